//! Expression state and the lazy `result` / `compute` cycle.

use crate::context::EvalContext;
use crate::vm;
use crate::traits::ModelView;
use linnyr_common::{EntityRef, ErrorKind, Region, Value};
use linnyr_parse::{Compiled, Compiler, Instr, RefInfo, ReferenceClassifier, VarSpec};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

/// A compiled, lazily evaluated attribute formula.
///
/// All evaluation state lives behind interior mutability: the engine is
/// single-threaded (expressions recurse into one another through the
/// model), so shared `&Expression` handles evaluate without an exclusive
/// borrow of the entity graph.
pub struct Expression {
    pub owner: EntityRef,
    /// Attribute or modifier selector this formula is bound to. A leading
    /// `:` marks a method (per-object result vectors).
    pub attribute: String,
    pub text: String,
    compiled: RefCell<Option<Arc<Compiled>>>,
    compiling: Cell<bool>,
    state: RefCell<ExprState>,
}

#[derive(Default)]
struct ExprState {
    vector: Vec<Value>,
    wildcard_vectors: FxHashMap<i32, Vec<Value>>,
    method_vectors: FxHashMap<String, Vec<Value>>,
    method_object_list: Vec<String>,
    step_stack: Vec<i32>,
    compute_issue: Option<String>,
}

/// Routes compile-time classification through the model seam.
struct ModelClassifier<'m>(&'m dyn ModelView);

impl ReferenceClassifier for ModelClassifier<'_> {
    fn classify(&self, spec: &VarSpec, owner: &EntityRef, attribute: &str) -> RefInfo {
        self.0.classify(spec, owner, attribute)
    }
}

/// Which result vector a computation addresses.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Own(usize),
    Wildcard(i32, usize),
    Method(String, usize),
}

impl Expression {
    pub fn new(owner: EntityRef, attribute: impl Into<String>, text: impl Into<String>) -> Self {
        Expression {
            owner,
            attribute: attribute.into(),
            text: text.into(),
            compiled: RefCell::new(None),
            compiling: Cell::new(false),
            state: RefCell::new(ExprState::default()),
        }
    }

    pub fn is_method(&self) -> bool {
        self.attribute.starts_with(':')
    }

    /// Clear all evaluation state; the formula recompiles on next use.
    pub fn reset(&self) {
        *self.compiled.borrow_mut() = None;
        self.compiling.set(false);
        *self.state.borrow_mut() = ExprState::default();
    }

    /// Drop cached results from step `t` on. Called when a new block
    /// begins: values computed during the previous block's look-ahead are
    /// stale once the boundary advances.
    pub fn invalidate_from(&self, t: i32) {
        let from = t.max(0) as usize;
        let mut st = self.state.borrow_mut();
        let ExprState {
            vector,
            wildcard_vectors,
            method_vectors,
            ..
        } = &mut *st;
        for vec in std::iter::once(vector)
            .chain(wildcard_vectors.values_mut())
            .chain(method_vectors.values_mut())
        {
            for slot in vec.iter_mut().skip(from) {
                *slot = Value::NOT_COMPUTED;
            }
        }
    }

    /* ───────────────────── classification ───────────────────── */

    pub fn is_static(&self) -> bool {
        self.compiled
            .borrow()
            .as_ref()
            .map(|c| c.is_static)
            .unwrap_or(false)
    }

    pub fn is_level_based(&self) -> bool {
        self.compiled
            .borrow()
            .as_ref()
            .map(|c| c.is_level_based)
            .unwrap_or(false)
    }

    pub fn uses_wildcards(&self) -> bool {
        self.compiled
            .borrow()
            .as_ref()
            .map(|c| c.uses_wildcards)
            .unwrap_or(false)
    }

    pub fn references_self(&self) -> bool {
        self.compiled
            .borrow()
            .as_ref()
            .map(|c| c.references_self)
            .unwrap_or(false)
    }

    pub fn compile_issue(&self) -> Option<String> {
        self.compiled
            .borrow()
            .as_ref()
            .and_then(|c| c.compile_issue.clone())
    }

    /// First exceptional code observed during the most recent compute.
    pub fn compute_issue(&self) -> Option<String> {
        self.state.borrow().compute_issue.clone()
    }

    /// The wildcard indices that have produced a result vector so far.
    pub fn wildcard_indices(&self) -> Vec<i32> {
        let mut v: Vec<i32> = self.state.borrow().wildcard_vectors.keys().copied().collect();
        v.sort_unstable();
        v
    }

    /// Compile now (normally lazy). Returns the compile issue, if any.
    pub fn compile(&self, ctx: &EvalContext) -> Option<String> {
        self.ensure_compiled(ctx);
        self.compile_issue()
    }

    fn ensure_compiled(&self, ctx: &EvalContext) -> Option<Arc<Compiled>> {
        if let Some(c) = self.compiled.borrow().as_ref() {
            return Some(c.clone());
        }
        if self.compiling.get() {
            // re-entered through the classifier: cyclic definition
            return None;
        }
        self.compiling.set(true);
        let classifier = ModelClassifier(ctx.model);
        let compiled =
            Compiler::with_classifier(&classifier).compile(&self.text, &self.owner, &self.attribute);
        self.compiling.set(false);
        let arc = Arc::new(compiled);
        *self.compiled.borrow_mut() = Some(arc.clone());
        Some(arc)
    }

    /* ───────────────────── evaluation ───────────────────── */

    /// The expression's value at local step `t` for wildcard index
    /// `wildcard`. Computes lazily; re-entrant lookups surface `#CYCLE!`.
    pub fn result(&self, ctx: &EvalContext, t: i32, wildcard: Option<i32>) -> Value {
        let Some(compiled) = self.ensure_compiled(ctx) else {
            return Value::error(ErrorKind::Cyclic);
        };
        // the clamp applies to t itself: the step the bytecode sees is the
        // step whose slot the result lands in
        let t = self.clamp(&compiled, t, ctx) as i32;
        let slot = self.locate(ctx, &compiled, t, wildcard);
        match self.read(&slot) {
            v if v == Value::NOT_COMPUTED => {
                self.compute(ctx, &compiled, &slot, t, wildcard);
                self.read(&slot)
            }
            v if v == Value::COMPUTING => {
                // recursion through the model: break the cycle here
                let cyc = Value::error(ErrorKind::Cyclic);
                self.write(&slot, cyc);
                self.note_issue(cyc);
                cyc
            }
            v => v,
        }
    }

    /// Convenience for non-wildcard call sites.
    pub fn result_at(&self, ctx: &EvalContext, t: i32) -> Value {
        self.result(ctx, t, None)
    }

    /// The value at index 0 (the initial value), 0 when never computed.
    /// Self-references that resolve to a step before the simulation read
    /// this instead of recursing.
    pub fn initial_value(&self) -> Value {
        match self.read(&Slot::Own(0)) {
            v if v == Value::NOT_COMPUTED || v == Value::COMPUTING => Value::ZERO,
            v => v,
        }
    }

    fn locate(&self, ctx: &EvalContext, compiled: &Compiled, t: i32, wildcard: Option<i32>) -> Slot {
        // static expressions hold a single value, wherever it lives
        let index = if compiled.is_static { 0 } else { t.max(0) as usize };
        if compiled.is_static && !compiled.uses_wildcards && !self.is_method() {
            return Slot::Own(0);
        }
        if self.is_method() {
            let object = ctx
                .method_object
                .borrow()
                .clone()
                .unwrap_or_default();
            return Slot::Method(object, index);
        }
        match wildcard {
            Some(w) if compiled.uses_wildcards => Slot::Wildcard(w, index),
            _ => Slot::Own(index),
        }
    }

    fn clamp(&self, compiled: &Compiled, t: i32, ctx: &EvalContext) -> usize {
        let t = t.max(0);
        let last = ctx.span.last_index();
        if t > last && !compiled.references_self {
            last as usize
        } else {
            t as usize
        }
    }

    fn read(&self, slot: &Slot) -> Value {
        let st = self.state.borrow();
        let get = |vec: &Vec<Value>, i: usize| vec.get(i).copied().unwrap_or(Value::NOT_COMPUTED);
        match slot {
            Slot::Own(i) => get(&st.vector, *i),
            Slot::Wildcard(w, i) => st
                .wildcard_vectors
                .get(w)
                .map(|v| get(v, *i))
                .unwrap_or(Value::NOT_COMPUTED),
            Slot::Method(o, i) => st
                .method_vectors
                .get(o)
                .map(|v| get(v, *i))
                .unwrap_or(Value::NOT_COMPUTED),
        }
    }

    fn write(&self, slot: &Slot, value: Value) {
        let mut st = self.state.borrow_mut();
        fn put(vec: &mut Vec<Value>, i: usize, value: Value) {
            if vec.len() <= i {
                vec.resize(i + 1, Value::NOT_COMPUTED);
            }
            vec[i] = value;
        }
        match slot {
            Slot::Own(i) => put(&mut st.vector, *i, value),
            Slot::Wildcard(w, i) => {
                put(st.wildcard_vectors.entry(*w).or_default(), *i, value);
                // keep the default vector populated as well
                put(&mut st.vector, *i, value);
            }
            Slot::Method(o, i) => {
                if !st.method_object_list.iter().any(|m| m == o) {
                    st.method_object_list.push(o.clone());
                }
                put(st.method_vectors.entry(o.clone()).or_default(), *i, value);
            }
        }
    }

    fn note_issue(&self, v: Value) {
        let mut st = self.state.borrow_mut();
        if st.compute_issue.is_none() && v.is_exceptional() {
            st.compute_issue = Some(v.to_string());
        }
    }

    fn compute(
        &self,
        ctx: &EvalContext,
        compiled: &Arc<Compiled>,
        slot: &Slot,
        t: i32,
        wildcard: Option<i32>,
    ) {
        if self.compiling.get() {
            return;
        }
        self.write(slot, Value::COMPUTING);
        ctx.call_stack
            .borrow_mut()
            .push(format!("{}|{}", self.owner.name, self.attribute));
        self.state.borrow_mut().step_stack.push(t);

        let code: &[Instr] = &compiled.code;
        let mut value = vm::execute(self, code, ctx, t, wildcard);

        if let Some(s) = &ctx.sensitivity {
            if s.owner == self.owner && s.attribute.eq_ignore_ascii_case(&self.attribute) {
                if let Some(x) = value.finite() {
                    value = Value::number(x * (1.0 + s.delta_pct / 100.0));
                }
            }
        }
        if let Region::Normal(x) = value.region() {
            value = Value::number(x);
        }

        self.state.borrow_mut().step_stack.pop();
        ctx.call_stack.borrow_mut().pop();
        // a cycle detected underneath must not be overwritten by the
        // infected value computed on the way out
        if self.read(slot) == Value::COMPUTING || !self.read(slot).is_error() {
            self.write(slot, value);
        }
        self.note_issue(value);
    }
}
