//! The explicit evaluation context.
//!
//! Everything the stack machine may consult while computing (simulation
//! span, solver pass, experiment iterators, the RNG, the sensitivity
//! setting, and the diagnostic call stack) travels in one borrowed
//! context instead of module-level singletons.

use crate::traits::ModelView;
use linnyr_common::{AnchorContext, EntityRef};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::cell::{Cell, RefCell};

/// Static parameters of the simulation period.
#[derive(Debug, Clone, Copy)]
pub struct SimSpan {
    /// Simulation length N in steps.
    pub n: u32,
    pub look_ahead: u32,
    pub block_length: u32,
    pub block_count: u32,
    /// Duration of one step in hours.
    pub dt_hours: f64,
}

impl SimSpan {
    pub fn single(n: u32) -> Self {
        SimSpan {
            n,
            look_ahead: 0,
            block_length: n.max(1),
            block_count: 1,
            dt_hours: 1.0,
        }
    }

    /// Highest valid vector index (index 0 holds the initial value).
    pub fn last_index(&self) -> i32 {
        (self.n + self.look_ahead) as i32
    }
}

/// Marks one expression as the active sensitivity parameter; its finite
/// results are multiplied by `1 + delta_pct/100` after computation.
#[derive(Debug, Clone)]
pub struct Sensitivity {
    pub owner: EntityRef,
    pub attribute: String,
    pub delta_pct: f64,
}

pub struct EvalContext<'m> {
    pub model: &'m dyn ModelView,
    pub span: SimSpan,
    /// Current round within the sequence, 1-based.
    pub round: Cell<u32>,
    /// Length of the round sequence.
    pub round_count: u32,
    /// Letter ordinal (a=1) of the final round of the sequence.
    pub last_round: u32,
    /// Experiment run number (0 outside experiments) and run count.
    pub run_number: i32,
    pub run_count: i32,
    pub iterators: [i32; 3],
    /// Context number bound by the innermost wildcard match.
    pub context_number: Cell<i32>,
    /// Resolved step of the parent expression, for `^` anchors.
    pub parent_step: Cell<i32>,
    /// Bound method object for `:method` evaluation, if any.
    pub method_object: RefCell<Option<String>>,
    pub sensitivity: Option<Sensitivity>,
    pub(crate) rng: RefCell<SmallRng>,
    pub(crate) call_stack: RefCell<Vec<String>>,
}

impl<'m> EvalContext<'m> {
    pub fn new(model: &'m dyn ModelView, span: SimSpan) -> Self {
        EvalContext {
            model,
            span,
            round: Cell::new(1),
            round_count: 1,
            last_round: 1,
            run_number: 0,
            run_count: 0,
            iterators: [0; 3],
            context_number: Cell::new(0),
            parent_step: Cell::new(0),
            method_object: RefCell::new(None),
            sensitivity: None,
            rng: RefCell::new(SmallRng::seed_from_u64(0x11bb)),
            call_stack: RefCell::new(Vec::new()),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = RefCell::new(SmallRng::seed_from_u64(seed));
        self
    }

    /// Anchor-resolution view at local step `t` for wildcard index `w`.
    pub fn anchor_context(&self, t: i32, wildcard: Option<i32>) -> AnchorContext {
        AnchorContext {
            step: t,
            context_number: wildcard.unwrap_or_else(|| self.context_number.get()),
            parent_step: self.parent_step.get(),
            iterators: self.iterators,
            block_length: self.span.block_length,
            horizon: self.span.n,
            dtm: 1.0,
        }
    }

    /// Names of the expressions currently being computed, outermost first.
    pub fn call_stack_snapshot(&self) -> Vec<String> {
        self.call_stack.borrow().clone()
    }
}
