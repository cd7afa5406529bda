//! Shunting-yard compiler producing stack-machine bytecode.
//!
//! Compilation never fails hard: problems are reported through
//! `Compiled::compile_issue` and the generated program degrades to
//! `push #INVALID!`, so a broken formula yields an error *value* at
//! every time step instead of aborting a run.

use crate::instr::{Instr, Symbol};
use crate::reference::VarSpec;
use crate::tokenizer::{tokenize, Token};
use linnyr_common::{is_level_based, EntityRef, ErrorKind, Value, NEAR_ZERO};
use smallvec::SmallVec;
use std::error::Error;
use std::fmt::{self, Display};

type OpStack = SmallVec<[StackOp; 16]>;

/// What the model knows about a referenced expression; consulted during
/// compilation to classify the referring expression.
#[derive(Debug, Clone, Copy)]
pub struct RefInfo {
    pub exists: bool,
    pub is_static: bool,
    pub is_level_based: bool,
}

impl Default for RefInfo {
    fn default() -> Self {
        RefInfo {
            exists: true,
            is_static: true,
            is_level_based: false,
        }
    }
}

/// Pluggable seam: the model side resolves references for classification
/// purposes without evaluating them.
pub trait ReferenceClassifier {
    fn classify(&self, spec: &VarSpec, owner: &EntityRef, attribute: &str) -> RefInfo;
}

#[derive(Debug)]
pub struct CompilerError {
    pub message: String,
    pub position: Option<usize>,
}

impl Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(p) => write!(f, "CompilerError at position {p}: {}", self.message),
            None => write!(f, "CompilerError: {}", self.message),
        }
    }
}

impl Error for CompilerError {}

/// Compilation result. `code` is always executable.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub code: Vec<Instr>,
    pub is_static: bool,
    pub is_level_based: bool,
    pub uses_wildcards: bool,
    pub references_self: bool,
    pub compile_issue: Option<String>,
}

/* ─────────────────────── operator priorities ───────────────────────
Doubled so the `@` slot (5.5 in the language manual) stays integral. */

const PRIO_CONCAT: u8 = 2;
const PRIO_TERNARY: u8 = 4;
const PRIO_OR: u8 = 6;
const PRIO_AND: u8 = 8;
const PRIO_CMP: u8 = 10;
const PRIO_AT: u8 = 11;
const PRIO_ADD: u8 = 12;
const PRIO_MUL: u8 = 14;
const PRIO_POW: u8 = 16;
const PRIO_MONADIC: u8 = 18;
const PRIO_REPLACE: u8 = 20;

fn dyadic(op: &str) -> Option<(u8, Instr)> {
    match op {
        ";" => Some((PRIO_CONCAT, Instr::Concat)),
        "=" => Some((PRIO_CMP, Instr::Eq)),
        "<>" => Some((PRIO_CMP, Instr::Ne)),
        "<" => Some((PRIO_CMP, Instr::Lt)),
        ">" => Some((PRIO_CMP, Instr::Gt)),
        "<=" => Some((PRIO_CMP, Instr::Le)),
        ">=" => Some((PRIO_CMP, Instr::Ge)),
        "@" => Some((PRIO_AT, Instr::At)),
        "+" => Some((PRIO_ADD, Instr::Add)),
        "-" => Some((PRIO_ADD, Instr::Sub)),
        "*" => Some((PRIO_MUL, Instr::Mul)),
        "/" => Some((PRIO_MUL, Instr::Div)),
        "//" => Some((PRIO_MUL, Instr::SafeDiv)),
        "%" => Some((PRIO_POW, Instr::Modulo)),
        "^" => Some((PRIO_POW, Instr::Power)),
        "|" => Some((PRIO_REPLACE, Instr::Replace)),
        _ => None,
    }
}

enum StackOp {
    Dyadic(u8, Instr),
    Monadic(Instr),
    Open,
    /// `?`: holds the address of its JumpIfFalse awaiting a patch.
    Then(usize),
    /// `:`: holds the address of its Jump awaiting a patch.
    Else(usize),
}

/// The compiler. Holds only the classification seam; each `compile` call
/// is independent.
#[derive(Default)]
pub struct Compiler<'a> {
    classifier: Option<&'a dyn ReferenceClassifier>,
}

impl<'a> Compiler<'a> {
    pub fn new() -> Self {
        Compiler { classifier: None }
    }

    pub fn with_classifier(classifier: &'a dyn ReferenceClassifier) -> Self {
        Compiler {
            classifier: Some(classifier),
        }
    }

    pub fn compile(&self, text: &str, owner: &EntityRef, attribute: &str) -> Compiled {
        match self.try_compile(text, owner, attribute) {
            Ok(compiled) => compiled,
            Err(e) => Compiled {
                code: vec![Instr::Push(Value::error(ErrorKind::Invalid))],
                is_static: true,
                is_level_based: false,
                uses_wildcards: false,
                references_self: false,
                compile_issue: Some(e.to_string()),
            },
        }
    }

    fn try_compile(
        &self,
        text: &str,
        owner: &EntityRef,
        attribute: &str,
    ) -> Result<Compiled, CompilerError> {
        let tokens = tokenize(text).map_err(|e| CompilerError {
            message: e.message,
            position: Some(e.pos),
        })?;
        if tokens.is_empty() {
            return Err(CompilerError {
                message: "empty expression".into(),
                position: None,
            });
        }

        let mut state = Emit {
            code: Vec::new(),
            // parallel operand ledger: true marks a `;`-group
            ledger: SmallVec::new(),
            is_static: true,
            is_level_based: false,
            uses_wildcards: false,
            references_self: false,
        };
        let mut ops: OpStack = SmallVec::new();
        let mut expect_operand = true;

        for (tok, pos) in tokens {
            let fail = |message: String| CompilerError {
                message,
                position: Some(pos),
            };
            match tok {
                Token::Number(n) => {
                    if !expect_operand {
                        return Err(fail("operator expected".into()));
                    }
                    state.emit(Instr::Push(Value::number(n)))?;
                    expect_operand = false;
                }
                Token::Unit(u) => {
                    if !expect_operand {
                        return Err(fail("operator expected".into()));
                    }
                    state.emit(Instr::Unit(u))?;
                    expect_operand = false;
                }
                Token::Reference(raw) => {
                    if !expect_operand {
                        return Err(fail("operator expected".into()));
                    }
                    let spec = VarSpec::parse(&raw).map_err(|m| fail(m))?;
                    self.classify_reference(&spec, owner, attribute, &mut state)?;
                    state.emit(Instr::Ref(Box::new(spec)))?;
                    expect_operand = false;
                }
                Token::Symbol(name) => {
                    let lower = name.to_ascii_lowercase();
                    if expect_operand {
                        if let Some(v) = constant(&lower) {
                            state.emit(Instr::Push(v))?;
                            expect_operand = false;
                        } else if let Some(instr) = Instr::monadic_name(&lower) {
                            ops.push(StackOp::Monadic(instr));
                        } else if let Some(sym) = Symbol::parse(&name) {
                            if sym.is_dynamic() {
                                state.is_static = false;
                            }
                            if sym == Symbol::ContextNumber {
                                state.uses_wildcards = true;
                            }
                            state.emit(Instr::Sym(sym))?;
                            expect_operand = false;
                        } else {
                            return Err(fail(format!("unknown symbol '{name}'")));
                        }
                    } else {
                        let (prio, instr) = match lower.as_str() {
                            "or" => (PRIO_OR, Instr::Or),
                            "and" => (PRIO_AND, Instr::And),
                            _ => return Err(fail(format!("operator expected, found '{name}'"))),
                        };
                        state.unwind(&mut ops, prio, true)?;
                        ops.push(StackOp::Dyadic(prio, instr));
                        expect_operand = true;
                    }
                }
                Token::Open => {
                    if !expect_operand {
                        return Err(fail("operator expected before '('".into()));
                    }
                    ops.push(StackOp::Open);
                }
                Token::Close => {
                    loop {
                        match ops.pop() {
                            Some(StackOp::Open) => break,
                            Some(op) => state.apply(op)?,
                            None => return Err(fail("unbalanced ')'".into())),
                        }
                    }
                    expect_operand = false;
                }
                Token::Op(o) => {
                    if expect_operand {
                        match o {
                            "-" | "~" => ops.push(StackOp::Monadic(Instr::Negate)),
                            "!" => ops.push(StackOp::Monadic(Instr::Not)),
                            "+" => {} // unary plus is a no-op
                            _ => return Err(fail(format!("operand expected before '{o}'"))),
                        }
                        continue;
                    }
                    match o {
                        "?" => {
                            state.unwind(&mut ops, PRIO_TERNARY, false)?;
                            let addr = state.emit_jump(Instr::JumpIfFalse(usize::MAX))?;
                            ops.push(StackOp::Then(addr));
                            expect_operand = true;
                        }
                        ":" => {
                            loop {
                                match ops.pop() {
                                    Some(StackOp::Then(jif)) => {
                                        let addr = state.emit_jump(Instr::Jump(usize::MAX))?;
                                        // THEN value is consumed by the jump in
                                        // the static ledger
                                        state.pop_scalar()?;
                                        state.patch(jif);
                                        ops.push(StackOp::Else(addr));
                                        break;
                                    }
                                    Some(StackOp::Open) | None => {
                                        return Err(fail("':' without matching '?'".into()));
                                    }
                                    Some(op) => state.apply(op)?,
                                }
                            }
                            expect_operand = true;
                        }
                        _ => {
                            let (prio, instr) = dyadic(o)
                                .ok_or_else(|| fail(format!("unknown operator '{o}'")))?;
                            state.unwind(&mut ops, prio, true)?;
                            ops.push(StackOp::Dyadic(prio, instr));
                            expect_operand = true;
                        }
                    }
                }
            }
        }

        if expect_operand {
            return Err(CompilerError {
                message: "missing operand at end of expression".into(),
                position: None,
            });
        }
        while let Some(op) = ops.pop() {
            match op {
                StackOp::Open => {
                    return Err(CompilerError {
                        message: "unbalanced '('".into(),
                        position: None,
                    });
                }
                other => state.apply(other)?,
            }
        }
        match state.ledger.len() {
            1 => {}
            0 => {
                return Err(CompilerError {
                    message: "missing operand".into(),
                    position: None,
                });
            }
            _ => {
                return Err(CompilerError {
                    message: "missing operator".into(),
                    position: None,
                });
            }
        }

        Ok(Compiled {
            code: state.code,
            is_static: state.is_static,
            is_level_based: state.is_level_based,
            uses_wildcards: state.uses_wildcards,
            references_self: state.references_self,
            compile_issue: None,
        })
    }

    fn classify_reference(
        &self,
        spec: &VarSpec,
        owner: &EntityRef,
        attribute: &str,
        state: &mut Emit,
    ) -> Result<(), CompilerError> {
        if spec.has_wildcards() {
            state.uses_wildcards = true;
        }
        let self_ref = spec.is_self()
            || (spec.pattern.eq_ignore_ascii_case(&owner.name)
                && spec
                    .attribute
                    .as_deref()
                    .unwrap_or("")
                    .eq_ignore_ascii_case(attribute));
        if self_ref {
            state.references_self = true;
            // a self-reference is meaningful only with a time shift
            state.is_static = false;
            return Ok(());
        }
        if !spec.trivial_offset() {
            state.is_static = false;
        }
        if let Some(exp) = &spec.experiment {
            if exp.method.is_empty() {
                state.is_static = false;
            }
            return Ok(());
        }
        let attr_letter = spec.attribute.as_deref().unwrap_or("");
        let level = if attr_letter.is_empty() {
            false
        } else {
            is_level_based(attr_letter)
        };
        let info = self
            .classifier
            .map(|c| c.classify(spec, owner, attribute))
            .unwrap_or_default();
        if !info.exists {
            return Err(CompilerError {
                message: format!("unknown variable [{}]", spec.raw),
                position: None,
            });
        }
        if level || info.is_level_based {
            state.is_static = false;
            if spec.trivial_offset() {
                state.is_level_based = true;
            }
        }
        if !info.is_static {
            state.is_static = false;
        }
        Ok(())
    }
}

fn constant(name: &str) -> Option<Value> {
    match name {
        "true" => Some(Value::ONE),
        "false" => Some(Value::ZERO),
        "pi" => Some(Value::number(std::f64::consts::PI)),
        "infinity" => Some(Value::PLUS_INFINITY),
        "epsilon" => Some(Value::number(NEAR_ZERO)),
        _ => None,
    }
}

/// Emission state: bytecode plus the static operand ledger used to detect
/// missing operands/operators and misplaced `;`-groups at compile time.
struct Emit {
    code: Vec<Instr>,
    ledger: SmallVec<[bool; 16]>,
    is_static: bool,
    is_level_based: bool,
    uses_wildcards: bool,
    references_self: bool,
}

impl Emit {
    fn err(message: &str) -> CompilerError {
        CompilerError {
            message: message.into(),
            position: None,
        }
    }

    fn pop_scalar(&mut self) -> Result<(), CompilerError> {
        match self.ledger.pop() {
            Some(false) => Ok(()),
            Some(true) => Err(Self::err(
                "a ';' list is only allowed as argument of a reducing operator",
            )),
            None => Err(Self::err("missing operand")),
        }
    }

    fn emit(&mut self, instr: Instr) -> Result<(), CompilerError> {
        match &instr {
            Instr::Push(_) | Instr::Sym(_) | Instr::Unit(_) | Instr::Ref(_) => {
                self.ledger.push(false);
            }
            Instr::Concat => {
                self.pop_any()?;
                self.pop_any()?;
                self.ledger.push(true);
            }
            Instr::At => {
                self.pop_scalar()?; // index
                self.pop_any()?; // target may be a group
                self.ledger.push(false);
            }
            i if i.is_reducing() => {
                self.pop_any()?;
                self.ledger.push(false);
            }
            Instr::Negate
            | Instr::Not
            | Instr::Abs
            | Instr::Sin
            | Instr::Cos
            | Instr::Atan
            | Instr::Ln
            | Instr::Exp
            | Instr::Sqrt
            | Instr::Round
            | Instr::Int
            | Instr::Fract => {
                self.pop_scalar()?;
                self.ledger.push(false);
            }
            Instr::JumpIfFalse(_) | Instr::Jump(_) => {
                unreachable!("jumps go through emit_jump")
            }
            _ => {
                // remaining dyadics
                self.pop_scalar()?;
                self.pop_scalar()?;
                self.ledger.push(false);
            }
        }
        self.code.push(instr);
        Ok(())
    }

    fn pop_any(&mut self) -> Result<(), CompilerError> {
        self.ledger.pop().map(|_| ()).ok_or_else(|| Self::err("missing operand"))
    }

    fn emit_jump(&mut self, instr: Instr) -> Result<usize, CompilerError> {
        if matches!(instr, Instr::JumpIfFalse(_)) {
            // consumes the condition
            self.pop_scalar()?;
        }
        self.code.push(instr);
        Ok(self.code.len() - 1)
    }

    fn patch(&mut self, addr: usize) {
        let target = self.code.len();
        match &mut self.code[addr] {
            Instr::JumpIfFalse(a) | Instr::Jump(a) => *a = target,
            _ => {}
        }
    }

    fn apply(&mut self, op: StackOp) -> Result<(), CompilerError> {
        match op {
            StackOp::Dyadic(_, instr) | StackOp::Monadic(instr) => self.emit(instr),
            StackOp::Then(_) => Err(Self::err("'?' without matching ':'")),
            StackOp::Else(jmp) => {
                self.patch(jmp);
                Ok(())
            }
            StackOp::Open => Err(Self::err("unbalanced '('")),
        }
    }

    /// Pop-and-emit stacked operators that bind at least as tightly as
    /// `prio`. Monadics are right-associative and only yield to strictly
    /// higher priorities.
    fn unwind(&mut self, ops: &mut OpStack, prio: u8, left_assoc: bool) -> Result<(), CompilerError> {
        loop {
            let pop = match ops.last() {
                Some(StackOp::Dyadic(p, _)) => *p > prio || (*p == prio && left_assoc),
                Some(StackOp::Monadic(_)) => PRIO_MONADIC > prio,
                Some(StackOp::Else(_)) => prio < PRIO_TERNARY,
                _ => false,
            };
            if !pop {
                return Ok(());
            }
            let op = ops.pop().unwrap();
            self.apply(op)?;
        }
    }
}

/// Compile with no classifier (every reference assumed to exist and be
/// static unless its own shape says otherwise).
pub fn compile(text: &str, owner: &EntityRef, attribute: &str) -> Compiled {
    Compiler::new().compile(text, owner, attribute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use linnyr_common::EntityKind;

    fn owner() -> EntityRef {
        EntityRef::new(EntityKind::Dataset, "d")
    }

    fn ok(text: &str) -> Compiled {
        let c = compile(text, &owner(), "");
        assert!(c.compile_issue.is_none(), "unexpected issue: {:?}", c.compile_issue);
        c
    }

    fn bad(text: &str) -> String {
        let c = compile(text, &owner(), "");
        assert_eq!(c.code, vec![Instr::Push(Value::error(ErrorKind::Invalid))]);
        assert!(c.is_static);
        c.compile_issue.expect("expected a compile issue")
    }

    #[test]
    fn precedence_shapes_bytecode() {
        let c = ok("1 + 2 * 3");
        assert_eq!(
            c.code,
            vec![
                Instr::Push(Value::number(1.0)),
                Instr::Push(Value::number(2.0)),
                Instr::Push(Value::number(3.0)),
                Instr::Mul,
                Instr::Add,
            ]
        );
    }

    #[test]
    fn parentheses_override() {
        let c = ok("(1 + 2) * 3");
        assert_eq!(
            c.code,
            vec![
                Instr::Push(Value::number(1.0)),
                Instr::Push(Value::number(2.0)),
                Instr::Add,
                Instr::Push(Value::number(3.0)),
                Instr::Mul,
            ]
        );
    }

    #[test]
    fn unary_minus() {
        let c = ok("-2 ^ 2");
        // monadic binds tighter than '^': (-2) ^ 2
        assert_eq!(
            c.code,
            vec![
                Instr::Push(Value::number(2.0)),
                Instr::Negate,
                Instr::Push(Value::number(2.0)),
                Instr::Power,
            ]
        );
    }

    #[test]
    fn ternary_compiles_to_jumps() {
        let c = ok("1 ? 2 : 3");
        assert_eq!(
            c.code,
            vec![
                Instr::Push(Value::number(1.0)),
                Instr::JumpIfFalse(4),
                Instr::Push(Value::number(2.0)),
                Instr::Jump(5),
                Instr::Push(Value::number(3.0)),
            ]
        );
    }

    #[test]
    fn nested_ternary() {
        let c = ok("1 ? 2 : 0 ? 3 : 4");
        // right-associative: 1 ? 2 : (0 ? 3 : 4)
        assert_eq!(c.code[1], Instr::JumpIfFalse(4));
        assert_eq!(c.code[3], Instr::Jump(9));
    }

    #[test]
    fn groups_reach_only_reducers() {
        let c = ok("max(1;2;3)");
        assert_eq!(c.code.len(), 6);
        assert_eq!(c.code[5], Instr::Max);
        bad("1 + (2;3)");
        bad("abs(1;2)");
    }

    #[test]
    fn group_indexing_is_allowed() {
        ok("(1;2;3) @ 2");
    }

    #[test]
    fn missing_pieces_are_reported() {
        assert!(bad("1 +").contains("missing operand"));
        assert!(bad("1 2").contains("operator expected"));
        assert!(bad("(1").contains("unbalanced"));
        assert!(bad("1)").contains("unbalanced"));
        assert!(bad("1 ? 2").contains("without matching"));
        assert!(bad("1 : 2").contains("without matching"));
        assert!(bad("@ 1").contains("operand expected"));
    }

    #[test]
    fn staticness_classification() {
        assert!(ok("1 + 2 * pi").is_static);
        assert!(!ok("t + 1").is_static);
        assert!(!ok("random").is_static);
        assert!(!ok("[p|L]").is_static); // level-based attribute
        assert!(ok("[p|LB]").is_static);
        assert!(!ok("[p|LB@t-1]").is_static); // non-trivial offset
        assert!(ok("N * dt").is_static);
    }

    #[test]
    fn level_based_classification() {
        let c = ok("[p|L]");
        assert!(c.is_level_based);
        // a deliberate offset suppresses the level-based mark
        let c = ok("[p|L@t-1]");
        assert!(!c.is_level_based);
        let c = ok("[p|UB]");
        assert!(!c.is_level_based);
    }

    #[test]
    fn wildcard_and_self_flags() {
        assert!(ok("[unit ?|L]").uses_wildcards);
        assert!(ok("#").uses_wildcards);
        let c = ok("[@-1] + 1");
        assert!(c.references_self);
        assert!(!c.is_static);
    }

    #[test]
    fn bool_and_comparison_chain() {
        ok("[p|LB] > 0 and [p|UB] < 10 or true");
    }

    #[test]
    fn replace_undefined_priority() {
        // '|' binds tighter than monadics: abs([d]|0) = abs(([d] | 0))
        let c = ok("abs [x] | 0");
        assert_eq!(c.code.last(), Some(&Instr::Abs));
    }
}
