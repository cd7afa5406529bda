//! The bytecode instruction set.
//!
//! An expression compiles into a flat `Vec<Instr>` executed by the stack
//! machine in `linnyr-eval`. Instructions are a plain sum type; the
//! evaluator dispatches with one `match`, no function-pointer table.

use crate::reference::VarSpec;
use linnyr_common::Value;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

/// Model-level symbols that resolve against the evaluation context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Symbol {
    /// `t`: current step (1-based).
    T,
    /// `rt`: simulated hours elapsed at the current step.
    Rt,
    /// `bt`: step within the current block (1-based).
    Bt,
    /// `ct`: first step of the current block.
    Ct,
    /// `b`: current block number (1-based).
    B,
    /// `N`: simulation length in steps.
    BigN,
    /// `n`: number of blocks in the run.
    N,
    /// `l`: last simulated step (equals N).
    L,
    /// `r`: current round number within the sequence (1-based).
    R,
    /// `lr`: index of the last round of the sequence.
    Lr,
    /// `nr`: number of rounds in the sequence.
    Nr,
    /// `x`: current experiment run number.
    X,
    /// `nx`: number of runs in the active experiment.
    Nx,
    /// `random`: uniform draw from [0, 1).
    Random,
    /// `dt`: duration of one step in hours.
    Dt,
    /// `#`: context number of the innermost wildcard match.
    ContextNumber,
    /// `i`, `j`, `k`: experiment iterator indices.
    Iterator(u8),
    /// `yr wk d h m s`: number of model steps per calendar unit.
    StepsPer(linnyr_common::TimeUnit),
}

impl Symbol {
    /// Symbols whose value varies with the time step or the solver pass.
    pub fn is_dynamic(self) -> bool {
        matches!(
            self,
            Symbol::T
                | Symbol::Rt
                | Symbol::Bt
                | Symbol::Ct
                | Symbol::B
                | Symbol::R
                | Symbol::Random
                | Symbol::Iterator(_)
        )
    }

    /// Exact-match lookup; `N` and `n` are distinct.
    pub fn parse(name: &str) -> Option<Symbol> {
        use linnyr_common::TimeUnit::*;
        match name {
            "N" => Some(Symbol::BigN),
            "t" => Some(Symbol::T),
            "rt" => Some(Symbol::Rt),
            "bt" => Some(Symbol::Bt),
            "ct" => Some(Symbol::Ct),
            "b" => Some(Symbol::B),
            "n" => Some(Symbol::N),
            "l" => Some(Symbol::L),
            "r" => Some(Symbol::R),
            "lr" => Some(Symbol::Lr),
            "nr" => Some(Symbol::Nr),
            "x" => Some(Symbol::X),
            "nx" => Some(Symbol::Nx),
            "random" => Some(Symbol::Random),
            "dt" => Some(Symbol::Dt),
            "#" => Some(Symbol::ContextNumber),
            "i" => Some(Symbol::Iterator(0)),
            "j" => Some(Symbol::Iterator(1)),
            "k" => Some(Symbol::Iterator(2)),
            "yr" => Some(Symbol::StepsPer(Year)),
            "wk" => Some(Symbol::StepsPer(Week)),
            "d" => Some(Symbol::StepsPer(Day)),
            "h" => Some(Symbol::StepsPer(Hour)),
            "m" => Some(Symbol::StepsPer(Minute)),
            "s" => Some(Symbol::StepsPer(Second)),
            _ => None,
        }
    }
}

/// One bytecode instruction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Instr {
    /// Push a literal or a compile-time sentinel (e.g. `Invalid` fallback).
    Push(Value),
    /// Push a context-resolved symbol.
    Sym(Symbol),
    /// Push a scale-unit conversion factor resolved by the model.
    Unit(String),
    /// Push a resolved variable reference.
    Ref(Box<VarSpec>),

    // dyadic
    Add,
    Sub,
    Mul,
    Div,
    /// `//`: returns the LHS unchanged when the RHS is near zero.
    SafeDiv,
    Modulo,
    Power,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    /// `|`: replace an undefined LHS by the RHS.
    Replace,
    /// `@`: pick the element of a group at a 1-based index.
    At,
    /// `;`: append to (or start) a group.
    Concat,

    // monadic
    Negate,
    Not,
    Abs,
    Sin,
    Cos,
    Atan,
    Ln,
    Exp,
    Sqrt,
    Round,
    Int,
    Fract,

    // reducing monadics: operate on a scalar or a `;`-group
    Min,
    Max,
    Binomial,
    Exponential,
    Normal,
    Poisson,
    Triangular,
    Weibull,
    Npv,
    Mpp,
    Npu,
    Hccd,
    Correl,
    Slope,

    // control
    JumpIfFalse(usize),
    Jump(usize),
}

impl Instr {
    /// Reducing operators accept a `;`-group operand.
    pub fn is_reducing(&self) -> bool {
        matches!(
            self,
            Instr::Min
                | Instr::Max
                | Instr::Binomial
                | Instr::Exponential
                | Instr::Normal
                | Instr::Poisson
                | Instr::Triangular
                | Instr::Weibull
                | Instr::Npv
                | Instr::Mpp
                | Instr::Npu
                | Instr::Hccd
                | Instr::Correl
                | Instr::Slope
        )
    }

    /// Monadic operator name (lower case), if this instruction is one.
    pub fn monadic_name(name: &str) -> Option<Instr> {
        MONADICS.get(name).cloned()
    }
}

static MONADICS: Lazy<HashMap<&'static str, Instr>> = Lazy::new(|| {
    HashMap::from([
        ("not", Instr::Not),
        ("abs", Instr::Abs),
        ("sin", Instr::Sin),
        ("cos", Instr::Cos),
        ("atan", Instr::Atan),
        ("ln", Instr::Ln),
        ("exp", Instr::Exp),
        ("sqrt", Instr::Sqrt),
        ("round", Instr::Round),
        ("int", Instr::Int),
        ("fract", Instr::Fract),
        ("min", Instr::Min),
        ("max", Instr::Max),
        ("binomial", Instr::Binomial),
        ("exponential", Instr::Exponential),
        ("normal", Instr::Normal),
        ("poisson", Instr::Poisson),
        ("triangular", Instr::Triangular),
        ("weibull", Instr::Weibull),
        ("npv", Instr::Npv),
        ("mpp", Instr::Mpp),
        ("npu", Instr::Npu),
        ("hccd", Instr::Hccd),
        ("correl", Instr::Correl),
        ("slope", Instr::Slope),
    ])
});

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Push(v) => write!(f, "push {v}"),
            Instr::Sym(s) => write!(f, "sym {s:?}"),
            Instr::Unit(u) => write!(f, "unit '{u}'"),
            Instr::Ref(r) => write!(f, "ref [{}]", r.raw),
            Instr::JumpIfFalse(a) => write!(f, "jump-if-false {a}"),
            Instr::Jump(a) => write!(f, "jump {a}"),
            other => write!(f, "{}", format!("{other:?}").to_ascii_lowercase()),
        }
    }
}

/// Render bytecode one instruction per line, with addresses.
pub fn disassemble(code: &[Instr]) -> String {
    let mut out = String::new();
    for (i, instr) in code.iter().enumerate() {
        out.push_str(&format!("{i:4}  {instr}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_classification() {
        assert!(Symbol::T.is_dynamic());
        assert!(Symbol::Random.is_dynamic());
        assert!(!Symbol::BigN.is_dynamic());
        assert!(!Symbol::Dt.is_dynamic());
        assert_eq!(Symbol::parse("j"), Some(Symbol::Iterator(1)));
        assert_eq!(Symbol::parse("zz"), None);
    }

    #[test]
    fn disassembly_lists_addresses() {
        let code = vec![
            Instr::Push(Value::ONE),
            Instr::Sym(Symbol::T),
            Instr::Add,
        ];
        let text = disassemble(&code);
        assert!(text.contains("0  push 1"));
        assert!(text.contains("2  add"));
    }
}
