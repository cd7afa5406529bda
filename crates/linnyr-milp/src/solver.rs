//! The boundary to the external MILP solver.

use crate::serialize::LpDialect;

/// What the selected solver can consume; drives variable allocation
/// (binary emulation of SOS2 and semi-continuity) and serialization.
#[derive(Debug, Clone, Copy)]
pub struct SolverCaps {
    pub dialect: LpDialect,
    pub sos: bool,
    pub semi_continuous: bool,
    pub integers: bool,
    /// The magnitude this solver treats as infinity; coefficients beyond
    /// it abort serialization.
    pub infinity: f64,
}

impl Default for SolverCaps {
    fn default() -> Self {
        SolverCaps {
            dialect: LpDialect::LpSolve,
            sos: true,
            semi_continuous: true,
            integers: true,
            infinity: 1e13,
        }
    }
}

/// Outcome of one solve call. `x` is consumed strictly by column index
/// (1-based columns map to `x[0..]`).
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SolverResult {
    /// 0 means solved to optimality.
    pub status: i32,
    pub x: Vec<f64>,
    pub messages: Vec<String>,
    pub seconds: f64,
    pub solution_available: bool,
}

/// Implemented by the caller; the engine hands over serialized model text
/// and consumes the primal vector.
pub trait SolverAdapter {
    fn capabilities(&self) -> SolverCaps;

    /// Solve `model_text` (in the dialect of `capabilities()`). `block`
    /// and `round` label the call for logs.
    fn solve(&mut self, model_text: &str, block: u32, round: char) -> SolverResult;
}

/// Test adapter: returns pre-scripted results in order and records every
/// model text it was handed.
#[derive(Default)]
pub struct ScriptedSolver {
    pub caps: SolverCaps,
    pub script: Vec<SolverResult>,
    pub received: Vec<String>,
    next: usize,
}

impl ScriptedSolver {
    pub fn new(caps: SolverCaps) -> Self {
        ScriptedSolver {
            caps,
            ..Default::default()
        }
    }

    pub fn push(&mut self, result: SolverResult) {
        self.script.push(result);
    }

    pub fn solved(x: Vec<f64>) -> SolverResult {
        SolverResult {
            status: 0,
            x,
            messages: Vec::new(),
            seconds: 0.0,
            solution_available: true,
        }
    }

    pub fn failed(status: i32, message: &str) -> SolverResult {
        SolverResult {
            status,
            x: Vec::new(),
            messages: vec![message.to_string()],
            seconds: 0.0,
            solution_available: false,
        }
    }
}

impl SolverAdapter for ScriptedSolver {
    fn capabilities(&self) -> SolverCaps {
        self.caps
    }

    fn solve(&mut self, model_text: &str, _block: u32, _round: char) -> SolverResult {
        self.received.push(model_text.to_string());
        let r = self
            .script
            .get(self.next)
            .cloned()
            .unwrap_or_else(|| ScriptedSolver::failed(1, "script exhausted"));
        self.next += 1;
        r
    }
}
