//! Meta crate that re-exports the Linny-R engine layers with sensible
//! defaults. Depend on this crate and opt into specific layers via
//! feature flags, keeping access to the underlying crates when deeper
//! integration is required.

#[cfg(feature = "common")]
pub use linnyr_common as common;

#[cfg(feature = "parse")]
pub use linnyr_parse as parse;

#[cfg(feature = "eval")]
pub use linnyr_eval as eval;

#[cfg(feature = "milp")]
pub use linnyr_milp as milp;

#[cfg(feature = "common")]
pub use linnyr_common::{ErrorKind, Region, RunConfig, TimeUnit, Value};

#[cfg(feature = "eval")]
pub use linnyr_eval::{EvalContext, Expression, ModelView, SimSpan};

#[cfg(feature = "milp")]
pub use linnyr_milp::{
    LinkMultiplier, LpDialect, Model, NodeId, RunOutcome, ScriptedSolver, Solve, SolverAdapter,
    SolverCaps, SolverResult,
};
