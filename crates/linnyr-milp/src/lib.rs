//! The Linny-R MILP engine.
//!
//! A [`model::Model`] holds the entity graph (actors, processes, products,
//! links, constraints, grids, datasets). Per block of time steps the
//! [`builder`] emits a tableau program, the [`tableau`] VM executes it into
//! a sparse matrix, [`serialize`] renders LP or MPS text, a
//! [`solver::SolverAdapter`] returns the primal vector, and [`block`]
//! decodes it back into time-indexed entity attributes.

pub mod block;
pub mod builder;
pub mod model;
pub mod serialize;
pub mod solver;
pub mod tableau;

pub use block::{BlockOutcome, RunOutcome, Solve};
pub use model::{
    Actor, ActorId, BoundLine, Cluster, ClusterId, Constraint, ConstraintId, Dataset, DatasetId,
    GridId, GridProcess, Link, LinkId, LinkMultiplier, Model, NodeId, PowerGrid, Process,
    ProcessId, Product, ProductId,
};
pub use serialize::{LpDialect, SerializeError};
pub use solver::{ScriptedSolver, SolverAdapter, SolverCaps, SolverResult};
pub use tableau::{RowType, Tableau};

pub use linnyr_common::{RunConfig, TimeUnit, Value};
