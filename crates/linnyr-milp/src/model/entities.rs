//! Entity types of the model graph.

use linnyr_common::{EntityKind, ResampleMethod, Value};
use linnyr_eval::Expression;
use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", stringify!($name), self.0)
            }
        }
    };
}

id_type!(ActorId);
id_type!(ProcessId);
id_type!(ProductId);
id_type!(LinkId);
id_type!(ConstraintId);
id_type!(ClusterId);
id_type!(DatasetId);
id_type!(GridId);

/// A level-bearing node: a process or a product.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Process(ProcessId),
    Product(ProductId),
}

impl NodeId {
    pub fn kind(self) -> EntityKind {
        match self {
            NodeId::Process(_) => EntityKind::Process,
            NodeId::Product(_) => EntityKind::Product,
        }
    }
}

impl From<ProcessId> for NodeId {
    fn from(p: ProcessId) -> Self {
        NodeId::Process(p)
    }
}

impl From<ProductId> for NodeId {
    fn from(p: ProductId) -> Self {
        NodeId::Product(p)
    }
}

/// The sixteen link multipliers: what quantity of the FROM node the link
/// carries into the TO node's balance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum LinkMultiplier {
    #[default]
    Level,
    Sum,
    Mean,
    Increase,
    MaxIncrease,
    MaxDecrease,
    SpinningReserve,
    Startup,
    Shutdown,
    FirstCommit,
    Positive,
    Zero,
    Negative,
    PeakInc,
    Throughput,
    CostPrice,
}

impl LinkMultiplier {
    /// Multipliers that need the FROM node's ON/OFF (and related) binaries.
    pub fn needs_binaries(self) -> bool {
        matches!(
            self,
            Self::SpinningReserve
                | Self::Startup
                | Self::Shutdown
                | Self::FirstCommit
                | Self::Positive
                | Self::Zero
                | Self::Negative
        )
    }

    pub fn needs_start_stop(self) -> bool {
        matches!(self, Self::Startup | Self::Shutdown | Self::FirstCommit)
    }
}

impl fmt::Display for LinkMultiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

pub struct Actor {
    pub name: String,
    /// `W`: objective weight of this actor's cash flow.
    pub weight: Expression,
    /// Bit r−1 set: the actor's processes are free in round letter r.
    pub round_flags: u32,
    pub cash_in: Vec<Value>,
    pub cash_out: Vec<Value>,
    pub cash_flow: Vec<Value>,
}

pub struct Process {
    pub name: String,
    pub actor: ActorId,
    pub lb: Expression,
    pub ub: Expression,
    pub initial_level: Expression,
    /// `LCF`, the pace: the level may change only every k-th step.
    pub pace: Expression,
    pub integer_level: bool,
    /// Level is semi-continuous: either 0 or at least LB.
    pub semi_continuous: bool,
    pub grid: Option<GridProcess>,
    // result vectors, written by the orchestrator
    pub level: Vec<Value>,
    pub cash_in: Vec<Value>,
    pub cash_out: Vec<Value>,
    pub cash_flow: Vec<Value>,
    pub marginal_cash_flow: Vec<Value>,
    pub cost_price: Vec<Value>,
    /// Steps at which a startup was decoded.
    pub startups: Vec<u32>,
    pub shutdowns: Vec<u32>,
}

pub struct Product {
    pub name: String,
    pub lb: Expression,
    pub ub: Expression,
    pub price: Expression,
    pub initial_level: Expression,
    /// Stock-bearing: the level carries over between steps.
    pub is_buffer: bool,
    /// Data products pass quantities through without a balance of their own.
    pub is_data: bool,
    pub no_slack: bool,
    /// LB and UB are the same expression: emit one EQ row for the level.
    pub equal_bounds: bool,
    pub level: Vec<Value>,
    pub cost_price: Vec<Value>,
    pub highest_cost_price: Vec<Value>,
}

pub struct Link {
    pub from: NodeId,
    pub to: NodeId,
    pub multiplier: LinkMultiplier,
    pub rate: Expression,
    /// Evaluated per step; may be negative (reach into the look-ahead).
    pub delay: Expression,
    /// `SOC`: share of cost carried upstream, 0..=1.
    pub share_of_cost: f64,
    pub flow: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct BoundLine {
    pub kind: crate::tableau::RowType,
    /// Vertices as percentages of the X/Y bound ranges, 0..=100, ordered
    /// by x.
    pub points: Vec<(f64, f64)>,
    /// Convex in the feasible direction: plain rows suffice, no SOS2.
    pub needs_no_sos: bool,
    pub no_slack: bool,
}

pub struct Constraint {
    pub name: String,
    pub from: NodeId,
    pub to: NodeId,
    pub lines: Vec<BoundLine>,
    pub share_of_cost: f64,
    /// `A`: 1 when a bound line is binding at t (post-solve).
    pub active: Vec<Value>,
}

pub struct Cluster {
    pub name: String,
    pub processes: Vec<ProcessId>,
    pub cash_in: Vec<Value>,
    pub cash_out: Vec<Value>,
    pub cash_flow: Vec<Value>,
}

pub struct Modifier {
    /// Selector; may contain wildcards, may start with `:` for a method.
    pub selector: String,
    pub expression: Expression,
}

pub struct Dataset {
    pub name: String,
    pub default_value: Value,
    pub data: Vec<f64>,
    /// Recording interval of `data`, in hours.
    pub data_dt_hours: f64,
    pub method: ResampleMethod,
    pub modifiers: Vec<Modifier>,
}

pub struct PowerGrid {
    pub name: String,
    pub power_unit: String,
    pub reactance_per_km: f64,
    /// 0 = lossless, 1..=3 = number of piecewise loss slopes.
    pub loss_approximation: u8,
}

#[derive(Debug, Clone)]
pub struct GridProcess {
    pub grid: GridId,
    pub length_km: f64,
    /// Loss fraction per slope band; entries beyond the grid's
    /// approximation level are unused.
    pub loss_slopes: [f64; 3],
}

/// Per-run experiment results readable from expressions.
#[derive(Default)]
pub struct ExperimentStore {
    pub runs: Vec<RunRecord>,
}

#[derive(Default)]
pub struct RunRecord {
    pub title: String,
    /// Keyed by `name|attribute`, lower-cased.
    pub results: rustc_hash::FxHashMap<String, Vec<Value>>,
}
