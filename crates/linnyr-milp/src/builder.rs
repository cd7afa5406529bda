//! Variable allocation and the tableau program.
//!
//! `allocate` walks the model once: it decides which auxiliary variable
//! families every node needs (partition binaries, start/stop, grid loss
//! slopes, SOS2 weights, slack, chunk peak columns), assigns per-step
//! column indices, computes grid cycle bases, and emits the opcode list
//! that `Exec` then runs once per time step of the chunk.

use crate::model::{
    read_level, ActorId, ConstraintId, GridId, LinkId, LinkMultiplier, Model, NodeId, ProcessId,
    ProductId,
};
use crate::solver::SolverCaps;
use crate::tableau::{RowType, Tableau};
use linnyr_common::{Region, Value};
use linnyr_eval::EvalContext;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Levels below this decode to exactly 0; binaries activate above it.
pub const ON_OFF_THRESHOLD: f64 = 0.0005;
/// Ceiling for big-M activation coefficients; larger upper bounds poison
/// binary accuracy and are reported as warnings.
pub const BIG_M_MAX: f64 = 1e10;
/// Upper bound substituted for infinity under `diagnose`.
pub const DIAGNOSTIC_BOUND: f64 = 1e7;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeCaps: u32 {
        const ON_OFF = 1 << 0;
        const IS_ZERO = 1 << 1;
        const NEGATIVE = 1 << 2;
        /// Full positive/negative/zero partition of the level.
        const NZP = 1 << 3;
        const START_STOP = 1 << 4;
        const FIRST_COMMIT = 1 << 5;
        const PEAK = 1 << 6;
        const SEMI_CONTINUOUS = 1 << 7;
        const GRID_SLOPES = 1 << 8;
    }
}

/// What a per-step column means; used for prior-chunk lookups and for
/// decoding the primal vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VarKind {
    Level(NodeId),
    OnOff(NodeId),
    IsZero(NodeId),
    Negative(NodeId),
    PosLevel(NodeId),
    NegLevel(NodeId),
    PosEps(NodeId),
    NegEps(NodeId),
    ScBinary(NodeId),
    Startup(ProcessId),
    Shutdown(ProcessId),
    FirstCommit(ProcessId),
    StartCount(ProcessId),
    SlopeUp(ProcessId, u8),
    SlopeUpOn(ProcessId, u8),
    SlopeDown(ProcessId, u8),
    SlopeDownOn(ProcessId, u8),
    CashIn(ActorId),
    CashOut(ActorId),
    SlackLe(ProductId),
    SlackGe(ProductId),
    LineWeight(ConstraintId, u16, u16),
    LineSlackLe(ConstraintId, u16),
    LineSlackGe(ConstraintId, u16),
    LineBinary(ConstraintId, u16, u16),
    /// Chunk columns: one per chunk, not per step.
    BlockPeak(NodeId),
    LookAheadPeak(NodeId),
}

#[derive(Debug, Clone, Copy)]
pub struct SlopeVars {
    pub up: u32,
    pub up_on: u32,
    pub down: u32,
    pub down_on: u32,
}

#[derive(Debug, Clone, Default)]
pub struct NodeVars {
    pub caps: NodeCaps,
    pub level: u32,
    pub on_off: Option<u32>,
    pub is_zero: Option<u32>,
    pub negative: Option<u32>,
    pub pos_level: Option<u32>,
    pub neg_level: Option<u32>,
    pub pos_eps: Option<u32>,
    pub neg_eps: Option<u32>,
    pub sc_binary: Option<u32>,
    pub startup: Option<u32>,
    pub shutdown: Option<u32>,
    pub first_commit: Option<u32>,
    pub start_count: Option<u32>,
    pub slopes: Vec<SlopeVars>,
    /// Absolute chunk columns, allocated after the per-step blocks.
    pub block_peak: Option<u32>,
    pub la_peak: Option<u32>,
}

impl Default for NodeCaps {
    fn default() -> Self {
        NodeCaps::empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LineVars {
    pub weights: Vec<u32>,
    pub slack_le: Option<u32>,
    pub slack_ge: Option<u32>,
    pub binaries: Vec<u32>,
}

/// One fundamental cycle of a power grid: the edge processes with their
/// orientation along the cycle.
#[derive(Debug, Clone)]
pub struct GridCycle {
    pub grid: GridId,
    pub edges: Vec<(ProcessId, f64)>,
}

/// One step of the tableau program.
#[derive(Debug, Clone, Copy)]
pub enum Op {
    SetProcessBounds(ProcessId),
    SetProductBounds(ProductId),
    AddProcessPace(ProcessId),
    AddNodePartition(NodeId),
    AddStartupConstraints(ProcessId),
    AddShutdownConstraints(ProcessId),
    AddFirstCommitConstraints(ProcessId),
    AddSemiContinuousConstraints(ProcessId),
    AddGridProcessConstraints(ProcessId),
    AddPeakIncreaseConstraints(NodeId),
    AddProductBalance(ProductId),
    AddProductBoundConstraints(ProductId),
    AddBoundLineConstraints(ConstraintId),
    AddKirchhoffConstraints(GridId),
    AddCashConstraints(ActorId),
    AddObjective(ActorId),
}

pub struct Allocation {
    /// Columns per time step.
    pub cols: u32,
    /// `kinds[vi - 1]` is the meaning of per-step variable index `vi`.
    pub kinds: Vec<VarKind>,
    /// Chunk-variable kinds; column = cols × chunk_length + ordinal + 1.
    pub chunk_kinds: Vec<VarKind>,
    pub nodes: FxHashMap<NodeId, NodeVars>,
    pub actors: FxHashMap<u32, (u32, u32)>,
    pub slacks: FxHashMap<u32, (u32, u32)>,
    pub lines: FxHashMap<(u32, u16), LineVars>,
    pub ignored: FxHashSet<u32>,
    pub cycles: Vec<GridCycle>,
    pub program: Vec<Op>,
    pub warnings: Vec<String>,
    chunk_length: u32,
}

impl Allocation {
    pub fn total_columns(&self) -> u32 {
        self.cols * self.chunk_length + self.chunk_kinds.len() as u32
    }

    pub fn chunk_column(&self, ordinal: usize) -> u32 {
        self.cols * self.chunk_length + ordinal as u32 + 1
    }

    pub fn node(&self, node: NodeId) -> &NodeVars {
        &self.nodes[&node]
    }

    fn is_ignored(&self, p: ProcessId) -> bool {
        self.ignored.contains(&p.0)
    }
}

/* ───────────────────────── allocation ───────────────────────── */

fn node_caps(model: &Model, node: NodeId) -> NodeCaps {
    let mut c = NodeCaps::empty();
    for (_, link) in model.links_out_of(node) {
        match link.multiplier {
            LinkMultiplier::Positive | LinkMultiplier::SpinningReserve => {
                c |= NodeCaps::ON_OFF;
            }
            LinkMultiplier::Zero => c |= NodeCaps::ON_OFF | NodeCaps::IS_ZERO,
            LinkMultiplier::Negative => c |= NodeCaps::ON_OFF | NodeCaps::NEGATIVE,
            LinkMultiplier::Startup | LinkMultiplier::Shutdown => {
                c |= NodeCaps::ON_OFF | NodeCaps::START_STOP;
            }
            LinkMultiplier::FirstCommit => {
                c |= NodeCaps::ON_OFF | NodeCaps::START_STOP | NodeCaps::FIRST_COMMIT;
            }
            LinkMultiplier::PeakInc => c |= NodeCaps::PEAK,
            _ => {}
        }
    }
    if let NodeId::Process(p) = node {
        let process = &model.processes[p.index()];
        if process.semi_continuous {
            c |= NodeCaps::SEMI_CONTINUOUS;
        }
        if process
            .grid
            .as_ref()
            .map(|g| model.grids[g.grid.index()].loss_approximation > 0)
            .unwrap_or(false)
        {
            c |= NodeCaps::GRID_SLOPES;
        }
        // a level that can go negative needs the full partition to give
        // the sign binaries meaning
        if c.intersects(NodeCaps::ON_OFF) && may_go_negative(model, node) {
            c |= NodeCaps::NZP | NodeCaps::IS_ZERO | NodeCaps::NEGATIVE;
        }
    }
    c
}

fn may_go_negative(model: &Model, node: NodeId) -> bool {
    let (lb, _) = model.node_bounds(node);
    let ctx = EvalContext::new(model, model.sim_span());
    lb.compile(&ctx);
    if !lb.is_static() {
        // dynamic lower bounds are assumed to reach below zero
        return true;
    }
    match lb.result_at(&ctx, 0).region() {
        Region::Normal(x) => x < 0.0,
        Region::MinusInfinity => true,
        _ => false,
    }
}

/// Build the variable allocation and the tableau program for this run.
pub fn allocate(model: &Model, solver: SolverCaps, diagnose: bool) -> Allocation {
    let ctx = EvalContext::new(model, model.sim_span());
    let chunk_length = model.run.chunk_length();
    let mut alloc = Allocation {
        cols: 0,
        kinds: Vec::new(),
        chunk_kinds: Vec::new(),
        nodes: FxHashMap::default(),
        actors: FxHashMap::default(),
        slacks: FxHashMap::default(),
        lines: FxHashMap::default(),
        ignored: FxHashSet::default(),
        cycles: grid_cycles(model),
        program: Vec::new(),
        warnings: Vec::new(),
        chunk_length,
    };

    let mut next = 0u32;
    let mut take = |kinds: &mut Vec<VarKind>, kind: VarKind| {
        kinds.push(kind);
        next += 1;
        next
    };

    // actors first: one cash-in and one cash-out column each
    for (i, _) in model.actors.iter().enumerate() {
        let a = ActorId(i as u32);
        let cin = take(&mut alloc.kinds, VarKind::CashIn(a));
        let cout = take(&mut alloc.kinds, VarKind::CashOut(a));
        alloc.actors.insert(a.0, (cin, cout));
    }

    // inert processes keep no columns
    for (i, p) in model.processes.iter().enumerate() {
        p.lb.compile(&ctx);
        p.ub.compile(&ctx);
        if p.lb.is_static() && p.ub.is_static() && p.grid.is_none() {
            let lb = p.lb.result_at(&ctx, 0);
            let ub = p.ub.result_at(&ctx, 0);
            if lb == Value::ZERO && ub == Value::ZERO {
                alloc.ignored.insert(i as u32);
            }
        }
    }

    let mut peak_nodes: Vec<NodeId> = Vec::new();
    let node_ids: Vec<NodeId> = (0..model.processes.len() as u32)
        .map(|i| NodeId::Process(ProcessId(i)))
        .chain((0..model.products.len() as u32).map(|i| NodeId::Product(ProductId(i))))
        .collect();

    for node in &node_ids {
        let node = *node;
        if let NodeId::Process(p) = node {
            if alloc.is_ignored(p) {
                continue;
            }
        }
        let caps = node_caps(model, node);
        let mut vars = NodeVars {
            caps,
            level: take(&mut alloc.kinds, VarKind::Level(node)),
            ..Default::default()
        };
        if caps.contains(NodeCaps::ON_OFF) {
            vars.on_off = Some(take(&mut alloc.kinds, VarKind::OnOff(node)));
        }
        if caps.contains(NodeCaps::IS_ZERO) || caps.contains(NodeCaps::NZP) {
            vars.is_zero = Some(take(&mut alloc.kinds, VarKind::IsZero(node)));
        }
        if caps.contains(NodeCaps::NZP) {
            vars.negative = Some(take(&mut alloc.kinds, VarKind::Negative(node)));
            vars.pos_level = Some(take(&mut alloc.kinds, VarKind::PosLevel(node)));
            vars.neg_level = Some(take(&mut alloc.kinds, VarKind::NegLevel(node)));
            vars.pos_eps = Some(take(&mut alloc.kinds, VarKind::PosEps(node)));
            vars.neg_eps = Some(take(&mut alloc.kinds, VarKind::NegEps(node)));
        } else if caps.contains(NodeCaps::NEGATIVE) {
            vars.negative = Some(take(&mut alloc.kinds, VarKind::Negative(node)));
        }
        if let NodeId::Process(p) = node {
            if caps.contains(NodeCaps::START_STOP) {
                vars.startup = Some(take(&mut alloc.kinds, VarKind::Startup(p)));
                vars.shutdown = Some(take(&mut alloc.kinds, VarKind::Shutdown(p)));
            }
            if caps.contains(NodeCaps::FIRST_COMMIT) {
                vars.first_commit = Some(take(&mut alloc.kinds, VarKind::FirstCommit(p)));
                vars.start_count = Some(take(&mut alloc.kinds, VarKind::StartCount(p)));
            }
            if caps.contains(NodeCaps::SEMI_CONTINUOUS) && !solver.semi_continuous {
                vars.sc_binary = Some(take(&mut alloc.kinds, VarKind::ScBinary(node)));
            }
            if caps.contains(NodeCaps::GRID_SLOPES) {
                let g = model.processes[p.index()].grid.as_ref().unwrap();
                let n = model.grids[g.grid.index()].loss_approximation;
                for s in 0..n {
                    vars.slopes.push(SlopeVars {
                        up: take(&mut alloc.kinds, VarKind::SlopeUp(p, s)),
                        up_on: take(&mut alloc.kinds, VarKind::SlopeUpOn(p, s)),
                        down: take(&mut alloc.kinds, VarKind::SlopeDown(p, s)),
                        down_on: take(&mut alloc.kinds, VarKind::SlopeDownOn(p, s)),
                    });
                }
            }
        }
        if let NodeId::Product(q) = node {
            let product = &model.products[q.index()];
            if !product.no_slack {
                let le = take(&mut alloc.kinds, VarKind::SlackLe(q));
                let ge = take(&mut alloc.kinds, VarKind::SlackGe(q));
                alloc.slacks.insert(q.0, (le, ge));
            }
        }
        if caps.contains(NodeCaps::PEAK) {
            peak_nodes.push(node);
        }
        alloc.nodes.insert(node, vars);
    }

    // bound lines: SOS2 weights, slacks, optional binaries
    for (ci, constraint) in model.constraints.iter().enumerate() {
        for (li, line) in constraint.lines.iter().enumerate() {
            let mut lv = LineVars::default();
            for vi in 0..line.points.len() {
                lv.weights.push(take(
                    &mut alloc.kinds,
                    VarKind::LineWeight(ConstraintId(ci as u32), li as u16, vi as u16),
                ));
            }
            if !line.no_slack {
                lv.slack_le = Some(take(
                    &mut alloc.kinds,
                    VarKind::LineSlackLe(ConstraintId(ci as u32), li as u16),
                ));
                lv.slack_ge = Some(take(
                    &mut alloc.kinds,
                    VarKind::LineSlackGe(ConstraintId(ci as u32), li as u16),
                ));
            }
            if !solver.sos && !line.needs_no_sos {
                for vi in 0..line.points.len() {
                    lv.binaries.push(take(
                        &mut alloc.kinds,
                        VarKind::LineBinary(ConstraintId(ci as u32), li as u16, vi as u16),
                    ));
                }
            }
            alloc.lines.insert((ci as u32, li as u16), lv);
        }
    }

    alloc.cols = next;

    // chunk variables: two peak columns per flagged node, one per chunk
    for node in &peak_nodes {
        let b = alloc.chunk_kinds.len();
        alloc.chunk_kinds.push(VarKind::BlockPeak(*node));
        alloc.chunk_kinds.push(VarKind::LookAheadPeak(*node));
        let vars = alloc.nodes.get_mut(node).unwrap();
        vars.block_peak = Some(alloc.cols * chunk_length + b as u32 + 1);
        vars.la_peak = Some(alloc.cols * chunk_length + b as u32 + 2);
    }

    for link in &model.links {
        if link.multiplier == LinkMultiplier::CostPrice {
            let has_price = match link.to {
                NodeId::Product(q) => {
                    let price = &model.products[q.index()].price;
                    price.compile(&ctx);
                    !(price.is_static() && price.result_at(&ctx, 0) == Value::ZERO)
                }
                _ => false,
            };
            if has_price {
                alloc.warnings.push(format!(
                    "cost-price link {} also carries a price; flow is computed post-solve only",
                    model.link_name_of(link.from, link.to)
                ));
            }
        }
    }

    emit_program(model, &mut alloc, diagnose);
    alloc
}

fn emit_program(model: &Model, alloc: &mut Allocation, _diagnose: bool) {
    let mut prog = Vec::new();
    for i in 0..model.processes.len() as u32 {
        let p = ProcessId(i);
        if alloc.is_ignored(p) {
            continue;
        }
        let node = NodeId::Process(p);
        let caps = alloc.node(node).caps;
        prog.push(Op::SetProcessBounds(p));
        prog.push(Op::AddProcessPace(p));
        if caps.intersects(NodeCaps::ON_OFF) {
            prog.push(Op::AddNodePartition(node));
        }
        if caps.contains(NodeCaps::START_STOP) {
            prog.push(Op::AddStartupConstraints(p));
            prog.push(Op::AddShutdownConstraints(p));
        }
        if caps.contains(NodeCaps::FIRST_COMMIT) {
            prog.push(Op::AddFirstCommitConstraints(p));
        }
        if caps.contains(NodeCaps::SEMI_CONTINUOUS) {
            prog.push(Op::AddSemiContinuousConstraints(p));
        }
        if caps.contains(NodeCaps::GRID_SLOPES) {
            prog.push(Op::AddGridProcessConstraints(p));
        }
    }
    for i in 0..model.products.len() as u32 {
        let q = ProductId(i);
        prog.push(Op::SetProductBounds(q));
        prog.push(Op::AddProductBalance(q));
        prog.push(Op::AddProductBoundConstraints(q));
    }
    for i in 0..model.constraints.len() as u32 {
        prog.push(Op::AddBoundLineConstraints(ConstraintId(i)));
    }
    for i in 0..model.grids.len() as u32 {
        prog.push(Op::AddKirchhoffConstraints(GridId(i)));
    }
    let mut peaked: Vec<NodeId> = alloc
        .nodes
        .iter()
        .filter(|(_, v)| v.block_peak.is_some())
        .map(|(n, _)| *n)
        .collect();
    peaked.sort_unstable();
    for node in peaked {
        prog.push(Op::AddPeakIncreaseConstraints(node));
    }
    for i in 0..model.actors.len() as u32 {
        prog.push(Op::AddCashConstraints(ActorId(i)));
        prog.push(Op::AddObjective(ActorId(i)));
    }
    alloc.program = prog;
}

/* ───────────────────── grid cycle basis ───────────────────── */

/// Fundamental cycles of each grid: grid processes are edges between
/// their input and output buses; non-tree edges close one cycle each.
pub fn grid_cycles(model: &Model) -> Vec<GridCycle> {
    let mut cycles = Vec::new();
    for (gi, _) in model.grids.iter().enumerate() {
        let grid = GridId(gi as u32);
        // collect edges (process, bus_in, bus_out)
        let mut edges: Vec<(ProcessId, ProductId, ProductId)> = Vec::new();
        for (i, p) in model.processes.iter().enumerate() {
            let Some(g) = &p.grid else { continue };
            if g.grid != grid {
                continue;
            }
            let pid = ProcessId(i as u32);
            let node = NodeId::Process(pid);
            let bus_in = model.links_into(node).find_map(|(_, l)| match l.from {
                NodeId::Product(q) => Some(q),
                _ => None,
            });
            let bus_out = model.links_out_of(node).find_map(|(_, l)| match l.to {
                NodeId::Product(q) => Some(q),
                _ => None,
            });
            if let (Some(a), Some(b)) = (bus_in, bus_out) {
                edges.push((pid, a, b));
            }
        }
        // spanning forest; each non-tree edge yields a fundamental cycle
        let mut parent: FxHashMap<ProductId, (ProductId, ProcessId, f64)> = FxHashMap::default();
        let mut root: FxHashMap<ProductId, ProductId> = FxHashMap::default();
        fn find(root: &FxHashMap<ProductId, ProductId>, mut q: ProductId) -> ProductId {
            while let Some(r) = root.get(&q) {
                if *r == q {
                    break;
                }
                q = *r;
            }
            q
        }
        for (p, a, b) in &edges {
            root.entry(*a).or_insert(*a);
            root.entry(*b).or_insert(*b);
            let (ra, rb) = (find(&root, *a), find(&root, *b));
            if ra != rb {
                // tree edge: hang b's tree under a
                reroot(&mut parent, *b);
                parent.insert(*b, (*a, *p, 1.0));
                let r = find(&root, *a);
                root.insert(rb, r);
                root.insert(*b, r);
            } else {
                // cycle: walk both vertices up to their common ancestor
                cycles.push(close_cycle(grid, &parent, *p, *a, *b));
            }
        }
    }
    cycles
}

fn reroot(
    parent: &mut FxHashMap<ProductId, (ProductId, ProcessId, f64)>,
    new_root: ProductId,
) {
    let mut chain = Vec::new();
    let mut q = new_root;
    while let Some(&(up, p, sign)) = parent.get(&q) {
        chain.push((q, up, p, sign));
        q = up;
    }
    for (child, up, p, sign) in chain {
        parent.remove(&child);
        parent.insert(up, (child, p, -sign));
    }
}

fn close_cycle(
    grid: GridId,
    parent: &FxHashMap<ProductId, (ProductId, ProcessId, f64)>,
    closing: ProcessId,
    a: ProductId,
    b: ProductId,
) -> GridCycle {
    let path_to_root = |mut q: ProductId| {
        let mut path = vec![q];
        while let Some(&(up, _, _)) = parent.get(&q) {
            q = up;
            path.push(q);
        }
        path
    };
    let pa = path_to_root(a);
    let pb = path_to_root(b);
    let common = *pa
        .iter()
        .find(|q| pb.contains(*q))
        .unwrap_or_else(|| pa.last().unwrap());

    let mut edges = vec![(closing, 1.0)];
    let mut q = b;
    while q != common {
        let (up, p, sign) = parent[&q];
        edges.push((p, sign));
        q = up;
    }
    let mut q = a;
    while q != common {
        let (up, p, sign) = parent[&q];
        edges.push((p, -sign));
        q = up;
    }
    GridCycle { grid, edges }
}

/* ───────────────────────── execution ───────────────────────── */

enum ColRef {
    In(u32),
    /// The step precedes the chunk; its value is already solved.
    Before(i32),
    /// The step lies beyond the chunk; the term is dropped.
    Beyond,
}

/// Flow terms of a link at one time step: per-step variable entries with
/// a step shift, chunk-column entries, and a constant part.
#[derive(Default)]
struct LinkTerms {
    entries: SmallVec<[(u32, i32, f64); 4]>,
    chunk_entries: SmallVec<[(u32, f64); 2]>,
    constant: f64,
}

pub struct Exec<'m> {
    pub model: &'m Model,
    pub ctx: &'m EvalContext<'m>,
    pub alloc: &'m Allocation,
    pub tab: Tableau,
    pub solver: SolverCaps,
    pub diagnose: bool,
    /// Absolute first step of the chunk (1-based).
    pub block_start: u32,
    pub block_length: u32,
    pub chunk_length: u32,
    pub round_ordinal: u32,
    /// Highest slack penalty for this block.
    pub slack_penalty: f64,
    /// Per-node peak level over all previous blocks.
    pub prior_peaks: &'m FxHashMap<NodeId, f64>,
    pub warnings: Vec<String>,
    pub max_cash_coefficient: f64,

    t_abs: i32,
    t_rel: u32,
    cash_in_rhs: f64,
    cash_out_rhs: f64,
}

impl<'m> Exec<'m> {
    pub fn new(
        model: &'m Model,
        ctx: &'m EvalContext<'m>,
        alloc: &'m Allocation,
        solver: SolverCaps,
        block_start: u32,
        block_length: u32,
        chunk_length: u32,
        round_ordinal: u32,
        slack_penalty: f64,
        prior_peaks: &'m FxHashMap<NodeId, f64>,
        diagnose: bool,
    ) -> Self {
        Exec {
            model,
            ctx,
            alloc,
            tab: Tableau::new(alloc.total_columns()),
            solver,
            diagnose,
            block_start,
            block_length,
            chunk_length,
            round_ordinal,
            slack_penalty,
            prior_peaks,
            warnings: Vec::new(),
            max_cash_coefficient: 0.0,
            t_abs: 0,
            t_rel: 0,
            cash_in_rhs: 0.0,
            cash_out_rhs: 0.0,
        }
    }

    /// Run the program for step `t_rel` (0-based within the chunk).
    pub fn run_step(&mut self, t_rel: u32) {
        self.t_rel = t_rel;
        self.t_abs = (self.block_start + t_rel) as i32;
        for i in 0..self.alloc.program.len() {
            self.op(self.alloc.program[i]);
        }
    }

    fn op(&mut self, op: Op) {
        match op {
            Op::SetProcessBounds(p) => self.set_process_bounds(p),
            Op::SetProductBounds(q) => self.set_product_bounds(q),
            Op::AddProcessPace(p) => self.add_process_pace(p),
            Op::AddNodePartition(n) => self.add_node_partition(n),
            Op::AddStartupConstraints(p) => self.add_startup(p),
            Op::AddShutdownConstraints(p) => self.add_shutdown(p),
            Op::AddFirstCommitConstraints(p) => self.add_first_commit(p),
            Op::AddSemiContinuousConstraints(p) => self.add_semi_continuous(p),
            Op::AddGridProcessConstraints(p) => self.add_grid_process(p),
            Op::AddPeakIncreaseConstraints(n) => self.add_peak_increase(n),
            Op::AddProductBalance(q) => self.add_product_balance(q),
            Op::AddProductBoundConstraints(q) => self.add_product_bound_rows(q),
            Op::AddBoundLineConstraints(c) => self.add_bound_lines(c),
            Op::AddKirchhoffConstraints(g) => self.add_kirchhoff(g),
            Op::AddCashConstraints(a) => self.add_cash_constraints(a),
            Op::AddObjective(a) => self.add_objective(a),
        }
    }

    /* ────────────── column arithmetic and micro-ops ────────────── */

    fn col(&self, vi: u32) -> u32 {
        self.t_rel * self.alloc.cols + vi
    }

    fn col_shift(&self, vi: u32, shift: i32) -> ColRef {
        let tr = self.t_rel as i32 + shift;
        if tr < 0 {
            ColRef::Before(self.t_abs + shift)
        } else if tr >= self.chunk_length as i32 {
            ColRef::Beyond
        } else {
            ColRef::In(tr as u32 * self.alloc.cols + vi)
        }
    }

    /// Add `c · x(vi, t+shift)` to the coefficient register; prior-chunk
    /// steps fold their solved value into the RHS, future steps beyond
    /// the chunk are dropped.
    fn add_var(&mut self, vi: u32, c: f64, shift: i32) {
        match self.col_shift(vi, shift) {
            ColRef::In(col) => self.tab.add_coefficient(col, c),
            ColRef::Before(t) => {
                let known = self.known_value(vi, t);
                self.tab.add_rhs(-c * known);
            }
            ColRef::Beyond => {}
        }
    }

    /// Solved value of a per-step variable at a pre-chunk step.
    fn known_value(&self, vi: u32, t: i32) -> f64 {
        let kind = self.alloc.kinds[(vi - 1) as usize];
        let level = |node: NodeId| {
            self.model
                .node_level(node, t)
                .finite()
                .unwrap_or(0.0)
        };
        match kind {
            VarKind::Level(n) => level(n),
            VarKind::OnOff(n) => {
                if level(n) > ON_OFF_THRESHOLD {
                    1.0
                } else {
                    0.0
                }
            }
            VarKind::IsZero(n) => {
                if level(n).abs() <= ON_OFF_THRESHOLD {
                    1.0
                } else {
                    0.0
                }
            }
            VarKind::Negative(n) => {
                if level(n) < -ON_OFF_THRESHOLD {
                    1.0
                } else {
                    0.0
                }
            }
            VarKind::PosLevel(n) => level(n).max(0.0),
            VarKind::NegLevel(n) => (-level(n)).max(0.0),
            VarKind::Startup(p) => {
                if t >= 0 && self.model.processes[p.index()].startups.contains(&(t as u32)) {
                    1.0
                } else {
                    0.0
                }
            }
            VarKind::Shutdown(p) => {
                if t >= 0 && self.model.processes[p.index()].shutdowns.contains(&(t as u32)) {
                    1.0
                } else {
                    0.0
                }
            }
            VarKind::StartCount(p) => self.model.processes[p.index()]
                .startups
                .iter()
                .filter(|s| (**s as i32) <= t)
                .count() as f64,
            VarKind::FirstCommit(p) => {
                let su = &self.model.processes[p.index()].startups;
                if t >= 0 && su.first() == Some(&(t as u32)) {
                    1.0
                } else {
                    0.0
                }
            }
            VarKind::CashIn(a) => read_level(&self.model.actors[a.index()].cash_in, t)
                .finite()
                .unwrap_or(0.0),
            VarKind::CashOut(a) => read_level(&self.model.actors[a.index()].cash_out, t)
                .finite()
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn bound_value(&self, e: &linnyr_eval::Expression, t: i32, fallback: f64) -> f64 {
        match e.result_at(self.ctx, t).region() {
            Region::Normal(x) => x,
            Region::PlusInfinity => {
                if self.diagnose {
                    DIAGNOSTIC_BOUND
                } else {
                    f64::INFINITY
                }
            }
            Region::MinusInfinity => {
                if self.diagnose {
                    -DIAGNOSTIC_BOUND
                } else {
                    f64::NEG_INFINITY
                }
            }
            _ => fallback,
        }
    }

    /// A finite big-M derived from an upper bound, capped and warned.
    fn big_m(&mut self, name: &str, ub: f64) -> f64 {
        if !ub.is_finite() {
            return BIG_M_MAX;
        }
        if ub > BIG_M_MAX {
            self.warnings.push(format!(
                "upper bound {ub:.3e} of {name} exceeds the big-M ceiling (bt={})",
                self.t_rel
            ));
            return BIG_M_MAX;
        }
        ub.max(1.0)
    }

    /* ────────────────────── bounds opcodes ────────────────────── */

    fn actor_is_fixated(&self, actor: ActorId) -> bool {
        let flags = self.model.actors[actor.index()].round_flags;
        self.round_ordinal > 0 && flags & (1 << (self.round_ordinal - 1)) == 0
    }

    fn set_process_bounds(&mut self, p: ProcessId) {
        let process = &self.model.processes[p.index()];
        let vars = self.alloc.node(NodeId::Process(p)).clone();
        let mut lb = self.bound_value(&process.lb, self.t_abs, 0.0);
        let mut ub = self.bound_value(&process.ub, self.t_abs, 0.0);
        if lb > ub {
            self.warnings
                .push(format!("LB > UB for process {} (bt={})", process.name, self.t_rel));
            lb = ub;
        }
        // round fixation: actors whose flag is clear keep the level of
        // the previous round
        if self.actor_is_fixated(process.actor) {
            if let Some(x) = self.model.node_level(NodeId::Process(p), self.t_abs).finite() {
                lb = x;
                ub = x;
            }
        }
        let col = self.col(vars.level);
        self.tab.set_bounds(col, lb, ub);
        if process.integer_level {
            self.tab.mark_integer(col);
        }
        if vars.caps.contains(NodeCaps::SEMI_CONTINUOUS) && self.solver.semi_continuous {
            self.tab.mark_semi_continuous(col);
        }
        // cascade to the partition family
        if let Some(v) = vars.pos_level {
            self.tab.set_bounds(self.col(v), 0.0, ub.max(0.0));
        }
        if let Some(v) = vars.neg_level {
            self.tab.set_bounds(self.col(v), 0.0, (-lb).max(0.0));
        }
        for v in [vars.pos_eps, vars.neg_eps].into_iter().flatten() {
            self.tab.set_bounds(self.col(v), 0.0, ON_OFF_THRESHOLD);
        }
        for v in [
            vars.on_off,
            vars.is_zero,
            vars.negative,
            vars.startup,
            vars.shutdown,
            vars.first_commit,
            vars.sc_binary,
        ]
        .into_iter()
        .flatten()
        {
            self.tab.mark_binary(self.col(v));
        }
        if let Some(v) = vars.start_count {
            let col = self.col(v);
            self.tab.set_bounds(col, 0.0, self.chunk_length as f64);
            self.tab.mark_integer(col);
        }
        // slope bands divide the bound range evenly
        if !vars.slopes.is_empty() {
            let n = vars.slopes.len() as f64;
            let up_band = ub.max(0.0) / n;
            let down_band = (-lb).max(0.0) / n;
            for (i, s) in vars.slopes.iter().enumerate() {
                let hi = (i + 1) as f64;
                self.tab.set_bounds(self.col(s.up), 0.0, up_band * hi);
                self.tab.set_bounds(self.col(s.down), 0.0, down_band * hi);
                self.tab.mark_binary(self.col(s.up_on));
                self.tab.mark_binary(self.col(s.down_on));
            }
        }
    }

    fn set_product_bounds(&mut self, q: ProductId) {
        let product = &self.model.products[q.index()];
        let vars = self.alloc.node(NodeId::Product(q)).clone();
        let col = self.col(vars.level);
        let lb = self.bound_value(&product.lb, self.t_abs, 0.0);
        let ub = self.bound_value(&product.ub, self.t_abs, f64::INFINITY);
        if self.alloc.slacks.contains_key(&q.0) {
            // bounds are enforced by slack rows; the level itself floats
            self.tab.set_unbounded(col);
            let (le, ge) = self.alloc.slacks[&q.0];
            self.tab.set_bounds(self.col(le), 0.0, f64::INFINITY);
            self.tab.set_bounds(self.col(ge), 0.0, f64::INFINITY);
        } else {
            self.tab.set_bounds(col, lb, ub);
        }
    }

    /* ────────────────────── structure opcodes ────────────────────── */

    /// Pace: with a pace of k, the level is pinned to its predecessor on
    /// every step that is not a multiple of k from the block grid.
    fn add_process_pace(&mut self, p: ProcessId) {
        let process = &self.model.processes[p.index()];
        let pace = process
            .pace
            .result_at(self.ctx, self.block_start as i32)
            .finite()
            .unwrap_or(1.0)
            .round() as i64;
        if pace <= 1 {
            return;
        }
        if (self.t_abs as i64 - 1) % pace == 0 {
            return;
        }
        let vars = self.alloc.node(NodeId::Process(p));
        self.tab.clear_coefficients();
        self.add_var(vars.level, 1.0, 0);
        self.add_var(vars.level, -1.0, -1);
        self.tab.add_constraint(RowType::Eq);
    }

    /// The NZP partition (or the simpler on/off pair when the level
    /// cannot go negative).
    fn add_node_partition(&mut self, node: NodeId) {
        let vars = self.alloc.node(node).clone();
        let (lb_e, ub_e) = self.model.node_bounds(node);
        let ub = self.bound_value(ub_e, self.t_abs, 0.0);
        let lb = self.bound_value(lb_e, self.t_abs, 0.0);
        let name = self.model.node_name(node).to_string();
        let m_up = self.big_m(&name, ub);
        let Some(on) = vars.on_off else { return };

        if !vars.caps.contains(NodeCaps::NZP) {
            // L − M·POS ≤ 0 ; L − ε·POS ≥ 0
            self.tab.clear_coefficients();
            self.add_var(vars.level, 1.0, 0);
            self.add_var(on, -m_up, 0);
            self.tab.add_constraint(RowType::Le);
            self.tab.clear_coefficients();
            self.add_var(vars.level, 1.0, 0);
            self.add_var(on, -ON_OFF_THRESHOLD, 0);
            self.tab.add_constraint(RowType::Ge);
            if let Some(off) = vars.is_zero {
                // POS + OFF = 1
                self.tab.clear_coefficients();
                self.add_var(on, 1.0, 0);
                self.add_var(off, 1.0, 0);
                self.tab.add_constraint(RowType::Eq);
            }
            return;
        }

        let m_down = self.big_m(&name, -lb);
        let (neg, posl, negl, pep, nep, off) = (
            vars.negative.unwrap(),
            vars.pos_level.unwrap(),
            vars.neg_level.unwrap(),
            vars.pos_eps.unwrap(),
            vars.neg_eps.unwrap(),
            vars.is_zero.unwrap(),
        );
        // L − POSL − PEP + NEP + NEGL = 0
        self.tab.clear_coefficients();
        self.add_var(vars.level, 1.0, 0);
        self.add_var(posl, -1.0, 0);
        self.add_var(pep, -1.0, 0);
        self.add_var(nep, 1.0, 0);
        self.add_var(negl, 1.0, 0);
        self.tab.add_constraint(RowType::Eq);
        // POSL tied to POS: POSL − M·POS ≤ 0 ; POSL − ε·POS ≥ 0
        self.tab.clear_coefficients();
        self.add_var(posl, 1.0, 0);
        self.add_var(on, -m_up, 0);
        self.tab.add_constraint(RowType::Le);
        self.tab.clear_coefficients();
        self.add_var(posl, 1.0, 0);
        self.add_var(on, -ON_OFF_THRESHOLD, 0);
        self.tab.add_constraint(RowType::Ge);
        // NEGL tied to NEG
        self.tab.clear_coefficients();
        self.add_var(negl, 1.0, 0);
        self.add_var(neg, -m_down, 0);
        self.tab.add_constraint(RowType::Le);
        self.tab.clear_coefficients();
        self.add_var(negl, 1.0, 0);
        self.add_var(neg, -ON_OFF_THRESHOLD, 0);
        self.tab.add_constraint(RowType::Ge);
        // epsilon parts only while OFF: PEP + NEP − ε·OFF ≤ 0
        self.tab.clear_coefficients();
        self.add_var(pep, 1.0, 0);
        self.add_var(nep, 1.0, 0);
        self.add_var(off, -ON_OFF_THRESHOLD, 0);
        self.tab.add_constraint(RowType::Le);
        // POS + NEG + OFF = 1, and POS + NEG ≤ 1
        self.tab.clear_coefficients();
        self.add_var(on, 1.0, 0);
        self.add_var(neg, 1.0, 0);
        self.add_var(off, 1.0, 0);
        self.tab.add_rhs(1.0);
        self.tab.add_constraint(RowType::Eq);
        self.tab.clear_coefficients();
        self.add_var(on, 1.0, 0);
        self.add_var(neg, 1.0, 0);
        self.tab.add_rhs(1.0);
        self.tab.add_constraint(RowType::Le);
    }

    fn add_startup(&mut self, p: ProcessId) {
        let vars = self.alloc.node(NodeId::Process(p)).clone();
        let (on, su) = (vars.on_off.unwrap(), vars.startup.unwrap());
        // POS[t] − POS[t−1] − SU ≤ 0
        self.tab.clear_coefficients();
        self.add_var(on, 1.0, 0);
        self.add_var(on, -1.0, -1);
        self.add_var(su, -1.0, 0);
        self.tab.add_constraint(RowType::Le);
        // SU − POS[t] ≤ 0
        self.tab.clear_coefficients();
        self.add_var(su, 1.0, 0);
        self.add_var(on, -1.0, 0);
        self.tab.add_constraint(RowType::Le);
        // SU + POS[t−1] ≤ 1
        self.tab.clear_coefficients();
        self.add_var(su, 1.0, 0);
        self.add_var(on, 1.0, -1);
        self.tab.add_rhs(1.0);
        self.tab.add_constraint(RowType::Le);
    }

    fn add_shutdown(&mut self, p: ProcessId) {
        let vars = self.alloc.node(NodeId::Process(p)).clone();
        let (on, sd) = (vars.on_off.unwrap(), vars.shutdown.unwrap());
        // POS[t−1] − POS[t] − SD ≤ 0
        self.tab.clear_coefficients();
        self.add_var(on, 1.0, -1);
        self.add_var(on, -1.0, 0);
        self.add_var(sd, -1.0, 0);
        self.tab.add_constraint(RowType::Le);
        // SD − POS[t−1] ≤ 0
        self.tab.clear_coefficients();
        self.add_var(sd, 1.0, 0);
        self.add_var(on, -1.0, -1);
        self.tab.add_constraint(RowType::Le);
        // SD + POS[t] ≤ 1
        self.tab.clear_coefficients();
        self.add_var(sd, 1.0, 0);
        self.add_var(on, 1.0, 0);
        self.tab.add_rhs(1.0);
        self.tab.add_constraint(RowType::Le);
    }

    fn add_first_commit(&mut self, p: ProcessId) {
        let vars = self.alloc.node(NodeId::Process(p)).clone();
        let (su, fc, suc) = (
            vars.startup.unwrap(),
            vars.first_commit.unwrap(),
            vars.start_count.unwrap(),
        );
        // SUC[t] − SUC[t−1] − SU = 0
        self.tab.clear_coefficients();
        self.add_var(suc, 1.0, 0);
        self.add_var(suc, -1.0, -1);
        self.add_var(su, -1.0, 0);
        self.tab.add_constraint(RowType::Eq);
        // SU − SUC[t−1] − FC ≤ 0
        self.tab.clear_coefficients();
        self.add_var(su, 1.0, 0);
        self.add_var(suc, -1.0, -1);
        self.add_var(fc, -1.0, 0);
        self.tab.add_constraint(RowType::Le);
        // FC − SU ≤ 0
        self.tab.clear_coefficients();
        self.add_var(fc, 1.0, 0);
        self.add_var(su, -1.0, 0);
        self.tab.add_constraint(RowType::Le);
        // FC + SUC[t−1]/chunk ≤ 1
        self.tab.clear_coefficients();
        self.add_var(fc, 1.0, 0);
        self.add_var(suc, 1.0 / self.chunk_length as f64, -1);
        self.tab.add_rhs(1.0);
        self.tab.add_constraint(RowType::Le);
    }

    fn add_semi_continuous(&mut self, p: ProcessId) {
        if self.solver.semi_continuous {
            return;
        }
        let process = &self.model.processes[p.index()];
        let vars = self.alloc.node(NodeId::Process(p)).clone();
        let Some(b) = vars.sc_binary else { return };
        let ub = self.bound_value(&process.ub, self.t_abs, 0.0);
        // while diagnosing the SC floor is dropped so infeasibilities
        // localize in slack instead
        let lb = if self.diagnose {
            0.0
        } else {
            self.bound_value(&process.lb, self.t_abs, 0.0)
        };
        let name = process.name.clone();
        let m = self.big_m(&name, ub);
        // L − ub·b ≤ 0 ; L − lb·b ≥ 0
        self.tab.clear_coefficients();
        self.add_var(vars.level, 1.0, 0);
        self.add_var(b, -m, 0);
        self.tab.add_constraint(RowType::Le);
        self.tab.clear_coefficients();
        self.add_var(vars.level, 1.0, 0);
        self.add_var(b, -lb, 0);
        self.tab.add_constraint(RowType::Ge);
        // the level column itself must then admit 0
        let col = self.col(vars.level);
        self.tab.set_bounds(col, 0.0, ub.max(0.0));
    }

    fn add_grid_process(&mut self, p: ProcessId) {
        let vars = self.alloc.node(NodeId::Process(p)).clone();
        if vars.slopes.is_empty() {
            return;
        }
        // level decomposes into its active slope band:
        // L − ΣUp_i + ΣDown_i = 0 (or PSC/NSC when partitioned)
        self.tab.clear_coefficients();
        if let (Some(posl), Some(negl)) = (vars.pos_level, vars.neg_level) {
            self.add_var(posl, 1.0, 0);
            self.add_var(negl, -1.0, 0);
        } else {
            self.add_var(vars.level, 1.0, 0);
        }
        for s in &vars.slopes {
            self.add_var(s.up, -1.0, 0);
            self.add_var(s.down, 1.0, 0);
        }
        self.tab.add_constraint(RowType::Eq);

        let n = vars.slopes.len() as f64;
        let (lb_e, ub_e) = self.model.node_bounds(NodeId::Process(p));
        let ub = self.bound_value(ub_e, self.t_abs, 0.0).max(0.0);
        let lb = (-self.bound_value(lb_e, self.t_abs, 0.0)).max(0.0);
        for (i, s) in vars.slopes.iter().enumerate() {
            let up_hi = ub / n * (i + 1) as f64;
            let up_lo = ub / n * i as f64;
            let down_hi = lb / n * (i + 1) as f64;
            let down_lo = lb / n * i as f64;
            // Up_i − hi·UpOn_i ≤ 0 ; Up_i − lo·UpOn_i ≥ 0
            self.tab.clear_coefficients();
            self.add_var(s.up, 1.0, 0);
            self.add_var(s.up_on, -up_hi, 0);
            self.tab.add_constraint(RowType::Le);
            self.tab.clear_coefficients();
            self.add_var(s.up, 1.0, 0);
            self.add_var(s.up_on, -up_lo, 0);
            self.tab.add_constraint(RowType::Ge);
            self.tab.clear_coefficients();
            self.add_var(s.down, 1.0, 0);
            self.add_var(s.down_on, -down_hi, 0);
            self.tab.add_constraint(RowType::Le);
            self.tab.clear_coefficients();
            self.add_var(s.down, 1.0, 0);
            self.add_var(s.down_on, -down_lo, 0);
            self.tab.add_constraint(RowType::Ge);
        }
        // at most one band active in either direction
        self.tab.clear_coefficients();
        for s in &vars.slopes {
            self.add_var(s.up_on, 1.0, 0);
            self.add_var(s.down_on, 1.0, 0);
        }
        self.tab.add_rhs(1.0);
        self.tab.add_constraint(RowType::Le);
    }

    fn add_peak_increase(&mut self, node: NodeId) {
        let vars = self.alloc.node(node).clone();
        let (Some(bpi), Some(cpi)) = (vars.block_peak, vars.la_peak) else {
            return;
        };
        let prior = self.prior_peaks.get(&node).copied().unwrap_or(0.0);
        self.tab.clear_coefficients();
        self.add_var(vars.level, 1.0, 0);
        self.tab.add_coefficient(bpi, -1.0);
        if self.t_rel >= self.block_length {
            self.tab.add_coefficient(cpi, -1.0);
        }
        self.tab.add_rhs(prior);
        self.tab.add_constraint(RowType::Le);
        self.tab.set_bounds(bpi, 0.0, f64::INFINITY);
        self.tab.set_bounds(cpi, 0.0, f64::INFINITY);
    }

    /* ────────────────────── link flow terms ────────────────────── */

    fn link_delay(&self, link: LinkId) -> i32 {
        self.model.links[link.index()]
            .delay
            .result_at(self.ctx, self.t_abs)
            .finite()
            .unwrap_or(0.0)
            .round() as i32
    }

    fn link_rate(&self, link: LinkId) -> f64 {
        self.model.links[link.index()]
            .rate
            .result_at(self.ctx, self.t_abs)
            .finite_or_free()
            .unwrap_or(0.0)
    }

    /// The flow of `link` at the current step, as coefficient terms. The
    /// driving node is the process side of the link: a product→process
    /// link draws at the process's level, with the same multiplier
    /// semantics as a process→product link.
    fn link_flow_terms(&mut self, link: LinkId, depth: u8) -> LinkTerms {
        let mut terms = LinkTerms::default();
        let l = &self.model.links[link.index()];
        let rate = self.link_rate(link);
        let d = self.link_delay(link);
        let mult = l.multiplier;
        let (driver, output_side) = match (l.from, l.to) {
            (NodeId::Process(p), _) => (NodeId::Process(p), true),
            (_, NodeId::Process(p)) => (NodeId::Process(p), false),
            _ => (l.from, true),
        };
        // throughput folds the FROM product's inflows, not a process
        let driver = if mult == LinkMultiplier::Throughput {
            l.from
        } else {
            driver
        };
        let vars = match self.alloc.nodes.get(&driver) {
            Some(v) => v.clone(),
            None => return terms,
        };
        match mult {
            LinkMultiplier::Level => {
                if vars.slopes.is_empty() {
                    terms.entries.push((vars.level, -d, rate));
                } else {
                    // grid losses are charged at the delivering end: the
                    // output bus receives the reduced band power, the
                    // input bus supplies it in full (and vice versa for
                    // reverse flow through the Down bands)
                    let g = match driver {
                        NodeId::Process(p) => {
                            self.model.processes[p.index()].grid.clone().unwrap()
                        }
                        NodeId::Product(_) => return terms,
                    };
                    for (i, s) in vars.slopes.iter().enumerate() {
                        let loss = g.loss_slopes[i.min(2)];
                        if output_side {
                            terms.entries.push((s.up, -d, rate * (1.0 - loss)));
                            terms.entries.push((s.down, -d, -rate));
                        } else {
                            terms.entries.push((s.up, -d, rate));
                            terms.entries.push((s.down, -d, -rate * (1.0 - loss)));
                        }
                    }
                }
            }
            LinkMultiplier::Sum | LinkMultiplier::Mean => {
                if d <= 0 {
                    terms.entries.push((vars.level, -d, rate));
                } else {
                    let w = if mult == LinkMultiplier::Mean {
                        rate / (d + 1) as f64
                    } else {
                        rate
                    };
                    for i in 0..=d {
                        terms.entries.push((vars.level, -i, w));
                    }
                }
            }
            LinkMultiplier::Increase => {
                terms.entries.push((vars.level, -d, rate));
                terms.entries.push((vars.level, -d - 1, -rate));
            }
            LinkMultiplier::MaxIncrease => {
                let (_, ub_e) = self.model.node_bounds(driver);
                let ub = self.bound_value(ub_e, self.t_abs - d, 0.0);
                terms.entries.push((vars.level, -d, -rate));
                terms.constant += rate * if ub.is_finite() { ub } else { BIG_M_MAX };
            }
            LinkMultiplier::MaxDecrease => {
                let (lb_e, _) = self.model.node_bounds(driver);
                let lb = self.bound_value(lb_e, self.t_abs - d, 0.0);
                terms.entries.push((vars.level, -d, rate));
                terms.constant -= rate * if lb.is_finite() { lb } else { -BIG_M_MAX };
            }
            LinkMultiplier::SpinningReserve => {
                let (_, ub_e) = self.model.node_bounds(driver);
                let ub = self.bound_value(ub_e, self.t_abs - d, 0.0);
                let name = self.model.node_name(driver).to_string();
                let m = self.big_m(&name, ub);
                if let Some(on) = vars.on_off {
                    terms.entries.push((on, -d, rate * m));
                }
                terms.entries.push((vars.level, -d, -rate));
            }
            LinkMultiplier::Startup => {
                if let Some(su) = vars.startup {
                    terms.entries.push((su, -d, rate));
                }
            }
            LinkMultiplier::Shutdown => {
                if let Some(sd) = vars.shutdown {
                    terms.entries.push((sd, -d, rate));
                }
            }
            LinkMultiplier::FirstCommit => {
                if let Some(fc) = vars.first_commit {
                    terms.entries.push((fc, -d, rate));
                }
            }
            LinkMultiplier::Positive => {
                if let Some(on) = vars.on_off {
                    terms.entries.push((on, -d, rate));
                }
            }
            LinkMultiplier::Zero => {
                if let Some(z) = vars.is_zero {
                    terms.entries.push((z, -d, rate));
                }
            }
            LinkMultiplier::Negative => {
                if let Some(n) = vars.negative {
                    terms.entries.push((n, -d, rate));
                }
            }
            LinkMultiplier::PeakInc => {
                if self.t_rel == 0 {
                    if let Some(bpi) = vars.block_peak {
                        terms.chunk_entries.push((bpi, rate));
                    }
                }
                if self.t_rel == self.block_length {
                    if let Some(cpi) = vars.la_peak {
                        terms.chunk_entries.push((cpi, rate));
                    }
                }
            }
            LinkMultiplier::Throughput => {
                if depth == 0 {
                    let upstream: Vec<LinkId> =
                        self.model.links_into(driver).map(|(id, _)| id).collect();
                    for lz in upstream {
                        let inner = self.link_flow_terms(lz, 1);
                        for (vi, shift, c) in inner.entries {
                            terms.entries.push((vi, shift, c * rate));
                        }
                        terms.constant += inner.constant * rate;
                    }
                }
            }
            LinkMultiplier::CostPrice => {}
        }
        terms
    }

    /// Fold flow terms into the coefficient register with `sign`.
    fn push_terms(&mut self, terms: &LinkTerms, sign: f64) {
        for (vi, shift, c) in &terms.entries {
            self.add_var(*vi, sign * c, *shift);
        }
        for (col, c) in &terms.chunk_entries {
            self.tab.add_coefficient(*col, sign * c);
        }
        self.tab.add_rhs(-sign * terms.constant);
    }

    /* ────────────────────── product opcodes ────────────────────── */

    /// The balance: L = carry-over + inflow − outflow, as a strict EQ.
    fn add_product_balance(&mut self, q: ProductId) {
        let product = &self.model.products[q.index()];
        let is_buffer = product.is_buffer;
        let node = NodeId::Product(q);
        let vars = self.alloc.node(node).clone();
        self.tab.clear_coefficients();
        self.add_var(vars.level, 1.0, 0);
        if is_buffer {
            if self.t_rel == 0 && self.block_start == 1 {
                // the first step carries the initial level as a constant
                let il = self.model.products[q.index()]
                    .initial_level
                    .result_at(self.ctx, 0)
                    .finite()
                    .unwrap_or(0.0);
                self.tab.add_rhs(il);
            } else {
                self.add_var(vars.level, -1.0, -1);
            }
        }
        let inbound: Vec<LinkId> = self.model.links_into(node).map(|(id, _)| id).collect();
        for link in inbound {
            let terms = self.link_flow_terms(link, 0);
            self.push_terms(&terms, -1.0);
        }
        let outbound: Vec<LinkId> = self.model.links_out_of(node).map(|(id, _)| id).collect();
        for link in outbound {
            let terms = self.link_flow_terms(link, 0);
            self.push_terms(&terms, 1.0);
        }
        self.tab.add_constraint(RowType::Eq);
    }

    /// Level bounds as slack-relaxed rows (or nothing when the product
    /// has plain column bounds).
    fn add_product_bound_rows(&mut self, q: ProductId) {
        let Some(&(le, ge)) = self.alloc.slacks.get(&q.0) else {
            return;
        };
        let product = &self.model.products[q.index()];
        let vars = self.alloc.node(NodeId::Product(q)).clone();
        let lb = self.bound_value(&product.lb, self.t_abs, 0.0);
        let ub = self.bound_value(&product.ub, self.t_abs, f64::INFINITY);
        if product.equal_bounds {
            // one EQ row: L − S⁺ + S⁻ = LB
            self.tab.clear_coefficients();
            self.add_var(vars.level, 1.0, 0);
            self.add_var(le, -1.0, 0);
            self.add_var(ge, 1.0, 0);
            let r = self.tab.add_constraint(RowType::Eq);
            self.tab.rhs[r] += lb;
            return;
        }
        if ub.is_finite() {
            // L − S⁺ ≤ UB
            self.tab.clear_coefficients();
            self.add_var(vars.level, 1.0, 0);
            self.add_var(le, -1.0, 0);
            let r = self.tab.add_constraint(RowType::Le);
            self.tab.rhs[r] += ub;
        }
        if lb.is_finite() {
            // L + S⁻ ≥ LB
            self.tab.clear_coefficients();
            self.add_var(vars.level, 1.0, 0);
            self.add_var(ge, 1.0, 0);
            let r = self.tab.add_constraint(RowType::Ge);
            self.tab.rhs[r] += lb;
        }
    }

    /* ────────────────────── bound lines ────────────────────── */

    fn add_bound_lines(&mut self, c: ConstraintId) {
        let constraint = &self.model.constraints[c.index()];
        let (from, to) = (constraint.from, constraint.to);
        let Some(xv) = self.alloc.nodes.get(&from).map(|v| v.level) else {
            return;
        };
        let Some(yv) = self.alloc.nodes.get(&to).map(|v| v.level) else {
            return;
        };
        let (lbx_e, ubx_e) = self.model.node_bounds(from);
        let (lbx, ubx) = (
            self.bound_value(lbx_e, self.t_abs, 0.0),
            self.bound_value(ubx_e, self.t_abs, 0.0),
        );
        let (lby_e, uby_e) = self.model.node_bounds(to);
        let (lby, uby) = (
            self.bound_value(lby_e, self.t_abs, 0.0),
            self.bound_value(uby_e, self.t_abs, 0.0),
        );
        let lines = constraint.lines.clone();
        for (li, line) in lines.iter().enumerate() {
            let lv = self.alloc.lines[&(c.0, li as u16)].clone();
            // materialize the vertices for this step
            let xs: Vec<f64> = line
                .points
                .iter()
                .map(|(px, _)| lbx + px / 100.0 * (ubx - lbx))
                .collect();
            let ys: Vec<f64> = line
                .points
                .iter()
                .map(|(_, py)| lby + py / 100.0 * (uby - lby))
                .collect();
            // Σw = 1
            self.tab.clear_coefficients();
            for w in &lv.weights {
                self.add_var(*w, 1.0, 0);
                let col = self.col(*w);
                self.tab.set_bounds(col, 0.0, 1.0);
            }
            let r = self.tab.add_constraint(RowType::Eq);
            self.tab.rhs[r] = 1.0;
            // X = Σ x_i·w_i
            self.tab.clear_coefficients();
            self.add_var(xv, 1.0, 0);
            for (w, x) in lv.weights.iter().zip(&xs) {
                self.add_var(*w, -x, 0);
            }
            self.tab.add_constraint(RowType::Eq);
            // Y (op) Σ y_i·w_i, slack-relaxed
            self.tab.clear_coefficients();
            self.add_var(yv, 1.0, 0);
            for (w, y) in lv.weights.iter().zip(&ys) {
                self.add_var(*w, -y, 0);
            }
            match line.kind {
                RowType::Le => {
                    if let Some(s) = lv.slack_le {
                        self.add_var(s, -1.0, 0);
                    }
                }
                RowType::Ge => {
                    if let Some(s) = lv.slack_ge {
                        self.add_var(s, 1.0, 0);
                    }
                }
                RowType::Eq => {
                    if let Some(s) = lv.slack_le {
                        self.add_var(s, -1.0, 0);
                    }
                    if let Some(s) = lv.slack_ge {
                        self.add_var(s, 1.0, 0);
                    }
                }
            }
            self.tab.add_constraint(line.kind);
            for s in [lv.slack_le, lv.slack_ge].into_iter().flatten() {
                let col = self.col(s);
                self.tab.set_bounds(col, 0.0, f64::INFINITY);
            }
            // adjacency: SOS2 when available, vertex binaries otherwise
            if !line.needs_no_sos {
                if self.solver.sos {
                    let group: Vec<u32> = lv.weights.iter().map(|w| self.col(*w)).collect();
                    self.tab.add_sos2(group);
                } else if !lv.binaries.is_empty() {
                    for (i, w) in lv.weights.iter().enumerate() {
                        self.tab.clear_coefficients();
                        self.add_var(*w, 1.0, 0);
                        if i > 0 {
                            self.add_var(lv.binaries[i - 1], -1.0, 0);
                        }
                        self.add_var(lv.binaries[i], -1.0, 0);
                        self.tab.add_constraint(RowType::Le);
                    }
                    self.tab.clear_coefficients();
                    for b in &lv.binaries {
                        self.add_var(*b, 1.0, 0);
                        let col = self.col(*b);
                        self.tab.mark_binary(col);
                    }
                    let r = self.tab.add_constraint(RowType::Le);
                    self.tab.rhs[r] = 2.0;
                }
            }
        }
    }

    /* ────────────────────── grids ────────────────────── */

    /// Kirchhoff voltage law per fundamental cycle; cycles broken by a
    /// zero-capacity edge are skipped at this step.
    fn add_kirchhoff(&mut self, g: GridId) {
        let cycles: Vec<GridCycle> = self
            .alloc
            .cycles
            .iter()
            .filter(|c| c.grid == g)
            .cloned()
            .collect();
        let reactance = self.model.grids[g.index()].reactance_per_km;
        for cycle in cycles {
            let mut broken = false;
            for (p, _) in &cycle.edges {
                let ub = self.bound_value(&self.model.processes[p.index()].ub, self.t_abs, 0.0);
                if ub == 0.0 {
                    broken = true;
                    break;
                }
            }
            if broken {
                continue;
            }
            self.tab.clear_coefficients();
            for (p, sign) in &cycle.edges {
                let length = self.model.processes[p.index()]
                    .grid
                    .as_ref()
                    .map(|gp| gp.length_km)
                    .unwrap_or(0.0);
                let vars = self.alloc.node(NodeId::Process(*p));
                self.add_var(vars.level, sign * length * reactance, 0);
            }
            self.tab.add_constraint(RowType::Eq);
        }
    }

    /* ────────────────────── cash and objective ────────────────────── */

    /// Dispatch one link's cash contribution into the actor registers.
    fn update_cash_coefficient(&mut self, link: LinkId) {
        let l = &self.model.links[link.index()];
        if l.multiplier == LinkMultiplier::CostPrice {
            // cost prices are unknown while building; post-solve only
            return;
        }
        let (product, direction) = match (l.from, l.to) {
            (NodeId::Process(_), NodeId::Product(q)) => (q, 1.0),
            (NodeId::Product(q), NodeId::Process(_)) => (q, -1.0),
            _ => return,
        };
        let price = self.model.products[product.index()]
            .price
            .result_at(self.ctx, self.t_abs)
            .finite_or_free()
            .unwrap_or(0.0);
        if price == 0.0 {
            return;
        }
        let terms = self.link_flow_terms(link, 0);
        // money = price × flow; direction +1 sells, −1 buys
        let amount = price * direction;
        let into_cash_in = amount > 0.0;
        let scale = amount.abs();
        for (vi, shift, c) in &terms.entries {
            if let ColRef::In(col) = self.col_shift(*vi, *shift) {
                let coeff = scale * c;
                self.max_cash_coefficient = self.max_cash_coefficient.max(coeff.abs());
                let reg = if into_cash_in {
                    &mut self.tab.cash_in_register
                } else {
                    &mut self.tab.cash_out_register
                };
                *reg.entry(col).or_insert(0.0) += coeff;
            } else if let ColRef::Before(t) = self.col_shift(*vi, *shift) {
                let known = self.known_value(*vi, t);
                if into_cash_in {
                    self.cash_in_rhs += scale * c * known;
                } else {
                    self.cash_out_rhs += scale * c * known;
                }
            }
        }
        for (col, c) in &terms.chunk_entries {
            let coeff = scale * c;
            self.max_cash_coefficient = self.max_cash_coefficient.max(coeff.abs());
            let reg = if into_cash_in {
                &mut self.tab.cash_in_register
            } else {
                &mut self.tab.cash_out_register
            };
            *reg.entry(*col).or_insert(0.0) += coeff;
        }
        if into_cash_in {
            self.cash_in_rhs += scale * terms.constant;
        } else {
            self.cash_out_rhs += scale * terms.constant;
        }
    }

    /// `CashIn − Σaᵢxᵢ = const` and `CashOut − Σbᵢxᵢ = const` for one
    /// actor; both rows are recorded for post-build rescaling.
    fn add_cash_constraints(&mut self, a: ActorId) {
        let (cin, cout) = self.alloc.actors[&a.0];
        self.tab.cash_in_register.clear();
        self.tab.cash_out_register.clear();
        self.cash_in_rhs = 0.0;
        self.cash_out_rhs = 0.0;
        let links: Vec<LinkId> = (0..self.model.links.len() as u32).map(LinkId).collect();
        for link in links {
            let l = &self.model.links[link.index()];
            let process = match (l.from, l.to) {
                (NodeId::Process(p), _) => p,
                (_, NodeId::Process(p)) => p,
                _ => continue,
            };
            if self.model.processes[process.index()].actor != a || self.alloc.is_ignored(process) {
                continue;
            }
            self.update_cash_coefficient(link);
        }
        let cin_col = self.col(cin);
        let cout_col = self.col(cout);
        self.tab.set_unbounded(cin_col);
        self.tab.set_unbounded(cout_col);

        self.tab.clear_coefficients();
        self.tab.add_coefficient(cin_col, 1.0);
        let entries: Vec<(u32, f64)> = self.tab.cash_in_register.drain().collect();
        for (col, v) in entries {
            self.tab.add_coefficient(col, -v);
        }
        self.tab.add_rhs(self.cash_in_rhs);
        self.tab.add_cash_constraint(RowType::Eq, cin_col);

        self.tab.clear_coefficients();
        self.tab.add_coefficient(cout_col, 1.0);
        let entries: Vec<(u32, f64)> = self.tab.cash_out_register.drain().collect();
        for (col, v) in entries {
            self.tab.add_coefficient(col, -v);
        }
        self.tab.add_rhs(self.cash_out_rhs);
        self.tab.add_cash_constraint(RowType::Eq, cout_col);
    }

    /// Actor weight × net cash into the objective, plus slack penalties.
    fn add_objective(&mut self, a: ActorId) {
        let w = self.model.actors[a.index()]
            .weight
            .result_at(self.ctx, self.t_abs)
            .finite()
            .unwrap_or(1.0);
        let (cin, cout) = self.alloc.actors[&a.0];
        self.tab.add_objective(self.col(cin), w);
        self.tab.add_objective(self.col(cout), -w);
        // slack penalties are attached once per step, with the first actor
        if a.0 != 0 {
            return;
        }
        let slacks: Vec<(u32, u32)> = self.alloc.slacks.values().copied().collect();
        for (le, ge) in slacks {
            self.tab.add_objective(self.col(le), -self.slack_penalty);
            self.tab.add_objective(self.col(ge), -self.slack_penalty);
        }
        let lines: Vec<LineVars> = self.alloc.lines.values().cloned().collect();
        for lv in lines {
            for s in [lv.slack_le, lv.slack_ge].into_iter().flatten() {
                self.tab.add_objective(self.col(s), -self.slack_penalty);
            }
        }
    }
}
