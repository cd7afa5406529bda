//! The block orchestrator.
//!
//! Slices the horizon into chunks, runs the round sequence per block,
//! scales the objective and the cash rows, hands the serialized tableau
//! to the solver adapter, decodes the primal vector into entity vectors
//! in strict time order, and computes the dependent variables (link
//! flows, cash, cost prices, peaks) once the block is in.

use crate::builder::{self, Allocation, Exec, VarKind, ON_OFF_THRESHOLD};
use crate::model::{read_level, LinkId, LinkMultiplier, Model, NodeId, ProcessId, ProductId};
use crate::serialize;
use crate::solver::{SolverAdapter, SolverCaps};
use linnyr_common::{ConfigError, Value};
use linnyr_eval::{EvalContext, SimSpan};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Base factor of the highest slack penalty.
const SLACK_PENALTY_BASE: f64 = 1000.0;
/// Ceiling on the slack penalty so it stays inside the numeric envelope.
const SLACK_PENALTY_MAX: f64 = 1e11;
/// Slack above this decodes into a block warning.
const SLACK_REPORT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Default, Clone)]
pub struct BlockOutcome {
    pub block: u32,
    /// Non-zero when any round of the block failed.
    pub status: i32,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub seconds: f64,
    pub objective_scalar: f64,
    pub cash_scalar: f64,
    /// Decoded (block-peak, look-ahead-peak) chunk variables per node.
    pub peak_increases: FxHashMap<NodeId, (f64, f64)>,
}

impl BlockOutcome {
    pub fn has_issues(&self) -> bool {
        self.status != 0 || !self.issues.is_empty() || !self.warnings.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub blocks: Vec<BlockOutcome>,
    pub halted: bool,
    pub license_expired_count: u32,
}

impl RunOutcome {
    /// One-line summaries for the issue browser.
    pub fn issue_list(&self) -> Vec<String> {
        let mut out = Vec::new();
        for b in &self.blocks {
            for i in &b.issues {
                out.push(format!("block {}: {i}", b.block));
            }
            for w in &b.warnings {
                out.push(format!("block {} (warning): {w}", b.block));
            }
        }
        out
    }
}

pub struct Solve<'a> {
    model: &'a mut Model,
    adapter: &'a mut dyn SolverAdapter,
    halt: Option<&'a AtomicBool>,
}

impl<'a> Solve<'a> {
    pub fn new(model: &'a mut Model, adapter: &'a mut dyn SolverAdapter) -> Self {
        Solve {
            model,
            adapter,
            halt: None,
        }
    }

    /// The flag is polled before each block and at every opcode batch of
    /// the builder; once set, no further blocks run.
    pub fn with_halt(mut self, halt: &'a AtomicBool) -> Self {
        self.halt = halt.into();
        self
    }

    fn halted(&self) -> bool {
        self.halt.map(|h| h.load(Ordering::Relaxed)).unwrap_or(false)
    }

    pub fn run(&mut self) -> Result<RunOutcome, ConfigError> {
        self.model.run.validate()?;
        self.model.reset_results();
        let caps = self.adapter.capabilities();
        let diagnose = self.model.run.diagnose;
        let span = self.model.sim_span();
        let rounds = self.model.run.round_letters();

        write_initial_levels(self.model, &span);
        let alloc = builder::allocate(self.model, caps, diagnose);
        let slack_penalty = slack_penalty(self.model, span.block_length + span.look_ahead);
        info!(
            blocks = span.block_count,
            chunk = span.block_length + span.look_ahead,
            columns = alloc.total_columns(),
            slack_penalty,
            "starting solver run"
        );

        let mut outcome = RunOutcome::default();
        let mut prior_peaks: FxHashMap<NodeId, f64> = FxHashMap::default();

        for b in 1..=span.block_count {
            if self.halted() {
                outcome.halted = true;
                break;
            }
            let block_start = (b - 1) * span.block_length + 1;
            let effective = (span.n + span.look_ahead + 1 - block_start)
                .min(span.block_length + span.look_ahead);
            self.model.invalidate_dynamic_from(block_start as i32);

            let mut block = BlockOutcome {
                block: b,
                objective_scalar: 1.0,
                cash_scalar: 1.0,
                ..Default::default()
            };
            block.warnings.extend(alloc.warnings.iter().cloned());

            for (ri, round) in rounds.iter().enumerate() {
                if self.halted() {
                    outcome.halted = true;
                    break;
                }
                let solved = self.run_round(
                    &alloc,
                    caps,
                    &span,
                    b,
                    block_start,
                    effective,
                    *round,
                    ri as u32 + 1,
                    rounds.len() as u32,
                    slack_penalty,
                    &prior_peaks,
                    diagnose,
                    &mut block,
                    &mut outcome.license_expired_count,
                );
                if !solved {
                    // later rounds build on this round's levels; stop here
                    break;
                }
            }

            if block.status == 0 {
                compute_dependent_variables(
                    self.model,
                    block_start,
                    span.block_length,
                    effective,
                    &mut block,
                );
            }
            update_prior_peaks(self.model, &alloc, &mut prior_peaks, block_start, span.block_length);
            if block.has_issues() {
                warn!(block = b, status = block.status, "block finished with issues");
            } else {
                debug!(block = b, "block solved");
            }
            outcome.blocks.push(block);
        }
        Ok(outcome)
    }

    fn run_round(
        &mut self,
        alloc: &Allocation,
        caps: SolverCaps,
        span: &SimSpan,
        b: u32,
        block_start: u32,
        effective: u32,
        round: char,
        round_ordinal: u32,
        round_count: u32,
        slack_penalty: f64,
        prior_peaks: &FxHashMap<NodeId, f64>,
        diagnose: bool,
        block: &mut BlockOutcome,
        license_counter: &mut u32,
    ) -> bool {
        let text = {
            let model = &*self.model;
            let mut ctx = EvalContext::new(model, *span);
            ctx.round.set(round_ordinal);
            ctx.round_count = round_count;
            ctx.last_round = round_count;
            let mut exec = Exec::new(
                model,
                &ctx,
                alloc,
                caps,
                block_start,
                span.block_length,
                effective,
                round_ordinal,
                slack_penalty,
                prior_peaks,
                diagnose,
            );
            for t_rel in 0..effective {
                if self.halted() {
                    return false;
                }
                exec.run_step(t_rel);
            }
            block.warnings.append(&mut exec.warnings);
            block.objective_scalar = exec.tab.scale_objective();
            exec.tab.scale_cash_rows(exec.max_cash_coefficient);
            block.cash_scalar = exec.tab.cash_scalar;
            match serialize::serialize(&exec.tab, caps, alloc.cols, b, round) {
                Ok(text) => text,
                Err(e) => {
                    block.status = -1;
                    block.issues.push(e.to_string());
                    warn!(block = b, round = %round, "serialization aborted: {e}");
                    return false;
                }
            }
        };

        let result = self.adapter.solve(&text, b, round);
        block.seconds += result.seconds;
        for m in &result.messages {
            if m.to_ascii_lowercase().contains("license") && m.to_ascii_lowercase().contains("expir")
            {
                *license_counter += 1;
                block.issues.push(m.clone());
            }
        }
        if result.status != 0 || !result.solution_available {
            // prior look-ahead values stay in place instead of garbage
            block.status = result.status;
            block
                .issues
                .push(format!("solver status {} in round {round}", result.status));
            for m in result.messages {
                block.issues.push(m);
            }
            return false;
        }
        decode_solution(
            self.model,
            alloc,
            &result.x,
            block_start,
            effective,
            block,
            caps,
        );
        true
    }
}

/// Index 0 of every level vector carries the initial level.
fn write_initial_levels(model: &mut Model, span: &SimSpan) {
    let ctx = EvalContext::new(&*model, *span);
    let mut levels: Vec<(NodeId, Value)> = Vec::new();
    for (i, p) in model.processes.iter().enumerate() {
        let il = p.initial_level.result_at(&ctx, 0);
        levels.push((NodeId::Process(ProcessId(i as u32)), il));
    }
    for (i, q) in model.products.iter().enumerate() {
        let il = q.initial_level.result_at(&ctx, 0);
        levels.push((NodeId::Product(ProductId(i as u32)), il));
    }
    drop(ctx);
    for (node, il) in levels {
        model.set_node_level(node, 0, Value::number(il.finite().unwrap_or(0.0)));
    }
}

/// `hsp = BASE · chunk_length · max(1, √#processes · highest_rate + 1)`,
/// clamped to the configured maximum.
fn slack_penalty(model: &Model, chunk_length: u32) -> f64 {
    let ctx = EvalContext::new(model, model.sim_span());
    let mut highest_rate: f64 = 0.0;
    for l in &model.links {
        l.rate.compile(&ctx);
        if l.rate.is_static() {
            if let Some(r) = l.rate.result_at(&ctx, 0).finite() {
                highest_rate = highest_rate.max(r.abs());
            }
        }
    }
    let n = model.processes.len() as f64;
    let hsp = SLACK_PENALTY_BASE
        * chunk_length as f64
        * (n.sqrt() * highest_rate + 1.0).max(1.0);
    hsp.min(SLACK_PENALTY_MAX)
}

fn decode_solution(
    model: &mut Model,
    alloc: &Allocation,
    x: &[f64],
    block_start: u32,
    effective: u32,
    block: &mut BlockOutcome,
    caps: SolverCaps,
) {
    let get = |col: u32| x.get((col - 1) as usize).copied().unwrap_or(0.0);
    // startups decoded this block replace the provisional look-ahead ones
    for p in &mut model.processes {
        p.startups.retain(|s| *s < block_start);
        p.shutdowns.retain(|s| *s < block_start);
    }
    for t_rel in 0..effective {
        let t_abs = (block_start + t_rel) as usize;
        for vi in 1..=alloc.cols {
            let col = t_rel * alloc.cols + vi;
            let v = get(col);
            match alloc.kinds[(vi - 1) as usize] {
                VarKind::Level(node) => {
                    let snapped = if v.abs() <= ON_OFF_THRESHOLD {
                        Value::ZERO
                    } else if v >= caps.infinity {
                        Value::PLUS_INFINITY
                    } else if v <= -caps.infinity {
                        Value::MINUS_INFINITY
                    } else {
                        Value::number(v)
                    };
                    if snapped.is_infinite() && model.run.diagnose {
                        block
                            .warnings
                            .push(format!("infinite level for {} at t={t_abs}", model.node_name(node)));
                    }
                    model.set_node_level(node, t_abs, snapped);
                }
                VarKind::Startup(p) => {
                    if v > 0.5 {
                        model.processes[p.index()].startups.push(t_abs as u32);
                    }
                }
                VarKind::Shutdown(p) => {
                    if v > 0.5 {
                        model.processes[p.index()].shutdowns.push(t_abs as u32);
                    }
                }
                VarKind::CashIn(a) => {
                    let actor = &mut model.actors[a.index()];
                    store(&mut actor.cash_in, t_abs, v * block.cash_scalar);
                }
                VarKind::CashOut(a) => {
                    let actor = &mut model.actors[a.index()];
                    store(&mut actor.cash_out, t_abs, v * block.cash_scalar);
                }
                VarKind::SlackLe(q) | VarKind::SlackGe(q) => {
                    if v > SLACK_REPORT_TOLERANCE {
                        block.warnings.push(format!(
                            "slack {v:.6} used by product {} at t={t_abs}",
                            model.products[q.index()].name
                        ));
                    }
                }
                VarKind::LineSlackLe(c, _) | VarKind::LineSlackGe(c, _) => {
                    if v > SLACK_REPORT_TOLERANCE {
                        block.warnings.push(format!(
                            "slack {v:.6} used by constraint {} at t={t_abs}",
                            model.constraints[c.index()].name
                        ));
                    }
                }
                _ => {}
            }
        }
    }
    // chunk variables sit after the per-step blocks
    for (k, kind) in alloc.chunk_kinds.iter().enumerate() {
        let v = get(alloc.chunk_column(k));
        match kind {
            VarKind::BlockPeak(node) => {
                block.peak_increases.entry(*node).or_insert((0.0, 0.0)).0 = v;
            }
            VarKind::LookAheadPeak(node) => {
                block.peak_increases.entry(*node).or_insert((0.0, 0.0)).1 = v;
            }
            _ => {}
        }
    }
    for a in model.actors.iter_mut() {
        for t_rel in 0..effective {
            let t = (block_start + t_rel) as usize;
            let cin = read_level(&a.cash_in, t as i32).finite().unwrap_or(0.0);
            let cout = read_level(&a.cash_out, t as i32).finite().unwrap_or(0.0);
            store(&mut a.cash_flow, t, cin - cout);
            if cin - cout < 0.0 {
                // negative actor cash is reported once per step
                block
                    .warnings
                    .push(format!("negative cash flow for actor {} at t={t}", a.name));
            }
        }
    }
}

fn store(vec: &mut Vec<Value>, t: usize, v: f64) {
    if vec.len() <= t {
        vec.resize(t + 1, Value::NOT_COMPUTED);
    }
    vec[t] = Value::number(v);
}

fn update_prior_peaks(
    model: &Model,
    alloc: &Allocation,
    peaks: &mut FxHashMap<NodeId, f64>,
    block_start: u32,
    block_length: u32,
) {
    for (node, vars) in &alloc.nodes {
        if vars.block_peak.is_none() {
            continue;
        }
        let mut peak = peaks.get(node).copied().unwrap_or(0.0);
        for t in block_start..block_start + block_length {
            if let Some(x) = model.node_level(*node, t as i32).finite() {
                peak = peak.max(x);
            }
        }
        peaks.insert(*node, peak);
    }
}

/* ───────────────── dependent variables ───────────────── */

fn compute_dependent_variables(
    model: &mut Model,
    block_start: u32,
    block_length: u32,
    effective: u32,
    block: &mut BlockOutcome,
) {
    let flows = {
        let m = &*model;
        let ctx = EvalContext::new(m, m.sim_span());
        let mut flows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); m.links.len()];
        for t_rel in 0..effective {
            let t = (block_start + t_rel) as i32;
            for (i, _) in m.links.iter().enumerate() {
                let f = actual_flow(
                    m,
                    &ctx,
                    LinkId(i as u32),
                    t,
                    block_start,
                    block_length,
                    &block.peak_increases,
                );
                flows[i].push((t as usize, f));
            }
        }
        flows
    };
    for (i, per_t) in flows.iter().enumerate() {
        for (t, f) in per_t {
            store(&mut model.links[i].flow, *t, *f);
        }
    }

    compute_cost_prices(model, block_start, effective);
    compute_cash_vectors(model, block_start, effective);
    compute_constraint_activity(model, block_start, effective);
}

/// Realized flow of a link from the decoded levels and binaries.
fn actual_flow(
    model: &Model,
    ctx: &EvalContext,
    link: LinkId,
    t: i32,
    block_start: u32,
    block_length: u32,
    peak_increases: &FxHashMap<NodeId, (f64, f64)>,
) -> f64 {
    let l = &model.links[link.index()];
    let rate = l.rate.result_at(ctx, t).finite_or_free().unwrap_or(0.0);
    let d = l
        .delay
        .result_at(ctx, t)
        .finite()
        .unwrap_or(0.0)
        .round() as i32;
    let td = t - d;
    let driver = match (l.from, l.to) {
        (NodeId::Process(p), _) => NodeId::Process(p),
        (_, NodeId::Process(p)) => NodeId::Process(p),
        _ => l.from,
    };
    let level = |at: i32| model.node_level(driver, at).finite().unwrap_or(0.0);
    let on = |at: i32| (level(at) > ON_OFF_THRESHOLD) as i32 as f64;
    match l.multiplier {
        LinkMultiplier::Level => rate * level(td),
        LinkMultiplier::Sum => {
            let mut acc = 0.0;
            for i in 0..=d.max(0) {
                acc += level(t - i);
            }
            rate * acc
        }
        LinkMultiplier::Mean => {
            let n = d.max(0) + 1;
            let mut acc = 0.0;
            for i in 0..n {
                acc += level(t - i);
            }
            rate * acc / n as f64
        }
        LinkMultiplier::Increase => rate * (level(td) - level(td - 1)),
        LinkMultiplier::MaxIncrease => {
            let (_, ub_e) = model.node_bounds(driver);
            let ub = ub_e.result_at(ctx, td).finite().unwrap_or(0.0);
            rate * (ub - level(td))
        }
        LinkMultiplier::MaxDecrease => {
            let (lb_e, _) = model.node_bounds(driver);
            let lb = lb_e.result_at(ctx, td).finite().unwrap_or(0.0);
            rate * (level(td) - lb)
        }
        LinkMultiplier::SpinningReserve => {
            let (_, ub_e) = model.node_bounds(driver);
            let ub = ub_e.result_at(ctx, td).finite().unwrap_or(0.0);
            rate * (ub * on(td) - level(td))
        }
        LinkMultiplier::Startup => match driver {
            NodeId::Process(p) => {
                rate * model.processes[p.index()].startups.contains(&(td.max(0) as u32)) as i32 as f64
            }
            _ => 0.0,
        },
        LinkMultiplier::Shutdown => match driver {
            NodeId::Process(p) => {
                rate * model.processes[p.index()].shutdowns.contains(&(td.max(0) as u32)) as i32
                    as f64
            }
            _ => 0.0,
        },
        LinkMultiplier::FirstCommit => match driver {
            NodeId::Process(p) => {
                rate * (model.processes[p.index()].startups.first() == Some(&(td.max(0) as u32)))
                    as i32 as f64
            }
            _ => 0.0,
        },
        LinkMultiplier::Positive => rate * on(td),
        LinkMultiplier::Zero => rate * (level(td).abs() <= ON_OFF_THRESHOLD) as i32 as f64,
        LinkMultiplier::Negative => rate * (level(td) < -ON_OFF_THRESHOLD) as i32 as f64,
        LinkMultiplier::PeakInc => {
            // the additional capacity materializes at the start of the
            // block (and of the look-ahead, for the extra rise there)
            let (bpi, cpi) = peak_increases.get(&driver).copied().unwrap_or((0.0, 0.0));
            if t as u32 == block_start {
                rate * bpi
            } else if t as u32 == block_start + block_length {
                rate * cpi
            } else {
                0.0
            }
        }
        LinkMultiplier::Throughput => {
            let mut acc = 0.0;
            for (li, _) in model.links_into(l.from) {
                acc += model.links[li.index()]
                    .flow
                    .get(t.max(0) as usize)
                    .and_then(|v| v.finite())
                    .unwrap_or(0.0);
            }
            rate * acc
        }
        LinkMultiplier::CostPrice => {
            let cp = match l.from {
                NodeId::Product(q) => model.products[q.index()]
                    .cost_price
                    .get(td.max(0) as usize)
                    .and_then(|v| v.finite_or_free())
                    .unwrap_or(0.0),
                NodeId::Process(p) => model.processes[p.index()]
                    .cost_price
                    .get(td.max(0) as usize)
                    .and_then(|v| v.finite_or_free())
                    .unwrap_or(0.0),
            };
            rate * cp
        }
    }
}

/// Per-process and per-product cost prices: a product's unit cost is its
/// price when set, otherwise the flow-weighted mean of its producers'
/// cost prices; a process's cost price is the cost of its inputs per
/// unit of level. Chains settle in as many passes as they are long.
fn compute_cost_prices(model: &mut Model, block_start: u32, effective: u32) {
    let span = model.sim_span();
    for _pass in 0..model.processes.len().max(1) {
        for t_rel in 0..effective {
            let t = (block_start + t_rel) as usize;
            let mut process_cp: Vec<Value> = Vec::with_capacity(model.processes.len());
            {
                let m = &*model;
                let ctx = EvalContext::new(m, span);
                for (i, _) in m.processes.iter().enumerate() {
                    let node = NodeId::Process(ProcessId(i as u32));
                    let mut cost = 0.0;
                    let mut any = false;
                    for (_, l) in m.links_into(node) {
                        let NodeId::Product(q) = l.from else { continue };
                        let rate = l.rate.result_at(&ctx, t as i32).finite_or_free().unwrap_or(0.0);
                        if let Some(u) = product_unit_cost(m, &ctx, q, t) {
                            cost += rate * u;
                            any = true;
                        }
                    }
                    process_cp.push(if any { Value::number(cost) } else { Value::NO_COST });
                }
            }
            for (i, cp) in process_cp.into_iter().enumerate() {
                store_value(&mut model.processes[i].cost_price, t, cp);
            }

            let mut product_cp: Vec<(Value, Value)> = Vec::with_capacity(model.products.len());
            {
                let m = &*model;
                for (i, q) in m.products.iter().enumerate() {
                    let node = NodeId::Product(ProductId(i as u32));
                    let mut weighted = 0.0;
                    let mut flow_sum = 0.0;
                    let mut highest: Option<f64> = None;
                    for (li, l) in m.links_into(node) {
                        let NodeId::Process(p) = l.from else { continue };
                        let f = m.links[li.index()]
                            .flow
                            .get(t)
                            .and_then(|v| v.finite())
                            .unwrap_or(0.0);
                        if let Some(cp) = m.processes[p.index()]
                            .cost_price
                            .get(t)
                            .and_then(|v| v.finite())
                        {
                            weighted += f * cp;
                            flow_sum += f;
                            highest = Some(highest.map_or(cp, |h: f64| h.max(cp)));
                        }
                    }
                    let cp = if flow_sum > 0.0 {
                        Value::number(weighted / flow_sum)
                    } else {
                        q.cost_price.get(t).copied().unwrap_or(Value::NO_COST)
                    };
                    let hcp = match highest {
                        Some(h) => Value::number(h),
                        None => Value::NO_COST,
                    };
                    product_cp.push((cp, hcp));
                }
            }
            for (i, (cp, hcp)) in product_cp.into_iter().enumerate() {
                store_value(&mut model.products[i].cost_price, t, cp);
                store_value(&mut model.products[i].highest_cost_price, t, hcp);
            }
        }
    }
}

fn product_unit_cost(
    m: &Model,
    ctx: &EvalContext,
    q: ProductId,
    t: usize,
) -> Option<f64> {
    let product = &m.products[q.index()];
    let price = product.price.result_at(ctx, t as i32);
    if let Some(p) = price.finite() {
        if p != 0.0 {
            return Some(p);
        }
    }
    product.cost_price.get(t).and_then(|v| v.finite())
}

fn store_value(vec: &mut Vec<Value>, t: usize, v: Value) {
    if vec.len() <= t {
        vec.resize(t + 1, Value::NOT_COMPUTED);
    }
    vec[t] = v;
}

/// Process cash from link flows and product prices; actors and clusters
/// roll up their member processes.
fn compute_cash_vectors(model: &mut Model, block_start: u32, effective: u32) {
    let span = model.sim_span();
    let per_process: Vec<Vec<(usize, f64, f64)>> = {
        let m = &*model;
        let ctx = EvalContext::new(m, span);
        let mut acc: Vec<Vec<(usize, f64, f64)>> = vec![Vec::new(); m.processes.len()];
        for t_rel in 0..effective {
            let t = (block_start + t_rel) as usize;
            for (i, _) in m.processes.iter().enumerate() {
                let mut cin = 0.0;
                let mut cout = 0.0;
                let node = NodeId::Process(ProcessId(i as u32));
                for (li, l) in m
                    .links
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| l.from == node || l.to == node)
                {
                    let (product, direction) = match (l.from, l.to) {
                        (NodeId::Process(_), NodeId::Product(q)) => (q, 1.0),
                        (NodeId::Product(q), NodeId::Process(_)) => (q, -1.0),
                        _ => continue,
                    };
                    let price = m.products[product.index()]
                        .price
                        .result_at(&ctx, t as i32)
                        .finite_or_free()
                        .unwrap_or(0.0);
                    if price == 0.0 {
                        continue;
                    }
                    let flow = m.links[li]
                        .flow
                        .get(t)
                        .and_then(|v| v.finite())
                        .unwrap_or(0.0);
                    let money = price * flow * direction;
                    if money > 0.0 {
                        cin += money;
                    } else {
                        cout -= money;
                    }
                }
                acc[i].push((t, cin, cout));
            }
        }
        acc
    };
    for (i, rows) in per_process.iter().enumerate() {
        for (t, cin, cout) in rows {
            let p = &mut model.processes[i];
            store(&mut p.cash_in, *t, *cin);
            store(&mut p.cash_out, *t, *cout);
            store(&mut p.cash_flow, *t, cin - cout);
            let level = p.level.get(*t).and_then(|v| v.finite()).unwrap_or(0.0);
            let mcf = if level.abs() > ON_OFF_THRESHOLD {
                (cin - cout) / level
            } else {
                0.0
            };
            store(&mut p.marginal_cash_flow, *t, mcf);
        }
    }
    // cluster roll-ups
    for c in 0..model.clusters.len() {
        let members = model.clusters[c].processes.clone();
        for t_rel in 0..effective {
            let t = (block_start + t_rel) as usize;
            let mut cin = 0.0;
            let mut cout = 0.0;
            for p in &members {
                cin += model.processes[p.index()]
                    .cash_in
                    .get(t)
                    .and_then(|v| v.finite())
                    .unwrap_or(0.0);
                cout += model.processes[p.index()]
                    .cash_out
                    .get(t)
                    .and_then(|v| v.finite())
                    .unwrap_or(0.0);
            }
            let cluster = &mut model.clusters[c];
            store(&mut cluster.cash_in, t, cin);
            store(&mut cluster.cash_out, t, cout);
            store(&mut cluster.cash_flow, t, cin - cout);
        }
    }
}

/// Constraint attribute `A`: 1 when the realized (X, Y) point lies on a
/// bound line within tolerance.
fn compute_constraint_activity(model: &mut Model, block_start: u32, effective: u32) {
    let span = model.sim_span();
    let activity: Vec<Vec<(usize, f64)>> = {
        let m = &*model;
        let ctx = EvalContext::new(m, span);
        let mut acc: Vec<Vec<(usize, f64)>> = vec![Vec::new(); m.constraints.len()];
        for (i, c) in m.constraints.iter().enumerate() {
            let (lbx_e, ubx_e) = m.node_bounds(c.from);
            let (lby_e, uby_e) = m.node_bounds(c.to);
            for t_rel in 0..effective {
                let t = (block_start + t_rel) as i32;
                let x = m.node_level(c.from, t).finite().unwrap_or(0.0);
                let y = m.node_level(c.to, t).finite().unwrap_or(0.0);
                let lbx = lbx_e.result_at(&ctx, t).finite().unwrap_or(0.0);
                let ubx = ubx_e.result_at(&ctx, t).finite().unwrap_or(0.0);
                let lby = lby_e.result_at(&ctx, t).finite().unwrap_or(0.0);
                let uby = uby_e.result_at(&ctx, t).finite().unwrap_or(0.0);
                let mut active = 0.0;
                for line in &c.lines {
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
                    if (polyline_y(&xs, &ys, x) - y).abs() <= 1e-6 {
                        active = 1.0;
                        break;
                    }
                }
                acc[i].push((t as usize, active));
            }
        }
        acc
    };
    for (i, rows) in activity.into_iter().enumerate() {
        for (t, a) in rows {
            store(&mut model.constraints[i].active, t, a);
        }
    }
}

/// Piecewise-linear interpolation along the polyline vertices.
fn polyline_y(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    if x <= xs[0] {
        return ys[0];
    }
    for i in 1..xs.len() {
        if x <= xs[i] {
            let span = xs[i] - xs[i - 1];
            if span.abs() < 1e-12 {
                return ys[i];
            }
            let f = (x - xs[i - 1]) / span;
            return ys[i - 1] + f * (ys[i] - ys[i - 1]);
        }
    }
    *ys.last().unwrap()
}
