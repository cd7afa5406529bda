//! The entity model: arenas of actors, processes, products, links,
//! constraints, clusters, datasets and power grids, plus the
//! [`ModelView`] implementation that lets expressions read any of them.

mod entities;

pub use entities::*;

use linnyr_common::{
    is_level_based, match_pattern, EntityKind, EntityRef, ErrorKind, RunConfig, TimeUnit, Value,
};
use linnyr_eval::{
    reduce_stat, EvalContext, Expression, ModelView, RefInfo, ReferenceClassifier, SimSpan,
    VarSpec,
};
use linnyr_parse::RunSpec;
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("a link must connect a process and a product, not {0} and {1}")]
    BadLinkEndpoints(EntityKind, EntityKind),
    #[error("a throughput link cannot originate from process '{0}'")]
    ThroughputFromProcess(String),
    #[error("link multiplier {0} requires a process source, not product '{1}'")]
    NeedsProcessSource(LinkMultiplier, String),
    #[error("process '{0}' belongs to no power grid")]
    NotAGridProcess(String),
}

pub struct Model {
    pub actors: Vec<Actor>,
    pub processes: Vec<Process>,
    pub products: Vec<Product>,
    pub links: Vec<Link>,
    pub constraints: Vec<Constraint>,
    pub clusters: Vec<Cluster>,
    pub datasets: Vec<Dataset>,
    pub grids: Vec<PowerGrid>,
    /// Equations and methods: named modifiers of the equations dataset.
    pub equations: Vec<Modifier>,
    pub experiments: ExperimentStore,
    pub run: RunConfig,
    /// Steps per model time unit and the unit itself; one step lasts
    /// `time_scale × time_unit.hours()` hours.
    pub time_scale: f64,
    pub time_unit: TimeUnit,
    pub scale_units: FxHashMap<String, f64>,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        let mut m = Model {
            actors: Vec::new(),
            processes: Vec::new(),
            products: Vec::new(),
            links: Vec::new(),
            constraints: Vec::new(),
            clusters: Vec::new(),
            datasets: Vec::new(),
            grids: Vec::new(),
            equations: Vec::new(),
            experiments: ExperimentStore::default(),
            run: RunConfig::default(),
            time_scale: 1.0,
            time_unit: TimeUnit::Hour,
            scale_units: FxHashMap::default(),
        };
        m.add_actor("(no actor)", "1");
        m
    }

    pub fn dt_hours(&self) -> f64 {
        self.time_scale * self.time_unit.hours()
    }

    pub fn sim_span(&self) -> SimSpan {
        SimSpan {
            n: self.run.simulation_length(),
            look_ahead: self.run.look_ahead,
            block_length: self.run.block_length,
            block_count: self.run.block_count(),
            dt_hours: self.dt_hours(),
        }
    }

    /// Vector length for result vectors: index 0 plus N + look-ahead.
    fn vector_len(&self) -> usize {
        (self.run.simulation_length() + self.run.look_ahead) as usize + 1
    }

    fn expr(&self, kind: EntityKind, name: &str, attr: &str, text: &str) -> Expression {
        Expression::new(EntityRef::new(kind, name), attr, text)
    }

    /* ─────────────────────── construction ─────────────────────── */

    pub fn add_actor(&mut self, name: &str, weight: &str) -> ActorId {
        let id = ActorId(self.actors.len() as u32);
        self.actors.push(Actor {
            name: name.to_string(),
            weight: self.expr(EntityKind::Actor, name, "W", weight),
            round_flags: u32::MAX,
            cash_in: Vec::new(),
            cash_out: Vec::new(),
            cash_flow: Vec::new(),
        });
        id
    }

    pub fn add_process(&mut self, name: &str, actor: ActorId) -> ProcessId {
        let id = ProcessId(self.processes.len() as u32);
        let k = EntityKind::Process;
        self.processes.push(Process {
            name: name.to_string(),
            actor,
            lb: self.expr(k, name, "LB", "0"),
            ub: self.expr(k, name, "UB", "0"),
            initial_level: self.expr(k, name, "IL", "0"),
            pace: self.expr(k, name, "LCF", "1"),
            integer_level: false,
            semi_continuous: false,
            grid: None,
            level: Vec::new(),
            cash_in: Vec::new(),
            cash_out: Vec::new(),
            cash_flow: Vec::new(),
            marginal_cash_flow: Vec::new(),
            cost_price: Vec::new(),
            startups: Vec::new(),
            shutdowns: Vec::new(),
        });
        id
    }

    pub fn set_process_bounds(&mut self, p: ProcessId, lb: &str, ub: &str) {
        let name = self.processes[p.index()].name.clone();
        self.processes[p.index()].lb = self.expr(EntityKind::Process, &name, "LB", lb);
        self.processes[p.index()].ub = self.expr(EntityKind::Process, &name, "UB", ub);
    }

    pub fn add_product(&mut self, name: &str) -> ProductId {
        let id = ProductId(self.products.len() as u32);
        let k = EntityKind::Product;
        self.products.push(Product {
            name: name.to_string(),
            lb: self.expr(k, name, "LB", "0"),
            ub: self.expr(k, name, "UB", "0"),
            price: self.expr(k, name, "P", "0"),
            initial_level: self.expr(k, name, "IL", "0"),
            is_buffer: false,
            is_data: false,
            no_slack: false,
            equal_bounds: false,
            level: Vec::new(),
            cost_price: Vec::new(),
            highest_cost_price: Vec::new(),
        });
        id
    }

    pub fn set_product_bounds(&mut self, p: ProductId, lb: &str, ub: &str) {
        let name = self.products[p.index()].name.clone();
        self.products[p.index()].lb = self.expr(EntityKind::Product, &name, "LB", lb);
        self.products[p.index()].ub = self.expr(EntityKind::Product, &name, "UB", ub);
    }

    pub fn set_product_price(&mut self, p: ProductId, price: &str) {
        let name = self.products[p.index()].name.clone();
        self.products[p.index()].price = self.expr(EntityKind::Product, &name, "P", price);
    }

    /// Connect two nodes. Links run between a process and a product; the
    /// multipliers that read binaries need a process source. These are
    /// hard modeling errors, not warnings.
    pub fn connect(
        &mut self,
        from: NodeId,
        to: NodeId,
        multiplier: LinkMultiplier,
        rate: &str,
    ) -> Result<LinkId, ModelError> {
        match (from, to) {
            (NodeId::Process(_), NodeId::Product(_)) | (NodeId::Product(_), NodeId::Process(_)) => {}
            _ => {
                return Err(ModelError::BadLinkEndpoints(from.kind(), to.kind()));
            }
        }
        if multiplier == LinkMultiplier::Throughput {
            if let NodeId::Process(p) = from {
                return Err(ModelError::ThroughputFromProcess(
                    self.processes[p.index()].name.clone(),
                ));
            }
        }
        if multiplier.needs_binaries() || multiplier == LinkMultiplier::PeakInc {
            if let NodeId::Product(q) = from {
                if multiplier != LinkMultiplier::PeakInc {
                    return Err(ModelError::NeedsProcessSource(
                        multiplier,
                        self.products[q.index()].name.clone(),
                    ));
                }
            }
        }
        let id = LinkId(self.links.len() as u32);
        let name = self.link_name_of(from, to);
        self.links.push(Link {
            from,
            to,
            multiplier,
            rate: self.expr(EntityKind::Link, &name, "R", rate),
            delay: self.expr(EntityKind::Link, &name, "D", "0"),
            share_of_cost: 0.0,
            flow: Vec::new(),
        });
        Ok(id)
    }

    pub fn set_link_delay(&mut self, l: LinkId, delay: &str) {
        let link = &self.links[l.index()];
        let name = self.link_name_of(link.from, link.to);
        self.links[l.index()].delay = self.expr(EntityKind::Link, &name, "D", delay);
    }

    pub fn add_constraint(
        &mut self,
        name: &str,
        from: NodeId,
        to: NodeId,
        lines: Vec<BoundLine>,
    ) -> ConstraintId {
        let id = ConstraintId(self.constraints.len() as u32);
        self.constraints.push(Constraint {
            name: name.to_string(),
            from,
            to,
            lines,
            share_of_cost: 0.0,
            active: Vec::new(),
        });
        id
    }

    pub fn add_cluster(&mut self, name: &str, processes: Vec<ProcessId>) -> ClusterId {
        let id = ClusterId(self.clusters.len() as u32);
        self.clusters.push(Cluster {
            name: name.to_string(),
            processes,
            cash_in: Vec::new(),
            cash_out: Vec::new(),
            cash_flow: Vec::new(),
        });
        id
    }

    pub fn add_dataset(&mut self, name: &str, default_value: f64) -> DatasetId {
        let id = DatasetId(self.datasets.len() as u32);
        self.datasets.push(Dataset {
            name: name.to_string(),
            default_value: Value::number(default_value),
            data: Vec::new(),
            data_dt_hours: self.dt_hours(),
            method: Default::default(),
            modifiers: Vec::new(),
        });
        id
    }

    pub fn add_modifier(&mut self, ds: DatasetId, selector: &str, text: &str) {
        let name = self.datasets[ds.index()].name.clone();
        let expression = self.expr(EntityKind::Dataset, &name, selector, text);
        self.datasets[ds.index()].modifiers.push(Modifier {
            selector: selector.to_string(),
            expression,
        });
    }

    pub fn add_equation(&mut self, name: &str, text: &str) {
        let expression = self.expr(EntityKind::Equation, name, name, text);
        self.equations.push(Modifier {
            selector: name.to_string(),
            expression,
        });
    }

    pub fn add_grid(&mut self, name: &str, reactance_per_km: f64, loss_approximation: u8) -> GridId {
        let id = GridId(self.grids.len() as u32);
        self.grids.push(PowerGrid {
            name: name.to_string(),
            power_unit: "MW".into(),
            reactance_per_km,
            loss_approximation: loss_approximation.min(3),
        });
        id
    }

    pub fn set_grid_process(
        &mut self,
        p: ProcessId,
        grid: GridId,
        length_km: f64,
        loss_slopes: [f64; 3],
    ) {
        self.processes[p.index()].grid = Some(GridProcess {
            grid,
            length_km,
            loss_slopes,
        });
    }

    /* ─────────────────────── graph lookups ─────────────────────── */

    pub fn link_name_of(&self, from: NodeId, to: NodeId) -> String {
        format!("{}->{}", self.node_name(from), self.node_name(to))
    }

    pub fn node_name(&self, node: NodeId) -> &str {
        match node {
            NodeId::Process(p) => &self.processes[p.index()].name,
            NodeId::Product(q) => &self.products[q.index()].name,
        }
    }

    pub fn links_into(&self, node: NodeId) -> impl Iterator<Item = (LinkId, &Link)> {
        self.links
            .iter()
            .enumerate()
            .filter(move |(_, l)| l.to == node)
            .map(|(i, l)| (LinkId(i as u32), l))
    }

    pub fn links_out_of(&self, node: NodeId) -> impl Iterator<Item = (LinkId, &Link)> {
        self.links
            .iter()
            .enumerate()
            .filter(move |(_, l)| l.from == node)
            .map(|(i, l)| (LinkId(i as u32), l))
    }

    /// The level vector of a node, `NotComputed` reading as 0 (unsolved
    /// steps count as zero in expressions, per the evaluation contract).
    pub fn node_level(&self, node: NodeId, t: i32) -> Value {
        let vec = match node {
            NodeId::Process(p) => &self.processes[p.index()].level,
            NodeId::Product(q) => &self.products[q.index()].level,
        };
        read_level(vec, t)
    }

    pub fn node_bounds(&self, node: NodeId) -> (&Expression, &Expression) {
        match node {
            NodeId::Process(p) => (&self.processes[p.index()].lb, &self.processes[p.index()].ub),
            NodeId::Product(q) => (&self.products[q.index()].lb, &self.products[q.index()].ub),
        }
    }

    pub fn set_node_level(&mut self, node: NodeId, t: usize, v: Value) {
        let vec = match node {
            NodeId::Process(p) => &mut self.processes[p.index()].level,
            NodeId::Product(q) => &mut self.products[q.index()].level,
        };
        if vec.len() <= t {
            vec.resize(t + 1, Value::NOT_COMPUTED);
        }
        vec[t] = v;
    }

    /* ─────────────────────── lifecycle ─────────────────────── */

    /// Clear all result vectors and expression caches ahead of a run.
    pub fn reset_results(&mut self) {
        let len = self.vector_len();
        let fresh = || vec![Value::NOT_COMPUTED; len];
        for a in &mut self.actors {
            a.weight.reset();
            a.cash_in = fresh();
            a.cash_out = fresh();
            a.cash_flow = fresh();
        }
        for p in &mut self.processes {
            for e in [&p.lb, &p.ub, &p.initial_level, &p.pace] {
                e.reset();
            }
            p.level = fresh();
            p.cash_in = fresh();
            p.cash_out = fresh();
            p.cash_flow = fresh();
            p.marginal_cash_flow = fresh();
            p.cost_price = vec![Value::NO_COST; len];
            p.startups.clear();
            p.shutdowns.clear();
        }
        for q in &mut self.products {
            for e in [&q.lb, &q.ub, &q.price, &q.initial_level] {
                e.reset();
            }
            q.level = fresh();
            q.cost_price = vec![Value::NO_COST; len];
            q.highest_cost_price = vec![Value::NO_COST; len];
        }
        for l in &mut self.links {
            l.rate.reset();
            l.delay.reset();
            l.flow = fresh();
        }
        for c in &mut self.constraints {
            c.active = fresh();
        }
        for c in &mut self.clusters {
            c.cash_in = fresh();
            c.cash_out = fresh();
            c.cash_flow = fresh();
        }
        for d in &mut self.datasets {
            for m in &d.modifiers {
                m.expression.reset();
            }
        }
        for e in &self.equations {
            e.expression.reset();
        }
    }

    /// Drop dynamic expression caches from step `t` on; called at each
    /// block boundary so stale look-ahead values recompute.
    pub fn invalidate_dynamic_from(&self, t: i32) {
        let each = |e: &Expression| {
            if !e.is_static() {
                e.invalidate_from(t);
            }
        };
        for a in &self.actors {
            each(&a.weight);
        }
        for p in &self.processes {
            for e in [&p.lb, &p.ub, &p.initial_level, &p.pace] {
                each(e);
            }
        }
        for q in &self.products {
            for e in [&q.lb, &q.ub, &q.price, &q.initial_level] {
                each(e);
            }
        }
        for l in &self.links {
            each(&l.rate);
            each(&l.delay);
        }
        for d in &self.datasets {
            for m in &d.modifiers {
                each(&m.expression);
            }
        }
        for e in &self.equations {
            each(&e.expression);
        }
    }

    /* ─────────────────────── value resolution ─────────────────────── */

    fn dataset_value(&self, ctx: &EvalContext, ds: &Dataset, attr: &str, t: i32) -> Value {
        if attr.is_empty() {
            if ds.data.is_empty() {
                return ds.default_value;
            }
            let x = ds.method.resample(
                &ds.data,
                ds.data_dt_hours,
                self.dt_hours(),
                t.max(1) as u32,
                ds.default_value.finite_or_free().unwrap_or(0.0),
            );
            return Value::number(x);
        }
        // exact selector match wins over wildcard selectors
        for m in &ds.modifiers {
            if m.selector.eq_ignore_ascii_case(attr) {
                return m.expression.result(ctx, t, None);
            }
        }
        for m in &ds.modifiers {
            if let Some(context) = match_pattern(&m.selector, attr) {
                return m.expression.result(ctx, t, Some(context));
            }
        }
        Value::error(ErrorKind::BadRef)
    }

    fn equation_value(&self, ctx: &EvalContext, pattern: &str, t: i32) -> Option<Value> {
        // "object:method" binds the prefix as the method object
        if let Some((prefix, method)) = pattern.split_once(':') {
            if !prefix.is_empty() {
                let name = format!(":{method}");
                let eq = self
                    .equations
                    .iter()
                    .find(|e| e.selector.eq_ignore_ascii_case(&name))?;
                let prev = ctx.method_object.replace(Some(prefix.trim().to_string()));
                let v = eq.expression.result(ctx, t, None);
                *ctx.method_object.borrow_mut() = prev;
                return Some(v);
            }
        }
        self.equations
            .iter()
            .find(|e| e.selector.eq_ignore_ascii_case(pattern))
            .map(|e| e.expression.result(ctx, t, None))
    }

    fn entity_value(
        &self,
        ctx: &EvalContext,
        pattern: &str,
        attribute: &str,
        t: i32,
        wildcard: Option<i32>,
    ) -> Option<Value> {
        for p in &self.processes {
            if p.name.eq_ignore_ascii_case(pattern) {
                return Some(self.process_attr(ctx, p, attribute, t));
            }
        }
        for q in &self.products {
            if q.name.eq_ignore_ascii_case(pattern) {
                return Some(self.product_attr(ctx, q, attribute, t));
            }
        }
        for a in &self.actors {
            if a.name.eq_ignore_ascii_case(pattern) {
                return Some(self.actor_attr(ctx, a, attribute, t));
            }
        }
        for c in &self.clusters {
            if c.name.eq_ignore_ascii_case(pattern) {
                return Some(match attribute.to_ascii_uppercase().as_str() {
                    "CI" => read_level(&c.cash_in, t),
                    "CO" => read_level(&c.cash_out, t),
                    _ => read_level(&c.cash_flow, t),
                });
            }
        }
        for l in &self.links {
            let name = self.link_name_of(l.from, l.to);
            if name.eq_ignore_ascii_case(pattern) {
                return Some(match attribute.to_ascii_uppercase().as_str() {
                    "R" => l.rate.result(ctx, t, None),
                    "D" => l.delay.result(ctx, t, None),
                    "SOC" => Value::number(l.share_of_cost),
                    _ => read_level(&l.flow, t),
                });
            }
        }
        for c in &self.constraints {
            if c.name.eq_ignore_ascii_case(pattern) {
                return Some(match attribute.to_ascii_uppercase().as_str() {
                    "SOC" => Value::number(c.share_of_cost),
                    _ => read_level(&c.active, t),
                });
            }
        }
        for d in &self.datasets {
            if d.name.eq_ignore_ascii_case(pattern) {
                return Some(self.dataset_value(ctx, d, attribute, t));
            }
        }
        if let Some(v) = self.equation_value(ctx, pattern, t) {
            return Some(v);
        }
        // wildcard selector with a single value requested: evaluate for the
        // bound context number by substituting it into the pattern
        if wildcard.is_some() && linnyr_common::pattern_has_wildcards(pattern) {
            let concrete = pattern.replace('#', &wildcard.unwrap_or(0).to_string());
            if concrete != pattern {
                return self.entity_value(ctx, &concrete, attribute, t, None);
            }
        }
        None
    }

    fn process_attr(&self, ctx: &EvalContext, p: &Process, attribute: &str, t: i32) -> Value {
        match attribute.to_ascii_uppercase().as_str() {
            "LB" => p.lb.result(ctx, t, None),
            "UB" => p.ub.result(ctx, t, None),
            "IL" => p.initial_level.result(ctx, t, None),
            "LCF" => p.pace.result(ctx, t, None),
            "CI" => read_level(&p.cash_in, t),
            "CO" => read_level(&p.cash_out, t),
            "CF" => read_level(&p.cash_flow, t),
            "MCF" => read_level(&p.marginal_cash_flow, t),
            "CP" => read_raw(&p.cost_price, t),
            _ => read_level(&p.level, t),
        }
    }

    fn product_attr(&self, ctx: &EvalContext, q: &Product, attribute: &str, t: i32) -> Value {
        match attribute.to_ascii_uppercase().as_str() {
            "LB" => q.lb.result(ctx, t, None),
            "UB" => q.ub.result(ctx, t, None),
            "IL" => q.initial_level.result(ctx, t, None),
            "P" => q.price.result(ctx, t, None),
            "CP" => read_raw(&q.cost_price, t),
            "HCP" => read_raw(&q.highest_cost_price, t),
            _ => read_level(&q.level, t),
        }
    }

    fn actor_attr(&self, ctx: &EvalContext, a: &Actor, attribute: &str, t: i32) -> Value {
        match attribute.to_ascii_uppercase().as_str() {
            "W" => a.weight.result(ctx, t, None),
            "CI" => read_level(&a.cash_in, t),
            "CO" => read_level(&a.cash_out, t),
            _ => read_level(&a.cash_flow, t),
        }
    }

    fn statistic(&self, ctx: &EvalContext, spec: &VarSpec, t: i32) -> Value {
        let Some(stat) = spec.stat else {
            return Value::error(ErrorKind::Params);
        };
        let attr = spec.attribute.as_deref().unwrap_or("");
        let mut values = Vec::new();
        for p in &self.processes {
            if match_pattern(&spec.pattern, &p.name).is_some() {
                let a = if attr.is_empty() { "L" } else { attr };
                if EntityKind::Process.supports_attribute(a) {
                    values.push(self.process_attr(ctx, p, a, t));
                }
            }
        }
        for q in &self.products {
            if match_pattern(&spec.pattern, &q.name).is_some() {
                let a = if attr.is_empty() { "L" } else { attr };
                if EntityKind::Product.supports_attribute(a) {
                    values.push(self.product_attr(ctx, q, a, t));
                }
            }
        }
        for a in &self.actors {
            if match_pattern(&spec.pattern, &a.name).is_some() {
                let at = if attr.is_empty() { "CF" } else { attr };
                if EntityKind::Actor.supports_attribute(at) {
                    values.push(self.actor_attr(ctx, a, at, t));
                }
            }
        }
        for d in &self.datasets {
            if match_pattern(&spec.pattern, &d.name).is_some() {
                values.push(self.dataset_value(ctx, d, attr, t));
            }
        }
        reduce_stat(stat, &values)
    }

    fn run_result(&self, spec: &RunSpec, key: &str, t: i32) -> Value {
        let run = if spec.run.is_empty() {
            self.experiments.runs.len().saturating_sub(1)
        } else {
            match spec.run.trim().parse::<usize>() {
                Ok(i) => i,
                Err(_) => return Value::error(ErrorKind::Params),
            }
        };
        let Some(record) = self.experiments.runs.get(run) else {
            return Value::UNDEFINED;
        };
        if !spec.title.is_empty() && !record.title.eq_ignore_ascii_case(&spec.title) {
            return Value::UNDEFINED;
        }
        let Some(vec) = record.results.get(&key.to_ascii_lowercase()) else {
            return Value::UNDEFINED;
        };
        if spec.method.is_empty() {
            let i = t.clamp(0, vec.len() as i32 - 1) as usize;
            return vec.get(i).copied().unwrap_or(Value::UNDEFINED);
        }
        match linnyr_parse::StatSpec::parse(&spec.method) {
            Some(stat) => reduce_stat(stat, vec),
            None => Value::error(ErrorKind::Params),
        }
    }
}

/// Level-based vector read: unsolved steps count as 0.
pub(crate) fn read_level(vec: &[Value], t: i32) -> Value {
    match read_raw(vec, t) {
        v if v == Value::NOT_COMPUTED => Value::ZERO,
        v => v,
    }
}

pub(crate) fn read_raw(vec: &[Value], t: i32) -> Value {
    let i = t.max(0) as usize;
    vec.get(i).copied().unwrap_or(Value::NOT_COMPUTED)
}

impl ReferenceClassifier for Model {
    fn classify(&self, spec: &VarSpec, _owner: &EntityRef, _attribute: &str) -> RefInfo {
        if spec.experiment.is_some() || spec.stat.is_some() || spec.has_wildcards() {
            return RefInfo {
                exists: true,
                is_static: false,
                is_level_based: spec
                    .attribute
                    .as_deref()
                    .map(is_level_based)
                    .unwrap_or(false),
            };
        }
        let ctx = EvalContext::new(self, self.sim_span());
        let attr = spec.attribute.as_deref().unwrap_or("");
        // input attributes classify by their defining expression
        let target: Option<&Expression> = self.find_input_expression(&spec.pattern, attr);
        if let Some(e) = target {
            e.compile(&ctx);
            return RefInfo {
                exists: true,
                is_static: e.is_static(),
                is_level_based: e.is_level_based(),
            };
        }
        let exists = self.name_exists(&spec.pattern);
        RefInfo {
            exists,
            is_static: false,
            is_level_based: attr.is_empty() || is_level_based(attr),
        }
    }
}

impl Model {
    fn find_input_expression(&self, pattern: &str, attr: &str) -> Option<&Expression> {
        let up = attr.to_ascii_uppercase();
        for p in &self.processes {
            if p.name.eq_ignore_ascii_case(pattern) {
                return match up.as_str() {
                    "LB" => Some(&p.lb),
                    "UB" => Some(&p.ub),
                    "IL" => Some(&p.initial_level),
                    "LCF" => Some(&p.pace),
                    _ => None,
                };
            }
        }
        for q in &self.products {
            if q.name.eq_ignore_ascii_case(pattern) {
                return match up.as_str() {
                    "LB" => Some(&q.lb),
                    "UB" => Some(&q.ub),
                    "IL" => Some(&q.initial_level),
                    "P" => Some(&q.price),
                    _ => None,
                };
            }
        }
        for a in &self.actors {
            if a.name.eq_ignore_ascii_case(pattern) && up == "W" {
                return Some(&a.weight);
            }
        }
        for d in &self.datasets {
            if d.name.eq_ignore_ascii_case(pattern) {
                for m in &d.modifiers {
                    if m.selector.eq_ignore_ascii_case(attr) {
                        return Some(&m.expression);
                    }
                }
                if attr.is_empty() {
                    return None;
                }
                for m in &d.modifiers {
                    if match_pattern(&m.selector, attr).is_some() {
                        return Some(&m.expression);
                    }
                }
            }
        }
        for e in &self.equations {
            if e.selector.eq_ignore_ascii_case(pattern) {
                return Some(&e.expression);
            }
        }
        None
    }

    fn name_exists(&self, pattern: &str) -> bool {
        self.processes.iter().any(|p| p.name.eq_ignore_ascii_case(pattern))
            || self.products.iter().any(|q| q.name.eq_ignore_ascii_case(pattern))
            || self.actors.iter().any(|a| a.name.eq_ignore_ascii_case(pattern))
            || self.clusters.iter().any(|c| c.name.eq_ignore_ascii_case(pattern))
            || self.constraints.iter().any(|c| c.name.eq_ignore_ascii_case(pattern))
            || self.datasets.iter().any(|d| d.name.eq_ignore_ascii_case(pattern))
            || self.equations.iter().any(|e| e.selector.eq_ignore_ascii_case(pattern))
            || self
                .links
                .iter()
                .any(|l| self.link_name_of(l.from, l.to).eq_ignore_ascii_case(pattern))
            || pattern.contains(':')
    }
}

impl ModelView for Model {
    fn variable(
        &self,
        ctx: &EvalContext,
        spec: &VarSpec,
        _owner: &EntityRef,
        _attribute: &str,
        t: i32,
        wildcard: Option<i32>,
    ) -> Value {
        if let Some(exp) = &spec.experiment {
            let key = match spec.attribute.as_deref() {
                Some(a) => format!("{}|{a}", spec.pattern),
                None => spec.pattern.clone(),
            };
            return self.run_result(exp, &key, t);
        }
        if spec.stat.is_some() {
            return self.statistic(ctx, spec, t);
        }
        let attr = spec.attribute.as_deref().unwrap_or("");
        match self.entity_value(ctx, &spec.pattern, attr, t, wildcard) {
            Some(v) => v,
            None => Value::error(ErrorKind::BadRef),
        }
    }

    fn unit_multiplier(&self, unit: &str) -> Value {
        match self.scale_units.get(&unit.to_ascii_lowercase()) {
            Some(x) => Value::number(*x),
            None => Value::ONE,
        }
    }
}
