mod interpreter;
mod properties;

use crate::context::{EvalContext, SimSpan};
use crate::expression::Expression;
use crate::stats::reduce_stat;
use crate::traits::ModelView;
use linnyr_common::{is_level_based, EntityKind, EntityRef, Value};
use linnyr_parse::{RefInfo, ReferenceClassifier, StatSpec, VarSpec};
use rustc_hash::FxHashMap;
use std::cell::RefCell;

/// In-memory model for engine tests: named series plus named expressions,
/// looked up by `pattern|attribute`.
#[derive(Default)]
pub(crate) struct TestModel {
    pub series: FxHashMap<String, Vec<Value>>,
    pub exprs: RefCell<FxHashMap<String, Expression>>,
}

impl TestModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, key: &str, values: &[f64]) -> Self {
        self.series.insert(
            key.to_ascii_lowercase(),
            values.iter().map(|x| Value::number(*x)).collect(),
        );
        self
    }

    pub fn with_expr(self, name: &str, attribute: &str, text: &str) -> Self {
        let e = Expression::new(
            EntityRef::new(EntityKind::Dataset, name),
            attribute,
            text,
        );
        self.exprs
            .borrow_mut()
            .insert(format!("{name}|{attribute}").to_ascii_lowercase(), e);
        self
    }

    fn key(spec: &VarSpec) -> String {
        let attr = spec.attribute.as_deref().unwrap_or("");
        if attr.is_empty() {
            spec.pattern.to_ascii_lowercase()
        } else {
            format!("{}|{attr}", spec.pattern).to_ascii_lowercase()
        }
    }
}

impl ReferenceClassifier for TestModel {
    fn classify(&self, spec: &VarSpec, _owner: &EntityRef, _attribute: &str) -> RefInfo {
        let level = spec
            .attribute
            .as_deref()
            .map(is_level_based)
            .unwrap_or(false);
        RefInfo {
            exists: true,
            is_static: false,
            is_level_based: level,
        }
    }
}

impl ModelView for TestModel {
    fn variable(
        &self,
        ctx: &EvalContext,
        spec: &VarSpec,
        _owner: &EntityRef,
        _attribute: &str,
        t: i32,
        wildcard: Option<i32>,
    ) -> Value {
        let key = Self::key(spec);
        if let Some(series) = self.series.get(&key) {
            let i = t.clamp(0, series.len() as i32 - 1) as usize;
            return series[i];
        }
        if let Some(stat) = spec.stat {
            return stat_over_series(self, &spec.pattern, stat, t);
        }
        let exprs = self.exprs.borrow();
        if let Some(e) = exprs.get(&key) {
            // NOTE: the borrow is held across evaluation; cyclic lookups
            // re-enter through `Expression`, not through this map.
            return e.result(ctx, t, wildcard);
        }
        Value::UNDEFINED
    }
}

fn stat_over_series(model: &TestModel, pattern: &str, stat: StatSpec, t: i32) -> Value {
    let mut values = Vec::new();
    for (name, series) in &model.series {
        if linnyr_common::match_pattern(pattern, name).is_some() {
            let i = t.clamp(0, series.len() as i32 - 1) as usize;
            values.push(series[i]);
        }
    }
    reduce_stat(stat, &values)
}

pub(crate) fn expr(text: &str) -> Expression {
    Expression::new(EntityRef::new(EntityKind::Dataset, "d"), "m", text)
}

pub(crate) fn ctx_of<'m>(model: &'m TestModel, n: u32) -> EvalContext<'m> {
    EvalContext::new(model, SimSpan::single(n))
}
