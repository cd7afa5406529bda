//! The seam between the evaluation engine and the entity model.

use crate::context::EvalContext;
use linnyr_common::{EntityRef, Value};
use linnyr_parse::{ReferenceClassifier, VarSpec};

/// Resolves variable references for evaluation. The engine owns no entity
/// storage; a `ModelView` implementation maps a parsed reference (entity
/// attribute, dataset modifier, wildcard set statistic, or experiment run
/// result) to a value at an absolute step.
pub trait ModelView: ReferenceClassifier {
    /// Value of `spec` at (resolved) step `t`. `owner`/`attribute`
    /// identify the referring expression; `wildcard` is the context
    /// number of the innermost wildcard match, when one is active.
    fn variable(
        &self,
        ctx: &EvalContext,
        spec: &VarSpec,
        owner: &EntityRef,
        attribute: &str,
        t: i32,
        wildcard: Option<i32>,
    ) -> Value;

    /// Conversion factor for a quoted scale-unit literal.
    fn unit_multiplier(&self, _unit: &str) -> Value {
        Value::ONE
    }
}

/// A model with no entities; every reference is undefined. Used by tests
/// and by expressions evaluated before a model is attached.
#[derive(Debug, Default)]
pub struct NullModel;

impl ReferenceClassifier for NullModel {
    fn classify(
        &self,
        _spec: &VarSpec,
        _owner: &EntityRef,
        _attribute: &str,
    ) -> linnyr_parse::RefInfo {
        linnyr_parse::RefInfo::default()
    }
}

impl ModelView for NullModel {
    fn variable(
        &self,
        _ctx: &EvalContext,
        _spec: &VarSpec,
        _owner: &EntityRef,
        _attribute: &str,
        _t: i32,
        _wildcard: Option<i32>,
    ) -> Value {
        Value::UNDEFINED
    }
}
