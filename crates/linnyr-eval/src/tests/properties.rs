//! Property tests for the numeric-code invariants.

use linnyr_common::{ErrorKind, Region, Value};
use proptest::prelude::*;

const ERROR_KINDS: [ErrorKind; 10] = [
    ErrorKind::Cyclic,
    ErrorKind::DivZero,
    ErrorKind::BadCalc,
    ErrorKind::ArrayIndex,
    ErrorKind::BadRef,
    ErrorKind::Underflow,
    ErrorKind::Overflow,
    ErrorKind::Invalid,
    ErrorKind::Params,
    ErrorKind::Unknown,
];

fn any_error() -> impl Strategy<Value = Value> {
    (0usize..ERROR_KINDS.len()).prop_map(|i| Value::error(ERROR_KINDS[i]))
}

fn any_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-1e12f64..1e12).prop_map(Value::number),
        any_error(),
        Just(Value::UNDEFINED),
        Just(Value::NOT_COMPUTED),
        Just(Value::COMPUTING),
        Just(Value::PLUS_INFINITY),
        Just(Value::MINUS_INFINITY),
    ]
}

proptest! {
    /// `severest` retains an error whenever either side is one, and of
    /// two errors keeps the lower (more severe) kind.
    #[test]
    fn severest_prefers_errors(a in any_value(), b in any_value()) {
        let s = Value::severest(a, b);
        if a.is_error() || b.is_error() {
            prop_assert!(s.is_error());
        }
        if let (Some(ka), Some(kb)) = (a.error_kind(), b.error_kind()) {
            prop_assert_eq!(s.error_kind().unwrap(), ka.min(kb));
        }
    }

    /// Region classification survives the raw-float storage boundary.
    #[test]
    fn raw_round_trip(v in any_value()) {
        let back = Value::from_raw(v.raw());
        prop_assert_eq!(back.region(), v.region());
    }

    /// Finite numbers never classify as special, and near-zeros chop.
    #[test]
    fn normal_region_is_normal(x in -1e20f64..1e20) {
        let v = Value::number(x);
        if x.abs() < 1e-10 {
            prop_assert_eq!(v, Value::ZERO);
        } else {
            prop_assert_eq!(v.region(), Region::Normal(x));
            prop_assert!(!v.is_special());
        }
    }

    /// Of two error operands the lower (more severe) kind survives.
    #[test]
    fn pairwise_error_promotion(i in 0usize..ERROR_KINDS.len(), j in 0usize..ERROR_KINDS.len()) {
        let a = Value::error(ERROR_KINDS[i]);
        let b = Value::error(ERROR_KINDS[j]);
        prop_assert_eq!(
            Value::severest(a, b).error_kind().unwrap(),
            ERROR_KINDS[i].min(ERROR_KINDS[j])
        );
    }
}

#[test]
fn errors_flow_through_operators() {
    use crate::expression::Expression;
    use crate::tests::{ctx_of, TestModel};
    use linnyr_common::{EntityKind, EntityRef};

    let model = TestModel::new();
    let ctx = ctx_of(&model, 1);
    for text in ["1/0 + 2", "2 * (1/0)", "abs(1/0)", "max(1; 1/0; 3)"] {
        let e = Expression::new(EntityRef::new(EntityKind::Dataset, "d"), "m", text);
        assert_eq!(
            e.result_at(&ctx, 1),
            Value::error(ErrorKind::DivZero),
            "{text}"
        );
    }
}
