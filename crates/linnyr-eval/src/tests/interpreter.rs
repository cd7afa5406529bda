use super::{ctx_of, expr, TestModel};
use crate::expression::Expression;
use linnyr_common::{EntityKind, EntityRef, ErrorKind, Value};

fn eval(text: &str) -> Value {
    let model = TestModel::new();
    let ctx = ctx_of(&model, 3);
    expr(text).result_at(&ctx, 1)
}

fn num(text: &str) -> f64 {
    eval(text).finite().expect("expected a finite result")
}

#[test]
fn arithmetic() {
    assert_eq!(num("1 + 2 * 3"), 7.0);
    assert_eq!(num("(1 + 2) * 3"), 9.0);
    assert_eq!(num("2 ^ 10"), 1024.0);
    assert_eq!(num("7 % 3"), 1.0);
    assert_eq!(num("-3 + 5"), 2.0);
    assert_eq!(num("10 / 4"), 2.5);
}

#[test]
fn comparisons_and_logic() {
    assert_eq!(num("3 > 2"), 1.0);
    assert_eq!(num("3 <= 2"), 0.0);
    assert_eq!(num("1 <> 2"), 1.0);
    assert_eq!(num("true and false"), 0.0);
    assert_eq!(num("true or false"), 1.0);
    assert_eq!(num("not 0"), 1.0);
}

#[test]
fn ternary() {
    assert_eq!(num("1 ? 10 : 20"), 10.0);
    assert_eq!(num("0 ? 10 : 20"), 20.0);
    assert_eq!(num("0 ? 10 : 0 ? 30 : 40"), 40.0);
    // only the taken branch is evaluated
    assert_eq!(num("1 ? 5 : 1/0"), 5.0);
}

#[test]
fn division_errors() {
    assert_eq!(eval("1 / 0"), Value::error(ErrorKind::DivZero));
    // safe division returns the LHS on a near-zero divisor
    assert_eq!(num("7 // 0"), 7.0);
    assert_eq!(num("7 // 2"), 3.5);
    assert_eq!(eval("1 % 0"), Value::error(ErrorKind::DivZero));
}

#[test]
fn infinities_absorb() {
    assert_eq!(eval("infinity + 1"), Value::PLUS_INFINITY);
    assert_eq!(eval("-infinity * 2"), Value::MINUS_INFINITY);
    assert_eq!(num("infinity - infinity"), 0.0);
    assert_eq!(num("infinity / infinity"), 1.0);
    assert_eq!(num("infinity > 1e10"), 1.0);
}

#[test]
fn groups_and_reducers() {
    assert_eq!(num("max(1; 5; 3)"), 5.0);
    assert_eq!(num("min(4; 2; 9)"), 2.0);
    assert_eq!(num("(10; 20; 30) @ 2"), 20.0);
    assert_eq!(
        eval("(10; 20) @ 3"),
        Value::error(ErrorKind::ArrayIndex)
    );
    assert_eq!(num("max 7"), 7.0);
}

#[test]
fn domain_reducers() {
    // npv: rate 0 sums the cash flows
    assert_eq!(num("npv(0; 10; 20; 30)"), 60.0);
    let v = num("npv(0.1; 100; 100)");
    assert!((v - (100.0 + 100.0 / 1.1)).abs() < 1e-9);
    // peak cumulative value of +5 -3 +4 is 6
    assert_eq!(num("mpp(5; -3; 4)"), 6.0);
    // largest drawdown of 4 7 2 9 1 is 9 - 1 = 8
    assert_eq!(num("hccd(4; 7; 2; 9; 1)"), 8.0);
    assert_eq!(num("npu(1; 0; -2; 3)"), 2.0);
    // perfectly correlated interleaved pairs
    let v = num("correl(1; 2; 2; 4; 3; 6)");
    assert!((v - 1.0).abs() < 1e-9);
    let v = num("slope(1; 2; 2; 4; 3; 6)");
    assert!((v - 2.0).abs() < 1e-9);
    assert_eq!(eval("correl(1; 2; 3)"), Value::error(ErrorKind::Params));
}

#[test]
fn distribution_sampling_is_seeded() {
    // same seed, same draw
    let a = eval("normal(10; 2)");
    let b = eval("normal(10; 2)");
    assert_eq!(a, b);
    let x = a.finite().unwrap();
    assert!((0.0..20.0).contains(&x));
    assert_eq!(eval("normal(10)"), Value::error(ErrorKind::Params));
    assert_eq!(eval("binomial(10; 2)"), Value::error(ErrorKind::Params));
    let u = num("random");
    assert!((0.0..1.0).contains(&u));
}

#[test]
fn replace_undefined() {
    // [x] is undefined in the null model
    assert_eq!(num("[x] | 5"), 5.0);
    assert_eq!(num("3 | 5"), 3.0);
}

#[test]
fn undefined_is_strict_elsewhere() {
    assert_eq!(eval("[x] + 1"), Value::UNDEFINED);
}

#[test]
fn monadic_functions() {
    assert_eq!(num("abs(-4)"), 4.0);
    assert_eq!(num("int 2.9"), 2.0);
    assert_eq!(num("round 2.5"), 3.0);
    assert!((num("fract 2.25") - 0.25).abs() < 1e-12);
    assert_eq!(num("sqrt 16"), 4.0);
    assert!(eval("sqrt(-1)").is_error());
    assert!((num("ln(exp(1))") - 1.0).abs() < 1e-12);
}

#[test]
fn time_symbols() {
    let model = TestModel::new();
    let ctx = ctx_of(&model, 12);
    let e = expr("t * 10");
    assert_eq!(e.result_at(&ctx, 3), Value::number(30.0));
    assert_eq!(e.result_at(&ctx, 7), Value::number(70.0));
    assert!(!e.is_static());

    let e = expr("N");
    assert_eq!(e.result_at(&ctx, 1), Value::number(12.0));
    assert!(e.is_static());
}

#[test]
fn static_expressions_compute_once() {
    let model = TestModel::new();
    let ctx = ctx_of(&model, 5);
    let e = expr("2 + 3");
    assert!(e.result_at(&ctx, 0) == Value::number(5.0));
    // any t reads the same cached slot
    assert_eq!(e.result_at(&ctx, 4), Value::number(5.0));
    assert!(e.is_static());
}

#[test]
fn series_references_with_offsets() {
    let model = TestModel::new().with_series("demand", &[0.0, 10.0, 20.0, 30.0]);
    let ctx = ctx_of(&model, 3);
    let e = expr("[demand] + 1");
    assert_eq!(e.result_at(&ctx, 2), Value::number(21.0));
    let e = expr("[demand@t-1]");
    assert_eq!(e.result_at(&ctx, 2), Value::number(10.0));
    let e = expr("[demand@f]");
    assert_eq!(e.result_at(&ctx, 3), Value::number(10.0));
    let e = expr("[demand@l]");
    assert_eq!(e.result_at(&ctx, 1), Value::number(30.0));
}

#[test]
fn entity_set_statistics() {
    let model = TestModel::new()
        .with_series("unit 1", &[0.0, 2.0])
        .with_series("unit 2", &[0.0, 4.0])
        .with_series("unit 3", &[0.0, 0.0]);
    let ctx = ctx_of(&model, 1);
    let e = expr("SUM$unit ?");
    assert_eq!(e.result_at(&ctx, 1), Value::number(6.0));
    let e = expr("NNZ$unit ?");
    assert_eq!(e.result_at(&ctx, 1), Value::number(2.0));
    let e = expr("MEAN$unit ?");
    assert_eq!(e.result_at(&ctx, 1), Value::number(2.0));
}

#[test]
fn self_reference_accumulates() {
    let model = TestModel::new();
    let ctx = ctx_of(&model, 5);
    let e = expr("[@-1] + 1");
    assert!(e.references_self());
    // base case reads the initial value 0
    assert_eq!(e.result_at(&ctx, 3), Value::number(3.0));
    assert_eq!(e.result_at(&ctx, 5), Value::number(5.0));
}

#[test]
fn same_step_self_reference_is_cyclic() {
    let model = TestModel::new();
    let ctx = ctx_of(&model, 3);
    let e = expr("[@t] + 1");
    assert_eq!(e.result_at(&ctx, 2), Value::error(ErrorKind::Cyclic));
}

#[test]
fn cross_expression_cycle_is_detected() {
    let model = TestModel::new()
        .with_expr("a", "m", "[b|m] + 1")
        .with_expr("b", "m", "[a|m] + 1");
    let ctx = ctx_of(&model, 3);
    let exprs = model.exprs.borrow();
    let a = exprs.get("a|m").unwrap();
    for t in 1..=3 {
        assert_eq!(a.result(&ctx, t, None), Value::error(ErrorKind::Cyclic));
    }
}

#[test]
fn wildcard_vectors_are_kept_apart() {
    let model = TestModel::new();
    let ctx = ctx_of(&model, 3);
    let e = expr("# * 10");
    assert!(e.uses_wildcards());
    assert_eq!(e.result(&ctx, 1, Some(2)), Value::number(20.0));
    assert_eq!(e.result(&ctx, 1, Some(5)), Value::number(50.0));
    assert_eq!(e.result(&ctx, 1, Some(2)), Value::number(20.0));
    assert_eq!(e.wildcard_indices(), vec![2, 5]);
}

#[test]
fn invalidate_from_forces_recompute() {
    let model = TestModel::new();
    let ctx = ctx_of(&model, 6);
    let e = expr("t + random * 0");
    let first = e.result_at(&ctx, 4);
    assert_eq!(first, Value::number(4.0));
    e.invalidate_from(4);
    assert_eq!(e.result_at(&ctx, 4), Value::number(4.0));
    // slots before the cut survive
    assert_eq!(e.result_at(&ctx, 3), Value::number(3.0));
}

#[test]
fn reset_clears_everything() {
    let model = TestModel::new();
    let ctx = ctx_of(&model, 3);
    let e = expr("t");
    let _ = e.result_at(&ctx, 2);
    e.reset();
    assert!(e.compile_issue().is_none());
    assert_eq!(e.result_at(&ctx, 2), Value::number(2.0));
}

#[test]
fn compile_issue_degrades_to_invalid() {
    let model = TestModel::new();
    let ctx = ctx_of(&model, 3);
    let e = expr("1 +");
    assert_eq!(e.result_at(&ctx, 1), Value::error(ErrorKind::Invalid));
    assert!(e.compile_issue().unwrap().contains("missing operand"));
}

#[test]
fn sensitivity_multiplier_applies() {
    use crate::context::{EvalContext, Sensitivity, SimSpan};
    let model = TestModel::new();
    let mut ctx = EvalContext::new(&model, SimSpan::single(3));
    ctx.sensitivity = Some(Sensitivity {
        owner: EntityRef::new(EntityKind::Dataset, "d"),
        attribute: "m".into(),
        delta_pct: 10.0,
    });
    let e = expr("100");
    assert_eq!(e.result_at(&ctx, 1), Value::number(110.0));

    let other = Expression::new(EntityRef::new(EntityKind::Dataset, "other"), "m", "100");
    assert_eq!(other.result_at(&ctx, 1), Value::number(100.0));
}

#[test]
fn clamping_at_the_horizon() {
    let model = TestModel::new();
    let ctx = ctx_of(&model, 4);
    let e = expr("t");
    // beyond N + L the last slot is reused
    assert_eq!(e.result_at(&ctx, 9), Value::number(4.0));
    assert_eq!(e.result_at(&ctx, -3), Value::number(0.0));
}
