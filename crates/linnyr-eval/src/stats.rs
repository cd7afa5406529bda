//! Reductions over sets of values, shared by `stat$pattern` references
//! and experiment-result methods.

use linnyr_common::{Region, Value};
use linnyr_parse::{Stat, StatSpec};

/// Reduce `values` with `spec`. `Undefined` entries are skipped; any
/// error entry short-circuits to the most severe one. An empty (or fully
/// skipped) set reduces to 0 for counting statistics and `Undefined`
/// otherwise.
pub fn reduce_stat(spec: StatSpec, values: &[Value]) -> Value {
    let mut worst: Option<Value> = None;
    let mut xs: Vec<f64> = Vec::with_capacity(values.len());
    for v in values {
        match v.region() {
            Region::Normal(x) => {
                if !(spec.non_zero && x == 0.0) {
                    xs.push(x);
                }
            }
            // infinities participate and absorb; NoCost counts as a zero
            Region::PlusInfinity => xs.push(f64::INFINITY),
            Region::MinusInfinity => xs.push(f64::NEG_INFINITY),
            Region::NoCost => {
                if !spec.non_zero {
                    xs.push(0.0);
                }
            }
            Region::Undefined => {}
            _ => {
                worst = Some(match worst {
                    Some(w) => Value::severest(w, *v),
                    None => *v,
                });
            }
        }
    }
    if let Some(w) = worst {
        if w.is_error() {
            return w;
        }
    }
    if spec.stat == Stat::N {
        return Value::number(xs.len() as f64);
    }
    if xs.is_empty() {
        return Value::UNDEFINED;
    }
    let n = xs.len() as f64;
    let sum: f64 = xs.iter().sum();
    match spec.stat {
        Stat::Max => Value::number(xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max)),
        Stat::Min => Value::number(xs.iter().cloned().fold(f64::INFINITY, f64::min)),
        Stat::Sum => Value::number(sum),
        Stat::Mean => Value::number(sum / n),
        Stat::Var | Stat::Sd => {
            let mean = sum / n;
            let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
            if spec.stat == Stat::Var {
                Value::number(var)
            } else {
                Value::number(var.sqrt())
            }
        }
        Stat::N => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linnyr_common::ErrorKind;

    fn spec(stat: Stat, nz: bool) -> StatSpec {
        StatSpec { stat, non_zero: nz }
    }

    fn nums(xs: &[f64]) -> Vec<Value> {
        xs.iter().map(|x| Value::number(*x)).collect()
    }

    #[test]
    fn basic_reductions() {
        let vs = nums(&[1.0, 2.0, 3.0, 0.0]);
        assert_eq!(reduce_stat(spec(Stat::Sum, false), &vs), Value::number(6.0));
        assert_eq!(reduce_stat(spec(Stat::Max, false), &vs), Value::number(3.0));
        assert_eq!(reduce_stat(spec(Stat::Min, false), &vs), Value::ZERO);
        assert_eq!(reduce_stat(spec(Stat::N, false), &vs), Value::number(4.0));
        assert_eq!(reduce_stat(spec(Stat::Mean, false), &vs), Value::number(1.5));
    }

    #[test]
    fn non_zero_variants() {
        let vs = nums(&[2.0, 0.0, 4.0]);
        assert_eq!(reduce_stat(spec(Stat::N, true), &vs), Value::number(2.0));
        assert_eq!(reduce_stat(spec(Stat::Mean, true), &vs), Value::number(3.0));
        assert_eq!(reduce_stat(spec(Stat::Min, true), &vs), Value::number(2.0));
    }

    #[test]
    fn variance_and_sd() {
        let vs = nums(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(reduce_stat(spec(Stat::Var, false), &vs), Value::number(4.0));
        assert_eq!(reduce_stat(spec(Stat::Sd, false), &vs), Value::number(2.0));
    }

    #[test]
    fn undefined_skipped_errors_propagate() {
        let vs = vec![Value::number(1.0), Value::UNDEFINED, Value::number(3.0)];
        assert_eq!(reduce_stat(spec(Stat::Sum, false), &vs), Value::number(4.0));
        assert_eq!(reduce_stat(spec(Stat::N, false), &vs), Value::number(2.0));

        let vs = vec![
            Value::number(1.0),
            Value::error(ErrorKind::Params),
            Value::error(ErrorKind::Cyclic),
        ];
        assert_eq!(
            reduce_stat(spec(Stat::Sum, false), &vs),
            Value::error(ErrorKind::Cyclic)
        );
    }

    #[test]
    fn empty_set() {
        assert_eq!(reduce_stat(spec(Stat::N, false), &[]), Value::ZERO);
        assert_eq!(reduce_stat(spec(Stat::Sum, false), &[]), Value::UNDEFINED);
    }
}
