//! Tagged-float numeric codes used throughout the engine.
//!
//! - **`ErrorKind`** : the canonical set of computation error codes
//! - **`Region`**    : classification of a raw value into named regions
//! - **`Value`**     : a copyable `f64` newtype that call sites inspect
//!   through `region()` instead of comparing raw magnitudes
//!
//! Exceptional values are *values*, not aborts: an error produced deep in
//! an expression travels up through vectors and operand stacks like any
//! number, and binary operators retain the most severe operand.

use std::fmt;

/// Magnitudes below this are chopped to exactly 0 before a result is
/// stored or pushed.
pub const NEAR_ZERO: f64 = 1e-10;

const PLUS_INF: f64 = 1e25;
const MINUS_INF: f64 = -1e25;

// Lifecycle sentinels sit far above any representable model quantity.
const UNDEFINED: f64 = 5e49;
const NOT_COMPUTED: f64 = 6e49;
const COMPUTING: f64 = 7e49;

// "Price not set", distinct from an actual zero price. Compared bitwise.
const NO_COST: f64 = -1.5e-13;

// Error codes occupy descending large-negative magnitudes starting at the
// most severe (Cyclic). Anything at or below ERROR_CEILING is an error.
const ERROR_BASE: f64 = -1e50;
const ERROR_STEP: f64 = 1e48;
const ERROR_CEILING: f64 = -9.05e49;

/// All recognised computation error codes, most severe first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    Cyclic,
    DivZero,
    BadCalc,
    ArrayIndex,
    BadRef,
    Underflow,
    Overflow,
    Invalid,
    Params,
    Unknown,
}

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

impl ErrorKind {
    fn ordinal(self) -> usize {
        ERROR_KINDS.iter().position(|k| *k == self).unwrap_or(9)
    }

    /// Lower is more severe.
    pub fn severity(self) -> usize {
        self.ordinal()
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "#CYCLE!" => Some(Self::Cyclic),
            "#DIV/0!" => Some(Self::DivZero),
            "#VALUE!" => Some(Self::BadCalc),
            "#INDEX!" => Some(Self::ArrayIndex),
            "#REF?" => Some(Self::BadRef),
            "#STACK-!" => Some(Self::Underflow),
            "#STACK+!" => Some(Self::Overflow),
            "#INVALID!" => Some(Self::Invalid),
            "#PARAMS!" => Some(Self::Params),
            "#ERROR?" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cyclic => "#CYCLE!",
            Self::DivZero => "#DIV/0!",
            Self::BadCalc => "#VALUE!",
            Self::ArrayIndex => "#INDEX!",
            Self::BadRef => "#REF?",
            Self::Underflow => "#STACK-!",
            Self::Overflow => "#STACK+!",
            Self::Invalid => "#INVALID!",
            Self::Params => "#PARAMS!",
            Self::Unknown => "#ERROR?",
        })
    }
}

/// The named regions a `Value` can fall into.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Region {
    Normal(f64),
    PlusInfinity,
    MinusInfinity,
    NotComputed,
    Computing,
    Undefined,
    NoCost,
    Error(ErrorKind),
}

/// A tagged float. The interior `f64` encodes both ordinary numbers and
/// the sentinel regions; vectors of `Value` are plain contiguous floats.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Value(f64);

impl Value {
    pub const ZERO: Value = Value(0.0);
    pub const ONE: Value = Value(1.0);
    pub const PLUS_INFINITY: Value = Value(PLUS_INF);
    pub const MINUS_INFINITY: Value = Value(MINUS_INF);
    pub const UNDEFINED: Value = Value(UNDEFINED);
    pub const NOT_COMPUTED: Value = Value(NOT_COMPUTED);
    pub const COMPUTING: Value = Value(COMPUTING);
    pub const NO_COST: Value = Value(NO_COST);

    /// Wrap a computed number. NaN becomes `Invalid`, IEEE infinities are
    /// mapped onto the directional sentinels, and near-zeros are chopped.
    pub fn number(x: f64) -> Self {
        if x.is_nan() {
            return Self::error(ErrorKind::Invalid);
        }
        if x.is_infinite() || x >= PLUS_INF {
            return if x > 0.0 {
                Self::PLUS_INFINITY
            } else {
                Self::MINUS_INFINITY
            };
        }
        if x <= MINUS_INF {
            return Self::MINUS_INFINITY;
        }
        if x.abs() < NEAR_ZERO {
            return Self::ZERO;
        }
        Value(x)
    }

    pub fn error(kind: ErrorKind) -> Self {
        Value(ERROR_BASE + kind.ordinal() as f64 * ERROR_STEP)
    }

    /// Raw bits, for storage boundaries only.
    pub fn raw(self) -> f64 {
        self.0
    }

    /// Rehydrate a value that was stored through `raw()`.
    pub fn from_raw(x: f64) -> Self {
        if x.is_nan() {
            Self::error(ErrorKind::Invalid)
        } else {
            Value(x)
        }
    }

    pub fn region(self) -> Region {
        let v = self.0;
        if v == NOT_COMPUTED {
            Region::NotComputed
        } else if v == COMPUTING {
            Region::Computing
        } else if v == UNDEFINED {
            Region::Undefined
        } else if v <= ERROR_CEILING {
            let k = ((v - ERROR_BASE) / ERROR_STEP).round() as usize;
            Region::Error(*ERROR_KINDS.get(k).unwrap_or(&ErrorKind::Unknown))
        } else if v >= PLUS_INF {
            Region::PlusInfinity
        } else if v <= MINUS_INF {
            Region::MinusInfinity
        } else if v.to_bits() == NO_COST.to_bits() {
            Region::NoCost
        } else {
            Region::Normal(v)
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self.region(), Region::Error(_))
    }

    pub fn error_kind(self) -> Option<ErrorKind> {
        match self.region() {
            Region::Error(k) => Some(k),
            _ => None,
        }
    }

    /// Any sentinel region: infinities, lifecycle codes, `NoCost`, errors.
    pub fn is_special(self) -> bool {
        !matches!(self.region(), Region::Normal(_))
    }

    /// Errors and lifecycle codes. Infinities and `NoCost` are *not*
    /// exceptional: arithmetic absorbs infinities, and `NoCost` is a
    /// legitimate price state.
    pub fn is_exceptional(self) -> bool {
        matches!(
            self.region(),
            Region::Error(_) | Region::NotComputed | Region::Computing | Region::Undefined
        )
    }

    pub fn is_infinite(self) -> bool {
        matches!(self.region(), Region::PlusInfinity | Region::MinusInfinity)
    }

    /// The plain number, when this value is in the normal region.
    pub fn finite(self) -> Option<f64> {
        match self.region() {
            Region::Normal(x) => Some(x),
            _ => None,
        }
    }

    /// Finite value, with `NoCost` reading as 0. Used when folding prices.
    pub fn finite_or_free(self) -> Option<f64> {
        match self.region() {
            Region::Normal(x) => Some(x),
            Region::NoCost => Some(0.0),
            _ => None,
        }
    }

    /// Of two exceptional candidates, keep the most severe. Errors beat
    /// lifecycle codes; among errors, lower `ErrorKind` wins; among
    /// lifecycle codes, `Computing` beats `NotComputed` beats `Undefined`.
    pub fn severest(a: Value, b: Value) -> Value {
        fn rank(v: Value) -> i32 {
            match v.region() {
                Region::Error(k) => k.severity() as i32,
                Region::Computing => 100,
                Region::NotComputed => 101,
                Region::Undefined => 102,
                _ => i32::MAX,
            }
        }
        if rank(a) <= rank(b) { a } else { b }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NOT_COMPUTED
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region() {
            Region::Normal(x) => write!(f, "{x}"),
            Region::PlusInfinity => f.write_str("\u{221e}"),
            Region::MinusInfinity => f.write_str("-\u{221e}"),
            Region::NotComputed => f.write_str("not computed"),
            Region::Computing => f.write_str("still computing"),
            Region::Undefined => f.write_str("undefined"),
            Region::NoCost => f.write_str("no cost"),
            Region::Error(k) => write!(f, "{k}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_round_trip() {
        for k in ERROR_KINDS {
            assert_eq!(Value::error(k).region(), Region::Error(k));
            assert_eq!(ErrorKind::parse(&k.to_string()), Some(k));
        }
        assert_eq!(Value::NOT_COMPUTED.region(), Region::NotComputed);
        assert_eq!(Value::COMPUTING.region(), Region::Computing);
        assert_eq!(Value::UNDEFINED.region(), Region::Undefined);
        assert_eq!(Value::NO_COST.region(), Region::NoCost);
        assert_eq!(Value::number(42.5).region(), Region::Normal(42.5));
    }

    #[test]
    fn near_zero_is_chopped() {
        assert_eq!(Value::number(1e-11), Value::ZERO);
        assert_eq!(Value::number(-9.9e-11), Value::ZERO);
        assert_eq!(Value::number(1e-9).finite(), Some(1e-9));
    }

    #[test]
    fn nan_and_ieee_infinities_are_mapped() {
        assert!(Value::number(f64::NAN).is_error());
        assert_eq!(Value::number(f64::INFINITY), Value::PLUS_INFINITY);
        assert_eq!(Value::number(f64::NEG_INFINITY), Value::MINUS_INFINITY);
        assert_eq!(Value::number(3e25), Value::PLUS_INFINITY);
    }

    #[test]
    fn severity_keeps_worst() {
        let cyc = Value::error(ErrorKind::Cyclic);
        let par = Value::error(ErrorKind::Params);
        assert_eq!(Value::severest(cyc, par), cyc);
        assert_eq!(Value::severest(par, cyc), cyc);
        assert_eq!(Value::severest(par, Value::UNDEFINED), par);
        assert_eq!(
            Value::severest(Value::UNDEFINED, Value::COMPUTING),
            Value::COMPUTING
        );
    }

    #[test]
    fn no_cost_is_not_zero() {
        assert_ne!(Value::NO_COST, Value::ZERO);
        assert_eq!(Value::NO_COST.finite_or_free(), Some(0.0));
        assert_eq!(Value::NO_COST.finite(), None);
    }
}
