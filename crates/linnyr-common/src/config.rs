//! Run configuration, time units, and dataset resampling.

use std::error::Error;
use std::fmt;

/// Solver-run configuration supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunConfig {
    /// First simulated period (1-based).
    pub start_period: u32,
    /// Last simulated period, inclusive.
    pub end_period: u32,
    pub block_length: u32,
    pub look_ahead: u32,
    /// Number of rounds, 1..=31.
    pub rounds: u8,
    /// Sequence of round letters; each must be within the first `rounds`
    /// letters of the alphabet. Empty means a single pass of the last round.
    pub round_sequence: String,
    pub diagnose: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            start_period: 1,
            end_period: 1,
            block_length: 1,
            look_ahead: 0,
            rounds: 1,
            round_sequence: "a".into(),
            diagnose: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run configuration: {}", self.0)
    }
}

impl Error for ConfigError {}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_length < 1 {
            return Err(ConfigError("block length must be at least 1".into()));
        }
        if self.end_period < self.start_period {
            return Err(ConfigError(format!(
                "end period {} precedes start period {}",
                self.end_period, self.start_period
            )));
        }
        if !(1..=31).contains(&self.rounds) {
            return Err(ConfigError(format!("rounds must be 1..=31, not {}", self.rounds)));
        }
        let last = (b'a' + self.rounds - 1) as char;
        for c in self.round_sequence.chars() {
            if !c.is_ascii_lowercase() || c > last {
                return Err(ConfigError(format!(
                    "round letter '{c}' outside a..{last}"
                )));
            }
        }
        Ok(())
    }

    /// Simulation length N in steps, excluding look-ahead.
    pub fn simulation_length(&self) -> u32 {
        self.end_period - self.start_period + 1
    }

    /// Steps translated into one MILP.
    pub fn chunk_length(&self) -> u32 {
        self.block_length + self.look_ahead
    }

    /// Number of blocks needed to cover the horizon; at least 1.
    pub fn block_count(&self) -> u32 {
        let n = self.simulation_length().saturating_sub(self.look_ahead);
        n.div_ceil(self.block_length).max(1)
    }

    /// Round letters to run per block, in order.
    pub fn round_letters(&self) -> Vec<char> {
        if self.round_sequence.is_empty() {
            vec![(b'a' + self.rounds - 1) as char]
        } else {
            self.round_sequence.chars().collect()
        }
    }
}

/* ─────────────────────────── time units ─────────────────────────── */

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimeUnit {
    Year,
    Week,
    Day,
    Hour,
    Minute,
    Second,
}

impl TimeUnit {
    pub fn hours(self) -> f64 {
        match self {
            Self::Year => 8760.0,
            Self::Week => 168.0,
            Self::Day => 24.0,
            Self::Hour => 1.0,
            Self::Minute => 1.0 / 60.0,
            Self::Second => 1.0 / 3600.0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "year" | "yr" | "y" => Some(Self::Year),
            "week" | "wk" | "w" => Some(Self::Week),
            "day" | "d" => Some(Self::Day),
            "hour" | "h" => Some(Self::Hour),
            "minute" | "min" | "m" => Some(Self::Minute),
            "second" | "sec" | "s" => Some(Self::Second),
            _ => None,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Year => "year",
            Self::Week => "week",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::Second => "second",
        })
    }
}

/* ─────────────────────── dataset resampling ─────────────────────── */

/// How a dataset series recorded at one time step is read at another.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResampleMethod {
    Nearest,
    Max,
    /// Coverage-weighted sum; for quantities that accumulate over time.
    WeightedSum,
    /// Coverage-weighted mean; the default for intensive quantities.
    #[default]
    Mean,
}

impl ResampleMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Some(Self::Nearest),
            "max" => Some(Self::Max),
            "w-sum" | "sum" => Some(Self::WeightedSum),
            "mean" | "default-mean" | "" => Some(Self::Mean),
            _ => None,
        }
    }

    /// Read model step `t` (1-based) from `data` recorded every `data_dt`
    /// hours, where one model step lasts `model_dt` hours. Steps beyond
    /// the series repeat `default` (the series' fallback value).
    pub fn resample(self, data: &[f64], data_dt: f64, model_dt: f64, t: u32, default: f64) -> f64 {
        if data.is_empty() || data_dt <= 0.0 || model_dt <= 0.0 {
            return default;
        }
        let at = |i: i64| -> f64 {
            if i < 0 {
                default
            } else {
                data.get(i as usize).copied().unwrap_or(default)
            }
        };
        // the model step covers [lo, hi) in data-index coordinates
        let lo = (t - 1) as f64 * model_dt / data_dt;
        let hi = t as f64 * model_dt / data_dt;
        match self {
            Self::Nearest => at(((lo + hi) / 2.0).floor() as i64),
            Self::Max => {
                let mut m = f64::NEG_INFINITY;
                let mut i = lo.floor() as i64;
                let last = (hi - 1e-9).floor() as i64;
                while i <= last {
                    m = m.max(at(i));
                    i += 1;
                }
                if m.is_finite() { m } else { default }
            }
            Self::WeightedSum | Self::Mean => {
                let mut sum = 0.0;
                let mut span = 0.0;
                let mut i = lo.floor() as i64;
                let last = (hi - 1e-9).floor() as i64;
                while i <= last {
                    let cover = (hi.min((i + 1) as f64) - lo.max(i as f64)).max(0.0);
                    sum += cover * at(i);
                    span += cover;
                    i += 1;
                }
                if span <= 0.0 {
                    default
                } else if self == Self::WeightedSum {
                    sum
                } else {
                    sum / span
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_invariants() {
        let mut cfg = RunConfig {
            start_period: 1,
            end_period: 10,
            block_length: 4,
            look_ahead: 2,
            rounds: 2,
            round_sequence: "ab".into(),
            diagnose: false,
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.simulation_length(), 10);
        assert_eq!(cfg.chunk_length(), 6);
        assert_eq!(cfg.block_count(), 2);

        cfg.round_sequence = "abc".into();
        assert!(cfg.validate().is_err());
        cfg.round_sequence = "ab".into();
        cfg.rounds = 32;
        assert!(cfg.validate().is_err());
        cfg.rounds = 2;
        cfg.block_length = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn block_count_is_at_least_one() {
        let cfg = RunConfig {
            start_period: 1,
            end_period: 2,
            block_length: 8,
            look_ahead: 2,
            ..RunConfig::default()
        };
        assert_eq!(cfg.block_count(), 1);
    }

    #[test]
    fn unit_table() {
        assert_eq!(TimeUnit::Year.hours(), 8760.0);
        assert_eq!(TimeUnit::parse("wk"), Some(TimeUnit::Week));
        assert_eq!(TimeUnit::parse("fortnight"), None);
    }

    #[test]
    fn resampling_downscale() {
        // hourly data read at 2-hour model steps
        let data = [2.0, 4.0, 6.0, 8.0];
        let mean = ResampleMethod::Mean.resample(&data, 1.0, 2.0, 1, 0.0);
        assert!((mean - 3.0).abs() < 1e-9);
        let max = ResampleMethod::Max.resample(&data, 1.0, 2.0, 2, 0.0);
        assert_eq!(max, 8.0);
        let wsum = ResampleMethod::WeightedSum.resample(&data, 1.0, 2.0, 1, 0.0);
        assert!((wsum - 6.0).abs() < 1e-9);
    }

    #[test]
    fn resampling_beyond_series_uses_default() {
        let data = [1.0];
        assert_eq!(ResampleMethod::Nearest.resample(&data, 1.0, 1.0, 5, 9.0), 9.0);
    }
}
