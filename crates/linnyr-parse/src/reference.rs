//! The variable-reference grammar.
//!
//! Inside brackets:
//!
//! ```text
//! [ {exp-spec}? stat$ pattern ( | attribute )? ( @ offset ( : offset )? )? ]
//! ```
//!
//! where `offset` is `[anchor][±integer]`. A bare unsigned number after
//! `@` addresses an absolute step (anchor `f`, offset n−1); a signed
//! number without an anchor is relative to the current step.

use linnyr_common::{pattern_has_wildcards, Anchor};
use std::fmt;

/// Reduction statistics usable as a `stat$pattern` prefix.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Stat {
    Max,
    Mean,
    Min,
    N,
    Sd,
    Sum,
    Var,
}

impl Stat {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "MAX" => Some(Self::Max),
            "MEAN" => Some(Self::Mean),
            "MIN" => Some(Self::Min),
            "N" => Some(Self::N),
            "SD" => Some(Self::Sd),
            "SUM" => Some(Self::Sum),
            "VAR" => Some(Self::Var),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatSpec {
    pub stat: Stat,
    /// `NZ` suffix: reduce over non-zero values only.
    pub non_zero: bool,
}

impl StatSpec {
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_ascii_uppercase();
        if let Some(base) = upper.strip_suffix("NZ") {
            // bare "NZ" is not a statistic
            Stat::parse(base).map(|stat| StatSpec { stat, non_zero: true })
        } else {
            Stat::parse(&upper).map(|stat| StatSpec { stat, non_zero: false })
        }
    }
}

/// `{method$title|runspec}`: selects an experiment run result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunSpec {
    /// Statistic method applied across the run (empty: last value).
    pub method: String,
    /// Experiment title; empty selects the active experiment.
    pub title: String,
    /// Run selector text (run number or iterator expression).
    pub run: String,
}

/// A parsed variable reference.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VarSpec {
    /// Original bracket interior, for diagnostics and round-tripping.
    pub raw: String,
    pub experiment: Option<RunSpec>,
    pub stat: Option<StatSpec>,
    /// Entity / dataset-modifier selector. Empty means a self-reference
    /// to the owner's own attribute.
    pub pattern: String,
    /// Attribute after `|`, when present.
    pub attribute: Option<String>,
    pub anchor1: Anchor,
    pub offset1: i32,
    pub anchor2: Anchor,
    pub offset2: i32,
    /// An `@…` part was written (distinguishes `@t+0` from no anchor).
    pub explicit_offset: bool,
}

impl VarSpec {
    /// Selector contains `?`, `*` or `#` and therefore matches a set.
    pub fn has_wildcards(&self) -> bool {
        pattern_has_wildcards(&self.pattern)
    }

    /// Method call: selector starts with `:`.
    pub fn is_method(&self) -> bool {
        self.pattern.starts_with(':')
    }

    /// Self-reference to the owner's attribute.
    pub fn is_self(&self) -> bool {
        self.pattern.is_empty() && self.attribute.is_none() && self.stat.is_none()
    }

    /// Both offsets resolve to the trivial `t+0`.
    pub fn trivial_offset(&self) -> bool {
        !self.explicit_offset
            || (self.anchor1 == Anchor::Step
                && self.offset1 == 0
                && self.anchor2 == Anchor::Step
                && self.offset2 == 0)
    }

    /// Parse a bracket interior. Errors carry a short description used as
    /// the expression's `compile_issue`.
    pub fn parse(raw: &str) -> Result<VarSpec, String> {
        let mut rest = raw.trim();
        let mut spec = VarSpec {
            raw: raw.to_string(),
            experiment: None,
            stat: None,
            pattern: String::new(),
            attribute: None,
            anchor1: Anchor::Step,
            offset1: 0,
            anchor2: Anchor::Step,
            offset2: 0,
            explicit_offset: false,
        };

        if let Some(after) = rest.strip_prefix('{') {
            let end = after
                .find('}')
                .ok_or_else(|| "unterminated experiment selector".to_string())?;
            spec.experiment = Some(parse_run_spec(&after[..end]));
            rest = after[end + 1..].trim_start();
        }

        if let Some(dollar) = rest.find('$') {
            let head = &rest[..dollar];
            match StatSpec::parse(head) {
                Some(s) => {
                    spec.stat = Some(s);
                    rest = rest[dollar + 1..].trim_start();
                }
                None => return Err(format!("unknown statistic '{head}'")),
            }
        }

        // offsets bind last, so split them off first
        let mut body = rest;
        if let Some(at) = rest.rfind('@') {
            let offsets = &rest[at + 1..];
            body = rest[..at].trim_end();
            let (first, second) = match offsets.split_once(':') {
                Some((a, b)) => (a, Some(b)),
                None => (offsets, None),
            };
            let (a1, o1) = parse_offset(first)?;
            spec.anchor1 = a1;
            spec.offset1 = o1;
            match second {
                Some(s) => {
                    let (a2, o2) = parse_offset(s)?;
                    spec.anchor2 = a2;
                    spec.offset2 = o2;
                }
                None => {
                    spec.anchor2 = a1;
                    spec.offset2 = o1;
                }
            }
            spec.explicit_offset = true;
        }

        match body.split_once('|') {
            Some((name, attr)) => {
                spec.pattern = name.trim().to_string();
                let attr = attr.trim();
                if attr.is_empty() {
                    return Err("empty attribute after '|'".into());
                }
                spec.attribute = Some(attr.to_string());
            }
            None => {
                spec.pattern = body.trim().to_string();
            }
        }

        if spec.pattern.is_empty() && spec.attribute.is_none() && spec.stat.is_some() {
            return Err("statistic without a selector".into());
        }
        Ok(spec)
    }
}

impl fmt::Display for VarSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.raw)
    }
}

fn parse_run_spec(text: &str) -> RunSpec {
    let (method, rest) = match text.split_once('$') {
        Some((m, r)) => (m.trim().to_string(), r),
        None => (String::new(), text),
    };
    let (title, run) = match rest.split_once('|') {
        Some((t, r)) => (t.trim().to_string(), r.trim().to_string()),
        None => (rest.trim().to_string(), String::new()),
    };
    RunSpec { method, title, run }
}

fn parse_offset(text: &str) -> Result<(Anchor, i32), String> {
    let s = text.trim();
    if s.is_empty() {
        return Err("empty offset after '@'".into());
    }
    let mut chars = s.chars();
    let first = chars.next().unwrap();
    if let Some(anchor) = Anchor::from_char(first) {
        let tail = chars.as_str().trim();
        if tail.is_empty() {
            return Ok((anchor, 0));
        }
        let off: i32 = tail
            .parse()
            .map_err(|_| format!("malformed offset '{s}'"))?;
        return Ok((anchor, off));
    }
    if first == '+' || first == '-' {
        let off: i32 = s.parse().map_err(|_| format!("malformed offset '{s}'"))?;
        return Ok((Anchor::Step, off));
    }
    if first.is_ascii_digit() {
        // bare number: absolute step
        let step: i32 = s.parse().map_err(|_| format!("malformed offset '{s}'"))?;
        return Ok((Anchor::First, step - 1));
    }
    Err(format!("unknown anchor '{first}'"))
}
