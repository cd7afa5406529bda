//! Entity kinds, the per-kind attribute vocabulary, and wildcard name
//! matching for variable references.

use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Actor,
    Process,
    Product,
    Cluster,
    Link,
    Constraint,
    Dataset,
    Equation,
    Note,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl EntityKind {
    /// The attribute letters a kind supports in variable references.
    pub fn attributes(self) -> &'static [&'static str] {
        match self {
            Self::Actor => &["W", "CI", "CO", "CF"],
            Self::Constraint => &["SOC", "A"],
            Self::Cluster => &["CI", "CO", "CF"],
            Self::Link => &["R", "D", "SOC", "F"],
            Self::Process => &["LB", "UB", "IL", "LCF", "L", "CI", "CO", "CF", "MCF", "CP"],
            Self::Product => &["LB", "UB", "IL", "P", "L", "CP", "HCP"],
            Self::Dataset | Self::Equation => &[],
            Self::Note => &[],
        }
    }

    /// The attribute assumed when a reference names an entity without `|`.
    pub fn default_attribute(self) -> &'static str {
        match self {
            Self::Actor => "CF",
            Self::Process | Self::Product => "L",
            Self::Link => "F",
            Self::Constraint => "A",
            Self::Cluster => "CF",
            _ => "",
        }
    }

    pub fn supports_attribute(self, attr: &str) -> bool {
        self.attributes().iter().any(|a| a.eq_ignore_ascii_case(attr))
    }
}

/// Attributes whose value exists only after the solver has run.
pub fn is_level_based(attr: &str) -> bool {
    matches!(
        attr.to_ascii_uppercase().as_str(),
        "L" | "CP" | "HCP" | "CF" | "MCF" | "CI" | "CO" | "F" | "A"
    )
}

/// A stable handle on an entity: kind plus display name. Names compare
/// case-insensitively everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub name: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        EntityRef {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

pub fn pattern_has_wildcards(pattern: &str) -> bool {
    pattern.contains(['?', '*', '#'])
}

/// Match `name` against a selector that may contain `?` (any one char),
/// `*` (any run) and `#` (a digit run whose value becomes the context
/// number). Matching is ASCII-case-insensitive. Returns the context
/// number captured by the first `#`, or 0 when the pattern has none.
pub fn match_pattern(pattern: &str, name: &str) -> Option<i32> {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let mut capture = None;
    if match_at(&p, 0, &n, 0, &mut capture) {
        Some(capture.unwrap_or(0))
    } else {
        None
    }
}

fn match_at(p: &[char], pi: usize, n: &[char], ni: usize, cap: &mut Option<i32>) -> bool {
    if pi == p.len() {
        return ni == n.len();
    }
    match p[pi] {
        '*' => {
            // greedy run, backtracking one char at a time
            for skip in (ni..=n.len()).rev() {
                if match_at(p, pi + 1, n, skip, cap) {
                    return true;
                }
            }
            false
        }
        '?' => ni < n.len() && match_at(p, pi + 1, n, ni + 1, cap),
        '#' => {
            let mut end = ni;
            while end < n.len() && n[end].is_ascii_digit() {
                end += 1;
            }
            if end == ni {
                return false;
            }
            // longest digit run first, shrinking on backtrack
            for stop in (ni + 1..=end).rev() {
                let digits: String = n[ni..stop].iter().collect();
                if let Ok(v) = digits.parse::<i32>() {
                    let saved = *cap;
                    if cap.is_none() {
                        *cap = Some(v);
                    }
                    if match_at(p, pi + 1, n, stop, cap) {
                        return true;
                    }
                    *cap = saved;
                }
            }
            false
        }
        c => {
            ni < n.len()
                && c.eq_ignore_ascii_case(&n[ni])
                && match_at(p, pi + 1, n, ni + 1, cap)
        }
    }
}
