//! Time-anchor resolution.
//!
//! A variable reference may carry an `@ anchor±offset` suffix (optionally
//! two, separated by `:`). Each anchor maps the expression's current local
//! step onto an absolute step of the simulation; a two-offset reference
//! resolves to the integer midpoint of the two resolved steps.

use std::fmt;

/// The ten anchor kinds (thirteen glyphs; `i`, `j`, `k` share one kind
/// family, as do `c`, `p`, `n`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Anchor {
    /// `t`: the current step. Default when no anchor is written.
    Step,
    /// `#`: the context number of a wildcard match.
    Context,
    /// `^`: the inherited parent anchor of an array-dataset modifier.
    Parent,
    /// `i`, `j`, `k`: experiment iterator index 0, 1 or 2.
    Iterator(u8),
    /// `r`: the current step scaled by the delta-time multiplier.
    Scaled,
    /// `f`: the first step of the simulation.
    First,
    /// `l`: the last step of the simulation.
    Last,
    /// `c`: the first step of the current block.
    ChunkStart,
    /// `p`: the first step of the previous block.
    PrevChunkStart,
    /// `n`: the first step of the next block.
    NextChunkStart,
    /// `s`: offset scaled by the delta-time multiplier, from step zero.
    ScaledZero,
}

impl Anchor {
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            't' => Some(Self::Step),
            '#' => Some(Self::Context),
            '^' => Some(Self::Parent),
            'i' => Some(Self::Iterator(0)),
            'j' => Some(Self::Iterator(1)),
            'k' => Some(Self::Iterator(2)),
            'r' => Some(Self::Scaled),
            'f' => Some(Self::First),
            'l' => Some(Self::Last),
            'c' => Some(Self::ChunkStart),
            'p' => Some(Self::PrevChunkStart),
            'n' => Some(Self::NextChunkStart),
            's' => Some(Self::ScaledZero),
            _ => None,
        }
    }

    pub fn glyph(self) -> char {
        match self {
            Self::Step => 't',
            Self::Context => '#',
            Self::Parent => '^',
            Self::Iterator(0) => 'i',
            Self::Iterator(1) => 'j',
            Self::Iterator(_) => 'k',
            Self::Scaled => 'r',
            Self::First => 'f',
            Self::Last => 'l',
            Self::ChunkStart => 'c',
            Self::PrevChunkStart => 'p',
            Self::NextChunkStart => 'n',
            Self::ScaledZero => 's',
        }
    }

    /// True when resolution depends on the current step, so any non-`t+0`
    /// use makes the enclosing expression dynamic.
    pub fn is_dynamic(self) -> bool {
        !matches!(self, Self::First | Self::ScaledZero)
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.glyph())
    }
}

/// Everything anchor resolution can depend on.
#[derive(Debug, Clone, Copy)]
pub struct AnchorContext {
    /// Current local step, 1-based within the simulation period.
    pub step: i32,
    /// Context number bound by the innermost wildcard match, if any.
    pub context_number: i32,
    /// Resolved step of the parent expression, for `^` in array datasets.
    pub parent_step: i32,
    /// Experiment iterator triple (i, j, k).
    pub iterators: [i32; 3],
    pub block_length: u32,
    /// Simulation length N (steps, excluding look-ahead).
    pub horizon: u32,
    /// Delta-time multiplier for cross-run lookups; 1.0 within a run.
    pub dtm: f64,
}

impl AnchorContext {
    pub fn at(step: i32, block_length: u32, horizon: u32) -> Self {
        AnchorContext {
            step,
            context_number: 0,
            parent_step: 0,
            iterators: [0; 3],
            block_length: block_length.max(1),
            horizon,
            dtm: 1.0,
        }
    }

    fn chunk_start(&self) -> i32 {
        let bl = self.block_length as i32;
        (self.step - 1).div_euclid(bl) * bl + 1
    }

    /// Resolve one `(anchor, offset)` pair to an absolute step. The result
    /// may lie outside `0..=horizon`; clamping is the caller's concern.
    pub fn resolve(&self, anchor: Anchor, offset: i32) -> i32 {
        match anchor {
            Anchor::Step => self.step + offset,
            Anchor::Context => self.context_number + offset,
            Anchor::Parent => self.parent_step + offset,
            Anchor::Iterator(n) => self.iterators[n.min(2) as usize] + offset,
            Anchor::Scaled => (((self.step + offset) as f64) * self.dtm).floor() as i32,
            Anchor::First => 1 + offset,
            Anchor::Last => self.horizon as i32 + offset,
            Anchor::ChunkStart => self.chunk_start() + offset,
            Anchor::PrevChunkStart => self.chunk_start() - self.block_length as i32 + offset,
            Anchor::NextChunkStart => self.chunk_start() + self.block_length as i32 + offset,
            Anchor::ScaledZero => ((offset as f64) * self.dtm).floor() as i32,
        }
    }

    /// Two differing offsets resolve to the floored midpoint, not a range.
    pub fn resolve_pair(&self, a1: Anchor, o1: i32, a2: Anchor, o2: i32) -> i32 {
        let s1 = self.resolve(a1, o1);
        let s2 = self.resolve(a2, o2);
        if s1 == s2 { s1 } else { (s1 + s2).div_euclid(2) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(step: i32) -> AnchorContext {
        let mut c = AnchorContext::at(step, 4, 12);
        c.context_number = 7;
        c.iterators = [2, 3, 4];
        c
    }

    #[test]
    fn plain_anchors() {
        let c = ctx(6);
        assert_eq!(c.resolve(Anchor::Step, 0), 6);
        assert_eq!(c.resolve(Anchor::Step, -2), 4);
        assert_eq!(c.resolve(Anchor::First, 0), 1);
        assert_eq!(c.resolve(Anchor::Last, 0), 12);
        assert_eq!(c.resolve(Anchor::Last, -1), 11);
        assert_eq!(c.resolve(Anchor::Context, 1), 8);
        assert_eq!(c.resolve(Anchor::Iterator(1), 0), 3);
    }

    #[test]
    fn chunk_anchors() {
        // step 6 with block length 4 lies in the second block (steps 5..8)
        let c = ctx(6);
        assert_eq!(c.resolve(Anchor::ChunkStart, 0), 5);
        assert_eq!(c.resolve(Anchor::PrevChunkStart, 0), 1);
        assert_eq!(c.resolve(Anchor::NextChunkStart, 0), 9);
        // first step of a block is its own chunk start
        assert_eq!(ctx(5).resolve(Anchor::ChunkStart, 0), 5);
        assert_eq!(ctx(4).resolve(Anchor::ChunkStart, 0), 1);
    }

    #[test]
    fn scaled_anchors() {
        let mut c = ctx(6);
        c.dtm = 0.5;
        assert_eq!(c.resolve(Anchor::Scaled, 0), 3);
        assert_eq!(c.resolve(Anchor::Scaled, 1), 3);
        assert_eq!(c.resolve(Anchor::ScaledZero, 10), 5);
    }

    #[test]
    fn pair_midpoint_floors() {
        let c = ctx(6);
        assert_eq!(c.resolve_pair(Anchor::Step, 0, Anchor::Step, 4), 8);
        assert_eq!(c.resolve_pair(Anchor::Step, 0, Anchor::Step, 3), 7);
        assert_eq!(c.resolve_pair(Anchor::First, 0, Anchor::Step, -10), 0);
    }
}
