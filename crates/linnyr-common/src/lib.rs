pub mod anchor;
pub mod config;
pub mod entity;
pub mod value;

pub use anchor::{Anchor, AnchorContext};
pub use config::{ConfigError, ResampleMethod, RunConfig, TimeUnit};
pub use entity::{is_level_based, match_pattern, pattern_has_wildcards, EntityKind, EntityRef};
pub use value::{ErrorKind, Region, Value, NEAR_ZERO};
