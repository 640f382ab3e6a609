pub mod put;
pub mod query;
pub mod time;

use std::collections::BTreeMap;

/// Database-assigned metric identifier (smallint).
pub type MetricId = i16;
/// Database-assigned tagset identifier (int).
pub type TagsetId = i32;

/// An immutable tag mapping; BTreeMap keeps the canonical key order.
pub type Tags = BTreeMap<String, String>;
