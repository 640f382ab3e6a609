use serde::{Deserialize, Serialize};

use super::Tags;

/// One incoming sample. `timestamp` follows the OpenTSDB convention: seconds
/// since epoch, or milliseconds when the value exceeds 10^10.
#[derive(Debug, Clone, Deserialize)]
pub struct DataPoint {
    pub metric: String,
    pub timestamp: f64,
    pub value: f64,
    #[serde(default)]
    pub tags: Tags,
}

/// `/api/put` accepts a single point or an array of points.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PutBody {
    Single(DataPoint),
    Many(Vec<DataPoint>),
}

impl PutBody {
    pub fn into_points(self) -> Vec<DataPoint> {
        match self {
            PutBody::Single(p) => vec![p],
            PutBody::Many(points) => points,
        }
    }
}

/// Write statistics returned to the caller.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PutStats {
    pub points_written: u64,
    pub write_time_ms: u64,
    /// Thousands of data points per second over the write.
    pub kdps: f64,
    pub miss_rates: MissRates,
}

/// Id-cache miss rates for the batch, per cache shape.
#[derive(Debug, Serialize, PartialEq)]
pub struct MissRates {
    pub metric: f64,
    pub tagset: f64,
}
