use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

use super::Tags;
use super::time::TimeSpec;
use crate::filters::{TagFilter, TagPredicate};
use crate::rate::RateOptions;

/// `/api/query` request body.
#[derive(Debug, Deserialize)]
pub struct QueryDto {
    pub start: TimeSpec,
    #[serde(default)]
    pub end: Option<TimeSpec>,
    pub queries: Vec<QueryPart>,
}

/// One subquery. Inline `tags` are shorthand filters that also group; the
/// `filters` list carries the explicit OpenTSDB filter objects.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPart {
    pub metric: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub aggregator: Option<String>,
    #[serde(default)]
    pub rate: bool,
    #[serde(default)]
    pub rate_options: Option<RateOptions>,
    #[serde(default)]
    pub downsample: Option<String>,
    #[serde(default)]
    pub filters: Vec<FilterDto>,
    #[serde(default)]
    pub explicit_tags: bool,
}

/// Wire-form filter object: `{"type":"wildcard","tagk":"host","filter":"web*"}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterDto {
    #[serde(rename = "type")]
    pub kind: String,
    pub tagk: String,
    pub filter: String,
    #[serde(default)]
    pub group_by: bool,
}

impl QueryPart {
    /// Normalize inline tags plus explicit filters into the evaluation list.
    /// Inline tags come first and always declare their key as a grouping
    /// axis.
    pub fn build_filters(&self) -> Result<Vec<TagFilter>, String> {
        let mut out = Vec::with_capacity(self.tags.len() + self.filters.len());
        for (key, expr) in &self.tags {
            out.push(TagFilter {
                key: key.clone(),
                predicate: TagPredicate::parse(expr)?,
                group_by: true,
            });
        }
        for f in &self.filters {
            out.push(TagFilter {
                key: f.tagk.clone(),
                predicate: TagPredicate::parse(&format!("{}({})", f.kind, f.filter))?,
                group_by: f.group_by,
            });
        }
        Ok(out)
    }
}

/// A datapoint value: a number, an explicit JSON null, or the string "NaN"
/// (JSON has no NaN literal).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DpsValue {
    Value(f64),
    Null,
}

impl Serialize for DpsValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DpsValue::Value(v) if v.is_nan() => serializer.serialize_str("NaN"),
            DpsValue::Value(v) => serializer.serialize_f64(*v),
            DpsValue::Null => serializer.serialize_none(),
        }
    }
}

/// One emitted series: OpenTSDB result shape with `dps` keyed by unix
/// seconds.
#[derive(Debug, Serialize)]
pub struct QueryResultDto {
    pub metric: String,
    pub tags: Tags,
    #[serde(rename = "aggregateTags")]
    pub aggregate_tags: Vec<String>,
    #[serde(serialize_with = "serialize_dps")]
    pub dps: BTreeMap<i64, DpsValue>,
}

fn serialize_dps<S: Serializer>(
    dps: &BTreeMap<i64, DpsValue>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(dps.len()))?;
    for (secs, value) in dps {
        map.serialize_entry(&secs.to_string(), value)?;
    }
    map.end()
}

/// `/api/query/last` request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastQueryDto {
    pub queries: Vec<LastQueryPart>,
    /// Hours to scan back from now; unbounded when absent.
    #[serde(default)]
    pub back_scan: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LastQueryPart {
    pub metric: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Latest sample of one series. `timestamp` is epoch milliseconds, OpenTSDB
/// parity.
#[derive(Debug, Serialize)]
pub struct LastQueryResultDto {
    pub metric: String,
    pub timestamp: i64,
    pub value: f64,
    pub tags: Tags,
}

/// `/api/search/lookup` request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupRequestDto {
    pub metric: String,
    #[serde(default)]
    pub tags: Vec<LookupTag>,
    #[serde(default = "default_lookup_limit")]
    pub limit: usize,
    #[serde(default)]
    pub start_index: usize,
}

#[derive(Debug, Deserialize)]
pub struct LookupTag {
    pub key: String,
    pub value: String,
}

fn default_lookup_limit() -> usize {
    25
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResponseDto {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub metric: String,
    pub total_results: usize,
    pub results: Vec<LookupResultDto>,
}

#[derive(Debug, Serialize)]
pub struct LookupResultDto {
    pub metric: String,
    pub tags: Tags,
}
