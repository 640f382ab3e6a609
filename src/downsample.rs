use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::types::PgInterval;
use std::str::FromStr;

use crate::aggregators::AggregatorKind;
use crate::models::time::parse_span_millis;

/// Gap handling for downsampled buckets. `none` buckets only where data
/// exists; the others gap-fill in SQL and rewrite the NULLs on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillPolicy {
    #[default]
    None,
    Nan,
    Null,
    Zero,
}

impl FromStr for FillPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "nan" => Ok(Self::Nan),
            "null" => Ok(Self::Null),
            "zero" => Ok(Self::Zero),
            other => Err(format!("unknown fill policy: {other}")),
        }
    }
}

/// A parsed downsample spec: `<quantity><unit>-<agg>[-<fill>]`. A `0all`
/// width collapses each series to a single bucket stamped with the query
/// start.
#[derive(Debug, Clone)]
pub struct Downsample {
    /// Bucket width in milliseconds; `None` is the `0all` sentinel.
    pub bucket_millis: Option<i64>,
    pub function: AggregatorKind,
    pub fill: FillPolicy,
}

impl FromStr for Downsample {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '-');
        let width = parts.next().filter(|w| !w.is_empty());
        let function = parts.next();
        let fill = parts.next();
        let (Some(width), Some(function)) = (width, function) else {
            return Err(format!("malformed downsample spec: {s}"));
        };

        let bucket_millis = if width.ends_with("all") {
            None
        } else {
            let millis = parse_span_millis(width)?;
            if millis <= 0 {
                return Err(format!("zero-width downsample bucket: {s}"));
            }
            Some(millis)
        };
        let function = function.parse::<AggregatorKind>()?;
        let fill = fill.map(FillPolicy::from_str).transpose()?.unwrap_or_default();
        Ok(Self {
            bucket_millis,
            function,
            fill,
        })
    }
}

/// A ready-to-bind downsampled point query. Bind order: $1 metric id,
/// $2 tagset id array, $3 window start, $4 window end, $5 bucket interval
/// (absent for `0all`).
#[derive(Debug)]
pub struct DownsampleQuery {
    pub sql: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval: Option<PgInterval>,
}

impl Downsample {
    /// Synthesize the bucketed aggregation SQL for a query window. The
    /// window is aligned outward to bucket boundaries; gap-fill variants
    /// carry the window both as function arguments and in the WHERE clause,
    /// which `time_bucket_gapfill` requires.
    pub fn build_query(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> DownsampleQuery {
        let agg = sql_aggregate(self.function);

        let Some(bucket_millis) = self.bucket_millis else {
            return DownsampleQuery {
                sql: format!(
                    "SELECT tagset_id, NULL::timestamptz AS bucket, {agg} AS value \
                     FROM point \
                     WHERE metric_id = $1 AND tagset_id = ANY($2) \
                       AND time >= $3 AND time < $4 \
                     GROUP BY tagset_id ORDER BY tagset_id",
                ),
                start,
                end,
                interval: None,
            };
        };

        let start = align_floor(start, bucket_millis);
        let end = align_ceil(end, bucket_millis);
        let bucket_fn = match self.fill {
            FillPolicy::None => "time_bucket($5, time)",
            _ => "time_bucket_gapfill($5, time, $3, $4)",
        };
        DownsampleQuery {
            sql: format!(
                "SELECT tagset_id, {bucket_fn} AS bucket, {agg} AS value \
                 FROM point \
                 WHERE metric_id = $1 AND tagset_id = ANY($2) \
                   AND time >= $3 AND time < $4 \
                 GROUP BY tagset_id, bucket ORDER BY tagset_id, bucket",
            ),
            start,
            end,
            interval: Some(PgInterval {
                months: 0,
                days: 0,
                microseconds: bucket_millis * 1_000,
            }),
        }
    }

    /// Emission timestamp for a bucket: its closing boundary, so the window
    /// `[00:30, 03:15]` at 1 h yields buckets stamped 01:00 through 04:00.
    /// `0all` buckets are stamped with the query start.
    pub fn bucket_label_secs(&self, bucket_start: Option<DateTime<Utc>>, query_start: DateTime<Utc>) -> i64 {
        match (self.bucket_millis, bucket_start) {
            (Some(millis), Some(start)) => {
                (start + chrono::Duration::milliseconds(millis)).timestamp()
            }
            _ => query_start.timestamp(),
        }
    }
}

fn sql_aggregate(function: AggregatorKind) -> &'static str {
    match function {
        AggregatorKind::Mean => "avg(value)",
        AggregatorKind::Median => "percentile_cont(0.5) WITHIN GROUP (ORDER BY value)",
        AggregatorKind::Sum => "sum(value)",
        AggregatorKind::Count => "count(1)",
        AggregatorKind::Min => "min(value)",
        AggregatorKind::Max => "max(value)",
        AggregatorKind::First => "first(value, time)",
        AggregatorKind::Last => "last(value, time)",
    }
}

fn align_floor(t: DateTime<Utc>, bucket_millis: i64) -> DateTime<Utc> {
    let bucket_micros = bucket_millis * 1_000;
    let micros = t.timestamp_micros();
    let floored = micros - micros.rem_euclid(bucket_micros);
    Utc.timestamp_micros(floored).single().unwrap_or(t)
}

fn align_ceil(t: DateTime<Utc>, bucket_millis: i64) -> DateTime<Utc> {
    let bucket_micros = bucket_millis * 1_000;
    let micros = t.timestamp_micros();
    let rem = micros.rem_euclid(bucket_micros);
    let ceiled = if rem == 0 { micros } else { micros - rem + bucket_micros };
    Utc.timestamp_micros(ceiled).single().unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn parses_wire_forms() {
        let ds: Downsample = "1m-sum-zero".parse().unwrap();
        assert_eq!(ds.bucket_millis, Some(60_000));
        assert_eq!(ds.function, AggregatorKind::Sum);
        assert_eq!(ds.fill, FillPolicy::Zero);

        let ds: Downsample = "1h-avg".parse().unwrap();
        assert_eq!(ds.bucket_millis, Some(3_600_000));
        assert_eq!(ds.fill, FillPolicy::None);

        let ds: Downsample = "0all-max".parse().unwrap();
        assert_eq!(ds.bucket_millis, None);

        assert!("1m".parse::<Downsample>().is_err());
        assert!("1m-p95".parse::<Downsample>().is_err());
        assert!("1m-sum-backfill".parse::<Downsample>().is_err());
    }

    #[test]
    fn window_aligns_outward() {
        let ds: Downsample = "1h-avg".parse().unwrap();
        let q = ds.build_query(at(0, 30), at(3, 15));
        assert_eq!(q.start, at(0, 0));
        assert_eq!(q.end, at(4, 0));
    }

    #[test]
    fn aligned_boundaries_stay_put() {
        let ds: Downsample = "1m-sum-zero".parse().unwrap();
        let q = ds.build_query(at(0, 0), at(0, 5));
        assert_eq!(q.start, at(0, 0));
        assert_eq!(q.end, at(0, 5));
    }

    #[test]
    fn bucket_labels_are_closing_boundaries() {
        // [00:30, 03:15] at 1h: four buckets stamped 01:00..04:00
        let ds: Downsample = "1h-avg".parse().unwrap();
        let q = ds.build_query(at(0, 30), at(3, 15));
        let mut labels = Vec::new();
        let mut bucket = q.start;
        while bucket < q.end {
            labels.push(ds.bucket_label_secs(Some(bucket), at(0, 30)));
            bucket += chrono::Duration::hours(1);
        }
        let expected: Vec<i64> = (1..=4).map(|h| at(h, 0).timestamp()).collect();
        assert_eq!(labels, expected);
    }

    #[test]
    fn all_sentinel_uses_query_start() {
        let ds: Downsample = "0all-sum".parse().unwrap();
        assert_eq!(
            ds.bucket_label_secs(None, at(2, 30)),
            at(2, 30).timestamp()
        );
        let q = ds.build_query(at(2, 30), at(5, 0));
        // no alignment, no interval, single bucket per series
        assert_eq!(q.start, at(2, 30));
        assert!(q.interval.is_none());
        assert!(!q.sql.contains("time_bucket"));
        assert!(q.sql.contains("GROUP BY tagset_id ORDER BY tagset_id"));
    }

    #[test]
    fn gapfill_requires_both_window_bounds() {
        let ds: Downsample = "1m-sum-zero".parse().unwrap();
        let q = ds.build_query(at(0, 0), at(0, 5));
        assert!(q.sql.contains("time_bucket_gapfill($5, time, $3, $4)"));
        assert!(q.sql.contains("time >= $3 AND time < $4"));

        let plain: Downsample = "1m-sum".parse().unwrap();
        let q = plain.build_query(at(0, 0), at(0, 5));
        assert!(q.sql.contains("time_bucket($5, time)"));
        assert!(!q.sql.contains("gapfill"));
    }

    #[test]
    fn aggregate_expressions() {
        for (wire, expr) in [
            ("1m-count", "count(1)"),
            ("1m-first", "first(value, time)"),
            ("1m-last", "last(value, time)"),
            ("1m-median", "percentile_cont(0.5) WITHIN GROUP (ORDER BY value)"),
        ] {
            let ds: Downsample = wire.parse().unwrap();
            let q = ds.build_query(at(0, 0), at(1, 0));
            assert!(q.sql.contains(expr), "{wire} should use {expr}");
        }
    }
}
