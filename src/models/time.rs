use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// An OpenTSDB time specifier: `now`, `<n><unit>-ago`, a numeric epoch, or an
/// RFC 3339 timestamp. Numeric epochs are seconds unless the value exceeds
/// 10^10 (or is fractional, which always means seconds).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TimeSpec {
    Epoch(f64),
    Text(String),
}

impl TimeSpec {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
        match self {
            TimeSpec::Epoch(n) => epoch_to_utc(*n),
            TimeSpec::Text(s) => parse_text(s, now),
        }
    }
}

/// Seconds-vs-milliseconds disambiguation shared with the ingest path.
pub fn epoch_to_utc(value: f64) -> Result<DateTime<Utc>, String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid epoch timestamp: {value}"));
    }
    let fractional = value.fract() != 0.0;
    let micros = if value > 1e10 && !fractional {
        // millisecond epoch
        (value * 1_000.0) as i64
    } else {
        (value * 1_000_000.0) as i64
    };
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| format!("epoch timestamp out of range: {value}"))
}

fn parse_text(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    if let Some(rel) = s.strip_suffix("-ago") {
        let millis = parse_span_millis(rel)?;
        return Ok(now - chrono::Duration::milliseconds(millis));
    }
    if let Ok(n) = s.parse::<f64>() {
        return epoch_to_utc(n);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| format!("unrecognized time specifier: {s}"))
}

/// Parse a `<quantity><unit>` span into milliseconds. Units follow OpenTSDB:
/// ms, s, m, h, d, w, n (30 days), y (365 days).
pub fn parse_span_millis(s: &str) -> Result<i64, String> {
    let s = s.trim();
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(format!("missing quantity in time span: {s}"));
    }
    let quantity: i64 = digits
        .parse()
        .map_err(|_| format!("invalid quantity in time span: {s}"))?;
    let unit = &s[digits.len()..];
    let unit_millis = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "n" => 30 * 86_400_000,
        "y" => 365 * 86_400_000,
        _ => return Err(format!("unknown time unit: {unit}")),
    };
    Ok(quantity * unit_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn resolves_now() {
        let t = TimeSpec::Text("now".into()).resolve(now()).unwrap();
        assert_eq!(t, now());
    }

    #[test]
    fn resolves_relative_ago() {
        let t = TimeSpec::Text("1h-ago".into()).resolve(now()).unwrap();
        assert_eq!(t, now() - chrono::Duration::hours(1));
        let t = TimeSpec::Text("2w-ago".into()).resolve(now()).unwrap();
        assert_eq!(t, now() - chrono::Duration::weeks(2));
    }

    #[test]
    fn epoch_seconds_vs_millis() {
        let secs = TimeSpec::Epoch(1_700_000_000.0).resolve(now()).unwrap();
        assert_eq!(secs.timestamp(), 1_700_000_000);
        let millis = TimeSpec::Epoch(1_700_000_000_000.0).resolve(now()).unwrap();
        assert_eq!(millis.timestamp(), 1_700_000_000);
        // fractional always means seconds
        let frac = TimeSpec::Epoch(1_700_000_000.5).resolve(now()).unwrap();
        assert_eq!(frac.timestamp_micros(), 1_700_000_000_500_000);
    }

    #[test]
    fn epoch_string_accepted() {
        let t = TimeSpec::Text("1700000000".into()).resolve(now()).unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
    }

    #[test]
    fn rfc3339_accepted() {
        let t = TimeSpec::Text("2024-06-01T10:30:00Z".into())
            .resolve(now())
            .unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 6, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn rejects_garbage() {
        assert!(TimeSpec::Text("yesterday".into()).resolve(now()).is_err());
        assert!(TimeSpec::Text("5q-ago".into()).resolve(now()).is_err());
    }
}
