use std::str::FromStr;

/// Cross-series combining functions, applied per bucket after grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorKind {
    Mean,
    Median,
    Sum,
    Count,
    Min,
    Max,
    First,
    Last,
}

impl FromStr for AggregatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" | "mean" => Ok(Self::Mean),
            "median" => Ok(Self::Median),
            "sum" => Ok(Self::Sum),
            "count" => Ok(Self::Count),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            other => Err(format!("unknown aggregator: {other}")),
        }
    }
}

/// One streaming fold. Null inputs are ignored by every kind; an empty fold
/// yields `None` so the fill policy decides what a gap becomes. `first` and
/// `last` trust arrival order, which the pipeline keeps time-ascending.
#[derive(Debug)]
pub enum Aggregator {
    Mean { sum: f64, count: u64 },
    Median { values: Vec<f64> },
    Sum { sum: f64, seen: bool },
    Count { count: u64, seen: bool },
    Min { min: Option<f64> },
    Max { max: Option<f64> },
    First { first: Option<f64> },
    Last { last: Option<f64> },
}

impl Aggregator {
    pub fn new(kind: AggregatorKind) -> Self {
        match kind {
            AggregatorKind::Mean => Self::Mean { sum: 0.0, count: 0 },
            AggregatorKind::Median => Self::Median { values: Vec::new() },
            AggregatorKind::Sum => Self::Sum { sum: 0.0, seen: false },
            AggregatorKind::Count => Self::Count { count: 0, seen: false },
            AggregatorKind::Min => Self::Min { min: None },
            AggregatorKind::Max => Self::Max { max: None },
            AggregatorKind::First => Self::First { first: None },
            AggregatorKind::Last => Self::Last { last: None },
        }
    }

    pub fn add(&mut self, value: Option<f64>) {
        let Some(v) = value else { return };
        match self {
            Self::Mean { sum, count } => {
                *sum += v;
                *count += 1;
            }
            Self::Median { values } => values.push(v),
            Self::Sum { sum, seen } => {
                *sum += v;
                *seen = true;
            }
            Self::Count { count, seen } => {
                *count += 1;
                *seen = true;
            }
            Self::Min { min } => *min = Some(min.map_or(v, |m| m.min(v))),
            Self::Max { max } => *max = Some(max.map_or(v, |m| m.max(v))),
            Self::First { first } => {
                if first.is_none() {
                    *first = Some(v);
                }
            }
            Self::Last { last } => *last = Some(v),
        }
    }

    /// Median sorts its buffer here, not on every add.
    pub fn result(&mut self) -> Option<f64> {
        match self {
            Self::Mean { sum, count } => {
                if *count == 0 {
                    None
                } else {
                    Some(*sum / *count as f64)
                }
            }
            Self::Median { values } => {
                if values.is_empty() {
                    return None;
                }
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = values.len() / 2;
                if values.len() % 2 == 1 {
                    Some(values[mid])
                } else {
                    Some((values[mid - 1] + values[mid]) / 2.0)
                }
            }
            Self::Sum { sum, seen } => seen.then_some(*sum),
            Self::Count { count, seen } => seen.then_some(*count as f64),
            Self::Min { min } => *min,
            Self::Max { max } => *max,
            Self::First { first } => *first,
            Self::Last { last } => *last,
        }
    }
}
