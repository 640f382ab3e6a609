use regex::Regex;
use std::collections::HashSet;

/// A predicate over a single tag's value. OpenTSDB filter semantics: the
/// literal-or family compares against a fixed value set, wildcard compiles a
/// glob, regexp anchors the user's pattern.
#[derive(Debug, Clone)]
pub enum TagPredicate {
    LiteralOr {
        values: HashSet<String>,
        case_insensitive: bool,
    },
    NotLiteralOr {
        values: HashSet<String>,
        case_insensitive: bool,
    },
    Wildcard {
        pattern: Regex,
    },
    Regexp {
        pattern: Regex,
    },
}

/// A parsed filter: predicate over one tag key, optionally declaring that key
/// as a grouping axis.
#[derive(Debug, Clone)]
pub struct TagFilter {
    pub key: String,
    pub predicate: TagPredicate,
    pub group_by: bool,
}

impl TagPredicate {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            TagPredicate::LiteralOr {
                values,
                case_insensitive,
            } => {
                if *case_insensitive {
                    values.contains(&value.to_lowercase())
                } else {
                    values.contains(value)
                }
            }
            TagPredicate::NotLiteralOr {
                values,
                case_insensitive,
            } => {
                if *case_insensitive {
                    !values.contains(&value.to_lowercase())
                } else {
                    !values.contains(value)
                }
            }
            TagPredicate::Wildcard { pattern } | TagPredicate::Regexp { pattern } => {
                pattern.is_match(value)
            }
        }
    }

    /// literal-or is the one kind where walking the value index directly is
    /// always at least as cheap as re-evaluating candidates.
    pub fn is_literal_or(&self) -> bool {
        matches!(self, TagPredicate::LiteralOr { .. })
    }

    /// Parse the wire form: either `kind(params)` or a bare value. A bare
    /// value containing `*` is a case-insensitive wildcard, anything else a
    /// literal-or (OpenTSDB parity).
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        if let Some((kind, params)) = split_call(expr) {
            return match kind {
                "literal_or" => Ok(Self::literal_or(params, false)),
                "iliteral_or" => Ok(Self::literal_or(params, true)),
                "not_literal_or" => Ok(Self::not_literal_or(params, false)),
                "not_iliteral_or" => Ok(Self::not_literal_or(params, true)),
                "wildcard" => Self::wildcard(params, false),
                "iwildcard" => Self::wildcard(params, true),
                "regexp" => Self::regexp(params),
                other => Err(format!("unknown filter type: {other}")),
            };
        }
        if expr.contains('*') {
            Self::wildcard(expr, true)
        } else {
            Ok(Self::literal_or(expr, false))
        }
    }

    fn literal_or(params: &str, case_insensitive: bool) -> Self {
        TagPredicate::LiteralOr {
            values: split_values(params, case_insensitive),
            case_insensitive,
        }
    }

    fn not_literal_or(params: &str, case_insensitive: bool) -> Self {
        TagPredicate::NotLiteralOr {
            values: split_values(params, case_insensitive),
            case_insensitive,
        }
    }

    fn wildcard(glob: &str, case_insensitive: bool) -> Result<Self, String> {
        let mut pattern = String::from(if case_insensitive { "(?i)^" } else { "^" });
        for c in glob.trim().chars() {
            if c == '*' {
                pattern.push_str(".*");
            } else {
                pattern.push_str(&regex::escape(&c.to_string()));
            }
        }
        pattern.push('$');
        let pattern = Regex::new(&pattern).map_err(|e| format!("bad wildcard: {e}"))?;
        Ok(TagPredicate::Wildcard { pattern })
    }

    fn regexp(expr: &str) -> Result<Self, String> {
        let pattern = Regex::new(&format!("^(?:{})$", expr.trim()))
            .map_err(|e| format!("bad regexp filter: {e}"))?;
        Ok(TagPredicate::Regexp { pattern })
    }
}

fn split_call(expr: &str) -> Option<(&str, &str)> {
    let open = expr.find('(')?;
    if !expr.ends_with(')') {
        return None;
    }
    let kind = &expr[..open];
    if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((kind, &expr[open + 1..expr.len() - 1]))
}

fn split_values(params: &str, lowercase: bool) -> HashSet<String> {
    params
        .split('|')
        .map(|v| {
            let v = v.trim();
            if lowercase { v.to_lowercase() } else { v.to_string() }
        })
        .filter(|v| !v.is_empty())
        .collect()
}
