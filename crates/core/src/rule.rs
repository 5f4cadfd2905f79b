//! Eviction policy parsing.
//!
//! A policy is a comma separated list of `left/right` clauses such as
//! `0/1h,4h/1d,1m/delete`. The first clause decides the mode: a bare
//! non-zero count keeps that many vaults, anything else is an age threshold.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("eviction policy is empty")]
    EmptyPolicy,
    #[error("invalid rule: {0:?}")]
    InvalidRule(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Keep the newest `first` vaults.
    Limit,
    /// Act on vaults older than `first` seconds.
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Delete,
    /// Keep one vault per bucket of this many seconds.
    Thin(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub kind: RuleKind,
    pub first: i64,
    pub action: Option<RuleAction>,
}

fn unit_seconds(unit: &str) -> Option<i64> {
    match unit {
        "min" => Some(60),
        "h" => Some(3_600),
        "d" => Some(86_400),
        "m" => Some(2_592_000),
        "y" => Some(31_104_000),
        _ => None,
    }
}

/// Splits `12h` into `(12, "h")`.
fn split_amount(raw: &str) -> Option<(i64, &str)> {
    let digits_end = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    if digits_end == 0 {
        return None;
    }
    let value = raw[..digits_end].parse::<i64>().ok()?;
    Some((value, &raw[digits_end..]))
}

fn parse_left(raw: &str) -> Result<(RuleKind, i64), RuleError> {
    let (value, unit) = split_amount(raw).ok_or_else(|| RuleError::InvalidRule(raw.to_string()))?;
    if unit.is_empty() {
        return Ok(if value == 0 {
            (RuleKind::Interval, 0)
        } else {
            (RuleKind::Limit, value)
        });
    }
    let multiplier = unit_seconds(unit).ok_or_else(|| RuleError::InvalidRule(raw.to_string()))?;
    value
        .checked_mul(multiplier)
        .map(|seconds| (RuleKind::Interval, seconds))
        .ok_or_else(|| RuleError::InvalidRule(raw.to_string()))
}

fn parse_right(raw: &str) -> Result<RuleAction, RuleError> {
    if raw == "delete" {
        return Ok(RuleAction::Delete);
    }
    let (value, unit) = split_amount(raw).ok_or_else(|| RuleError::InvalidRule(raw.to_string()))?;
    let multiplier = if unit.is_empty() {
        1
    } else {
        unit_seconds(unit).ok_or_else(|| RuleError::InvalidRule(raw.to_string()))?
    };
    match value.checked_mul(multiplier) {
        Some(width) if width > 0 => Ok(RuleAction::Thin(width)),
        _ => Err(RuleError::InvalidRule(raw.to_string())),
    }
}

fn parse_clause(clause: &str) -> Result<Rule, RuleError> {
    let (left, right) = match clause.split_once('/') {
        Some((left, right)) => (left.trim(), Some(right.trim())),
        None => (clause, None),
    };
    if left.is_empty() {
        return Err(RuleError::InvalidRule(clause.to_string()));
    }
    let (kind, first) = parse_left(left)?;
    let action = match right {
        Some(right) if !right.is_empty() => Some(parse_right(right)?),
        Some(_) => return Err(RuleError::InvalidRule(clause.to_string())),
        None if kind == RuleKind::Limit => None,
        None => return Err(RuleError::InvalidRule(clause.to_string())),
    };
    Ok(Rule {
        kind,
        first,
        action,
    })
}

/// Parses a full policy string into its ordered rules.
pub fn parse_rules(policy: &str) -> Result<Vec<Rule>, RuleError> {
    if policy.trim().is_empty() {
        return Err(RuleError::EmptyPolicy);
    }
    policy
        .split(',')
        .map(|clause| {
            let clause = clause.trim();
            if clause.is_empty() {
                Err(RuleError::InvalidRule(clause.to_string()))
            } else {
                parse_clause(clause)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interval_policy() {
        let rules = parse_rules("0/1h, 4h/1d,1m/delete").unwrap();
        assert_eq!(
            rules,
            vec![
                Rule {
                    kind: RuleKind::Interval,
                    first: 0,
                    action: Some(RuleAction::Thin(3_600)),
                },
                Rule {
                    kind: RuleKind::Interval,
                    first: 4 * 3_600,
                    action: Some(RuleAction::Thin(86_400)),
                },
                Rule {
                    kind: RuleKind::Interval,
                    first: 2_592_000,
                    action: Some(RuleAction::Delete),
                },
            ]
        );
    }

    #[test]
    fn parses_limit_policy() {
        let rules = parse_rules("5").unwrap();
        assert_eq!(
            rules,
            vec![Rule {
                kind: RuleKind::Limit,
                first: 5,
                action: None,
            }]
        );
        assert_eq!(parse_rules("3/delete").unwrap()[0].kind, RuleKind::Limit);
    }

    #[test]
    fn unit_multipliers() {
        let rules = parse_rules("2min/delete,1y/90").unwrap();
        assert_eq!(rules[0].first, 120);
        assert_eq!(rules[1].first, 31_104_000);
        assert_eq!(rules[1].action, Some(RuleAction::Thin(90)));
    }

    #[test]
    fn rejects_malformed_policies() {
        assert_eq!(parse_rules("  "), Err(RuleError::EmptyPolicy));
        assert!(matches!(parse_rules("1w/delete"), Err(RuleError::InvalidRule(_))));
        assert!(matches!(parse_rules("h/delete"), Err(RuleError::InvalidRule(_))));
        assert!(matches!(parse_rules("1h"), Err(RuleError::InvalidRule(_))));
        assert!(matches!(parse_rules("1h/"), Err(RuleError::InvalidRule(_))));
        assert!(matches!(parse_rules("0/1h,,1d/delete"), Err(RuleError::InvalidRule(_))));
        assert!(matches!(parse_rules("1h/0"), Err(RuleError::InvalidRule(_))));
        assert!(matches!(parse_rules("1h/keep"), Err(RuleError::InvalidRule(_))));
    }
}
