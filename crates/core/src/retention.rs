use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::rule::{parse_rules, RuleAction, RuleError, RuleKind};
use crate::vault::Vault;

/// Four days, so that the epoch-aligned buckets start on a Monday rather
/// than the Thursday of 1970-01-01.
const WEEKDAY_OFFSET_SECS: i64 = 4 * 86_400;

/// Computes the vaults a policy marks as obsolete.
///
/// `excluded` holds vault timestamps in milliseconds and is only honoured by
/// age-based policies; a count-based policy looks at nothing but its first
/// rule.
pub fn obsolete_vaults(
    vaults: &[Vault],
    policy: &str,
    excluded: &HashSet<i64>,
    now: DateTime<Utc>,
) -> Result<Vec<Vault>, RuleError> {
    let rules = parse_rules(policy)?;
    let Some(first) = rules.first() else {
        return Err(RuleError::EmptyPolicy);
    };

    if first.kind == RuleKind::Limit {
        let mut newest_first = dedup_by_timestamp(vaults.to_vec());
        newest_first.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let keep = usize::try_from(first.first).unwrap_or(usize::MAX);
        return Ok(newest_first.into_iter().skip(keep).collect());
    }

    let now_secs = now.timestamp();
    let mut obsolete = Vec::new();
    for rule in &rules {
        let cutoff = now_secs - rule.first;
        let candidates = vaults
            .iter()
            .filter(|vault| vault.timestamp / 1000 <= cutoff && !excluded.contains(&vault.timestamp));

        match rule.action {
            Some(RuleAction::Thin(width)) => {
                let mut buckets: BTreeMap<i64, Vec<&Vault>> = BTreeMap::new();
                for vault in candidates {
                    let key = (vault.timestamp / 1000 - WEEKDAY_OFFSET_SECS).div_euclid(width);
                    buckets.entry(key).or_default().push(vault);
                }
                for mut bucket in buckets.into_values() {
                    bucket.sort_by_key(|vault| vault.timestamp);
                    bucket.pop();
                    obsolete.extend(bucket.into_iter().cloned());
                }
            }
            Some(RuleAction::Delete) | None => obsolete.extend(candidates.cloned()),
        }
    }

    Ok(dedup_by_timestamp(obsolete))
}

fn dedup_by_timestamp(vaults: Vec<Vault>) -> Vec<Vault> {
    let mut seen = HashSet::new();
    vaults
        .into_iter()
        .filter(|vault| seen.insert(vault.timestamp))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Duration, TimeZone};

    use super::*;

    fn vault_at(ts: DateTime<Utc>) -> Vault {
        Vault {
            folder: PathBuf::from(format!("/storage/{}", ts.format("%Y%m%dT%H%M%S"))),
            timestamp: ts.timestamp_millis(),
            ..Vault::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap()
    }

    #[test]
    fn limit_keeps_newest_and_ignores_duplicates() {
        let base = now() - Duration::days(10);
        let mut vaults: Vec<Vault> = (0..6).map(|i| vault_at(base + Duration::days(i))).collect();
        vaults.push(vault_at(base));

        let obsolete = obsolete_vaults(&vaults, "4", &HashSet::new(), now()).unwrap();
        let days: Vec<i64> = obsolete
            .iter()
            .map(|v| (v.timestamp - base.timestamp_millis()) / 86_400_000)
            .collect();
        assert_eq!(days, vec![1, 0]);
    }

    #[test]
    fn limit_ignores_exclusions_and_later_rules() {
        let base = now() - Duration::days(10);
        let vaults: Vec<Vault> = (0..3).map(|i| vault_at(base + Duration::days(i))).collect();
        let excluded = HashSet::from([vaults[0].timestamp]);

        let obsolete = obsolete_vaults(&vaults, "2,1h/delete", &excluded, now()).unwrap();
        assert_eq!(obsolete, vec![vaults[0].clone()]);
    }

    #[test]
    fn delete_rule_removes_old_vaults_except_excluded() {
        let old = vault_at(now() - Duration::hours(30));
        let older = vault_at(now() - Duration::hours(50));
        let young = vault_at(now() - Duration::hours(2));
        let protected = vault_at(now() - Duration::hours(40));
        let vaults = vec![old.clone(), older.clone(), young, protected.clone()];
        let excluded = HashSet::from([protected.timestamp]);

        let obsolete = obsolete_vaults(&vaults, "24h/delete", &excluded, now()).unwrap();
        assert_eq!(obsolete, vec![old, older]);
    }

    #[test]
    fn bucket_rule_keeps_newest_per_bucket() {
        // Monday 2024-03-11, inside one weekly bucket.
        let monday = Utc.with_ymd_and_hms(2024, 3, 11, 1, 0, 0).unwrap();
        let a = vault_at(monday);
        let b = vault_at(monday + Duration::days(2));
        let c = vault_at(monday + Duration::days(5));
        let vaults = vec![c.clone(), a.clone(), b.clone()];

        let obsolete = obsolete_vaults(&vaults, "1d/7d", &HashSet::new(), now()).unwrap();
        assert_eq!(obsolete, vec![a, b]);
    }

    #[test]
    fn rules_accumulate_without_duplicates() {
        let vaults: Vec<Vault> = (1..=4)
            .map(|i| vault_at(now() - Duration::hours(i * 2)))
            .collect();

        let obsolete = obsolete_vaults(&vaults, "0/1d,1h/delete", &HashSet::new(), now()).unwrap();
        assert_eq!(obsolete.len(), 4);
    }

    #[test]
    fn malformed_policy_fails_evaluation() {
        let err = obsolete_vaults(&[], "1w/delete", &HashSet::new(), now()).unwrap_err();
        assert!(matches!(err, RuleError::InvalidRule(_)));
    }
}
