//! Backup chain resolution
//!
//! A chain starts at a full backup and follows `base_backup_id` links
//! forward to the backup being restored. An incremental's base is the
//! latest usable backup of any type; a differential's base is always the
//! latest usable full backup.

use super::metadata::{BackupMetadata, BackupType};
use crate::error::{Result, TenantForgeError};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Restore throughput assumed by recovery estimates
pub const RESTORE_BYTES_PER_SEC: u64 = 50 * 1024 * 1024;
/// Fixed cost per applied chain link
pub const PER_LINK_OVERHEAD: Duration = Duration::from_secs(5);

/// Base a new backup of `backup_type` builds on
pub fn select_base(backup_type: BackupType, existing: &[BackupMetadata]) -> Result<Option<&BackupMetadata>> {
    let usable = existing.iter().filter(|b| b.status.is_usable());
    let base = match backup_type {
        BackupType::Full => return Ok(None),
        BackupType::Incremental => usable.max_by_key(|b| b.captured_at()),
        BackupType::Differential => usable
            .filter(|b| b.backup_type == BackupType::Full)
            .max_by_key(|b| b.captured_at()),
    };
    match base {
        Some(base) => Ok(Some(base)),
        None => Err(TenantForgeError::InvalidInput(format!(
            "a {} backup needs a completed {} backup first",
            backup_type,
            if backup_type == BackupType::Differential { "full" } else { "base" }
        ))),
    }
}

/// Chain from the full backup to `target`, in apply order.
///
/// Every link must be usable and each link's base must have the type its
/// own type requires.
pub fn resolve_chain(target: &BackupMetadata, all: &[BackupMetadata]) -> Result<Vec<BackupMetadata>> {
    let by_id: HashMap<Uuid, &BackupMetadata> = all.iter().map(|b| (b.id, b)).collect();
    let mut chain = vec![target.clone()];
    let mut seen = HashSet::from([target.id]);
    let mut current = target;

    loop {
        if !current.status.is_usable() {
            return Err(TenantForgeError::restore_integrity(
                target.id,
                format!("backup {} in the chain is {}", current.id, current.status),
            ));
        }
        if current.module_name != target.module_name {
            return Err(TenantForgeError::restore_integrity(
                target.id,
                format!("backup {} belongs to module {}", current.id, current.module_name),
            ));
        }

        match (current.backup_type, current.base_backup_id) {
            (BackupType::Full, _) => break,
            (_, None) => {
                return Err(TenantForgeError::restore_integrity(
                    target.id,
                    format!("{} backup {} has no base", current.backup_type, current.id),
                ))
            }
            (kind, Some(base_id)) => {
                let base = by_id.get(&base_id).copied().ok_or_else(|| {
                    TenantForgeError::restore_integrity(target.id, format!("base backup {} is missing", base_id))
                })?;
                if kind == BackupType::Differential && base.backup_type != BackupType::Full {
                    return Err(TenantForgeError::restore_integrity(
                        target.id,
                        format!("differential backup {} is not based on a full backup", current.id),
                    ));
                }
                if !seen.insert(base.id) {
                    return Err(TenantForgeError::restore_integrity(
                        target.id,
                        "backup chain loops back on itself",
                    ));
                }
                chain.push(base.clone());
                current = base;
            }
        }
    }

    chain.reverse();
    Ok(chain)
}

/// Backups to delete: older than the cutoff and not needed by any
/// retained backup's chain
pub fn prune_candidates(all: &[BackupMetadata], retention_days: u32, now: DateTime<Utc>) -> Vec<Uuid> {
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));
    let by_id: HashMap<Uuid, &BackupMetadata> = all.iter().map(|b| (b.id, b)).collect();

    let mut retained: HashSet<Uuid> = all
        .iter()
        .filter(|b| b.started_at >= cutoff || b.completed_at.is_none())
        .map(|b| b.id)
        .collect();

    let mut pending: Vec<Uuid> = retained.iter().copied().collect();
    while let Some(id) = pending.pop() {
        let base = by_id.get(&id).and_then(|b| b.base_backup_id);
        if let Some(base) = base {
            if retained.insert(base) {
                pending.push(base);
            }
        }
    }

    let mut candidates: Vec<&BackupMetadata> = all.iter().filter(|b| !retained.contains(&b.id)).collect();
    candidates.sort_by_key(|b| b.started_at);
    candidates.into_iter().map(|b| b.id).collect()
}

/// Newest usable backup captured at or before `target_time`, with its chain
pub fn recovery_chain(all: &[BackupMetadata], target_time: DateTime<Utc>) -> Result<Vec<BackupMetadata>> {
    let mut candidates: Vec<&BackupMetadata> = all
        .iter()
        .filter(|b| b.status.is_usable() && b.captured_at() <= target_time)
        .collect();
    candidates.sort_by_key(|b| std::cmp::Reverse(b.captured_at()));

    let mut last_error = None;
    for candidate in candidates {
        match resolve_chain(candidate, all) {
            Ok(chain) => return Ok(chain),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        TenantForgeError::NotFound(format!("no usable backup at or before {}", target_time))
    }))
}

/// Estimated restore time for a chain
pub fn estimate_duration(total_bytes: u64, links: usize) -> Duration {
    let transfer = Duration::from_secs_f64(total_bytes as f64 / RESTORE_BYTES_PER_SEC as f64);
    transfer + PER_LINK_OVERHEAD * links as u32
}

/// Warning when the chain ends before the target time
pub fn data_loss_warning(chain: &[BackupMetadata], target_time: DateTime<Utc>) -> Option<String> {
    let last = chain.last()?.captured_at();
    (last < target_time).then(|| {
        format!(
            "latest backup was captured at {}; changes up to {} ({} minutes) are not covered",
            last.to_rfc3339(),
            target_time.to_rfc3339(),
            (target_time - last).num_minutes()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::metadata::BackupStatus;
    use chrono::Duration as ChronoDuration;

    fn backup(kind: BackupType, status: BackupStatus, hours_ago: i64, base: Option<Uuid>) -> BackupMetadata {
        let mut b = BackupMetadata::running("vendas", "module_vendas", kind, "x".into());
        b.status = status;
        b.started_at = Utc::now() - ChronoDuration::hours(hours_ago);
        b.completed_at = Some(b.started_at + ChronoDuration::minutes(1));
        b.base_backup_id = base;
        b
    }

    #[test]
    fn test_select_base() {
        let full = backup(BackupType::Full, BackupStatus::Verified, 10, None);
        let inc = backup(BackupType::Incremental, BackupStatus::Completed, 5, Some(full.id));
        let failed = backup(BackupType::Full, BackupStatus::Failed, 1, None);
        let all = vec![full.clone(), inc.clone(), failed];

        assert!(select_base(BackupType::Full, &all).unwrap().is_none());
        assert_eq!(select_base(BackupType::Incremental, &all).unwrap().unwrap().id, inc.id);
        assert_eq!(select_base(BackupType::Differential, &all).unwrap().unwrap().id, full.id);
        assert!(select_base(BackupType::Incremental, &[]).is_err());
    }

    #[test]
    fn test_resolve_chain_in_apply_order() {
        let full = backup(BackupType::Full, BackupStatus::Completed, 10, None);
        let inc1 = backup(BackupType::Incremental, BackupStatus::Completed, 8, Some(full.id));
        let inc2 = backup(BackupType::Incremental, BackupStatus::Verified, 6, Some(inc1.id));
        let all = vec![full.clone(), inc1.clone(), inc2.clone()];

        let ids: Vec<Uuid> = resolve_chain(&inc2, &all).unwrap().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![full.id, inc1.id, inc2.id]);
    }

    #[test]
    fn test_broken_base_is_integrity_error() {
        let full = backup(BackupType::Full, BackupStatus::Failed, 10, None);
        let inc = backup(BackupType::Incremental, BackupStatus::Completed, 8, Some(full.id));

        let err = resolve_chain(&inc, &[full, inc.clone()]).unwrap_err();
        assert!(matches!(err, TenantForgeError::RestoreIntegrity { .. }));

        let orphan = backup(BackupType::Incremental, BackupStatus::Completed, 2, Some(Uuid::new_v4()));
        assert!(matches!(
            resolve_chain(&orphan, &[orphan.clone()]),
            Err(TenantForgeError::RestoreIntegrity { .. })
        ));
    }

    #[test]
    fn test_differential_requires_full_base() {
        let full = backup(BackupType::Full, BackupStatus::Completed, 10, None);
        let inc = backup(BackupType::Incremental, BackupStatus::Completed, 8, Some(full.id));
        let diff = backup(BackupType::Differential, BackupStatus::Completed, 6, Some(inc.id));

        assert!(resolve_chain(&diff, &[full, inc, diff.clone()]).is_err());
    }

    #[test]
    fn test_prune_keeps_bases_of_retained() {
        let old_full = backup(BackupType::Full, BackupStatus::Completed, 24 * 40, None);
        let ancient_full = backup(BackupType::Full, BackupStatus::Completed, 24 * 50, None);
        let recent_inc = backup(BackupType::Incremental, BackupStatus::Completed, 24, Some(old_full.id));
        let all = vec![old_full.clone(), ancient_full.clone(), recent_inc];

        assert_eq!(prune_candidates(&all, 30, Utc::now()), vec![ancient_full.id]);
    }

    #[test]
    fn test_recovery_chain_and_warning() {
        let full = backup(BackupType::Full, BackupStatus::Completed, 10, None);
        let inc = backup(BackupType::Incremental, BackupStatus::Completed, 4, Some(full.id));
        let all = vec![full.clone(), inc.clone()];

        let target = Utc::now() - ChronoDuration::hours(6);
        let chain = recovery_chain(&all, target).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, full.id);
        assert!(data_loss_warning(&chain, target).is_some());

        let chain = recovery_chain(&all, Utc::now()).unwrap();
        assert_eq!(chain.len(), 2);

        assert!(recovery_chain(&all, Utc::now() - ChronoDuration::hours(20)).is_err());
    }

    #[test]
    fn test_estimate_duration() {
        let estimate = estimate_duration(100 * 1024 * 1024, 2);
        assert_eq!(estimate, Duration::from_secs(12));
    }
}
