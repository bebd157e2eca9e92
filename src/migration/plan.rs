//! Registration reconciliation and dependency ordering

use super::discovery::{compare_versions, Migration, MigrationStatus};
use crate::error::{Result, TenantForgeError};
use std::collections::{HashMap, HashSet};

/// What registration does with an incoming migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// Not registered yet
    Insert,
    /// Same checksum as the recorded one
    Unchanged,
    /// Content changed before it was applied; replace and reset to pending
    Replace,
}

/// Compare an incoming migration with the recorded `(checksum, status)`
pub fn reconcile(recorded: Option<(&str, MigrationStatus)>, incoming: &Migration) -> Result<Reconcile> {
    match recorded {
        None => Ok(Reconcile::Insert),
        Some((checksum, _)) if checksum == incoming.checksum => Ok(Reconcile::Unchanged),
        Some((checksum, MigrationStatus::Applied)) => Err(TenantForgeError::MigrationChecksumMismatch {
            module: incoming.module_name.clone(),
            version: incoming.version.clone(),
            recorded: checksum.to_string(),
            found: incoming.checksum.clone(),
        }),
        Some(_) => Ok(Reconcile::Replace),
    }
}

/// Order `pending` so every migration follows its dependencies.
///
/// Dependencies already in `applied` are satisfied. Among migrations whose
/// dependencies are met, the lowest version goes first. A dependency that is
/// neither applied nor pending fails the plan; leftover migrations after the
/// sort form a cycle.
pub fn order(module: &str, pending: Vec<Migration>, applied: &HashSet<String>) -> Result<Vec<Migration>> {
    let batch: HashSet<&str> = pending.iter().map(|m| m.version.as_str()).collect();

    let mut blocked_by: HashMap<String, usize> = HashMap::new();
    let mut unlocks: HashMap<String, Vec<String>> = HashMap::new();
    for migration in &pending {
        let mut waiting = 0;
        for dependency in &migration.dependencies {
            if batch.contains(dependency.as_str()) {
                waiting += 1;
                unlocks
                    .entry(dependency.clone())
                    .or_default()
                    .push(migration.version.clone());
            } else if !applied.contains(dependency) {
                return Err(TenantForgeError::migration(
                    module,
                    &migration.version,
                    format!("missing dependency {}", dependency),
                ));
            }
        }
        blocked_by.insert(migration.version.clone(), waiting);
    }

    let mut by_version: HashMap<String, Migration> = pending
        .into_iter()
        .map(|m| (m.version.clone(), m))
        .collect();
    let mut ready: Vec<String> = blocked_by
        .iter()
        .filter(|(_, waiting)| **waiting == 0)
        .map(|(version, _)| version.clone())
        .collect();
    let mut ordered = Vec::with_capacity(by_version.len());

    while !ready.is_empty() {
        ready.sort_by(|a, b| compare_versions(b, a));
        let Some(version) = ready.pop() else { break };

        for next in unlocks.remove(&version).unwrap_or_default() {
            if let Some(waiting) = blocked_by.get_mut(&next) {
                *waiting -= 1;
                if *waiting == 0 {
                    ready.push(next);
                }
            }
        }
        if let Some(migration) = by_version.remove(&version) {
            ordered.push(migration);
        }
    }

    if !by_version.is_empty() {
        let mut versions: Vec<String> = by_version.into_keys().collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        return Err(TenantForgeError::MigrationDependencyCycle {
            module: module.to_string(),
            versions,
        });
    }
    Ok(ordered)
}

/// Reject a batch whose declared dependencies form a cycle.
///
/// Dependencies outside the batch are ignored here; `order` checks them
/// against the applied set at run time.
pub fn detect_cycle(module: &str, batch: &[Migration]) -> Result<()> {
    let versions: HashSet<String> = batch.iter().map(|m| m.version.clone()).collect();
    let local: Vec<Migration> = batch
        .iter()
        .cloned()
        .map(|mut m| {
            m.dependencies.retain(|d| versions.contains(d));
            m
        })
        .collect();
    order(module, local, &HashSet::new()).map(|_| ())
}

/// Split pending migrations at a target version (inclusive)
pub fn split_at_target(pending: Vec<Migration>, target: Option<&str>) -> (Vec<Migration>, Vec<Migration>) {
    match target {
        None => (pending, Vec::new()),
        Some(target) => pending
            .into_iter()
            .partition(|m| compare_versions(&m.version, target) != std::cmp::Ordering::Greater),
    }
}
