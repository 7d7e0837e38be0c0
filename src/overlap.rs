//! Cross-package file overlap tracking.
//!
//! Two packages overlap when they install a file at the same destination path
//! (compared case-insensitively). The later install preserves the earlier
//! one's file in its backup, so uninstalling the earlier package while the
//! later one is still installed cannot bring back the pre-install state.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::backup::ModBackup;
use crate::warning::ReconciliationWarning;

/// Installed packages whose files `new` writes over.
pub fn compute_overlaps(new: &ModBackup, existing: &[ModBackup]) -> BTreeSet<u64> {
    let touched: HashSet<String> = new.file_lookup_paths().collect();
    if touched.is_empty() {
        return BTreeSet::new();
    }
    existing
        .iter()
        .filter(|b| b.valid && b.owner_hash != new.owner_hash)
        .filter(|b| b.file_lookup_paths().any(|p| touched.contains(&p)))
        .map(|b| b.owner_hash)
        .collect()
}

/// Current owner of each installed file: the most recent install wins.
pub fn path_owners(backups: &[ModBackup]) -> HashMap<String, u64> {
    let mut ordered: Vec<&ModBackup> = backups.iter().filter(|b| b.valid).collect();
    ordered.sort_by_key(|b| b.serial);

    let mut owners = HashMap::new();
    for backup in ordered {
        for path in backup.file_lookup_paths() {
            owners.insert(path, backup.owner_hash);
        }
    }
    owners
}

/// Installed packages that list `target` as overlapped.
pub fn overlapped_by(target: u64, backups: &[ModBackup]) -> Vec<u64> {
    backups
        .iter()
        .filter(|b| b.owner_hash != target && b.overlaps(target))
        .map(|b| b.owner_hash)
        .collect()
}

/// Warnings to raise before uninstalling `target`.
pub fn uninstall_warnings(target: u64, backups: &[ModBackup]) -> Vec<ReconciliationWarning> {
    let by = overlapped_by(target, backups);
    if by.is_empty() {
        Vec::new()
    } else {
        vec![ReconciliationWarning::OverlapOnUninstall {
            package: target,
            overlapped_by: by,
        }]
    }
}
