//! Non-fatal conditions surfaced to the caller alongside a result.

use std::fmt;

use serde::Serialize;

use crate::hash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconciliationWarning {
    /// Uninstalling `package` while later installs overwrote its files.
    /// Their content stays in place after the uninstall.
    OverlapOnUninstall { package: u64, overlapped_by: Vec<u64> },

    /// A remote package names dependencies found neither in any repository
    /// nor locally.
    DependencyMissing { ident: String, missing: Vec<String> },
}

impl fmt::Display for ReconciliationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciliationWarning::OverlapOnUninstall {
                package,
                overlapped_by,
            } => {
                let by: Vec<String> = overlapped_by.iter().map(|h| hash::hash_to_hex(*h)).collect();
                write!(
                    f,
                    "package {} is overlapped by {}",
                    hash::hash_to_hex(*package),
                    by.join(", ")
                )
            }
            ReconciliationWarning::DependencyMissing { ident, missing } => {
                write!(f, "{} has missing dependencies: {}", ident, missing.join(", "))
            }
        }
    }
}
