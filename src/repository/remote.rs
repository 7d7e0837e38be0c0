//! Remote package list and its reconciliation against local packages.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Serialize, Serializer};
use tracing::debug;

use super::Repository;
use crate::identity::PackageIdentity;
use crate::warning::ReconciliationWarning;

/// Combinable state flags of a remote package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RemoteState(u8);

impl RemoteState {
    pub const NONE: Self = Self(0);
    /// No local package has this identity.
    pub const NEW: Self = Self(1);
    /// Newer than a local package of the same name.
    pub const UPGRADE: Self = Self(1 << 1);
    /// Older than a local package of the same name.
    pub const OLD: Self = Self(1 << 2);
    /// At least one dependency cannot be resolved.
    pub const DEPENDENCY_MISSING: Self = Self(1 << 3);
    pub const DOWNLOADING: Self = Self(1 << 4);
    pub const ERROR: Self = Self(1 << 5);

    /// Flags recomputed by every reconciliation.
    const CLASSIFICATION: Self = Self(Self::NEW.0 | Self::UPGRADE.0 | Self::OLD.0 | Self::DEPENDENCY_MISSING.0);

    const LABELS: [(Self, &'static str); 6] = [
        (Self::NEW, "new"),
        (Self::UPGRADE, "upgrade"),
        (Self::OLD, "old"),
        (Self::DEPENDENCY_MISSING, "dependency_missing"),
        (Self::DOWNLOADING, "downloading"),
        (Self::ERROR, "error"),
    ];

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn labels(self) -> Vec<&'static str> {
        Self::LABELS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, label)| *label)
            .collect()
    }
}

impl BitOr for RemoteState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RemoteState {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels = self.labels();
        if labels.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", labels.join(","))
        }
    }
}

impl Serialize for RemoteState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.labels())
    }
}

/// A package offered by a repository.
#[derive(Debug, Clone, Serialize)]
pub struct RemotePackage {
    pub identity: PackageIdentity,
    /// UUID of the repository the entry came from.
    pub repository: String,
    pub file: String,
    /// Candidate download URLs, tried in order.
    pub download_urls: Vec<String>,
    pub checksum: String,
    pub size_bytes: u64,
    pub dependencies: Vec<String>,
    pub missing_dependencies: Vec<String>,
    /// Local packages this entry would upgrade.
    #[serde(skip)]
    pub upgrade_targets: Vec<u64>,
    /// Local packages newer than this entry.
    #[serde(skip)]
    pub superseded_by: Vec<u64>,
    #[serde(skip)]
    pub thumbnail: Option<Vec<u8>>,
    pub description: Option<String>,
    pub state: RemoteState,
}

/// Merge the parsed entries of `repositories` into `into`.
///
/// Entries are keyed by identity string. The first repository to list an
/// identity owns the entry; later repositories listing the same identity
/// only add their download URL as a fallback. Returns the number of new
/// entries plus the number of entries that gained a URL, so merging the
/// same repositories again returns 0.
pub fn merge(repositories: &[Repository], into: &mut Vec<RemotePackage>, underscore_to_space: bool) -> usize {
    let mut index: HashMap<String, usize> = into
        .iter()
        .enumerate()
        .map(|(i, r)| (r.identity.ident.clone(), i))
        .collect();
    let mut changed = 0;

    for repo in repositories {
        for descriptor in repo.remotes() {
            let url = repo.download_url(descriptor);
            match index.get(&descriptor.ident) {
                Some(&i) => {
                    let existing = &mut into[i];
                    if !existing.download_urls.contains(&url) {
                        debug!("Adding fallback URL for {}: {}", descriptor.ident, url);
                        existing.download_urls.push(url);
                        changed += 1;
                    }
                }
                None => {
                    index.insert(descriptor.ident.clone(), into.len());
                    into.push(RemotePackage {
                        identity: PackageIdentity::from_ident(&descriptor.ident, underscore_to_space),
                        repository: repo.uuid.clone(),
                        file: descriptor.file.clone(),
                        download_urls: vec![url],
                        checksum: descriptor.checksum.clone(),
                        size_bytes: descriptor.bytes,
                        dependencies: descriptor.dependencies.clone(),
                        missing_dependencies: Vec::new(),
                        upgrade_targets: Vec::new(),
                        superseded_by: Vec::new(),
                        thumbnail: descriptor.thumbnail.clone(),
                        description: descriptor.description.clone(),
                        state: RemoteState::NONE,
                    });
                    changed += 1;
                }
            }
        }
    }
    changed
}

/// Result of a dependency walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyResolution {
    /// Unresolved identities, in discovery order.
    pub missing: Vec<String>,
    /// Number of distinct identities visited, the root included.
    pub visited: usize,
}

/// Walk the dependency graph of `root`.
///
/// A dependency found locally is a leaf. A dependency found only among
/// remote entries is followed further. Each identity is visited once, so
/// cycles terminate.
pub fn resolve_dependencies(
    root: &RemotePackage,
    remotes: &HashMap<&str, &RemotePackage>,
    local_idents: &HashSet<&str>,
) -> DependencyResolution {
    let mut visited: HashSet<&str> = HashSet::new();
    visited.insert(root.identity.ident.as_str());
    let mut missing = Vec::new();
    let mut stack: Vec<&str> = root.dependencies.iter().rev().map(String::as_str).collect();

    while let Some(dep) = stack.pop() {
        if !visited.insert(dep) {
            continue;
        }
        if local_idents.contains(dep) {
            continue;
        }
        match remotes.get(dep) {
            Some(remote) => {
                for next in remote.dependencies.iter().rev() {
                    if !visited.contains(next.as_str()) {
                        stack.push(next);
                    }
                }
            }
            None => missing.push(dep.to_string()),
        }
    }

    DependencyResolution {
        missing,
        visited: visited.len(),
    }
}

/// Recompute the classification flags of every remote entry against the
/// local package identities. `DOWNLOADING` and `ERROR` are left untouched.
pub fn classify(remotes: &mut [RemotePackage], local: &[PackageIdentity]) {
    let local_hashes: HashSet<u64> = local.iter().map(|l| l.hash).collect();
    let local_idents: HashSet<&str> = local.iter().map(|l| l.ident.as_str()).collect();

    let resolutions: Vec<Vec<String>> = {
        let by_ident: HashMap<&str, &RemotePackage> = remotes
            .iter()
            .map(|r| (r.identity.ident.as_str(), r))
            .collect();
        remotes
            .iter()
            .map(|r| resolve_dependencies(r, &by_ident, &local_idents).missing)
            .collect()
    };

    for (remote, missing) in remotes.iter_mut().zip(resolutions) {
        remote.state.remove(RemoteState::CLASSIFICATION);
        remote.upgrade_targets.clear();
        remote.superseded_by.clear();

        if !local_hashes.contains(&remote.identity.hash) {
            remote.state.insert(RemoteState::NEW);
        }

        let mut seen = HashSet::new();
        for candidate in local.iter().filter(|l| l.hash != remote.identity.hash) {
            if !remote.identity.same_core(candidate) || !seen.insert(candidate.hash) {
                continue;
            }
            // An unversioned package sorts below any versioned one.
            match remote.identity.version.cmp(&candidate.version) {
                std::cmp::Ordering::Greater => remote.upgrade_targets.push(candidate.hash),
                std::cmp::Ordering::Less => remote.superseded_by.push(candidate.hash),
                std::cmp::Ordering::Equal => {}
            }
        }
        if !remote.upgrade_targets.is_empty() {
            remote.state.insert(RemoteState::UPGRADE);
        }
        if !remote.superseded_by.is_empty() {
            remote.state.insert(RemoteState::OLD);
        }

        if !missing.is_empty() {
            remote.state.insert(RemoteState::DEPENDENCY_MISSING);
        }
        remote.missing_dependencies = missing;
    }
}

/// One warning per remote entry with unresolved dependencies.
pub fn dependency_warnings(remotes: &[RemotePackage]) -> Vec<ReconciliationWarning> {
    remotes
        .iter()
        .filter(|r| !r.missing_dependencies.is_empty())
        .map(|r| ReconciliationWarning::DependencyMissing {
            ident: r.identity.ident.clone(),
            missing: r.missing_dependencies.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::tests::{definition, BASE};
    use super::super::DEFAULT_SUFFIX;
    use super::*;

    fn repo(base: &str, down: &str, remotes: &[(&str, &str, &str)]) -> Repository {
        let mut repo = Repository::new(base, DEFAULT_SUFFIX).unwrap();
        repo.parse_definition(&definition(down, remotes), None).unwrap();
        repo
    }

    fn local(ident: &str) -> PackageIdentity {
        PackageIdentity::from_ident(ident, true)
    }

    fn find<'a>(remotes: &'a [RemotePackage], ident: &str) -> &'a RemotePackage {
        remotes.iter().find(|r| r.identity.ident == ident).unwrap()
    }

    #[test]
    fn test_state_flags() {
        let mut state = RemoteState::NEW | RemoteState::UPGRADE;
        assert!(state.contains(RemoteState::NEW));
        assert!(!state.contains(RemoteState::OLD));
        state.remove(RemoteState::NEW);
        state |= RemoteState::ERROR;
        assert_eq!(state.labels(), vec!["upgrade", "error"]);
        assert_eq!(state.to_string(), "upgrade,error");
        assert_eq!(state.bits(), RemoteState::UPGRADE.bits() | RemoteState::ERROR.bits());
        assert_eq!(RemoteState::NONE.to_string(), "-");
        assert_eq!(serde_json::to_string(&state).unwrap(), r#"["upgrade","error"]"#);
    }

    #[test]
    fn test_merge_deduplicates_and_keeps_fallback_urls() {
        let first = repo(BASE, "files", &[("A_v1", "A_v1.zip", "")]);
        let second = repo(
            "https://mirror.example.org/m",
            "dl",
            &[("A_v1", "A_v1.zip", ""), ("B_v2", "B_v2.zip", "")],
        );
        let mut remotes = Vec::new();
        let repos = [first, second];
        assert_eq!(merge(&repos, &mut remotes, true), 3);
        assert_eq!(remotes.len(), 2);
        assert_eq!(merge(&repos, &mut remotes, true), 0);
        let a = find(&remotes, "A_v1");
        assert_eq!(
            a.download_urls,
            vec![
                "https://mods.example.com/repo/files/A_v1.zip",
                "https://mirror.example.org/m/dl/A_v1.zip",
            ]
        );
        assert_eq!(a.size_bytes, 10);
    }

    #[test]
    fn test_classify_new_upgrade_old() {
        let source = repo(
            BASE,
            "files",
            &[
                ("Better_Trees_v1.3", "Better_Trees_v1.3.zip", ""),
                ("Cool_Hats_v1", "Cool_Hats_v1.zip", ""),
                ("Velvet_v2", "Velvet_v2.zip", ""),
            ],
        );
        let mut remotes = Vec::new();
        merge(&[source], &mut remotes, true);
        let locals = vec![local("Better_Trees_v1.2"), local("Cool_Hats_v2"), local("Velvet_v2")];
        classify(&mut remotes, &locals);

        let trees = find(&remotes, "Better_Trees_v1.3");
        assert!(trees.state.contains(RemoteState::NEW));
        assert!(trees.state.contains(RemoteState::UPGRADE));
        assert_eq!(trees.upgrade_targets, vec![locals[0].hash]);

        let hats = find(&remotes, "Cool_Hats_v1");
        assert!(hats.state.contains(RemoteState::OLD));
        assert!(!hats.state.contains(RemoteState::UPGRADE));

        let velvet = find(&remotes, "Velvet_v2");
        assert!(velvet.state.is_empty());
    }

    #[test]
    fn test_classify_preserves_transfer_flags() {
        let source = repo(BASE, "files", &[("A_v1", "A_v1.zip", "")]);
        let mut remotes = Vec::new();
        merge(&[source], &mut remotes, true);
        remotes[0].state.insert(RemoteState::DOWNLOADING | RemoteState::OLD);
        classify(&mut remotes, &[local("A_v1")]);
        assert_eq!(remotes[0].state, RemoteState::DOWNLOADING);
    }

    #[test]
    fn test_dependencies_resolve_transitively_and_handle_cycles() {
        let source = repo(
            BASE,
            "files",
            &[
                ("App_v1", "App_v1.zip", "Lib_v1"),
                ("Lib_v1", "Lib_v1.zip", "Core_v1,Ghost_v1"),
                ("Core_v1", "Core_v1.zip", "Lib_v1"),
                ("Solo_v1", "Solo_v1.zip", "Installed_v3"),
            ],
        );
        let mut remotes = Vec::new();
        merge(&[source], &mut remotes, true);
        classify(&mut remotes, &[local("Installed_v3")]);

        let app = find(&remotes, "App_v1");
        assert!(app.state.contains(RemoteState::DEPENDENCY_MISSING));
        assert_eq!(app.missing_dependencies, vec!["Ghost_v1"]);
        assert!(find(&remotes, "Core_v1").state.contains(RemoteState::DEPENDENCY_MISSING));
        assert!(!find(&remotes, "Solo_v1").state.contains(RemoteState::DEPENDENCY_MISSING));

        let by_ident: HashMap<&str, &RemotePackage> =
            remotes.iter().map(|r| (r.identity.ident.as_str(), r)).collect();
        let resolution = resolve_dependencies(app, &by_ident, &HashSet::new());
        assert_eq!(resolution.visited, 4);

        let warnings = dependency_warnings(&remotes);
        assert_eq!(warnings.len(), 3);
    }

    #[test]
    fn test_clean_cycle_has_no_missing_dependencies() {
        let source = repo(
            BASE,
            "files",
            &[
                ("A_v1", "A_v1.zip", "B_v1"),
                ("B_v1", "B_v1.zip", "C_v1"),
                ("C_v1", "C_v1.zip", "A_v1"),
            ],
        );
        let mut remotes = Vec::new();
        merge(&[source], &mut remotes, true);
        classify(&mut remotes, &[]);

        for remote in &remotes {
            assert!(
                !remote.state.contains(RemoteState::DEPENDENCY_MISSING),
                "{}",
                remote.identity.ident
            );
            assert!(remote.missing_dependencies.is_empty());
        }
        assert!(dependency_warnings(&remotes).is_empty());

        let by_ident: HashMap<&str, &RemotePackage> =
            remotes.iter().map(|r| (r.identity.ident.as_str(), r)).collect();
        for remote in &remotes {
            let resolution = resolve_dependencies(remote, &by_ident, &HashSet::new());
            assert!(resolution.missing.is_empty());
            assert_eq!(resolution.visited, 3);
        }
    }
}
