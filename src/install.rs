//! Install and uninstall of packages into a destination tree.
//!
//! Install walks the package entries parent-first. Before a file is written
//! over an existing one, the original is copied into the backup folder. Each
//! touched entry is appended to the install record, so an interrupted install
//! still leaves a record that can be uninstalled. Uninstall replays the
//! record in reverse.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::backup::{ModBackup, ModEntry};
use crate::overlap;
use crate::package::{EntryReader, Package, SourceEntry};
use crate::paths;

/// Install and uninstall errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallError {
    #[error("Package source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("Destination not writable: {0}")]
    DestinationUnwritable(String),

    #[error("Stopped after {completed} of {total} entries: {reason}")]
    PartialFailure {
        completed: usize,
        total: usize,
        reason: String,
    },

    #[error("Backup data is corrupt: {0}")]
    BackupCorrupt(String),

    #[error("Package {0} is already installed")]
    AlreadyInstalled(String),

    #[error("Unknown package: {0}")]
    UnknownPackage(String),
}

/// Per-package install state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackageState {
    #[default]
    NotInstalled,
    Installing,
    Installed,
    InstallFailed,
    Uninstalling,
    UninstallFailed,
}

/// A failed install. `partial` is the saved record of everything that was
/// written before the failure; uninstalling it reverts those changes.
#[derive(Debug)]
pub struct InstallFailure {
    pub error: InstallError,
    pub partial: Option<ModBackup>,
}

impl InstallFailure {
    fn early(error: InstallError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

/// Counters from an uninstall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UninstallReport {
    pub restored: usize,
    pub deleted: usize,
    /// Directories left in place because they still had content.
    pub kept_dirs: usize,
}

/// Progress callback: `(entries_done, entries_total)`.
pub type Progress<'a> = Option<&'a dyn Fn(usize, usize)>;

/// Installs packages into one destination and keeps their records in one
/// backup root.
#[derive(Debug)]
pub struct InstallEngine {
    destination: PathBuf,
    backup_root: PathBuf,
    states: HashMap<u64, PackageState>,
}

impl InstallEngine {
    pub fn new(destination: &Path, backup_root: &Path) -> Self {
        Self {
            destination: destination.to_path_buf(),
            backup_root: backup_root.to_path_buf(),
            states: HashMap::new(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn state(&self, hash: u64) -> PackageState {
        self.states.get(&hash).copied().unwrap_or_default()
    }

    /// Mark every valid record as installed.
    pub fn sync_states(&mut self, backups: &[ModBackup]) {
        self.states.retain(|_, s| *s != PackageState::Installed);
        for backup in backups.iter().filter(|b| b.valid) {
            self.states.insert(backup.owner_hash, PackageState::Installed);
        }
    }

    fn set_state(&mut self, hash: u64, state: PackageState) {
        if state == PackageState::NotInstalled {
            self.states.remove(&hash);
        } else {
            self.states.insert(hash, state);
        }
    }

    /// Install `package`. `existing` are the current install records, used
    /// for the already-installed check and overlap detection.
    pub fn install(
        &mut self,
        package: &Package,
        existing: &[ModBackup],
        progress: Progress<'_>,
    ) -> Result<ModBackup, InstallFailure> {
        let hash = package.identity.hash;
        let ident = &package.identity.ident;

        if existing.iter().any(|b| b.owner_hash == hash) {
            return Err(InstallFailure::early(InstallError::AlreadyInstalled(ident.clone())));
        }
        let backup_dir = ModBackup::dir_for(&self.backup_root, hash);
        if backup_dir.exists() {
            return Err(InstallFailure::early(InstallError::AlreadyInstalled(format!(
                "{} (stale backup folder {})",
                ident,
                backup_dir.display()
            ))));
        }
        if !self.destination.is_dir() {
            return Err(InstallFailure::early(InstallError::DestinationUnwritable(format!(
                "{} is not a directory",
                self.destination.display()
            ))));
        }
        let mut reader = package.open().map_err(InstallFailure::early)?;

        let serial = existing.iter().map(|b| b.serial).max().unwrap_or(0) + 1;
        let mut backup = ModBackup::new(hash, ident, &package.path, &self.backup_root, serial);
        if let Err(e) = fs::create_dir_all(&backup.dir) {
            return Err(InstallFailure::early(InstallError::DestinationUnwritable(format!(
                "{}: {}",
                backup.dir.display(),
                e
            ))));
        }

        info!("Installing {} ({} entries)", package.identity, package.entries().len());
        self.set_state(hash, PackageState::Installing);

        let total = package.entries().len();
        for (done, entry) in package.entries().iter().enumerate() {
            if let Err(e) = self.install_entry(&mut reader, entry, &mut backup) {
                warn!("Install of {} failed at '{}': {:#}", ident, entry.relative_path, e);
                self.set_state(hash, PackageState::InstallFailed);
                return Err(self.partial_failure(backup, existing, done, total, format!("{:#}", e)));
            }
            if let Some(report) = progress {
                report(done + 1, total);
            }
        }

        backup.set_overlaps(overlap::compute_overlaps(&backup, existing));
        if let Err(e) = backup.save() {
            self.set_state(hash, PackageState::InstallFailed);
            return Err(InstallFailure {
                error: InstallError::PartialFailure {
                    completed: total,
                    total,
                    reason: e.to_string(),
                },
                partial: Some(backup),
            });
        }

        if !backup.overlapped.is_empty() {
            info!("{} overlaps {} installed package(s)", ident, backup.overlapped.len());
        }
        self.set_state(hash, PackageState::Installed);
        Ok(backup)
    }

    fn partial_failure(
        &self,
        mut backup: ModBackup,
        existing: &[ModBackup],
        completed: usize,
        total: usize,
        reason: String,
    ) -> InstallFailure {
        backup.set_overlaps(overlap::compute_overlaps(&backup, existing));
        if let Err(e) = backup.save() {
            warn!("Failed to save partial install record: {}", e);
        }
        InstallFailure {
            error: InstallError::PartialFailure {
                completed,
                total,
                reason,
            },
            partial: Some(backup),
        }
    }

    fn install_entry(&self, reader: &mut EntryReader, entry: &SourceEntry, backup: &mut ModBackup) -> Result<()> {
        let dest = paths::join_relative(&self.destination, &entry.relative_path);
        let existing = match fs::symlink_metadata(&dest) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).with_context(|| format!("Failed to inspect {}", dest.display())),
        };

        if entry.is_dir {
            match existing {
                Some(meta) if meta.is_dir() => {
                    backup.push_entry(record(entry, false));
                }
                Some(_) => bail!("A file exists where directory '{}' is expected", entry.relative_path),
                None => {
                    fs::create_dir_all(&dest)
                        .with_context(|| format!("Failed to create {}", dest.display()))?;
                    backup.push_entry(record(entry, true));
                }
            }
            return Ok(());
        }

        match existing {
            Some(meta) if meta.is_dir() => {
                bail!("A directory exists where file '{}' is expected", entry.relative_path)
            }
            Some(_) => {
                let saved = backup.data_path(&entry.relative_path);
                paths::ensure_parent_dirs(&saved)?;
                fs::copy(&dest, &saved)
                    .with_context(|| format!("Failed to preserve {}", dest.display()))?;
                backup.push_entry(record(entry, false));
            }
            None => backup.push_entry(record(entry, true)),
        }

        let written = reader
            .extract(entry, &dest)
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        debug!("Wrote {} ({} bytes)", entry.relative_path, written);
        Ok(())
    }

    /// Revert an install record and delete its backup folder.
    ///
    /// Entries are processed in reverse install order. Missing files are not
    /// an error; directories that still have content are kept. If any entry
    /// fails, the backup folder is kept so the uninstall can be retried.
    pub fn uninstall(&mut self, backup: &ModBackup, progress: Progress<'_>) -> Result<UninstallReport, InstallError> {
        let hash = backup.owner_hash;
        if !backup.valid {
            self.set_state(hash, PackageState::UninstallFailed);
            return Err(InstallError::BackupCorrupt(
                backup.error.clone().unwrap_or_else(|| "unreadable record".to_string()),
            ));
        }

        info!("Uninstalling {} ({} entries)", backup.ident, backup.entries.len());
        self.set_state(hash, PackageState::Uninstalling);

        let total = backup.entries.len();
        let mut report = UninstallReport::default();
        let mut failures: Vec<String> = Vec::new();

        for (done, entry) in backup.entries.iter().rev().enumerate() {
            if let Err(e) = self.uninstall_entry(entry, backup, &mut report) {
                warn!("Failed to revert '{}': {:#}", entry.relative_path, e);
                failures.push(format!("{}: {:#}", entry.relative_path, e));
            }
            if let Some(cb) = progress {
                cb(done + 1, total);
            }
        }

        if let Some(first) = failures.first() {
            self.set_state(hash, PackageState::UninstallFailed);
            return Err(InstallError::PartialFailure {
                completed: total - failures.len(),
                total,
                reason: first.clone(),
            });
        }

        if let Err(e) = backup.discard() {
            warn!("Failed to remove backup folder {}: {}", backup.dir.display(), e);
        }
        self.set_state(hash, PackageState::NotInstalled);
        Ok(report)
    }

    fn uninstall_entry(&self, entry: &ModEntry, backup: &ModBackup, report: &mut UninstallReport) -> Result<()> {
        let dest = paths::join_relative(&self.destination, &entry.relative_path);

        match (entry.is_dir, entry.marked_for_deletion) {
            (true, true) => match fs::remove_dir(&dest) {
                Ok(()) => report.deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(_) => {
                    debug!("Keeping non-empty directory {}", dest.display());
                    report.kept_dirs += 1;
                }
            },
            (true, false) => {}
            (false, true) => match fs::remove_file(&dest) {
                Ok(()) => report.deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to delete {}", dest.display())),
            },
            (false, false) => {
                let saved = backup.data_path(&entry.relative_path);
                if !saved.is_file() {
                    bail!("Preserved original is missing: {}", saved.display());
                }
                paths::ensure_parent_dirs(&dest)?;
                fs::copy(&saved, &dest)
                    .with_context(|| format!("Failed to restore {}", dest.display()))?;
                report.restored += 1;
            }
        }
        Ok(())
    }
}

fn record(entry: &SourceEntry, marked_for_deletion: bool) -> ModEntry {
    ModEntry {
        archive_index: entry.archive_index,
        is_dir: entry.is_dir,
        marked_for_deletion,
        relative_path: entry.relative_path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::tests::write_zip;
    use std::cell::Cell;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        library: PathBuf,
        destination: PathBuf,
        backups: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let library = dir.path().join("library");
        let destination = dir.path().join("game");
        let backups = dir.path().join("backup");
        for p in [&library, &destination, &backups] {
            fs::create_dir_all(p).unwrap();
        }
        Fixture {
            _dir: dir,
            library,
            destination,
            backups,
        }
    }

    fn make_package(fx: &Fixture, name: &str, items: &[(&str, Option<&[u8]>)]) -> Package {
        let path = fx.library.join(name);
        write_zip(&path, items);
        Package::scan(&path, true).unwrap()
    }

    #[test]
    fn test_install_then_uninstall_restores_tree() {
        let fx = fixture();
        fs::create_dir_all(fx.destination.join("Data")).unwrap();
        fs::write(fx.destination.join("Data/skyrim.esm"), b"original").unwrap();

        let package = make_package(
            &fx,
            "Hats_v1.zip",
            &[
                ("Data/skyrim.esm", Some(b"patched")),
                ("Data/Meshes/hat.nif", Some(b"mesh")),
            ],
        );
        let mut engine = InstallEngine::new(&fx.destination, &fx.backups);

        let calls = Cell::new(0);
        let on_progress = |done: usize, total: usize| {
            assert!(done <= total);
            calls.set(calls.get() + 1);
        };
        let backup = engine.install(&package, &[], Some(&on_progress)).unwrap();
        assert_eq!(calls.get(), package.entries().len());
        assert_eq!(engine.state(package.identity.hash), PackageState::Installed);
        assert_eq!(fs::read(fx.destination.join("Data/skyrim.esm")).unwrap(), b"patched");
        assert!(backup.definition_path().exists());
        assert_eq!(fs::read(backup.data_path("Data/skyrim.esm")).unwrap(), b"original");

        let esm = backup
            .entries
            .iter()
            .find(|e| e.relative_path == "Data/skyrim.esm")
            .unwrap();
        assert!(!esm.marked_for_deletion);
        let data = backup.entries.iter().find(|e| e.relative_path == "Data").unwrap();
        assert!(!data.marked_for_deletion);

        let report = engine.uninstall(&backup, None).unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(fs::read(fx.destination.join("Data/skyrim.esm")).unwrap(), b"original");
        assert!(!fx.destination.join("Data/Meshes").exists());
        assert!(fx.destination.join("Data").is_dir());
        assert!(!backup.dir.exists());
        assert_eq!(engine.state(package.identity.hash), PackageState::NotInstalled);
    }

    #[test]
    fn test_install_twice_is_refused() {
        let fx = fixture();
        let package = make_package(&fx, "Mod.zip", &[("a.txt", Some(b"a"))]);
        let mut engine = InstallEngine::new(&fx.destination, &fx.backups);
        let backup = engine.install(&package, &[], None).unwrap();

        let failure = engine.install(&package, &[backup], None).unwrap_err();
        assert!(matches!(failure.error, InstallError::AlreadyInstalled(_)));
        assert!(failure.partial.is_none());
    }

    #[test]
    fn test_missing_destination() {
        let fx = fixture();
        let package = make_package(&fx, "Mod.zip", &[("a.txt", Some(b"a"))]);
        let mut engine = InstallEngine::new(&fx.destination.join("nope"), &fx.backups);
        let failure = engine.install(&package, &[], None).unwrap_err();
        assert!(matches!(failure.error, InstallError::DestinationUnwritable(_)));
    }

    #[test]
    fn test_partial_install_is_recorded_and_revertible() {
        let fx = fixture();
        // A directory where the package wants a file stops the install.
        fs::create_dir_all(fx.destination.join("b.txt")).unwrap();
        let package = make_package(
            &fx,
            "Mod.zip",
            &[("a.txt", Some(b"a")), ("b.txt", Some(b"b")), ("c.txt", Some(b"c"))],
        );
        let mut engine = InstallEngine::new(&fx.destination, &fx.backups);

        let failure = engine.install(&package, &[], None).unwrap_err();
        match &failure.error {
            InstallError::PartialFailure { completed, total, .. } => {
                assert_eq!(*completed, 1);
                assert_eq!(*total, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(engine.state(package.identity.hash), PackageState::InstallFailed);
        let partial = failure.partial.unwrap();
        assert_eq!(partial.entries.len(), 1);
        assert!(partial.definition_path().exists());
        assert!(fx.destination.join("a.txt").exists());

        engine.uninstall(&partial, None).unwrap();
        assert!(!fx.destination.join("a.txt").exists());
        assert!(fx.destination.join("b.txt").is_dir());
    }

    #[test]
    fn test_overlaps_recorded_on_install() {
        let fx = fixture();
        let first = make_package(&fx, "First.zip", &[("Data/shared.esp", Some(b"1"))]);
        let second = make_package(&fx, "Second.zip", &[("data/SHARED.esp", Some(b"2"))]);
        let mut engine = InstallEngine::new(&fx.destination, &fx.backups);

        let a = engine.install(&first, &[], None).unwrap();
        let b = engine.install(&second, std::slice::from_ref(&a), None).unwrap();
        assert!(b.overlaps(a.owner_hash));
        assert!(b.serial > a.serial);
    }

    #[test]
    fn test_overlaps_hold_in_every_install_order() {
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let fx = fixture();
            let packages = [
                make_package(&fx, "A.zip", &[("Data/common.esp", Some(b"a")), ("a.txt", Some(b"a"))]),
                make_package(&fx, "B.zip", &[("Data/common.esp", Some(b"b"))]),
                make_package(&fx, "C.zip", &[("Data/common.esp", Some(b"c")), ("c.txt", Some(b"c"))]),
            ];
            let mut engine = InstallEngine::new(&fx.destination, &fx.backups);

            let mut installed: Vec<ModBackup> = Vec::new();
            for &i in &order {
                let backup = engine.install(&packages[i], &installed, None).unwrap();
                for earlier in &installed {
                    assert!(backup.overlaps(earlier.owner_hash), "order {order:?}");
                }
                installed.push(backup);
            }

            // Uninstalling in reverse order restores the original tree.
            for backup in installed.iter().rev() {
                engine.uninstall(backup, None).unwrap();
            }
            assert_eq!(fs::read_dir(&fx.destination).unwrap().count(), 0, "order {order:?}");
        }
    }

    #[test]
    fn test_uninstall_tolerates_missing_files_and_keeps_full_dirs() {
        let fx = fixture();
        let package = make_package(&fx, "Mod.zip", &[("Data/a.txt", Some(b"a"))]);
        let mut engine = InstallEngine::new(&fx.destination, &fx.backups);
        let backup = engine.install(&package, &[], None).unwrap();

        fs::remove_file(fx.destination.join("Data/a.txt")).unwrap();
        fs::write(fx.destination.join("Data/user.txt"), b"user").unwrap();

        let report = engine.uninstall(&backup, None).unwrap();
        assert_eq!(report.kept_dirs, 1);
        assert!(fx.destination.join("Data/user.txt").exists());
    }

    #[test]
    fn test_uninstall_corrupt_backup() {
        let fx = fixture();
        let mut backup = ModBackup::new(1, "X", Path::new("x"), &fx.backups, 1);
        backup.valid = false;
        backup.error = Some("broken".to_string());
        let mut engine = InstallEngine::new(&fx.destination, &fx.backups);
        assert_eq!(
            engine.uninstall(&backup, None),
            Err(InstallError::BackupCorrupt("broken".to_string()))
        );
        assert_eq!(engine.state(1), PackageState::UninstallFailed);
    }

    #[test]
    fn test_uninstall_missing_original_keeps_backup() {
        let fx = fixture();
        fs::write(fx.destination.join("a.txt"), b"original").unwrap();
        let package = make_package(&fx, "Mod.zip", &[("a.txt", Some(b"new"))]);
        let mut engine = InstallEngine::new(&fx.destination, &fx.backups);
        let backup = engine.install(&package, &[], None).unwrap();

        fs::remove_file(backup.data_path("a.txt")).unwrap();
        let err = engine.uninstall(&backup, None).unwrap_err();
        assert!(matches!(err, InstallError::PartialFailure { completed: 0, total: 1, .. }));
        assert!(backup.definition_path().exists());
    }
}
