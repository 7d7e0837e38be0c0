//! Locations: one install destination with its library, install records and
//! repositories.
//!
//! A location lives in its own folder under the home directory:
//!
//! ```text
//! <home>/<title>/location.xml    Location definition
//! <home>/<title>/library/        package archives and folders
//! <home>/<title>/backup/         install records
//! ```

pub mod config;
pub mod context;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::{anyhow, bail, Context as _, Result};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backup::{self, ModBackup};
use crate::batch::Batch;
use crate::document::{ConfigDocument, SIGNATURE_LOCATION};
use crate::hash;
use crate::identity::PackageIdentity;
use crate::install::{InstallEngine, InstallError, PackageState, Progress, UninstallReport};
use crate::overlap;
use crate::package::{Package, PackageSource};
use crate::repository::download::PART_SUFFIX;
use crate::repository::{
    download_remote, remote, DownloadEvent, DownloadOptions, HttpClient, RemoteDescriptor, RemotePackage, Repository,
    DEFAULT_SUFFIX,
};
use crate::warning::ReconciliationWarning;

pub use config::{EngineOptions, LocationConfig, LocationConfigError, RepositoryEntry};
pub use context::Context;

/// File name of the Location definition inside a location folder.
pub const LOCATION_DEFINITION: &str = "location.xml";

/// Result of querying every configured repository.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryReport {
    pub queried: usize,
    /// `(url, error)` of repositories that could not be queried.
    pub failed: Vec<(String, String)>,
    /// New entries plus entries that gained a download URL.
    pub merged: usize,
    pub remotes: usize,
    pub warnings: Vec<ReconciliationWarning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub ident: String,
    pub entries: usize,
    /// Hashes of installed packages this install overwrote files of.
    pub overlapped: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct UninstallOutcome {
    pub report: UninstallReport,
    pub warnings: Vec<ReconciliationWarning>,
}

/// Result of running a batch on a location.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub installed: Vec<String>,
    pub uninstalled: Vec<String>,
    /// Listed packages not found in the library.
    pub missing: Vec<String>,
    pub failures: Vec<String>,
    pub warnings: Vec<ReconciliationWarning>,
}

/// One location and everything loaded for it.
#[derive(Debug)]
pub struct Location {
    home: PathBuf,
    config: LocationConfig,
    document: ConfigDocument,
    engine: InstallEngine,
    packages: Vec<Package>,
    backups: Vec<ModBackup>,
    repositories: Vec<Repository>,
    remotes: Vec<RemotePackage>,
}

impl Location {
    /// Create a new location folder `<home_root>/<title>` and its definition.
    pub fn create(home_root: &Path, title: &str, destination: &Path) -> Result<Self> {
        let home = home_root.join(title);
        let definition = home.join(LOCATION_DEFINITION);
        if definition.exists() {
            bail!("Location '{}' already exists at {}", title, home.display());
        }

        let config = LocationConfig::new(&home, title, destination);
        config.validate().context("Invalid location configuration")?;
        for dir in [&home, &config.library_dir, &config.backup_dir] {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let mut document = ConfigDocument::new();
        document.init_new(SIGNATURE_LOCATION);
        if let Some(root) = document.root_mut() {
            *root = config.to_xml();
        }
        document
            .save_as(&definition)
            .with_context(|| format!("Failed to write {}", definition.display()))?;
        info!("Created location '{}' at {}", title, home.display());

        Self::open(&definition)
    }

    /// Open a location from its definition file and load its library and
    /// install records.
    pub fn open(definition: &Path) -> Result<Self> {
        let mut document = ConfigDocument::new();
        document
            .open(definition, SIGNATURE_LOCATION)
            .with_context(|| format!("Failed to open location {}", definition.display()))?;
        let config = LocationConfig::from_xml(document.require_root()?)
            .with_context(|| format!("Invalid location definition {}", definition.display()))?;

        let home = definition
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("Location definition has no parent folder"))?;

        let repositories = config
            .repositories
            .iter()
            .filter_map(|entry| match Repository::new(&entry.base_url, &entry.suffix) {
                Ok(repo) => Some(repo),
                Err(e) => {
                    warn!("Ignoring repository {}: {}", entry.base_url, e);
                    None
                }
            })
            .collect();

        let mut location = Self {
            home,
            engine: InstallEngine::new(&config.destination, &config.backup_dir),
            config,
            document,
            packages: Vec::new(),
            backups: Vec::new(),
            repositories,
            remotes: Vec::new(),
        };
        location.refresh_backups();
        location.refresh_library()?;
        Ok(location)
    }

    /// Write the definition back to disk.
    pub fn save(&mut self) -> Result<()> {
        let root = self.document.require_root_mut()?;
        *root = self.config.to_xml();
        self.document.save().context("Failed to save location definition")?;
        Ok(())
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config(&self) -> &LocationConfig {
        &self.config
    }

    pub fn uuid(&self) -> &str {
        &self.config.uuid
    }

    pub fn title(&self) -> &str {
        &self.config.title
    }

    /// Change the options and persist them.
    pub fn set_options(&mut self, options: EngineOptions) -> Result<()> {
        self.config.options = options;
        self.save()?;
        self.refresh_library()?;
        Ok(())
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn backups(&self) -> &[ModBackup] {
        &self.backups
    }

    pub fn repositories(&self) -> &[Repository] {
        &self.repositories
    }

    pub fn remotes(&self) -> &[RemotePackage] {
        &self.remotes
    }

    pub fn state(&self, hash: u64) -> PackageState {
        self.engine.state(hash)
    }

    pub fn is_installed(&self, hash: u64) -> bool {
        self.backups.iter().any(|b| b.owner_hash == hash)
    }

    /// Rescan the library folder. Packages are scanned in parallel.
    pub fn refresh_library(&mut self) -> Result<usize> {
        let library = &self.config.library_dir;
        fs::create_dir_all(library).with_context(|| format!("Failed to create {}", library.display()))?;

        let candidates: Vec<PathBuf> = fs::read_dir(library)
            .with_context(|| format!("Failed to read library {}", library.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| !p.to_string_lossy().ends_with(PART_SUFFIX))
            .filter(|p| Package::is_candidate(p))
            .collect();

        let underscore_to_space = self.config.options.underscore_to_space;
        let mut packages: Vec<Package> = candidates
            .par_iter()
            .filter_map(|path| match Package::scan(path, underscore_to_space) {
                Ok(package) => Some(package),
                Err(e) => {
                    warn!("Skipping library entry {}: {}", path.display(), e);
                    None
                }
            })
            .collect();
        packages.sort_by(|a, b| a.identity.ident.to_lowercase().cmp(&b.identity.ident.to_lowercase()));

        debug!("Library of '{}' holds {} package(s)", self.config.title, packages.len());
        self.packages = packages;
        self.reconcile();
        Ok(self.packages.len())
    }

    /// Reload install records from the backup folder.
    pub fn refresh_backups(&mut self) {
        self.backups = backup::scan_backups(&self.config.backup_dir);
        self.engine.sync_states(&self.backups);
        for broken in self.backups.iter().filter(|b| !b.valid) {
            warn!(
                "Install record {} is unusable: {}",
                broken.dir.display(),
                broken.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    /// Identities of every package known locally: library packages and
    /// installed packages.
    pub fn local_identities(&self) -> Vec<PackageIdentity> {
        let underscore_to_space = self.config.options.underscore_to_space;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for identity in self.packages.iter().map(|p| p.identity.clone()) {
            if seen.insert(identity.hash) {
                out.push(identity);
            }
        }
        for backup in self.backups.iter().filter(|b| b.valid && !b.ident.is_empty()) {
            if seen.insert(backup.owner_hash) {
                out.push(PackageIdentity::from_ident(&backup.ident, underscore_to_space));
            }
        }
        out
    }

    /// Resolve a package by identity string (case-insensitive) or by hex
    /// hash. Library packages and install records are both searched.
    pub fn resolve(&self, key: &str) -> Option<u64> {
        let key = key.trim();
        self.packages
            .iter()
            .find(|p| p.identity.ident.eq_ignore_ascii_case(key))
            .map(|p| p.identity.hash)
            .or_else(|| {
                self.backups
                    .iter()
                    .find(|b| b.ident.eq_ignore_ascii_case(key))
                    .map(|b| b.owner_hash)
            })
            .or_else(|| {
                hash::hex_to_hash(key).filter(|h| {
                    self.packages.iter().any(|p| p.identity.hash == *h)
                        || self.backups.iter().any(|b| b.owner_hash == *h)
                })
            })
    }

    pub fn find_package(&self, hash: u64) -> Option<&Package> {
        self.packages.iter().find(|p| p.identity.hash == hash)
    }

    pub fn find_backup(&self, hash: u64) -> Option<&ModBackup> {
        self.backups.iter().find(|b| b.owner_hash == hash)
    }

    /// Install a library package.
    pub fn install(&mut self, hash: u64, progress: Progress<'_>) -> Result<InstallOutcome> {
        let index = self
            .packages
            .iter()
            .position(|p| p.identity.hash == hash)
            .ok_or_else(|| InstallError::UnknownPackage(hash::hash_to_hex(hash)))?;

        match self.engine.install(&self.packages[index], &self.backups, progress) {
            Ok(backup) => {
                let outcome = InstallOutcome {
                    ident: backup.ident.clone(),
                    entries: backup.entries.len(),
                    overlapped: backup.overlapped.iter().copied().collect(),
                };
                self.backups.push(backup);
                self.reconcile();
                Ok(outcome)
            }
            Err(failure) => {
                if let Some(partial) = failure.partial {
                    // Keep the partial record so it can be uninstalled.
                    self.backups.push(partial);
                }
                Err(failure.error.into())
            }
        }
    }

    /// Uninstall an installed package. Overlap warnings are returned, not
    /// treated as errors.
    pub fn uninstall(&mut self, hash: u64, progress: Progress<'_>) -> Result<UninstallOutcome> {
        let index = self
            .backups
            .iter()
            .position(|b| b.owner_hash == hash)
            .ok_or_else(|| InstallError::UnknownPackage(hash::hash_to_hex(hash)))?;

        let warnings = overlap::uninstall_warnings(hash, &self.backups);
        for warning in &warnings {
            warn!("{}", warning);
        }

        let report = self.engine.uninstall(&self.backups[index], progress)?;
        self.backups.remove(index);

        for other in self.backups.iter_mut() {
            if other.overlapped.remove(&hash) {
                if let Err(e) = other.save() {
                    warn!("Failed to update install record of {}: {}", other.ident, e);
                }
            }
        }
        self.reconcile();
        Ok(UninstallOutcome { report, warnings })
    }

    /// Add a repository and persist it.
    pub fn add_repository(&mut self, base_url: &str, suffix: &str) -> Result<()> {
        let repo = Repository::new(base_url, suffix)?;
        if self.repositories.iter().any(|r| r.url() == repo.url()) {
            bail!("Repository {} is already configured", repo.url());
        }
        self.config.repositories.push(RepositoryEntry {
            base_url: repo.base_url().to_string(),
            suffix: repo.suffix().to_string(),
        });
        self.repositories.push(repo);
        self.save()
    }

    /// Remove a repository by definition URL.
    pub fn remove_repository(&mut self, url: &str) -> Result<bool> {
        let Some(index) = self.repositories.iter().position(|r| r.url() == url) else {
            return Ok(false);
        };
        let repo = self.repositories.remove(index);
        self.config
            .repositories
            .retain(|e| !(e.base_url == repo.base_url() && e.suffix == repo.suffix()));
        self.save()?;
        Ok(true)
    }

    /// Describe the library's archive packages as a repository definition
    /// served from `base_url`, with files under `down_path`.
    pub fn publish(&self, base_url: &str, title: &str, down_path: &str) -> Result<String> {
        let mut repo = Repository::new(base_url, DEFAULT_SUFFIX)?;
        repo.uuid = uuid::Uuid::new_v4().to_string();
        repo.title = title.to_string();
        repo.down_path = down_path.to_string();
        for package in self.packages.iter().filter(|p| p.source == PackageSource::Archive) {
            let Some(file) = package.path.file_name() else {
                continue;
            };
            repo.push_remote(RemoteDescriptor {
                ident: package.identity.ident.clone(),
                file: file.to_string_lossy().into_owned(),
                bytes: fs::metadata(&package.path).map(|m| m.len()).unwrap_or(0),
                checksum: package.checksum(),
                ..Default::default()
            });
        }
        Ok(repo.to_definition()?)
    }

    /// Query every repository, merge their entries and classify them.
    pub fn query_repositories(&mut self, http: &dyn HttpClient, abort: Option<&AtomicBool>) -> QueryReport {
        let mut report = QueryReport::default();
        self.remotes.clear();

        for repo in self.repositories.iter_mut() {
            if abort.is_some_and(|a| a.load(std::sync::atomic::Ordering::Relaxed)) {
                report.failed.push((repo.url().to_string(), "aborted".to_string()));
                continue;
            }
            report.queried += 1;
            if let Err(e) = repo.query(http, abort) {
                report.failed.push((repo.url().to_string(), e.to_string()));
            }
        }

        report.merged = remote::merge(
            &self.repositories,
            &mut self.remotes,
            self.config.options.underscore_to_space,
        );
        self.reconcile();
        report.remotes = self.remotes.len();
        report.warnings = remote::dependency_warnings(&self.remotes);
        report
    }

    /// Recompute remote states against the local packages.
    pub fn reconcile(&mut self) {
        if self.remotes.is_empty() {
            return;
        }
        let local = self.local_identities();
        remote::classify(&mut self.remotes, &local);
    }

    /// Download a remote package into the library.
    pub fn download(
        &mut self,
        ident: &str,
        http: &dyn HttpClient,
        abort: Option<&AtomicBool>,
        on_event: &mut dyn FnMut(DownloadEvent),
    ) -> Result<PathBuf> {
        let index = self
            .remotes
            .iter()
            .position(|r| r.identity.ident.eq_ignore_ascii_case(ident.trim()))
            .ok_or_else(|| anyhow!("No remote package named '{}'", ident))?;

        let options = DownloadOptions {
            verify_checksum: self.config.options.verify_downloads,
        };
        let path = download_remote(
            &mut self.remotes[index],
            http,
            &self.config.library_dir,
            options,
            abort,
            on_event,
        )?;

        let replaced = self.remotes[index].upgrade_targets.clone();
        self.refresh_library()?;

        if self.config.options.upgrade_replaces {
            let mut removed = 0;
            for target in replaced {
                if self.is_installed(target) {
                    continue;
                }
                if let Some(old) = self.find_package(target) {
                    let old_path = old.path.clone();
                    let result = if old_path.is_dir() {
                        fs::remove_dir_all(&old_path)
                    } else {
                        fs::remove_file(&old_path)
                    };
                    match result {
                        Ok(()) => {
                            info!("Removed superseded package {}", old_path.display());
                            removed += 1;
                        }
                        Err(e) => warn!("Failed to remove {}: {}", old_path.display(), e),
                    }
                }
            }
            if removed > 0 {
                self.refresh_library()?;
            }
        }
        Ok(path)
    }

    /// Apply a batch's install list for this location.
    pub fn run_batch(&mut self, batch: &Batch, install_only: bool) -> Result<BatchReport> {
        let loc_index = batch
            .location_index(&self.config.uuid)
            .ok_or_else(|| anyhow!("Batch '{}' has no entry for location '{}'", batch.title, self.config.title))?;

        let installed: Vec<u64> = self
            .backups
            .iter()
            .filter(|b| b.valid)
            .map(|b| b.owner_hash)
            .collect();
        let plan = batch
            .plan(loc_index, &installed, install_only)
            .ok_or_else(|| anyhow!("Batch location index out of range"))?;
        info!(
            "Batch '{}': {} to install, {} to uninstall",
            batch.title,
            plan.install.len(),
            plan.uninstall.len()
        );

        let mut report = BatchReport::default();
        for hash in plan.uninstall {
            let ident = self.find_backup(hash).map(|b| b.ident.clone()).unwrap_or_default();
            match self.uninstall(hash, None) {
                Ok(outcome) => {
                    report.warnings.extend(outcome.warnings);
                    report.uninstalled.push(ident);
                }
                Err(e) => report.failures.push(format!("{}: {:#}", ident, e)),
            }
        }

        let idents = batch.install_idents(loc_index);
        let hashes = batch.install_hashes(loc_index);
        for (hash, ident) in hashes.into_iter().zip(idents) {
            if !plan.install.contains(&hash) {
                continue;
            }
            if self.find_package(hash).is_none() {
                report.missing.push(ident.to_string());
                continue;
            }
            match self.install(hash, None) {
                Ok(outcome) => report.installed.push(outcome.ident),
                Err(e) => report.failures.push(format!("{}: {:#}", ident, e)),
            }
        }
        Ok(report)
    }
}
