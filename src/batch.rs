//! Batches: saved install sets, one list of packages per location.
//!
//! Running a batch installs every listed package that is not installed yet
//! and, unless the batch is install-only, uninstalls every installed package
//! the batch does not list.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::document::{ConfigDocument, ConfigError, SIGNATURE_BATCH};
use crate::hash;
use crate::paths;
use crate::xml::XmlNode;

/// Extension of batch definition files.
pub const BATCH_EXTENSION: &str = "xml";

/// One package a batch installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInstall {
    pub hash: u64,
    pub ident: String,
}

/// Install list for one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLocation {
    pub uuid: String,
    pub installs: Vec<BatchInstall>,
}

/// What running a batch on a location changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    /// Packages to install, in batch order.
    pub install: Vec<u64>,
    /// Packages to uninstall, most recent install first.
    pub uninstall: Vec<u64>,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.uninstall.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub uuid: String,
    pub title: String,
    /// Position in the user's batch list.
    pub order_index: u32,
    /// Only install; never uninstall unlisted packages.
    pub install_only: bool,
    locations: Vec<BatchLocation>,
    path: Option<PathBuf>,
}

impl Batch {
    pub fn new(title: &str) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            order_index: 0,
            install_only: false,
            locations: Vec::new(),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn locations(&self) -> &[BatchLocation] {
        &self.locations
    }

    pub fn location_uuids(&self) -> Vec<&str> {
        self.locations.iter().map(|l| l.uuid.as_str()).collect()
    }

    pub fn location_index(&self, uuid: &str) -> Option<usize> {
        self.locations.iter().position(|l| l.uuid == uuid)
    }

    /// Add a location, returning its index. Adding a known location returns
    /// the existing index.
    pub fn add_location(&mut self, uuid: &str) -> usize {
        if let Some(index) = self.location_index(uuid) {
            return index;
        }
        self.locations.push(BatchLocation {
            uuid: uuid.to_string(),
            installs: Vec::new(),
        });
        self.locations.len() - 1
    }

    /// Remove a location and its install list.
    pub fn remove_location(&mut self, uuid: &str) -> bool {
        match self.location_index(uuid) {
            Some(index) => {
                self.locations.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn install_hashes(&self, loc_index: usize) -> Vec<u64> {
        self.locations
            .get(loc_index)
            .map(|l| l.installs.iter().map(|i| i.hash).collect())
            .unwrap_or_default()
    }

    pub fn install_idents(&self, loc_index: usize) -> Vec<&str> {
        self.locations
            .get(loc_index)
            .map(|l| l.installs.iter().map(|i| i.ident.as_str()).collect())
            .unwrap_or_default()
    }

    /// Add a package to a location's list. Returns `false` if the index is
    /// out of range or the package is already listed.
    pub fn add_install(&mut self, loc_index: usize, hash: u64, ident: &str) -> bool {
        let Some(location) = self.locations.get_mut(loc_index) else {
            return false;
        };
        if location.installs.iter().any(|i| i.hash == hash) {
            return false;
        }
        location.installs.push(BatchInstall {
            hash,
            ident: ident.to_string(),
        });
        true
    }

    pub fn remove_install(&mut self, loc_index: usize, hash: u64) -> bool {
        let Some(location) = self.locations.get_mut(loc_index) else {
            return false;
        };
        let before = location.installs.len();
        location.installs.retain(|i| i.hash != hash);
        location.installs.len() != before
    }

    pub fn clear_installs(&mut self, loc_index: usize) {
        if let Some(location) = self.locations.get_mut(loc_index) {
            location.installs.clear();
        }
    }

    pub fn has_install_hash(&self, loc_index: usize, hash: u64) -> bool {
        self.locations
            .get(loc_index)
            .is_some_and(|l| l.installs.iter().any(|i| i.hash == hash))
    }

    pub fn has_install_ident(&self, loc_index: usize, ident: &str) -> bool {
        self.locations
            .get(loc_index)
            .is_some_and(|l| l.installs.iter().any(|i| i.ident == ident))
    }

    /// Compute the changes to apply to a location. `installed` lists the
    /// currently installed hashes in install order.
    pub fn plan(&self, loc_index: usize, installed: &[u64], install_only: bool) -> Option<BatchPlan> {
        let location = self.locations.get(loc_index)?;
        let wanted: HashSet<u64> = location.installs.iter().map(|i| i.hash).collect();
        let present: HashSet<u64> = installed.iter().copied().collect();

        let install = location
            .installs
            .iter()
            .map(|i| i.hash)
            .filter(|h| !present.contains(h))
            .collect();
        let uninstall = if install_only || self.install_only {
            Vec::new()
        } else {
            installed
                .iter()
                .rev()
                .copied()
                .filter(|h| !wanted.contains(h))
                .collect()
        };
        Some(BatchPlan { install, uninstall })
    }

    /// Load a batch definition.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut doc = ConfigDocument::new();
        doc.open(path, SIGNATURE_BATCH)?;
        let root = doc.require_root()?;

        let mut batch = Self::new("");
        if let Some(uuid) = root.child_text("uuid").filter(|u| !u.is_empty()) {
            batch.uuid = uuid.to_string();
        }
        batch.title = root.child_text("title").unwrap_or_default().to_string();
        batch.order_index = root
            .child_text("index")
            .and_then(|i| i.trim().parse().ok())
            .unwrap_or(0);
        batch.install_only = root
            .child("options")
            .and_then(|o| o.attr("install_only"))
            .is_some_and(|v| v == "1" || v == "true");

        for node in root.children_named("location") {
            let Some(uuid) = node.attr("uuid").filter(|u| !u.is_empty()) else {
                debug!("Skipping batch location without uuid in {}", path.display());
                continue;
            };
            let index = batch.add_location(uuid);
            for install in node.children_named("install") {
                let hash = install
                    .attr("hash")
                    .and_then(hash::hex_to_hash)
                    .ok_or_else(|| ConfigError::MalformedXml(format!("invalid install hash in {}", path.display())))?;
                batch.add_install(index, hash, install.attr("ident").unwrap_or_default());
            }
        }
        batch.path = Some(path.to_path_buf());
        Ok(batch)
    }

    fn to_root(&self) -> XmlNode {
        let mut root = XmlNode::new(SIGNATURE_BATCH);
        root.set_child_text("uuid", self.uuid.clone());
        root.set_child_text("title", self.title.clone());
        root.set_child_text("index", self.order_index.to_string());
        root.add_child(XmlNode::new("options").with_attr("install_only", if self.install_only { "1" } else { "0" }));
        for location in &self.locations {
            let node = root.add_child(XmlNode::new("location").with_attr("uuid", location.uuid.clone()));
            for install in &location.installs {
                node.add_child(
                    XmlNode::new("install")
                        .with_attr("hash", hash::hash_to_hex(install.hash))
                        .with_attr("ident", install.ident.clone()),
                );
            }
        }
        root
    }

    /// Save to the current path.
    pub fn save(&mut self) -> Result<(), ConfigError> {
        let path = self.path.clone().ok_or(ConfigError::NotLoaded)?;
        self.save_as(&path)
    }

    /// Save to `path`, which becomes the current path.
    pub fn save_as(&mut self, path: &Path) -> Result<(), ConfigError> {
        let mut doc = ConfigDocument::new();
        doc.init_new(SIGNATURE_BATCH);
        if let Some(root) = doc.root_mut() {
            *root = self.to_root();
        }
        doc.save_as(path)?;
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    /// Move the definition file to `<dir>/<new_stem>.xml`. The uuid and
    /// title stay as they are.
    pub fn rename(&mut self, new_stem: &str) -> Result<PathBuf, ConfigError> {
        let old = self.path.clone().ok_or(ConfigError::NotLoaded)?;
        let target = old.with_file_name(format!("{}.{}", new_stem, BATCH_EXTENSION));
        if !paths::is_valid_name(new_stem) || (target.exists() && target != old) {
            return Err(ConfigError::IoWrite {
                path: target,
                reason: "invalid or existing batch name".to_string(),
            });
        }
        if target == old {
            return Ok(target);
        }
        self.save_as(&target)?;
        if let Err(e) = fs::remove_file(&old) {
            return Err(ConfigError::IoWrite {
                path: old,
                reason: e.to_string(),
            });
        }
        info!("Renamed batch {} to {}", self.title, target.display());
        Ok(target)
    }
}

/// Load every batch definition in `dir`, ordered by `order_index`.
pub fn scan_batches(dir: &Path) -> Vec<Batch> {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut batches: Vec<Batch> = read_dir
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == BATCH_EXTENSION))
        .filter_map(|p| match Batch::load(&p) {
            Ok(batch) => Some(batch),
            Err(e) => {
                warn!("Skipping batch {}: {}", p.display(), e);
                None
            }
        })
        .collect();
    batches.sort_by(|a, b| a.order_index.cmp(&b.order_index).then(a.title.cmp(&b.title)));
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_locations_and_installs() {
        let mut batch = Batch::new("Evening");
        let a = batch.add_location("loc-a");
        let b = batch.add_location("loc-b");
        assert_eq!(batch.add_location("loc-a"), a);
        assert_eq!(batch.location_uuids(), vec!["loc-a", "loc-b"]);

        assert!(batch.add_install(a, 1, "One_v1"));
        assert!(batch.add_install(a, 2, "Two_v1"));
        assert!(!batch.add_install(a, 1, "One_v1"));
        assert!(!batch.add_install(9, 1, "One_v1"));
        assert_eq!(batch.install_hashes(a), vec![1, 2]);
        assert_eq!(batch.install_idents(a), vec!["One_v1", "Two_v1"]);
        assert!(batch.has_install_ident(a, "Two_v1"));
        assert!(!batch.has_install_hash(b, 1));

        assert!(batch.remove_install(a, 1));
        assert!(!batch.remove_install(a, 1));
        batch.clear_installs(a);
        assert!(batch.install_hashes(a).is_empty());

        assert!(batch.remove_location("loc-a"));
        assert_eq!(batch.location_uuids(), vec!["loc-b"]);
        assert_eq!(batch.location_index("loc-b"), Some(0));
        assert!(batch.install_hashes(5).is_empty());
    }

    #[test]
    fn test_install_hash_is_per_location() {
        let mut batch = Batch::new("Scenario");
        batch.add_location("L1");
        batch.add_location("L2");
        batch.add_install(0, 0xABCD, "ModA");
        assert!(batch.has_install_hash(0, 0xABCD));
        assert!(!batch.has_install_hash(1, 0xABCD));
    }

    #[test]
    fn test_plan() {
        let mut batch = Batch::new("Plan");
        let loc = batch.add_location("loc");
        batch.add_install(loc, 10, "A");
        batch.add_install(loc, 20, "B");

        let plan = batch.plan(loc, &[20, 30, 40], false).unwrap();
        assert_eq!(plan.install, vec![10]);
        assert_eq!(plan.uninstall, vec![40, 30]);

        let plan = batch.plan(loc, &[20, 30], true).unwrap();
        assert!(plan.uninstall.is_empty());

        assert!(batch.plan(loc, &[10, 20], false).unwrap().is_empty());
        assert!(batch.plan(3, &[], false).is_none());
    }

    #[test]
    fn test_save_load_rename() {
        let dir = tempdir().unwrap();
        let mut batch = Batch::new("Evening setup");
        batch.order_index = 2;
        batch.install_only = true;
        let loc = batch.add_location("loc-a");
        batch.add_install(loc, 0xdead, "Hats_v1");
        batch.save_as(&dir.path().join("evening.xml")).unwrap();

        let loaded = Batch::load(&dir.path().join("evening.xml")).unwrap();
        assert_eq!(loaded.uuid, batch.uuid);
        assert_eq!(loaded.title, "Evening setup");
        assert_eq!(loaded.order_index, 2);
        assert!(loaded.install_only);
        assert_eq!(loaded.locations(), batch.locations());

        let mut loaded = loaded;
        let new_path = loaded.rename("night").unwrap();
        assert!(new_path.exists());
        assert!(!dir.path().join("evening.xml").exists());
        let renamed = Batch::load(&new_path).unwrap();
        assert_eq!(renamed.uuid, batch.uuid);
        assert_eq!(renamed.title, "Evening setup");

        assert!(loaded.rename("bad/name").is_err());
    }

    #[test]
    fn test_scan_batches_orders_and_skips_broken() {
        let dir = tempdir().unwrap();
        for (stem, index) in [("b", 1u32), ("a", 0)] {
            let mut batch = Batch::new(stem);
            batch.order_index = index;
            batch.save_as(&dir.path().join(format!("{}.xml", stem))).unwrap();
        }
        fs::write(dir.path().join("broken.xml"), "<Open_Mod_Manager_Location/>").unwrap();

        let titles: Vec<String> = scan_batches(dir.path()).into_iter().map(|b| b.title).collect();
        assert_eq!(titles, vec!["a", "b"]);
    }

    #[test]
    fn test_save_without_path() {
        let mut batch = Batch::new("x");
        assert_eq!(batch.save(), Err(ConfigError::NotLoaded));
    }
}
