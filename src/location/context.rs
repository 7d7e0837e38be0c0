//! The application context: a home directory holding locations and batches.
//!
//! ```text
//! <home>/context.xml           Context definition
//! <home>/<title>/location.xml  one folder per location
//! <home>/batches/<name>.xml    batch definitions
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as _, Result};
use tracing::{info, warn};

use super::{Location, LOCATION_DEFINITION};
use crate::batch::{self, Batch};
use crate::document::{ConfigDocument, SIGNATURE_CONTEXT};
use crate::paths;
use crate::worker::LocationHandle;

/// File name of the Context definition.
pub const CONTEXT_DEFINITION: &str = "context.xml";

/// Folder holding batch definitions.
pub const BATCHES_DIR: &str = "batches";

pub struct Context {
    home: PathBuf,
    document: ConfigDocument,
    pub uuid: String,
    pub title: String,
    locations: Vec<LocationHandle>,
    batches: Vec<Batch>,
}

impl Context {
    /// Open the context in `home`, creating it on first use.
    pub fn open_or_create(home: &Path) -> Result<Self> {
        fs::create_dir_all(home).with_context(|| format!("Failed to create {}", home.display()))?;
        let definition = home.join(CONTEXT_DEFINITION);

        let mut document = ConfigDocument::new();
        if definition.exists() {
            document
                .open(&definition, SIGNATURE_CONTEXT)
                .with_context(|| format!("Failed to open context {}", definition.display()))?;
        } else {
            document.init_new(SIGNATURE_CONTEXT);
            if let Some(root) = document.root_mut() {
                root.set_child_text("uuid", uuid::Uuid::new_v4().to_string());
                root.set_child_text("title", "modvault");
            }
            document.save_as(&definition)?;
            info!("Created context at {}", home.display());
        }

        let root = document.require_root()?;
        let uuid = root.child_text("uuid").unwrap_or_default().to_string();
        let title = root.child_text("title").unwrap_or_default().to_string();

        let mut context = Self {
            home: home.to_path_buf(),
            document,
            uuid,
            title,
            locations: Vec::new(),
            batches: Vec::new(),
        };
        context.load_locations()?;
        context.batches = batch::scan_batches(&context.batches_dir());
        Ok(context)
    }

    fn load_locations(&mut self) -> Result<()> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.home)
            .with_context(|| format!("Failed to read {}", self.home.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.join(LOCATION_DEFINITION).is_file())
            .collect();
        dirs.sort();

        self.locations.clear();
        for dir in dirs {
            match Location::open(&dir.join(LOCATION_DEFINITION)) {
                Ok(location) => self.locations.push(LocationHandle::new(location)),
                Err(e) => warn!("Skipping location {}: {:#}", dir.display(), e),
            }
        }
        Ok(())
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn batches_dir(&self) -> PathBuf {
        self.home.join(BATCHES_DIR)
    }

    /// Write the Context definition.
    pub fn save(&mut self) -> Result<()> {
        let root = self.document.require_root_mut()?;
        root.set_child_text("uuid", self.uuid.clone());
        root.set_child_text("title", self.title.clone());
        self.document.save().context("Failed to save context")?;
        Ok(())
    }

    pub fn locations(&self) -> &[LocationHandle] {
        &self.locations
    }

    /// Find a location by uuid or title (case-insensitive).
    pub fn find_location(&self, key: &str) -> Option<LocationHandle> {
        self.locations
            .iter()
            .find(|handle| {
                handle
                    .with(|loc| loc.uuid() == key || loc.title().eq_ignore_ascii_case(key))
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// Create a location in `<home>/<title>`.
    pub fn create_location(&mut self, title: &str, destination: &Path) -> Result<LocationHandle> {
        if self.find_location(title).is_some() {
            bail!("A location named '{}' already exists", title);
        }
        let location = Location::create(&self.home, title, destination)?;
        let handle = LocationHandle::new(location);
        self.locations.push(handle.clone());
        Ok(handle)
    }

    /// Forget a location: its definition is deleted and every batch drops
    /// its entry for it. Library and install records stay on disk.
    pub fn forget_location(&mut self, uuid: &str) -> Result<bool> {
        let Some(index) = self
            .locations
            .iter()
            .position(|h| h.with(|loc| loc.uuid() == uuid).unwrap_or(false))
        else {
            return Ok(false);
        };
        let handle = self.locations.remove(index);
        let definition = handle.with(|loc| loc.home().join(LOCATION_DEFINITION))?;
        fs::remove_file(&definition).with_context(|| format!("Failed to delete {}", definition.display()))?;

        for batch in self.batches.iter_mut() {
            if batch.remove_location(uuid) {
                batch.save()?;
            }
        }
        Ok(true)
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Find a batch by uuid or title (case-insensitive).
    pub fn find_batch(&self, key: &str) -> Option<&Batch> {
        self.batches
            .iter()
            .find(|b| b.uuid == key || b.title.eq_ignore_ascii_case(key))
    }

    pub fn find_batch_mut(&mut self, key: &str) -> Option<&mut Batch> {
        self.batches
            .iter_mut()
            .find(|b| b.uuid == key || b.title.eq_ignore_ascii_case(key))
    }

    /// Create an empty batch saved as `<home>/batches/<title>.xml`.
    pub fn create_batch(&mut self, title: &str) -> Result<&mut Batch> {
        if !paths::is_valid_name(title) {
            bail!("Invalid batch name '{}'", title);
        }
        if self.find_batch(title).is_some() {
            bail!("A batch named '{}' already exists", title);
        }
        let path = self.batches_dir().join(format!("{}.{}", title, batch::BATCH_EXTENSION));
        let mut new_batch = Batch::new(title);
        new_batch.order_index = self.batches.iter().map(|b| b.order_index + 1).max().unwrap_or(0);
        new_batch.save_as(&path)?;
        self.batches.push(new_batch);
        self.batches
            .last_mut()
            .ok_or_else(|| anyhow!("Batch list is empty after insert"))
    }

    /// Delete a batch and its definition file.
    pub fn remove_batch(&mut self, key: &str) -> Result<bool> {
        let Some(index) = self
            .batches
            .iter()
            .position(|b| b.uuid == key || b.title.eq_ignore_ascii_case(key))
        else {
            return Ok(false);
        };
        let removed = self.batches.remove(index);
        if let Some(path) = removed.path() {
            fs::remove_file(path).with_context(|| format!("Failed to delete {}", path.display()))?;
        }
        Ok(true)
    }
}
