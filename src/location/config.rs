//! Location configuration
//!
//! Persisted settings of one location, stored in its signed Location
//! definition.

use std::path::{Path, PathBuf};

use crate::document::SIGNATURE_LOCATION;
use crate::paths;
use crate::repository::DEFAULT_SUFFIX;
use crate::xml::XmlNode;

/// Behaviour flags of a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Show underscores in package names as spaces
    pub underscore_to_space: bool,

    /// Verify checksums of downloaded packages
    pub verify_downloads: bool,

    /// After a download that upgrades a package, delete the older library
    /// copies that are not installed
    pub upgrade_replaces: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            underscore_to_space: true,
            verify_downloads: true,
            upgrade_replaces: false,
        }
    }
}

/// A configured repository source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub base_url: String,
    pub suffix: String,
}

/// Configuration of one location
#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub uuid: String,

    /// Display name, also the location's folder name under the home
    pub title: String,

    /// Directory packages are installed into
    pub destination: PathBuf,

    /// Directory holding package archives and folders
    pub library_dir: PathBuf,

    /// Directory holding install records
    pub backup_dir: PathBuf,

    pub repositories: Vec<RepositoryEntry>,

    pub options: EngineOptions,
}

impl LocationConfig {
    /// New configuration with library and backup folders inside `home`.
    pub fn new(home: &Path, title: &str, destination: &Path) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            destination: destination.to_path_buf(),
            library_dir: home.join("library"),
            backup_dir: home.join("backup"),
            repositories: Vec::new(),
            options: EngineOptions::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), LocationConfigError> {
        if !paths::is_valid_name(&self.title) {
            return Err(LocationConfigError::InvalidTitle(self.title.clone()));
        }

        if !self.destination.is_dir() {
            return Err(LocationConfigError::DestinationNotFound(self.destination.clone()));
        }

        if self.library_dir.as_os_str().is_empty() {
            return Err(LocationConfigError::MissingField("library"));
        }

        if self.backup_dir.as_os_str().is_empty() {
            return Err(LocationConfigError::MissingField("backup"));
        }

        if self.library_dir == self.destination || self.backup_dir == self.destination {
            return Err(LocationConfigError::OverlappingDirs);
        }

        Ok(())
    }

    /// Root element of the Location definition.
    pub fn to_xml(&self) -> XmlNode {
        let mut root = XmlNode::new(SIGNATURE_LOCATION);
        root.set_child_text("uuid", self.uuid.clone());
        root.set_child_text("title", self.title.clone());
        root.set_child_text("destination", self.destination.to_string_lossy());
        root.set_child_text("library", self.library_dir.to_string_lossy());
        root.set_child_text("backup", self.backup_dir.to_string_lossy());
        root.add_child(
            XmlNode::new("options")
                .with_attr("underscore_to_space", flag(self.options.underscore_to_space))
                .with_attr("verify_downloads", flag(self.options.verify_downloads))
                .with_attr("upgrade_replaces", flag(self.options.upgrade_replaces)),
        );
        let repos = root.add_child(XmlNode::new("repositories"));
        for entry in &self.repositories {
            repos.add_child(
                XmlNode::new("repository")
                    .with_attr("base", entry.base_url.clone())
                    .with_attr("suffix", entry.suffix.clone()),
            );
        }
        root
    }

    /// Read a configuration from a Location definition root.
    pub fn from_xml(root: &XmlNode) -> Result<Self, LocationConfigError> {
        let text = |name: &'static str| {
            root.child_text(name)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or(LocationConfigError::MissingField(name))
        };

        let defaults = EngineOptions::default();
        let options = match root.child("options") {
            Some(node) => EngineOptions {
                underscore_to_space: read_flag(node, "underscore_to_space", defaults.underscore_to_space),
                verify_downloads: read_flag(node, "verify_downloads", defaults.verify_downloads),
                upgrade_replaces: read_flag(node, "upgrade_replaces", defaults.upgrade_replaces),
            },
            None => defaults,
        };

        let repositories = root
            .child("repositories")
            .map(|node| {
                node.children_named("repository")
                    .filter_map(|r| {
                        let base_url = r.attr("base")?.trim().to_string();
                        let suffix = r.attr("suffix").unwrap_or(DEFAULT_SUFFIX).trim().to_string();
                        Some(RepositoryEntry { base_url, suffix })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            uuid: text("uuid")?.to_string(),
            title: text("title")?.to_string(),
            destination: PathBuf::from(text("destination")?),
            library_dir: PathBuf::from(text("library")?),
            backup_dir: PathBuf::from(text("backup")?),
            repositories,
            options,
        })
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn read_flag(node: &XmlNode, name: &str, default: bool) -> bool {
    match node.attr(name).map(str::trim) {
        Some("1") | Some("true") => true,
        Some("0") | Some("false") => false,
        _ => default,
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationConfigError {
    #[error("Invalid location title: '{0}'")]
    InvalidTitle(String),

    #[error("Destination directory not found: {0}")]
    DestinationNotFound(PathBuf),

    #[error("Location definition is missing <{0}>")]
    MissingField(&'static str),

    #[error("Library and backup folders must differ from the destination")]
    OverlappingDirs,
}
