//! Signed definition documents.
//!
//! Every persisted entity (context, location, package, backup, batch,
//! repository) is an XML file whose root tag is a fixed signature string for
//! its kind. [`ConfigDocument`] loads such a file, refuses it when the root
//! tag is not the expected signature, and writes it back atomically.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::xml::{self, XmlError, XmlNode};

/// Root tag of a Context definition.
pub const SIGNATURE_CONTEXT: &str = "Open_Mod_Manager_Context";
/// Root tag of a Location definition.
pub const SIGNATURE_LOCATION: &str = "Open_Mod_Manager_Location";
/// Root tag of a Package definition.
pub const SIGNATURE_PACKAGE: &str = "Open_Mod_Manager_Package";
/// Root tag of a Backup definition.
pub const SIGNATURE_BACKUP: &str = "Open_Mod_Manager_Backup";
/// Root tag of a Batch definition.
pub const SIGNATURE_BATCH: &str = "Open_Mod_Manager_Batch";
/// Root tag of a Repository definition.
pub const SIGNATURE_REPOSITORY: &str = "Open_Mod_Manager_Repository";

/// Definition document errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Malformed definition: {0}")]
    MalformedXml(String),

    #[error("Wrong definition kind: expected <{expected}>, found <{found}>")]
    WrongSignature { expected: String, found: String },

    #[error("Failed to read {path}: {reason}")]
    IoRead { path: PathBuf, reason: String },

    #[error("Failed to write {path}: {reason}")]
    IoWrite { path: PathBuf, reason: String },

    #[error("Definition is not loaded")]
    NotLoaded,
}

impl From<XmlError> for ConfigError {
    fn from(err: XmlError) -> Self {
        ConfigError::MalformedXml(err.to_string())
    }
}

/// Lifecycle of a [`ConfigDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Pending,
    Valid,
    ErrorMalformed,
    ErrorWrongSignature,
}

/// An XML definition file guarded by its root-tag signature.
#[derive(Debug)]
pub struct ConfigDocument {
    path: Option<PathBuf>,
    root: Option<XmlNode>,
    state: DocumentState,
    last_error: Option<ConfigError>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self {
            path: None,
            root: None,
            state: DocumentState::Pending,
            last_error: None,
        }
    }

    /// Start an empty in-memory document with the given signature.
    pub fn init_new(&mut self, signature: &str) {
        self.path = None;
        self.root = Some(XmlNode::new(signature));
        self.state = DocumentState::Valid;
        self.last_error = None;
    }

    /// Start an empty document and create its file right away.
    pub fn init_new_at(&mut self, path: &Path, signature: &str) -> Result<(), ConfigError> {
        self.init_new(signature);
        self.path = Some(path.to_path_buf());
        self.save()
    }

    /// Load and validate a definition file.
    pub fn open(&mut self, path: &Path, signature: &str) -> Result<(), ConfigError> {
        self.reset();
        self.path = Some(path.to_path_buf());

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                return Err(self.fail(
                    DocumentState::ErrorMalformed,
                    ConfigError::IoRead {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    },
                ))
            }
        };
        let text = match xml::decode_xml_bytes(&bytes) {
            Ok(text) => text,
            Err(e) => return Err(self.fail(DocumentState::ErrorMalformed, e.into())),
        };
        self.load_text(&text, signature)
    }

    /// Load and validate a definition from text (e.g. an HTTP response).
    pub fn parse(&mut self, xml_text: &str, signature: &str) -> Result<(), ConfigError> {
        self.reset();
        self.load_text(xml_text, signature)
    }

    fn load_text(&mut self, text: &str, signature: &str) -> Result<(), ConfigError> {
        let root = match XmlNode::parse(text) {
            Ok(root) => root,
            Err(e) => return Err(self.fail(DocumentState::ErrorMalformed, e.into())),
        };
        if root.name != signature {
            let err = ConfigError::WrongSignature {
                expected: signature.to_string(),
                found: root.name,
            };
            return Err(self.fail(DocumentState::ErrorWrongSignature, err));
        }
        self.root = Some(root);
        self.state = DocumentState::Valid;
        Ok(())
    }

    /// Write the document to its current path.
    pub fn save(&mut self) -> Result<(), ConfigError> {
        if self.state != DocumentState::Valid {
            return Err(self.record(ConfigError::NotLoaded));
        }
        let Some(path) = self.path.clone() else {
            return Err(self.record(ConfigError::IoWrite {
                path: PathBuf::new(),
                reason: "document has no path".to_string(),
            }));
        };
        self.write_to(&path)
    }

    /// Write the document to a new path, which becomes its current path.
    pub fn save_as(&mut self, path: &Path) -> Result<(), ConfigError> {
        if self.state != DocumentState::Valid {
            return Err(self.record(ConfigError::NotLoaded));
        }
        self.write_to(path)?;
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    fn write_to(&mut self, path: &Path) -> Result<(), ConfigError> {
        let Some(root) = &self.root else {
            return Err(self.record(ConfigError::NotLoaded));
        };
        let text = match root.to_document() {
            Ok(text) => text,
            Err(e) => {
                return Err(self.record(ConfigError::IoWrite {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }))
            }
        };
        match write_atomic(path, text.as_bytes()) {
            Ok(()) => {
                debug!("Saved definition {}", path.display());
                Ok(())
            }
            Err(e) => Err(self.record(ConfigError::IoWrite {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })),
        }
    }

    /// Release the document, optionally saving it first.
    ///
    /// Never fails: a save error is kept in [`Self::last_error`] and the
    /// document is closed anyway.
    pub fn close(&mut self, flush_if_valid: bool) {
        if flush_if_valid && self.state == DocumentState::Valid && self.path.is_some() {
            if let Err(e) = self.save() {
                warn!("Failed to save definition on close: {}", e);
            }
        }
        self.path = None;
        self.root = None;
        self.state = DocumentState::Pending;
    }

    pub fn is_valid(&self) -> bool {
        self.state == DocumentState::Valid
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Root element; `None` unless the document is valid.
    pub fn root(&self) -> Option<&XmlNode> {
        if self.is_valid() {
            self.root.as_ref()
        } else {
            None
        }
    }

    pub fn root_mut(&mut self) -> Option<&mut XmlNode> {
        if self.is_valid() {
            self.root.as_mut()
        } else {
            None
        }
    }

    /// Root element or `NotLoaded`.
    pub fn require_root(&self) -> Result<&XmlNode, ConfigError> {
        self.root().ok_or(ConfigError::NotLoaded)
    }

    pub fn require_root_mut(&mut self) -> Result<&mut XmlNode, ConfigError> {
        self.root_mut().ok_or(ConfigError::NotLoaded)
    }

    pub fn last_error(&self) -> Option<&ConfigError> {
        self.last_error.as_ref()
    }

    /// Human readable last error, empty when none occurred.
    pub fn last_error_string(&self) -> String {
        self.last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    fn reset(&mut self) {
        self.path = None;
        self.root = None;
        self.state = DocumentState::Pending;
        self.last_error = None;
    }

    fn fail(&mut self, state: DocumentState, err: ConfigError) -> ConfigError {
        self.root = None;
        self.state = state;
        self.record(err)
    }

    fn record(&mut self, err: ConfigError) -> ConfigError {
        self.last_error = Some(err.clone());
        err
    }
}

/// Write a file whole: into a temp file beside the target, then renamed over
/// it. On failure the target is left untouched.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
