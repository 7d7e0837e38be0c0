//! Remote package repositories.
//!
//! A repository is an XML definition served over HTTP at
//! `<base_url>/<suffix>.xml`. It lists downloadable packages with their
//! checksums, sizes, dependencies and optional thumbnails and descriptions.

pub mod download;
pub mod http;
pub mod remote;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::codec;
use crate::paths;
use crate::document::{ConfigDocument, ConfigError, SIGNATURE_REPOSITORY};
use crate::xml::{self, XmlNode};

pub use download::{download_remote, DownloadError, DownloadEvent, DownloadOptions};
pub use http::{HttpClient, NetworkError, ReqwestClient};
pub use remote::{RemotePackage, RemoteState};

/// Default definition name appended to a repository base URL.
pub const DEFAULT_SUFFIX: &str = "repository";

/// Repository errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Definition(#[from] ConfigError),

    #[error("Repository definition is missing <{0}>")]
    MissingNode(&'static str),
}

/// One `<remote>` entry of a repository definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub ident: String,
    /// File name to download, relative to the download prefix.
    pub file: String,
    pub bytes: u64,
    pub checksum: String,
    /// Overrides the repository's download prefix for this entry.
    pub custom_url: Option<String>,
    pub dependencies: Vec<String>,
    pub thumbnail: Option<Vec<u8>>,
    pub description: Option<String>,
}

impl RemoteDescriptor {
    /// Download URL of this entry as published by `repo`.
    pub fn download_url(&self, repo: &Repository) -> String {
        repo.download_url(self)
    }
}

/// A repository and the result of its last query.
#[derive(Debug, Clone)]
pub struct Repository {
    base_url: String,
    suffix: String,
    url: String,
    pub uuid: String,
    pub title: String,
    /// Download prefix; absolute URL or a path relative to the base URL.
    pub down_path: String,
    remotes: Vec<RemoteDescriptor>,
    last_error: Option<String>,
}

fn url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?i:https?)://[A-Za-z0-9.\-]+(:[0-9]{1,5})?/\S+$").ok())
        .as_ref()
}

/// Check that a URL is `http(s)://host[:port]/path` with a non-empty path.
pub fn is_valid_url(url: &str) -> bool {
    url_pattern().is_some_and(|re| re.is_match(url))
}

/// Check that a string starts with an HTTP scheme.
pub fn is_absolute_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Join URL segments with exactly one `/` between them.
pub fn join_url(prefix: &str, tail: &str) -> String {
    let tail = tail.trim_start_matches('/');
    if tail.is_empty() {
        return prefix.to_string();
    }
    format!("{}/{}", prefix.trim_end_matches('/'), tail)
}

impl Repository {
    /// Create a repository for `<base_url>/<suffix>.xml`.
    pub fn new(base_url: &str, suffix: &str) -> Result<Self, RepositoryError> {
        let mut repo = Self {
            base_url: String::new(),
            suffix: String::new(),
            url: String::new(),
            uuid: String::new(),
            title: String::new(),
            down_path: String::new(),
            remotes: Vec::new(),
            last_error: None,
        };
        repo.init(base_url, suffix)?;
        Ok(repo)
    }

    /// Point the repository at a new URL, dropping previous results.
    pub fn init(&mut self, base_url: &str, suffix: &str) -> Result<(), RepositoryError> {
        let base = base_url.trim().trim_end_matches('/');
        let suffix = suffix.trim().trim_matches('/');
        let suffix = if suffix.is_empty() { DEFAULT_SUFFIX } else { suffix };
        let url = format!("{}/{}.xml", base, suffix);
        if !paths::is_valid_name(suffix) || !is_valid_url(&url) {
            return Err(NetworkError::InvalidUrl(url).into());
        }
        self.clear();
        self.base_url = base.to_string();
        self.suffix = suffix.to_string();
        self.url = url;
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Full definition URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn remotes(&self) -> &[RemoteDescriptor] {
        &self.remotes
    }

    /// Add an entry to be written by [`Repository::to_definition`].
    pub fn push_remote(&mut self, descriptor: RemoteDescriptor) {
        self.remotes.push(descriptor);
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Last query error, empty when the last query succeeded.
    pub fn last_error_string(&self) -> String {
        self.last_error.clone().unwrap_or_default()
    }

    /// Drop the results of the last query.
    pub fn clear(&mut self) {
        self.uuid.clear();
        self.title.clear();
        self.down_path.clear();
        self.remotes.clear();
        self.last_error = None;
    }

    /// Fetch and parse the repository definition. Returns the number of
    /// remote entries. On failure, previous results are cleared and the
    /// error is kept in [`Self::last_error`].
    pub fn query(&mut self, http: &dyn HttpClient, abort: Option<&AtomicBool>) -> Result<usize, RepositoryError> {
        self.clear();
        let result = self.fetch_and_parse(http, abort);
        match &result {
            Ok(count) => info!("Repository {} lists {} package(s)", self.url, count),
            Err(e) => {
                warn!("Repository query failed for {}: {}", self.url, e);
                let message = e.to_string();
                self.clear();
                self.last_error = Some(message);
            }
        }
        result
    }

    fn fetch_and_parse(&mut self, http: &dyn HttpClient, abort: Option<&AtomicBool>) -> Result<usize, RepositoryError> {
        check_abort(abort)?;
        let bytes = http.get(&self.url)?;
        check_abort(abort)?;
        let text = xml::decode_xml_bytes(&bytes).map_err(ConfigError::from)?;
        self.parse_definition(&text, abort)
    }

    /// Parse a repository definition into this repository.
    pub fn parse_definition(&mut self, text: &str, abort: Option<&AtomicBool>) -> Result<usize, RepositoryError> {
        let mut doc = ConfigDocument::new();
        doc.parse(text, SIGNATURE_REPOSITORY)?;
        let root = doc.require_root()?;

        for name in ["uuid", "title", "downpath", "remotes"] {
            if !root.has_child(name) {
                return Err(RepositoryError::MissingNode(name));
            }
        }
        self.uuid = root.child_text("uuid").unwrap_or_default().to_string();
        self.title = root.child_text("title").unwrap_or_default().to_string();
        self.down_path = root.child_text("downpath").unwrap_or_default().to_string();

        let remotes = root.child("remotes").ok_or(RepositoryError::MissingNode("remotes"))?;
        self.remotes.clear();
        for node in remotes.children_named("remote") {
            check_abort(abort)?;
            match parse_remote(node) {
                Some(descriptor) => self.remotes.push(descriptor),
                None => warn!("Skipping <remote> without ident or file in {}", self.url),
            }
        }
        if let Some(count) = remotes.attr("count").and_then(|c| c.parse::<usize>().ok()) {
            if count != self.remotes.len() {
                debug!(
                    "Repository {} declares {} remotes, parsed {}",
                    self.url,
                    count,
                    self.remotes.len()
                );
            }
        }
        Ok(self.remotes.len())
    }

    /// Download prefix for entries without a custom URL.
    pub fn download_prefix(&self) -> String {
        if is_absolute_url(&self.down_path) {
            self.down_path.trim().to_string()
        } else {
            join_url(&self.base_url, self.down_path.trim())
        }
    }

    /// Download URL of one descriptor.
    pub fn download_url(&self, descriptor: &RemoteDescriptor) -> String {
        let prefix = match descriptor.custom_url.as_deref().map(str::trim) {
            Some(custom) if !custom.is_empty() => {
                if is_absolute_url(custom) {
                    custom.to_string()
                } else {
                    join_url(&self.base_url, custom)
                }
            }
            _ => self.download_prefix(),
        };
        join_url(&prefix, &descriptor.file)
    }

    /// Serialize the current contents as a repository definition.
    pub fn to_definition(&self) -> Result<String, ConfigError> {
        let mut root = XmlNode::new(SIGNATURE_REPOSITORY);
        root.set_child_text("uuid", self.uuid.clone());
        root.set_child_text("title", self.title.clone());
        root.set_child_text("downpath", self.down_path.clone());
        let remotes = root.add_child(
            XmlNode::new("remotes").with_attr("count", self.remotes.len().to_string()),
        );
        for descriptor in &self.remotes {
            remotes.add_child(remote_to_node(descriptor)?);
        }
        Ok(root.to_document()?)
    }
}

fn check_abort(abort: Option<&AtomicBool>) -> Result<(), RepositoryError> {
    match abort {
        Some(flag) if flag.load(Ordering::Relaxed) => Err(RepositoryError::Network(NetworkError::Aborted)),
        _ => Ok(()),
    }
}

fn parse_remote(node: &XmlNode) -> Option<RemoteDescriptor> {
    let ident = node.attr("ident").map(str::trim).filter(|s| !s.is_empty())?;
    let file = node.attr("file").map(str::trim).filter(|s| !s.is_empty())?;

    let mut descriptor = RemoteDescriptor {
        ident: ident.to_string(),
        file: file.to_string(),
        bytes: node.attr("bytes").and_then(|b| b.trim().parse().ok()).unwrap_or(0),
        checksum: node.attr("checksum").unwrap_or_default().trim().to_lowercase(),
        ..Default::default()
    };

    descriptor.custom_url = node
        .child_text("url")
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string);

    if let Some(deps) = node.child("dependencies") {
        descriptor.dependencies = deps
            .children_named("ident")
            .map(|d| d.text.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
    }

    if let Some(picture) = node.child("picture").filter(|p| !p.text.trim().is_empty()) {
        match codec::decode_thumbnail(&picture.text) {
            Ok(bytes) => descriptor.thumbnail = Some(bytes),
            Err(e) => warn!("Ignoring thumbnail of {}: {}", descriptor.ident, e),
        }
    }

    if let Some(desc) = node.child("description").filter(|d| !d.text.trim().is_empty()) {
        let len = desc.attr("bytes").and_then(|b| b.trim().parse::<usize>().ok());
        match len {
            Some(len) => match codec::decode_description(&desc.text, len) {
                Ok(text) => descriptor.description = Some(text),
                Err(e) => warn!("Ignoring description of {}: {}", descriptor.ident, e),
            },
            None => warn!("Ignoring description of {}: missing bytes attribute", descriptor.ident),
        }
    }

    Some(descriptor)
}

fn remote_to_node(descriptor: &RemoteDescriptor) -> Result<XmlNode, ConfigError> {
    let mut node = XmlNode::new("remote")
        .with_attr("ident", descriptor.ident.clone())
        .with_attr("file", descriptor.file.clone())
        .with_attr("bytes", descriptor.bytes.to_string())
        .with_attr("checksum", descriptor.checksum.clone());
    if let Some(url) = &descriptor.custom_url {
        node.set_child_text("url", url.clone());
    }
    if !descriptor.dependencies.is_empty() {
        let deps = node.add_child(XmlNode::new("dependencies"));
        for dep in &descriptor.dependencies {
            deps.add_child(XmlNode::new("ident").with_text(dep.clone()));
        }
    }
    if let Some(thumbnail) = &descriptor.thumbnail {
        node.set_child_text("picture", codec::encode_thumbnail(thumbnail));
    }
    if let Some(text) = &descriptor.description {
        let (uri, len) = codec::encode_description(text).map_err(|e| ConfigError::IoWrite {
            path: Default::default(),
            reason: e.to_string(),
        })?;
        node.add_child(
            XmlNode::new("description")
                .with_attr("bytes", len.to_string())
                .with_text(uri),
        );
    }
    Ok(node)
}
