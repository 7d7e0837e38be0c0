//! Downloading remote packages into a library folder.
//!
//! Data is streamed into `<file>.part` and renamed into place only after size
//! and checksum checks pass. Each candidate URL is tried in turn. Callers get
//! monotonic progress events followed by exactly one terminal event.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use super::http::{HttpClient, NetworkError};
use super::remote::{RemotePackage, RemoteState};
use crate::hash;
use crate::paths;

/// Suffix of in-progress download files.
pub const PART_SUFFIX: &str = ".part";

/// Download failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("No download URL for {0}")]
    NoUrl(String),

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Failed to write download: {0}")]
    Io(String),
}

/// Events reported while downloading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Progress { downloaded: u64, total: Option<u64> },
    Completed { path: PathBuf },
    Aborted,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    /// Verify the MD5 checksum when the repository publishes one.
    pub verify_checksum: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            verify_checksum: true,
        }
    }
}

fn aborted(abort: Option<&AtomicBool>) -> bool {
    abort.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Download `remote` into `library`. Sets `DOWNLOADING` while running and
/// `ERROR` on failure. An abort is not a failure.
pub fn download_remote(
    remote: &mut RemotePackage,
    http: &dyn HttpClient,
    library: &Path,
    options: DownloadOptions,
    abort: Option<&AtomicBool>,
    on_event: &mut dyn FnMut(DownloadEvent),
) -> Result<PathBuf, DownloadError> {
    remote.state.remove(RemoteState::ERROR);
    remote.state.insert(RemoteState::DOWNLOADING);

    let result = fetch(remote, http, library, options, abort, on_event);

    remote.state.remove(RemoteState::DOWNLOADING);
    match &result {
        Ok(path) => {
            info!("Downloaded {} to {}", remote.identity.ident, path.display());
            on_event(DownloadEvent::Completed { path: path.clone() });
        }
        Err(DownloadError::Network(NetworkError::Aborted)) => {
            info!("Download of {} aborted", remote.identity.ident);
            on_event(DownloadEvent::Aborted);
        }
        Err(e) => {
            warn!("Download of {} failed: {}", remote.identity.ident, e);
            remote.state.insert(RemoteState::ERROR);
            on_event(DownloadEvent::Failed { reason: e.to_string() });
        }
    }
    result
}

fn fetch(
    remote: &RemotePackage,
    http: &dyn HttpClient,
    library: &Path,
    options: DownloadOptions,
    abort: Option<&AtomicBool>,
    on_event: &mut dyn FnMut(DownloadEvent),
) -> Result<PathBuf, DownloadError> {
    if !paths::is_valid_name(&remote.file) {
        return Err(DownloadError::InvalidFileName(remote.file.clone()));
    }
    if remote.download_urls.is_empty() {
        return Err(DownloadError::NoUrl(remote.identity.ident.clone()));
    }
    fs::create_dir_all(library).map_err(|e| DownloadError::Io(e.to_string()))?;

    let part = library.join(format!("{}{}", remote.file, PART_SUFFIX));
    let target = library.join(&remote.file);
    let expected_total = (remote.size_bytes > 0).then_some(remote.size_bytes);
    let mut reported = 0u64;
    let mut last_error = DownloadError::NoUrl(remote.identity.ident.clone());

    for url in &remote.download_urls {
        if aborted(abort) {
            return Err(NetworkError::Aborted.into());
        }

        let file = File::create(&part).map_err(|e| DownloadError::Io(e.to_string()))?;
        let mut sink = BufWriter::new(file);
        let transfer = http.download(url, &mut sink, &mut |downloaded, total| {
            // Progress never moves backwards, even when a retry restarts.
            reported = reported.max(downloaded);
            on_event(DownloadEvent::Progress {
                downloaded: reported,
                total: total.or(expected_total),
            });
            !aborted(abort)
        });
        let flushed = sink.into_inner().map(drop).map_err(|e| e.to_string());

        let written = match (transfer, flushed) {
            (Ok(n), Ok(())) => n,
            (Err(NetworkError::Aborted), _) => {
                discard(&part);
                return Err(NetworkError::Aborted.into());
            }
            (Err(e), _) => {
                warn!("Download from {} failed: {}", url, e);
                discard(&part);
                last_error = e.into();
                continue;
            }
            (Ok(_), Err(e)) => {
                discard(&part);
                return Err(DownloadError::Io(e));
            }
        };

        if let Err(e) = verify(remote, &part, written, options) {
            warn!("Download from {} rejected: {}", url, e);
            discard(&part);
            last_error = e;
            continue;
        }

        fs::rename(&part, &target).map_err(|e| DownloadError::Io(e.to_string()))?;
        return Ok(target);
    }

    Err(last_error)
}

fn verify(remote: &RemotePackage, part: &Path, written: u64, options: DownloadOptions) -> Result<(), DownloadError> {
    if remote.size_bytes > 0 && written != remote.size_bytes {
        return Err(DownloadError::SizeMismatch {
            expected: remote.size_bytes,
            actual: written,
        });
    }
    if options.verify_checksum && !remote.checksum.is_empty() && !hash::verify(part, &remote.checksum) {
        return Err(DownloadError::ChecksumMismatch {
            expected: remote.checksum.clone(),
            actual: hash::checksum(part),
        });
    }
    Ok(())
}

fn discard(part: &Path) {
    if let Err(e) = fs::remove_file(part) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", part.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::http::tests::FakeClient;
    use super::*;
    use crate::identity::PackageIdentity;
    use tempfile::tempdir;

    fn remote(urls: &[&str], size: u64, checksum: &str) -> RemotePackage {
        RemotePackage {
            identity: PackageIdentity::from_ident("Hats_v1", true),
            repository: "r".to_string(),
            file: "Hats_v1.zip".to_string(),
            download_urls: urls.iter().map(|u| u.to_string()).collect(),
            checksum: checksum.to_string(),
            size_bytes: size,
            dependencies: Vec::new(),
            missing_dependencies: Vec::new(),
            upgrade_targets: Vec::new(),
            superseded_by: Vec::new(),
            thumbnail: None,
            description: None,
            state: RemoteState::NEW,
        }
    }

    fn terminal_count(events: &[DownloadEvent]) -> usize {
        events
            .iter()
            .filter(|e| !matches!(e, DownloadEvent::Progress { .. }))
            .count()
    }

    #[test]
    fn test_download_with_fallback() {
        let dir = tempdir().unwrap();
        let body = b"zipdata-zipdata".to_vec();
        let client = FakeClient::new()
            .fail("http://a/Hats_v1.zip", NetworkError::TransferFailed("reset".to_string()))
            .serve("http://b/Hats_v1.zip", body.clone());
        let checksum = format!("{:x}", md5::compute(&body));
        let mut pkg = remote(&["http://a/Hats_v1.zip", "http://b/Hats_v1.zip"], body.len() as u64, &checksum);

        let mut events = Vec::new();
        let path = download_remote(
            &mut pkg,
            &client,
            dir.path(),
            DownloadOptions::default(),
            None,
            &mut |e| events.push(e),
        )
        .unwrap();

        assert_eq!(fs::read(&path).unwrap(), body);
        assert!(!dir.path().join("Hats_v1.zip.part").exists());
        assert_eq!(pkg.state, RemoteState::NEW);
        assert_eq!(terminal_count(&events), 1);
        assert_eq!(events.last(), Some(&DownloadEvent::Completed { path }));

        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::Progress { downloaded, .. } => Some(*downloaded),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_checksum_mismatch_fails() {
        let dir = tempdir().unwrap();
        let client = FakeClient::new().serve("http://a/Hats_v1.zip", b"payload".to_vec());
        let mut pkg = remote(&["http://a/Hats_v1.zip"], 0, "00000000000000000000000000000000");

        let mut events = Vec::new();
        let err = download_remote(
            &mut pkg,
            &client,
            dir.path(),
            DownloadOptions::default(),
            None,
            &mut |e| events.push(e),
        )
        .unwrap_err();

        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(pkg.state.contains(RemoteState::ERROR));
        assert!(!pkg.state.contains(RemoteState::DOWNLOADING));
        assert!(!dir.path().join("Hats_v1.zip").exists());
        assert!(!dir.path().join("Hats_v1.zip.part").exists());
        assert_eq!(terminal_count(&events), 1);

        // Verification can be turned off.
        let ok = download_remote(
            &mut pkg,
            &client,
            dir.path(),
            DownloadOptions {
                verify_checksum: false,
            },
            None,
            &mut |_| {},
        );
        assert!(ok.is_ok());
        assert!(!pkg.state.contains(RemoteState::ERROR));
    }

    #[test]
    fn test_size_mismatch_fails() {
        let dir = tempdir().unwrap();
        let client = FakeClient::new().serve("http://a/Hats_v1.zip", b"short".to_vec());
        let mut pkg = remote(&["http://a/Hats_v1.zip"], 999, "");
        let err = download_remote(&mut pkg, &client, dir.path(), DownloadOptions::default(), None, &mut |_| {})
            .unwrap_err();
        assert_eq!(err, DownloadError::SizeMismatch { expected: 999, actual: 5 });
    }

    #[test]
    fn test_abort_midway() {
        let dir = tempdir().unwrap();
        let client = FakeClient::new().serve("http://a/Hats_v1.zip", vec![7u8; 64]);
        let mut pkg = remote(&["http://a/Hats_v1.zip"], 64, "");
        let abort = AtomicBool::new(false);

        let mut events = Vec::new();
        let err = download_remote(
            &mut pkg,
            &client,
            dir.path(),
            DownloadOptions::default(),
            Some(&abort),
            &mut |e| {
                if let DownloadEvent::Progress { downloaded, .. } = &e {
                    if *downloaded >= 16 {
                        abort.store(true, Ordering::Relaxed);
                    }
                }
                events.push(e);
            },
        )
        .unwrap_err();

        assert_eq!(err, DownloadError::Network(NetworkError::Aborted));
        assert_eq!(events.last(), Some(&DownloadEvent::Aborted));
        assert_eq!(terminal_count(&events), 1);
        assert!(!pkg.state.contains(RemoteState::ERROR));
        assert!(!dir.path().join("Hats_v1.zip.part").exists());
    }

    #[test]
    fn test_invalid_file_name_rejected_before_io() {
        let dir = tempdir().unwrap();
        let client = FakeClient::new();
        let mut pkg = remote(&["http://a/x"], 0, "");
        pkg.file = "../evil.zip".to_string();
        let err = download_remote(&mut pkg, &client, dir.path(), DownloadOptions::default(), None, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidFileName(_)));
        assert!(client.requested().is_empty());
    }
}
