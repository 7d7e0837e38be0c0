//! HTTP transport for repository queries and package downloads.
//!
//! Everything network-facing goes through the [`HttpClient`] trait so the
//! reconciliation and download logic can run against an in-memory client in
//! tests.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

/// Connection timeout: time to establish TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall timeout for one request. Package archives can be large, so this
/// is generous and covers a hung server rather than a slow link.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Size of one read while streaming a download.
const CHUNK_SIZE: usize = 64 * 1024;

/// Network errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Transfer aborted")]
    Aborted,
}

/// Minimal blocking HTTP surface.
pub trait HttpClient: Send + Sync {
    /// Fetch a whole response body.
    fn get(&self, url: &str) -> Result<Vec<u8>, NetworkError>;

    /// Stream a response body into `sink`. `on_progress(downloaded, total)`
    /// is called after every chunk; returning `false` aborts the transfer.
    /// Returns the number of bytes written.
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
    ) -> Result<u64, NetworkError>;
}

/// [`HttpClient`] backed by reqwest's blocking client.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("modvault/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    fn send(&self, url: &str) -> Result<reqwest::blocking::Response, NetworkError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| NetworkError::TransferFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        debug!("GET {}", url);
        let bytes = self
            .send(url)?
            .bytes()
            .map_err(|e| NetworkError::TransferFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
    ) -> Result<u64, NetworkError> {
        debug!("Downloading {}", url);
        let mut response = self.send(url)?;
        let total = response.content_length();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut downloaded = 0u64;

        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| NetworkError::TransferFailed(e.to_string()))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])
                .map_err(|e| NetworkError::TransferFailed(format!("write failed: {}", e)))?;
            downloaded += n as u64;
            if !on_progress(downloaded, total) {
                return Err(NetworkError::Aborted);
            }
        }
        sink.flush()
            .map_err(|e| NetworkError::TransferFailed(format!("write failed: {}", e)))?;
        Ok(downloaded)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory client serving canned responses.
    #[derive(Default)]
    pub(crate) struct FakeClient {
        responses: HashMap<String, Result<Vec<u8>, NetworkError>>,
        pub(crate) requests: Mutex<Vec<String>>,
        /// Bytes per progress callback.
        pub(crate) chunk: usize,
    }

    impl FakeClient {
        pub(crate) fn new() -> Self {
            Self {
                chunk: 4,
                ..Default::default()
            }
        }

        pub(crate) fn serve(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
            self.responses.insert(url.to_string(), Ok(body.into()));
            self
        }

        pub(crate) fn fail(mut self, url: &str, err: NetworkError) -> Self {
            self.responses.insert(url.to_string(), Err(err));
            self
        }

        pub(crate) fn requested(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }

        fn lookup(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.responses.get(url).cloned().unwrap_or(Err(NetworkError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }))
        }
    }

    impl HttpClient for FakeClient {
        fn get(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
            self.lookup(url)
        }

        fn download(
            &self,
            url: &str,
            sink: &mut dyn Write,
            on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
        ) -> Result<u64, NetworkError> {
            let body = self.lookup(url)?;
            let total = Some(body.len() as u64);
            let mut written = 0u64;
            for chunk in body.chunks(self.chunk.max(1)) {
                sink.write_all(chunk)
                    .map_err(|e| NetworkError::TransferFailed(e.to_string()))?;
                written += chunk.len() as u64;
                if !on_progress(written, total) {
                    return Err(NetworkError::Aborted);
                }
            }
            Ok(written)
        }
    }

    #[test]
    fn test_fake_client_streams_in_chunks() {
        let client = FakeClient::new().serve("http://h/a", b"0123456789".to_vec());
        let mut out = Vec::new();
        let mut seen = Vec::new();
        let n = client
            .download("http://h/a", &mut out, &mut |done, _| {
                seen.push(done);
                true
            })
            .unwrap();
        assert_eq!(n, 10);
        assert_eq!(out, b"0123456789");
        assert_eq!(seen, vec![4, 8, 10]);
        assert!(matches!(
            client.get("http://h/missing"),
            Err(NetworkError::HttpStatus { status: 404, .. })
        ));
    }

    #[test]
    fn test_reqwest_client_builds() {
        assert!(ReqwestClient::new().is_ok());
    }
}
