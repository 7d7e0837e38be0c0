//! Embedded blob encoding for repository definitions.
//!
//! Repository definitions embed binary payloads as `data:` URIs:
//! - `<picture>`: a base64 JPEG thumbnail, kept as opaque bytes
//! - `<description bytes="N">`: base64 zlib-compressed UTF-8 text, where `N`
//!   is the exact uncompressed size needed to size the inflate buffer

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// MIME type written for thumbnails.
pub const THUMBNAIL_MIME: &str = "image/jpeg";

/// MIME type written for compressed descriptions.
pub const DESCRIPTION_MIME: &str = "application/octet-stream";

/// Largest uncompressed description accepted from a definition.
pub const MAX_INFLATED_LEN: usize = 16 * 1024 * 1024;

/// Decoding failures for embedded blobs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Not a data URI")]
    NotDataUri,

    #[error("Unsupported data URI encoding (only base64 is accepted)")]
    NotBase64,

    #[error("Invalid base64 payload: {0}")]
    Base64(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Description is not valid UTF-8")]
    Utf8,
}

/// Decoded `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Encode bytes as `data:<mime>;base64,<payload>`.
pub fn encode_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// Decode a base64 `data:` URI.
pub fn decode_data_uri(uri: &str) -> Result<DataUri, CodecError> {
    let rest = uri.trim().strip_prefix("data:").ok_or(CodecError::NotDataUri)?;
    let (header, payload) = rest.split_once(',').ok_or(CodecError::NotDataUri)?;

    let mut params = header.split(';');
    let mime = params.next().unwrap_or_default().to_string();
    if !params.any(|p| p.eq_ignore_ascii_case("base64")) {
        return Err(CodecError::NotBase64);
    }

    // Definitions are often written with line-wrapped payloads.
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| CodecError::Base64(e.to_string()))?;
    Ok(DataUri { mime, bytes })
}

/// Compress text with zlib, returning the compressed bytes and the original
/// byte length.
pub fn deflate_text(text: &str) -> Result<(Vec<u8>, usize), CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    Ok((compressed, text.len()))
}

/// Inflate exactly `original_len` bytes of zlib data into text.
///
/// `original_len` comes from untrusted input, so it is capped at
/// [`MAX_INFLATED_LEN`] and the buffer only grows as data is inflated.
pub fn inflate_text(compressed: &[u8], original_len: usize) -> Result<String, CodecError> {
    if original_len > MAX_INFLATED_LEN {
        return Err(CodecError::Compression(format!(
            "declared size {} exceeds the {} byte limit",
            original_len, MAX_INFLATED_LEN
        )));
    }
    let mut out = Vec::new();
    ZlibDecoder::new(compressed)
        .take(original_len as u64)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    if out.len() != original_len {
        return Err(CodecError::Compression(format!(
            "expected {} bytes, inflated {}",
            original_len,
            out.len()
        )));
    }
    String::from_utf8(out).map_err(|_| CodecError::Utf8)
}

/// Encode a description as `(data_uri, uncompressed_len)`.
pub fn encode_description(text: &str) -> Result<(String, usize), CodecError> {
    let (compressed, len) = deflate_text(text)?;
    Ok((encode_data_uri(DESCRIPTION_MIME, &compressed), len))
}

/// Decode a `<description bytes="N">` payload.
pub fn decode_description(uri: &str, original_len: usize) -> Result<String, CodecError> {
    let data = decode_data_uri(uri)?;
    inflate_text(&data.bytes, original_len)
}

/// Encode JPEG bytes as a thumbnail data URI.
pub fn encode_thumbnail(jpeg: &[u8]) -> String {
    encode_data_uri(THUMBNAIL_MIME, jpeg)
}

/// Decode a `<picture>` payload into raw image bytes.
pub fn decode_thumbnail(uri: &str) -> Result<Vec<u8>, CodecError> {
    Ok(decode_data_uri(uri)?.bytes)
}
