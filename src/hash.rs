//! Hash utilities for package identity and file integrity.
//!
//! Two hashes with two distinct jobs:
//! - xxHash64 over a package's file/folder name is its identity key, shared
//!   by the library, the backups and every repository entry.
//! - MD5 over a file's content is the integrity checksum published by
//!   repositories and checked after downloads.
//!
//! Identity hashes are rendered as fixed-width (16 digit) lowercase hex.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Compute the identity hash of a package name.
///
/// Only the last path segment is hashed, so a bare name and a full path to
/// the same file name produce the same value. Case-sensitive.
pub fn ident_hash(name_or_path: &str) -> u64 {
    let name = crate::paths::file_name(name_or_path);
    xxhash_rust::xxh64::xxh64(name.as_bytes(), 0)
}

/// Render an identity hash as 16 lowercase hex digits.
pub fn hash_to_hex(hash: u64) -> String {
    format!("{:016x}", hash)
}

/// Parse an identity hash from fixed-width or minimal-width hex.
pub fn hex_to_hash(hex: &str) -> Option<u64> {
    let trimmed = hex.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if trimmed.is_empty() || trimmed.len() > 16 {
        return None;
    }
    u64::from_str_radix(trimmed, 16).ok()
}

/// Compute the MD5 checksum of a file as lowercase hex.
///
/// The whole file is read into memory. Package archives are bounded by
/// practical archive sizes.
pub fn try_checksum(path: &Path) -> Result<String> {
    let data = fs::read(path)
        .with_context(|| format!("Failed to read file for checksum: {}", path.display()))?;
    Ok(format!("{:x}", md5::compute(&data)))
}

/// Compute the MD5 checksum of a file, or an empty string on I/O failure.
pub fn checksum(path: &Path) -> String {
    match try_checksum(path) {
        Ok(sum) => sum,
        Err(e) => {
            tracing::debug!("checksum failed: {:#}", e);
            String::new()
        }
    }
}

/// Verify a file against an expected hex checksum (case-insensitive).
///
/// Any failure to read the file counts as a mismatch.
pub fn verify(path: &Path, expected_hex: &str) -> bool {
    let expected = expected_hex.trim();
    if expected.is_empty() {
        return false;
    }
    let actual = checksum(path);
    !actual.is_empty() && actual.eq_ignore_ascii_case(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_ident_hash_is_deterministic() {
        let a = ident_hash("Better_Trees_v1.2");
        let b = ident_hash("Better_Trees_v1.2");
        assert_eq!(a, b);
        assert_ne!(a, ident_hash("better_trees_v1.2"));
    }

    #[test]
    fn test_ident_hash_uses_last_segment() {
        assert_eq!(
            ident_hash("Better_Trees_v1.2"),
            ident_hash("C:\\Mods\\Library\\Better_Trees_v1.2")
        );
        assert_eq!(
            ident_hash("Better_Trees_v1.2"),
            ident_hash("/home/user/library/Better_Trees_v1.2")
        );
    }

    #[test]
    fn test_ident_hash_no_collisions_on_generated_names() {
        let mut seen = HashSet::new();
        for i in 0..10_000 {
            let name = format!("Generated_Package_{}_v{}.{}", i, i % 7, i % 13);
            assert!(seen.insert(ident_hash(&name)), "collision on {}", name);
        }
    }

    #[test]
    fn test_hex_round_trip() {
        let hash = ident_hash("SomeMod");
        let hex = hash_to_hex(hash);
        assert_eq!(hex.len(), 16);
        assert_eq!(hex_to_hash(&hex), Some(hash));

        assert_eq!(hash_to_hex(0xabcd), "000000000000abcd");
        assert_eq!(hex_to_hash("abcd"), Some(0xabcd));
        assert_eq!(hex_to_hash("0xABCD"), Some(0xabcd));
        assert_eq!(hex_to_hash(""), None);
        assert_eq!(hex_to_hash("not hex"), None);
        assert_eq!(hex_to_hash("11112222333344445"), None);
    }

    #[test]
    fn test_checksum_known_value() -> Result<()> {
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(b"Hello, World!")?;
        tmp.flush()?;

        assert_eq!(checksum(tmp.path()), "65a8e27d8879283831b664bd8b7f0ad4");
        Ok(())
    }

    #[test]
    fn test_checksum_missing_file_is_empty() {
        assert_eq!(checksum(Path::new("/definitely/not/here.zip")), "");
    }

    #[test]
    fn test_verify() -> Result<()> {
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(b"Test content for hashing")?;
        tmp.flush()?;

        let sum = checksum(tmp.path());
        assert!(verify(tmp.path(), &sum));
        assert!(verify(tmp.path(), &sum.to_uppercase()));
        assert!(!verify(tmp.path(), "00000000000000000000000000000000"));
        assert!(!verify(tmp.path(), ""));
        assert!(!verify(Path::new("/definitely/not/here.zip"), &sum));
        Ok(())
    }
}
