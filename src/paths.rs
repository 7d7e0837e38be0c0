//! Path handling for package entries and destination trees.
//!
//! Package archives may use either separator, and mods are usually authored
//! on case-insensitive filesystems. This module handles:
//! - Normalizing entry paths to `/` separators
//! - A lowercase lookup form used when matching paths across packages
//! - Validation of names and archive paths before any I/O happens

use std::path::{Path, PathBuf};

/// Characters that are never allowed in a file or folder name.
const RESERVED_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Convert any separator to `/` and drop leading/trailing separators.
/// `Data\Textures\armor.dds` -> `Data/Textures/armor.dds`
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

/// Normalize a path for lookups and comparisons (lowercase, forward slashes, trimmed)
pub fn normalize_for_lookup(path: &str) -> String {
    normalize_separators(path).to_lowercase()
}

/// Get the last segment of a path (handles both / and \)
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['\\', '/']);
    trimmed
        .rfind(['\\', '/'])
        .map(|idx| &trimmed[idx + 1..])
        .unwrap_or(trimmed)
}

/// Split a file name into stem and extension at the last dot.
///
/// A leading dot is part of the stem (`.hidden` has no extension).
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

/// Join a root directory with a `/`-separated relative entry path
pub fn join_relative(root: &Path, relative: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in relative.split(['\\', '/']).filter(|s| !s.is_empty()) {
        out.push(part);
    }
    out
}

/// Check that a name is usable as a file or folder name on every target
/// platform.
pub fn is_valid_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty()
        && trimmed != "."
        && trimmed != ".."
        && !name
            .chars()
            .any(|c| RESERVED_NAME_CHARS.contains(&c) || c.is_control())
}

/// Check that an archive entry path stays inside the destination root.
pub fn is_safe_relative(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.starts_with('\\') {
        return false;
    }
    // Drive letters (`C:`) are absolute on Windows.
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return false;
    }
    path.split(['\\', '/'])
        .filter(|s| !s.is_empty())
        .all(|part| part != "..")
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_separators() {
        assert_eq!(normalize_separators("Data\\Textures\\armor.dds"), "Data/Textures/armor.dds");
        assert_eq!(normalize_separators("already/linux/path/"), "already/linux/path");
        assert_eq!(normalize_separators("\\mixed\\path/style"), "mixed/path/style");
    }

    #[test]
    fn test_normalize_for_lookup() {
        assert_eq!(normalize_for_lookup("Data\\Textures\\Armor.dds"), "data/textures/armor.dds");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("Data\\Textures\\armor.dds"), "armor.dds");
        assert_eq!(file_name("armor.dds"), "armor.dds");
        assert_eq!(file_name("/library/Some Mod/"), "Some Mod");
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("Mod_v1.2.zip"), ("Mod_v1.2", Some("zip")));
        assert_eq!(split_extension("noext"), ("noext", None));
        assert_eq!(split_extension(".hidden"), (".hidden", None));
    }

    #[test]
    fn test_join_relative() {
        let joined = join_relative(Path::new("/game"), "Data\\Textures/armor.dds");
        assert_eq!(joined, Path::new("/game/Data/Textures/armor.dds"));
    }

    #[test]
    fn test_is_valid_name() {
        assert!(is_valid_name("Better Trees v1.2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("   "));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("bad:name"));
        assert!(!is_valid_name("what?"));
        assert!(!is_valid_name("tab\tname"));
    }

    #[test]
    fn test_is_safe_relative() {
        assert!(is_safe_relative("Data/Textures/armor.dds"));
        assert!(!is_safe_relative("../outside.txt"));
        assert!(!is_safe_relative("Data/../../outside.txt"));
        assert!(!is_safe_relative("/etc/passwd"));
        assert!(!is_safe_relative("C:\\Windows\\system.ini"));
        assert!(!is_safe_relative(""));
    }
}
