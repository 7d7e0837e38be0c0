//! Package sources: zip archives and plain folders in a library.
//!
//! A package is scanned once into an ordered entry list. The order is
//! parent-before-child so an install can create directories as it goes and an
//! uninstall can walk the list backwards without hitting non-empty parents.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backup::ModBackup;
use crate::hash;
use crate::identity::PackageIdentity;
use crate::install::InstallError;
use crate::paths;

/// Extensions recognized as package archives when scanning a library.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip"];

/// Where a package's content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageSource {
    Archive,
    Folder,
}

/// One file or directory inside a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Index in the archive, or -1 for folder entries and implicit
    /// archive directories.
    pub archive_index: i32,
    pub is_dir: bool,
    /// `/`-separated path relative to the package root.
    pub relative_path: String,
    pub size: u64,
}

/// A scanned package ready to install.
#[derive(Debug, Clone)]
pub struct Package {
    pub identity: PackageIdentity,
    pub path: PathBuf,
    pub source: PackageSource,
    entries: Vec<SourceEntry>,
}

impl Package {
    /// Scan a zip archive or a folder.
    pub fn scan(path: &Path, underscore_to_space: bool) -> Result<Self, InstallError> {
        let meta = fs::metadata(path)
            .map_err(|e| InstallError::SourceUnreadable(format!("{}: {}", path.display(), e)))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| InstallError::SourceUnreadable(format!("{}: no file name", path.display())))?;

        let (source, entries) = if meta.is_dir() {
            (PackageSource::Folder, scan_folder(path)?)
        } else {
            (PackageSource::Archive, scan_archive(path)?)
        };

        let identity = PackageIdentity::from_path_name(&name, source == PackageSource::Archive, underscore_to_space);
        debug!(
            "Scanned package {} ({} entries) from {}",
            identity.ident,
            entries.len(),
            path.display()
        );

        Ok(Self {
            identity,
            path: path.to_path_buf(),
            source,
            entries,
        })
    }

    /// Whether a library directory entry looks like a package.
    pub fn is_candidate(path: &Path) -> bool {
        if path.is_dir() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| ARCHIVE_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)))
            .unwrap_or(false)
    }

    /// Entries in parent-before-child order.
    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_dir).count()
    }

    /// Total uncompressed size of all files.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// MD5 of the archive file; empty for folders.
    pub fn checksum(&self) -> String {
        match self.source {
            PackageSource::Archive => hash::checksum(&self.path),
            PackageSource::Folder => String::new(),
        }
    }

    /// Extract a single entry to `dest`. Use [`Self::open`] when extracting
    /// many entries.
    pub fn extract_entry(&self, entry: &SourceEntry, dest: &Path) -> Result<u64, InstallError> {
        self.open()?
            .extract(entry, dest)
            .map_err(|e| InstallError::DestinationUnwritable(format!("{}: {}", dest.display(), e)))
    }

    /// Whether any of `backups` records this package.
    pub fn is_installed_in(&self, backups: &[ModBackup]) -> bool {
        backups.iter().any(|b| b.owner_hash == self.identity.hash)
    }

    /// Open a reader to extract entries.
    pub fn open(&self) -> Result<EntryReader, InstallError> {
        let archive = match self.source {
            PackageSource::Archive => {
                let file = File::open(&self.path).map_err(|e| {
                    InstallError::SourceUnreadable(format!("{}: {}", self.path.display(), e))
                })?;
                let archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| {
                    InstallError::SourceUnreadable(format!("{}: {}", self.path.display(), e))
                })?;
                Some(archive)
            }
            PackageSource::Folder => None,
        };
        Ok(EntryReader {
            root: self.path.clone(),
            archive,
        })
    }
}

/// Extracts package entries one at a time.
pub struct EntryReader {
    root: PathBuf,
    archive: Option<zip::ZipArchive<BufReader<File>>>,
}

impl EntryReader {
    /// Write one file entry to `dest`, overwriting. Returns bytes written.
    pub fn extract(&mut self, entry: &SourceEntry, dest: &Path) -> io::Result<u64> {
        if entry.is_dir {
            fs::create_dir_all(dest)?;
            return Ok(0);
        }
        paths::ensure_parent_dirs(dest)?;
        match self.archive.as_mut() {
            Some(archive) => {
                let index = usize::try_from(entry.archive_index).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "archive entry has no index")
                })?;
                let mut file = archive.by_index(index).map_err(io::Error::other)?;
                let mut out = File::create(dest)?;
                io::copy(&mut file, &mut out)
            }
            None => fs::copy(paths::join_relative(&self.root, &entry.relative_path), dest),
        }
    }
}

fn scan_folder(root: &Path) -> Result<Vec<SourceEntry>, InstallError> {
    let mut entries = Vec::new();
    for item in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let item = item.map_err(|e| InstallError::SourceUnreadable(e.to_string()))?;
        let file_type = item.file_type();
        if file_type.is_symlink() {
            warn!("Skipping symlink in package: {}", item.path().display());
            continue;
        }
        let rel = item
            .path()
            .strip_prefix(root)
            .map_err(|e| InstallError::SourceUnreadable(e.to_string()))?;
        let relative_path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = if file_type.is_file() {
            item.metadata().map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        entries.push(SourceEntry {
            archive_index: -1,
            is_dir: file_type.is_dir(),
            relative_path,
            size,
        });
    }
    Ok(entries)
}

fn scan_archive(path: &Path) -> Result<Vec<SourceEntry>, InstallError> {
    let unreadable = |e: &dyn std::fmt::Display| {
        InstallError::SourceUnreadable(format!("{}: {}", path.display(), e))
    };
    let file = File::open(path).map_err(|e| unreadable(&e))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| unreadable(&e))?;

    // Keyed by path components so parents sort before their children.
    let mut ordered: BTreeMap<Vec<String>, SourceEntry> = BTreeMap::new();

    for i in 0..archive.len() {
        let file = archive.by_index_raw(i).map_err(|e| unreadable(&e))?;
        if !paths::is_safe_relative(file.name()) {
            return Err(unreadable(&format!("unsafe entry path '{}'", file.name())));
        }
        let relative_path = paths::normalize_separators(file.name());
        if relative_path.is_empty() {
            continue;
        }
        let components: Vec<String> = relative_path.split('/').map(str::to_string).collect();

        // Archives often omit directory records.
        for depth in 1..components.len() {
            let parent = components[..depth].to_vec();
            ordered.entry(parent.clone()).or_insert_with(|| SourceEntry {
                archive_index: -1,
                is_dir: true,
                relative_path: parent.join("/"),
                size: 0,
            });
        }

        let index = i32::try_from(i).map_err(|_| unreadable(&"too many archive entries"))?;
        ordered.insert(
            components,
            SourceEntry {
                archive_index: index,
                is_dir: file.is_dir(),
                relative_path,
                size: if file.is_dir() { 0 } else { file.size() },
            },
        );
    }

    Ok(ordered.into_values().collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    /// Build a zip archive from `(path, content)` pairs; `None` content
    /// writes a directory record.
    pub(crate) fn write_zip(path: &Path, items: &[(&str, Option<&[u8]>)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, content) in items {
            match content {
                Some(bytes) => {
                    zip.start_file(*name, options).unwrap();
                    zip.write_all(bytes).unwrap();
                }
                None => {
                    zip.add_directory(*name, options).unwrap();
                }
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_scan_archive_orders_parents_first() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Cool_Hats_v2.1.zip");
        write_zip(
            &path,
            &[
                ("Data/Meshes/hat.nif", Some(b"mesh")),
                ("Data/hats.esp", Some(b"plugin")),
                ("readme.txt", Some(b"hi")),
            ],
        );

        let package = Package::scan(&path, true).unwrap();
        assert_eq!(package.source, PackageSource::Archive);
        assert_eq!(package.identity.name, "Cool Hats");
        assert_eq!(package.identity.ident, "Cool_Hats_v2.1");

        let paths: Vec<&str> = package.entries().iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["Data", "Data/Meshes", "Data/Meshes/hat.nif", "Data/hats.esp", "readme.txt"]
        );
        assert!(package.entries()[0].is_dir);
        assert_eq!(package.entries()[0].archive_index, -1);
        assert!(package.entries()[2].archive_index >= 0);
        assert_eq!(package.file_count(), 3);
        assert_eq!(package.total_size(), 12);
        assert_eq!(package.checksum().len(), 32);
    }

    #[test]
    fn test_scan_archive_rejects_unsafe_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evil.zip");
        write_zip(&path, &[("../escape.txt", Some(b"x"))]);
        assert!(matches!(
            Package::scan(&path, false),
            Err(InstallError::SourceUnreadable(_))
        ));
    }

    #[test]
    fn test_scan_not_an_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.zip");
        fs::write(&path, b"definitely not a zip").unwrap();
        assert!(matches!(
            Package::scan(&path, false),
            Err(InstallError::SourceUnreadable(_))
        ));
        assert!(matches!(
            Package::scan(&dir.path().join("missing.zip"), false),
            Err(InstallError::SourceUnreadable(_))
        ));
    }

    #[test]
    fn test_scan_folder() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Velvet Armor v1");
        fs::create_dir_all(root.join("Data/Textures")).unwrap();
        fs::write(root.join("Data/Textures/velvet.dds"), b"dds").unwrap();
        fs::write(root.join("Data/velvet.esp"), b"esp").unwrap();

        let package = Package::scan(&root, false).unwrap();
        assert_eq!(package.source, PackageSource::Folder);
        assert_eq!(package.identity.name, "Velvet Armor");
        let paths: Vec<&str> = package.entries().iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["Data", "Data/Textures", "Data/Textures/velvet.dds", "Data/velvet.esp"]
        );
        assert!(package.checksum().is_empty());
    }

    #[test]
    fn test_extract_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_zip(&path, &[("Data/", None), ("Data/a.txt", Some(b"alpha"))]);

        let package = Package::scan(&path, false).unwrap();
        let mut reader = package.open().unwrap();
        let out = dir.path().join("out");
        for entry in package.entries() {
            reader
                .extract(entry, &paths::join_relative(&out, &entry.relative_path))
                .unwrap();
        }
        assert!(out.join("Data").is_dir());
        assert_eq!(fs::read(out.join("Data/a.txt")).unwrap(), b"alpha");

        let single = dir.path().join("single.txt");
        assert_eq!(package.extract_entry(&package.entries()[1], &single).unwrap(), 5);
        assert!(!package.is_installed_in(&[]));
    }

    #[test]
    fn test_is_candidate() {
        let dir = tempdir().unwrap();
        assert!(Package::is_candidate(dir.path()));
        assert!(Package::is_candidate(&dir.path().join("Mod.ZIP")));
        assert!(!Package::is_candidate(&dir.path().join("notes.txt")));
    }
}
