//! Install records.
//!
//! Every installed package owns a backup folder under the location's backup
//! root, named after its identity hash:
//!
//! ```text
//! backup/<hash16>/backup.xml      install record
//! backup/<hash16>/data/<rel>      original copies of overwritten files
//! ```
//!
//! The record lists every destination entry the install touched, in install
//! order, with a flag telling whether uninstall deletes the entry or restores
//! the preserved original.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::document::{ConfigDocument, ConfigError, SIGNATURE_BACKUP};
use crate::hash;
use crate::paths;
use crate::xml::XmlNode;

/// File name of the install record inside a backup folder.
pub const BACKUP_DEFINITION: &str = "backup.xml";

/// Subfolder holding preserved originals.
pub const BACKUP_DATA_DIR: &str = "data";

/// One destination entry touched by an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModEntry {
    /// Index of the source entry in the package archive, -1 when unknown.
    pub archive_index: i32,
    pub is_dir: bool,
    /// `true`: the install created the entry and uninstall deletes it.
    /// `false`: the entry existed before and uninstall restores it.
    pub marked_for_deletion: bool,
    pub relative_path: String,
}

impl ModEntry {
    fn to_node(&self) -> XmlNode {
        XmlNode::new("entry")
            .with_attr("index", self.archive_index.to_string())
            .with_attr("dir", bool_attr(self.is_dir))
            .with_attr("delete", bool_attr(self.marked_for_deletion))
            .with_text(self.relative_path.clone())
    }

    fn from_node(node: &XmlNode) -> Option<Self> {
        let relative_path = paths::normalize_separators(&node.text);
        if relative_path.is_empty() || !paths::is_safe_relative(&relative_path) {
            return None;
        }
        Some(Self {
            archive_index: node.attr("index").and_then(|v| v.parse().ok()).unwrap_or(-1),
            is_dir: parse_bool_attr(node.attr("dir")),
            marked_for_deletion: parse_bool_attr(node.attr("delete")),
            relative_path,
        })
    }
}

/// Install record of one package.
#[derive(Debug, Clone)]
pub struct ModBackup {
    pub owner_hash: u64,
    pub ident: String,
    /// Package file or folder the install came from.
    pub source_path: PathBuf,
    /// Backup folder, `<backup_root>/<hash16>`.
    pub dir: PathBuf,
    /// Install order within the location; later installs have larger serials.
    pub serial: u64,
    /// Touched entries in install order.
    pub entries: Vec<ModEntry>,
    /// Packages this install overwrote at least one file of.
    pub overlapped: BTreeSet<u64>,
    /// `false` when the record could not be read; such a backup is listed
    /// but never used for uninstall.
    pub valid: bool,
    pub error: Option<String>,
}

impl ModBackup {
    pub fn new(owner_hash: u64, ident: &str, source_path: &Path, backup_root: &Path, serial: u64) -> Self {
        Self {
            owner_hash,
            ident: ident.to_string(),
            source_path: source_path.to_path_buf(),
            dir: Self::dir_for(backup_root, owner_hash),
            serial,
            entries: Vec::new(),
            overlapped: BTreeSet::new(),
            valid: true,
            error: None,
        }
    }

    /// Backup folder for a package hash.
    pub fn dir_for(backup_root: &Path, owner_hash: u64) -> PathBuf {
        backup_root.join(hash::hash_to_hex(owner_hash))
    }

    pub fn definition_path(&self) -> PathBuf {
        self.dir.join(BACKUP_DEFINITION)
    }

    /// Where the preserved original of `relative_path` lives.
    pub fn data_path(&self, relative_path: &str) -> PathBuf {
        paths::join_relative(&self.dir.join(BACKUP_DATA_DIR), relative_path)
    }

    pub fn push_entry(&mut self, entry: ModEntry) {
        self.entries.push(entry);
    }

    /// Record an overlapped package. A package never overlaps itself.
    pub fn add_overlap(&mut self, hash: u64) -> bool {
        hash != self.owner_hash && self.overlapped.insert(hash)
    }

    pub fn set_overlaps(&mut self, hashes: BTreeSet<u64>) {
        self.overlapped = hashes;
        self.overlapped.remove(&self.owner_hash);
    }

    pub fn overlaps(&self, hash: u64) -> bool {
        self.overlapped.contains(&hash)
    }

    /// Lookup-form paths of all files (not directories) in the record.
    pub fn file_lookup_paths(&self) -> impl Iterator<Item = String> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| paths::normalize_for_lookup(&e.relative_path))
    }

    /// Read an install record. Never fails: unreadable records come back
    /// with `valid == false` and the reason in `error`.
    pub fn load(dir: &Path) -> Self {
        let fallback_hash = dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(hash::hex_to_hash)
            .unwrap_or(0);
        let mut backup = Self {
            owner_hash: fallback_hash,
            ident: String::new(),
            source_path: PathBuf::new(),
            dir: dir.to_path_buf(),
            serial: 0,
            entries: Vec::new(),
            overlapped: BTreeSet::new(),
            valid: false,
            error: None,
        };

        let mut doc = ConfigDocument::new();
        if let Err(e) = doc.open(&dir.join(BACKUP_DEFINITION), SIGNATURE_BACKUP) {
            backup.error = Some(e.to_string());
            return backup;
        }
        match doc.require_root() {
            Ok(root) => {
                if let Err(reason) = backup.read_root(root) {
                    backup.error = Some(reason);
                } else {
                    backup.valid = true;
                }
            }
            Err(e) => backup.error = Some(e.to_string()),
        }
        if let Some(reason) = &backup.error {
            warn!("Backup record {} is unusable: {}", dir.display(), reason);
        }
        backup
    }

    fn read_root(&mut self, root: &XmlNode) -> Result<(), String> {
        let ident = root.child("ident").ok_or("missing <ident>")?;
        self.ident = ident.text.clone();
        self.owner_hash = ident
            .attr("hash")
            .and_then(hash::hex_to_hash)
            .ok_or("missing or invalid ident hash")?;
        self.source_path = PathBuf::from(root.child_text("source").unwrap_or_default());
        self.serial = root
            .child_text("serial")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        let entries = root.child("entries").ok_or("missing <entries>")?;
        for node in entries.children_named("entry") {
            let entry = ModEntry::from_node(node)
                .ok_or_else(|| format!("invalid entry path '{}'", node.text))?;
            self.entries.push(entry);
        }
        if let Some(count) = entries.attr("count").and_then(|c| c.parse::<usize>().ok()) {
            if count != self.entries.len() {
                return Err(format!(
                    "entry count mismatch: declared {}, found {}",
                    count,
                    self.entries.len()
                ));
            }
        }

        if let Some(overlaps) = root.child("overlaps") {
            for node in overlaps.children_named("overlap") {
                match node.attr("hash").and_then(hash::hex_to_hash) {
                    Some(h) => {
                        self.add_overlap(h);
                    }
                    None => debug!("Ignoring overlap without hash in {}", self.dir.display()),
                }
            }
        }
        Ok(())
    }

    fn to_root(&self) -> XmlNode {
        let mut root = XmlNode::new(SIGNATURE_BACKUP);
        root.add_child(
            XmlNode::new("ident")
                .with_attr("hash", hash::hash_to_hex(self.owner_hash))
                .with_text(self.ident.clone()),
        );
        root.add_child(XmlNode::new("source").with_text(self.source_path.to_string_lossy()));
        root.add_child(XmlNode::new("serial").with_text(self.serial.to_string()));

        let entries = root.add_child(
            XmlNode::new("entries").with_attr("count", self.entries.len().to_string()),
        );
        for entry in &self.entries {
            entries.add_child(entry.to_node());
        }

        let overlaps = root.add_child(XmlNode::new("overlaps"));
        for h in &self.overlapped {
            overlaps.add_child(XmlNode::new("overlap").with_attr("hash", hash::hash_to_hex(*h)));
        }
        root
    }

    /// Write the install record.
    pub fn save(&self) -> Result<(), ConfigError> {
        let mut doc = ConfigDocument::new();
        doc.init_new(SIGNATURE_BACKUP);
        if let Some(root) = doc.root_mut() {
            *root = self.to_root();
        }
        doc.save_as(&self.definition_path())
    }

    /// Delete the backup folder and everything in it.
    pub fn discard(&self) -> std::io::Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Load every backup folder under `backup_root`, ordered by install serial.
pub fn scan_backups(backup_root: &Path) -> Vec<ModBackup> {
    let Ok(read_dir) = fs::read_dir(backup_root) else {
        return Vec::new();
    };
    let mut backups: Vec<ModBackup> = read_dir
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .map(|p| ModBackup::load(&p))
        .collect();
    backups.sort_by(|a, b| a.serial.cmp(&b.serial).then(a.ident.cmp(&b.ident)));
    backups
}

fn bool_attr(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn parse_bool_attr(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some("1") | Some("true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(root: &Path) -> ModBackup {
        let mut backup = ModBackup::new(0xabc, "Cool_Hats_v2", Path::new("/lib/Cool_Hats_v2.zip"), root, 3);
        backup.push_entry(ModEntry {
            archive_index: -1,
            is_dir: true,
            marked_for_deletion: false,
            relative_path: "Data".to_string(),
        });
        backup.push_entry(ModEntry {
            archive_index: 4,
            is_dir: false,
            marked_for_deletion: true,
            relative_path: "Data/hats.esp".to_string(),
        });
        backup.add_overlap(0x77);
        backup
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let backup = sample(dir.path());
        backup.save().unwrap();
        assert!(dir.path().join("0000000000000abc").join(BACKUP_DEFINITION).exists());

        let loaded = ModBackup::load(&backup.dir);
        assert!(loaded.valid, "{:?}", loaded.error);
        assert_eq!(loaded.owner_hash, 0xabc);
        assert_eq!(loaded.ident, "Cool_Hats_v2");
        assert_eq!(loaded.serial, 3);
        assert_eq!(loaded.entries, backup.entries);
        assert!(loaded.overlaps(0x77));
        assert_eq!(loaded.source_path, PathBuf::from("/lib/Cool_Hats_v2.zip"));
    }

    #[test]
    fn test_never_overlaps_itself() {
        let dir = tempdir().unwrap();
        let mut backup = sample(dir.path());
        assert!(!backup.add_overlap(0xabc));
        backup.set_overlaps([0xabc, 0x1].into_iter().collect());
        assert_eq!(backup.overlapped.iter().copied().collect::<Vec<_>>(), vec![0x1]);
    }

    #[test]
    fn test_load_corrupt_record() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("00000000000000ff");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join(BACKUP_DEFINITION), "<Open_Mod_Manager_Backup><entries/>").unwrap();

        let loaded = ModBackup::load(&folder);
        assert!(!loaded.valid);
        assert!(loaded.error.is_some());
        assert_eq!(loaded.owner_hash, 0xff);
    }

    #[test]
    fn test_load_rejects_count_mismatch() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("0000000000000001");
        fs::create_dir_all(&folder).unwrap();
        fs::write(
            folder.join(BACKUP_DEFINITION),
            r#"<Open_Mod_Manager_Backup>
                 <ident hash="0000000000000001">Mod</ident>
                 <entries count="2"><entry index="0" dir="0" delete="1">a.txt</entry></entries>
               </Open_Mod_Manager_Backup>"#,
        )
        .unwrap();
        let loaded = ModBackup::load(&folder);
        assert!(!loaded.valid);
        assert!(loaded.error.unwrap().contains("count"));
    }

    #[test]
    fn test_scan_orders_by_serial() {
        let dir = tempdir().unwrap();
        for (hash, serial) in [(1u64, 5u64), (2, 1), (3, 3)] {
            ModBackup::new(hash, &format!("Mod{}", hash), Path::new("x"), dir.path(), serial)
                .save()
                .unwrap();
        }
        let serials: Vec<u64> = scan_backups(dir.path()).iter().map(|b| b.serial).collect();
        assert_eq!(serials, vec![1, 3, 5]);
        assert!(scan_backups(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_discard() {
        let dir = tempdir().unwrap();
        let backup = sample(dir.path());
        backup.save().unwrap();
        fs::create_dir_all(backup.data_path("Data")).unwrap();
        backup.discard().unwrap();
        assert!(!backup.dir.exists());
        backup.discard().unwrap();
    }
}
