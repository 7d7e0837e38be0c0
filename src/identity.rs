//! Package identity: display name, version and identity hash.
//!
//! Package files are conventionally named `Some_Mod_v1.2.3.zip`. The trailing
//! `vN[.N[.N]]` token is split off as the version, the rest becomes the
//! display name, and the raw stem is hashed into the identity key.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use crate::hash;
use crate::paths;

/// Maximum number of digits accepted in one version group.
const MAX_GROUP_DIGITS: usize = 15;

/// Maximum number of dot-separated version groups.
const MAX_GROUPS: usize = 3;

/// A `major.minor.revision` version. Omitted groups are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub revision: u64,
}

impl Version {
    pub fn new(major: u64, minor: u64, revision: u64) -> Self {
        Self {
            major,
            minor,
            revision,
        }
    }

    /// Parse a version string such as `1`, `1.2` or `1.2.3`.
    pub fn parse(s: &str) -> Option<Self> {
        if !is_version_string(s) {
            return None;
        }
        let mut groups = [0u64; MAX_GROUPS];
        for (slot, group) in groups.iter_mut().zip(s.split('.')) {
            *slot = group.parse().ok()?;
        }
        Some(Self::new(groups[0], groups[1], groups[2]))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.revision.cmp(&other.revision))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Check that a string is 1 to 3 dot-separated groups of 1 to 15 digits.
pub fn is_version_string(s: &str) -> bool {
    let groups: Vec<&str> = s.split('.').collect();
    if groups.is_empty() || groups.len() > MAX_GROUPS {
        return false;
    }
    groups.iter().all(|group| {
        !group.is_empty()
            && group.len() <= MAX_GROUP_DIGITS
            && group.bytes().all(|b| b.is_ascii_digit())
    })
}

/// Result of splitting a package name into display name and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub name: String,
    pub version: Option<Version>,
}

/// Split a package file or folder name into display name and version.
///
/// The version marker is the last `v`/`V` preceded by a space, underscore or
/// hyphen and followed by a digit. A `v` at position 0 is never a marker.
pub fn parse_identity(filename: &str, is_file: bool, underscore_to_space: bool) -> ParsedName {
    let base = paths::file_name(filename);
    let stem = if is_file {
        paths::split_extension(base).0
    } else {
        base
    };

    let chars: Vec<char> = stem.chars().collect();
    let marker = (1..chars.len()).rev().find(|&i| {
        matches!(chars[i], 'v' | 'V')
            && matches!(chars[i - 1], ' ' | '_' | '-')
            && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
    });

    let (name, version) = match marker {
        Some(i) => {
            let candidate: String = chars[i + 1..].iter().collect();
            match Version::parse(&candidate) {
                Some(version) if i > 1 => (chars[..i - 1].iter().collect(), Some(version)),
                _ => (stem.to_string(), None),
            }
        }
        None => (stem.to_string(), None),
    };

    let name = if underscore_to_space {
        name.replace('_', " ")
    } else {
        name
    };

    ParsedName { name, version }
}

/// Build the conventional `name_vX.Y.Z` package stem.
pub fn format_identity(name: &str, version: Option<&Version>) -> String {
    match version {
        Some(version) => format!("{}_v{}", name, version),
        None => name.to_string(),
    }
}

/// Identity of a package, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageIdentity {
    /// Raw file stem or folder name; the identity string published by
    /// repositories.
    pub ident: String,
    /// Human readable name, version stripped.
    pub name: String,
    /// Lowercase name with underscores as spaces, used to match upgrades.
    pub core: String,
    pub version: Option<Version>,
    /// `hash::ident_hash(ident)`
    #[serde(serialize_with = "serialize_hash")]
    pub hash: u64,
}

impl PackageIdentity {
    /// Identity of a package file or folder found on disk.
    pub fn from_path_name(name: &str, is_file: bool, underscore_to_space: bool) -> Self {
        let base = paths::file_name(name);
        let ident = if is_file {
            paths::split_extension(base).0
        } else {
            base
        };
        Self::from_ident(ident, underscore_to_space)
    }

    /// Identity from an identity string (file stem), e.g. a repository
    /// `ident` attribute.
    pub fn from_ident(ident: &str, underscore_to_space: bool) -> Self {
        let parsed = parse_identity(ident, false, underscore_to_space);
        Self {
            ident: ident.to_string(),
            core: parsed.name.replace('_', " ").trim().to_lowercase(),
            name: parsed.name,
            version: parsed.version,
            hash: hash::ident_hash(ident),
        }
    }

    /// Whether both identities name the same package, ignoring version.
    pub fn same_core(&self, other: &PackageIdentity) -> bool {
        self.core == other.core
    }

    pub fn hash_hex(&self) -> String {
        hash::hash_to_hex(self.hash)
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{} v{}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}

fn serialize_hash<S: serde::Serializer>(hash: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hash::hash_to_hex(*hash))
}
