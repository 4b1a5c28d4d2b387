//! Per-file manifest of an archive
//!
//! Records every included file with its checksum and every excluded path
//! with the pattern that excluded it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use shellpack_protocol::header::ManifestLine;

use crate::checksum::{EMPTY_SENTINEL, SYMLINK_SENTINEL};

/// An included file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// POSIX path relative to the content root
    pub path: String,

    /// Size in bytes (link length for symlinks)
    pub size: u64,

    /// SHA-256 hex, `empty` for zero-byte files, `symlink` for links
    pub checksum_sha256: String,

    /// Modification time, seconds since the epoch
    pub mtime: u64,

    /// Whether the entry is a symbolic link
    pub is_link: bool,
}

impl FileRecord {
    /// Whether the checksum is a real digest
    pub fn is_hashed(&self) -> bool {
        self.checksum_sha256 != EMPTY_SENTINEL && self.checksum_sha256 != SYMLINK_SENTINEL
    }
}

/// Why a path was left out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclusionReason {
    Pattern,
}

/// An excluded path. Directories carry a trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRecord {
    pub path: String,
    pub reason: ExclusionReason,
    /// The pattern that matched
    pub pattern: String,
}

impl ExclusionRecord {
    pub fn is_dir(&self) -> bool {
        self.path.ends_with('/')
    }
}

/// Archive manifest, computed before encryption
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Included files in walk order
    pub files: Vec<FileRecord>,

    /// Excluded paths in walk order
    pub excluded: Vec<ExclusionRecord>,

    /// SHA-256 of the compressed archive file
    pub archive_sha256: String,

    /// Size of the compressed archive file
    pub archive_size: u64,
}

impl Manifest {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write to file
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e))
        })?;
        fs::write(path, json)
    }

    /// Total size of included files
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Excluded (files, directories)
    pub fn exclusion_counts(&self) -> (usize, usize) {
        let dirs = self.excluded.iter().filter(|e| e.is_dir()).count();
        (self.excluded.len() - dirs, dirs)
    }

    /// Find an included file by path
    pub fn find_file(&self, path: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Whether a path was excluded
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded.iter().any(|e| e.path == path)
    }

    /// Lines for the manifest block embedded in the artifact header
    pub fn header_lines(&self) -> Vec<ManifestLine> {
        self.files
            .iter()
            .map(|f| ManifestLine::new(&f.checksum_sha256, &f.path))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            files: vec![
                FileRecord {
                    path: "run.sh".to_string(),
                    size: 12,
                    checksum_sha256: "ab".repeat(32),
                    mtime: 1_700_000_000,
                    is_link: false,
                },
                FileRecord {
                    path: "empty.txt".to_string(),
                    size: 0,
                    checksum_sha256: EMPTY_SENTINEL.to_string(),
                    mtime: 1_700_000_000,
                    is_link: false,
                },
                FileRecord {
                    path: "link".to_string(),
                    size: 6,
                    checksum_sha256: SYMLINK_SENTINEL.to_string(),
                    mtime: 1_700_000_000,
                    is_link: true,
                },
            ],
            excluded: vec![
                ExclusionRecord {
                    path: "debug.log".to_string(),
                    reason: ExclusionReason::Pattern,
                    pattern: "*.log".to_string(),
                },
                ExclusionRecord {
                    path: ".git/".to_string(),
                    reason: ExclusionReason::Pattern,
                    pattern: ".git/".to_string(),
                },
            ],
            archive_sha256: "cd".repeat(32),
            archive_size: 512,
        }
    }

    #[test]
    fn test_serialization() {
        let json = sample_manifest().to_json().unwrap();
        assert!(json.contains("\"checksum_sha256\": \"empty\""));
        assert!(json.contains("\"reason\": \"pattern\""));

        let parsed = Manifest::from_json(&json).unwrap();
        assert_eq!(parsed, sample_manifest());
    }

    #[test]
    fn test_counts() {
        let manifest = sample_manifest();
        assert_eq!(manifest.total_size(), 18);
        assert_eq!(manifest.exclusion_counts(), (1, 1));
    }

    #[test]
    fn test_find_and_excluded() {
        let manifest = sample_manifest();
        assert!(manifest.find_file("run.sh").is_some());
        assert!(manifest.find_file("debug.log").is_none());
        assert!(manifest.is_excluded(".git/"));
    }

    #[test]
    fn test_header_lines() {
        let lines = sample_manifest().header_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].is_hashed());
        assert_eq!(lines[1].checksum, "empty");
        assert_eq!(lines[2].checksum, "symlink");
    }

    #[test]
    fn test_is_hashed() {
        let manifest = sample_manifest();
        assert!(manifest.files[0].is_hashed());
        assert!(!manifest.files[1].is_hashed());
        assert!(!manifest.files[2].is_hashed());
    }
}
