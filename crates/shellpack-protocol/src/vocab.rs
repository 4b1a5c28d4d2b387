//! Shared vocabularies: compression methods and update modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;

/// Compression applied to the embedded tar archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Plain tar
    Store,
    #[default]
    Gzip,
    Bzip2,
    Xz,
}

impl CompressionMethod {
    /// Order in which the runtime probes methods when the declared one is
    /// unknown or stale.
    pub const PROBE_ORDER: [CompressionMethod; 4] = [
        CompressionMethod::Bzip2,
        CompressionMethod::Gzip,
        CompressionMethod::Xz,
        CompressionMethod::Store,
    ];

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
        }
    }

    /// Archive file extension
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Store => ".tar",
            Self::Gzip => ".tar.gz",
            Self::Bzip2 => ".tar.bz2",
            Self::Xz => ".tar.xz",
        }
    }

    /// Flag passed to `tar` for this method (empty for store)
    pub fn tar_flag(&self) -> &'static str {
        match self {
            Self::Store => "",
            Self::Gzip => "z",
            Self::Bzip2 => "j",
            Self::Xz => "J",
        }
    }

    /// Whether a level applies to this method
    pub fn uses_level(&self) -> bool {
        !matches!(self, Self::Store)
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionMethod {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "store" | "none" | "tar" => Ok(Self::Store),
            "gzip" | "gz" => Ok(Self::Gzip),
            "bzip2" | "bz2" => Ok(Self::Bzip2),
            "xz" => Ok(Self::Xz),
            other => Err(ProtocolError::UnknownValue {
                kind: "compression method",
                value: other.to_string(),
            }),
        }
    }
}

/// What the runtime does when the feed announces a newer build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateMode {
    /// Report the newer build and continue
    #[default]
    CheckOnly,
    /// Download the newer build beside the running artifact
    DownloadOnly,
    /// Download, ask for confirmation, then replace and re-exec
    AutoReplace,
    /// Download, replace and re-exec without asking
    AutoReplaceAlways,
}

impl UpdateMode {
    /// All modes, in documentation order
    pub const ALL: [UpdateMode; 4] = [
        UpdateMode::CheckOnly,
        UpdateMode::DownloadOnly,
        UpdateMode::AutoReplace,
        UpdateMode::AutoReplaceAlways,
    ];

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckOnly => "check-only",
            Self::DownloadOnly => "download-only",
            Self::AutoReplace => "auto-replace",
            Self::AutoReplaceAlways => "auto-replace-always",
        }
    }

    /// Whether this mode downloads the package
    pub fn downloads(&self) -> bool {
        !matches!(self, Self::CheckOnly)
    }

    /// Whether this mode replaces the running artifact
    pub fn replaces(&self) -> bool {
        matches!(self, Self::AutoReplace | Self::AutoReplaceAlways)
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for UpdateMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UpdateMode::ALL
            .into_iter()
            .find(|m| m.name() == s.trim())
            .ok_or_else(|| ProtocolError::UnknownValue {
                kind: "update mode",
                value: s.to_string(),
            })
    }
}
