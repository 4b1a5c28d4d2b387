//! Read-only summary of a generated artifact
//!
//! Everything comes from the header variables and the embedded manifest;
//! the payload is measured but never decoded.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use shellpack_protocol::header::{vars, HeaderInfo};
use shellpack_protocol::{split_artifact, ProtocolError, EMPTY_SENTINEL, SYMLINK_SENTINEL};

use crate::checksum;
use crate::config::sidecar;
use crate::metadata::PublicMetadata;

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("not a shellpack artifact: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Summary printed by `shellpack inspect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactSummary {
    pub artifact: PathBuf,
    pub artifact_sha256: String,
    pub protocol_version: String,
    pub tool_version: String,
    pub build_version: String,
    pub created_at: String,
    pub build_origin: String,
    pub platform: String,
    pub compression: String,
    pub archive_sha256: String,
    pub encrypted: bool,
    pub encrypted_sha256: Option<String>,
    pub entry_point: Option<String>,
    pub need_root: bool,
    pub update_mode: Option<String>,
    pub version_url: Option<String>,
    /// 1-based line of the marker
    pub marker_line: usize,
    /// Size of the base64 payload
    pub payload_bytes: usize,
    pub manifest_files: usize,
    pub manifest_empty: usize,
    pub manifest_symlinks: usize,
    /// Whether `<artifact>.json` records this artifact's checksum; `None`
    /// when there is no readable sidecar
    pub sidecar_matches: Option<bool>,
}

fn non_empty(info: &HeaderInfo, name: &str) -> Option<String> {
    info.get(name).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Summarize the artifact at `path`
pub fn inspect_artifact(path: &Path) -> Result<ArtifactSummary, InspectError> {
    let bytes = fs::read(path).map_err(|source| InspectError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let split = split_artifact(&bytes)?;
    let info = HeaderInfo::parse(split.header)?;
    let artifact_sha256 = checksum::sha256_bytes(&bytes);

    let count = |sentinel: &str| info.manifest.iter().filter(|l| l.checksum == sentinel).count();
    let update_enabled = info.flag(vars::UPDATE_ENABLED);
    let sidecar_matches = fs::read_to_string(sidecar(path, "json"))
        .ok()
        .and_then(|json| PublicMetadata::from_json(&json).ok())
        .map(|meta| meta.script_checksum_sha256.as_deref() == Some(artifact_sha256.as_str()));

    Ok(ArtifactSummary {
        artifact: path.to_path_buf(),
        protocol_version: info.get_or_empty(vars::PROTOCOL_VERSION).to_string(),
        tool_version: info.get_or_empty(vars::TOOL_VERSION).to_string(),
        build_version: info.get_or_empty(vars::BUILD_VERSION).to_string(),
        created_at: info.get_or_empty(vars::CREATED_AT).to_string(),
        build_origin: info.get_or_empty(vars::BUILD_ORIGIN).to_string(),
        platform: info.get_or_empty(vars::PLATFORM).to_string(),
        compression: info.get_or_empty(vars::COMPRESSION).to_string(),
        archive_sha256: info.get_or_empty(vars::ARCHIVE_SHA256).to_string(),
        encrypted: info.flag(vars::ENCRYPTED),
        encrypted_sha256: non_empty(&info, vars::ENCRYPTED_SHA256),
        entry_point: non_empty(&info, vars::ENTRY_POINT),
        need_root: info.flag(vars::NEED_ROOT),
        update_mode: non_empty(&info, vars::UPDATE_MODE).filter(|_| update_enabled),
        version_url: non_empty(&info, vars::VERSION_URL).filter(|_| update_enabled),
        marker_line: split.marker_line,
        payload_bytes: split.payload_trimmed().len(),
        manifest_files: info.manifest.len(),
        manifest_empty: count(EMPTY_SENTINEL),
        manifest_symlinks: count(SYMLINK_SENTINEL),
        sidecar_matches,
        artifact_sha256,
    })
}

impl ArtifactSummary {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable report
    pub fn to_human(&self) -> String {
        let mut out = String::new();
        let mut line = |label: &str, value: &str| {
            out.push_str(&format!("  {:<18}{}\n", label, value));
        };
        line("Build:", &self.build_version);
        line("Created:", &format!("{} by {}", self.created_at, self.build_origin));
        line("Platform:", &self.platform);
        line("Tool:", &format!("shellpack {} (protocol {})", self.tool_version, self.protocol_version));
        line("Compression:", &self.compression);
        line("Archive SHA-256:", &self.archive_sha256);
        match &self.encrypted_sha256 {
            Some(sha) if self.encrypted => line("Encrypted:", &format!("yes ({})", sha)),
            _ => line("Encrypted:", if self.encrypted { "yes" } else { "no" }),
        }
        line("Entry point:", self.entry_point.as_deref().unwrap_or("(none)"));
        line("Needs root:", if self.need_root { "yes" } else { "no" });
        match (&self.update_mode, &self.version_url) {
            (Some(mode), Some(url)) => line("Updates:", &format!("{} from {}", mode, url)),
            _ => line("Updates:", "disabled"),
        }
        line(
            "Manifest:",
            &format!(
                "{} entries ({} empty, {} symlinks)",
                self.manifest_files, self.manifest_empty, self.manifest_symlinks
            ),
        );
        line("Payload:", &format!("{} base64 bytes after line {}", self.payload_bytes, self.marker_line));
        line("Artifact SHA-256:", &self.artifact_sha256);
        if let Some(matches) = self.sidecar_matches {
            line("Sidecar:", if matches { "matches" } else { "STALE" });
        }
        out
    }
}
