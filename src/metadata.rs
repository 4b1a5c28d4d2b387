//! Build record, public metadata sidecar and update feed
//!
//! A [`BuildRecord`] accumulates facts as the pipeline runs and is sealed
//! by [`BuildRecord::finalize`] once the artifact checksum is known. After
//! that every setter fails.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use tracing::debug;

use shellpack_protocol::{ArchiveInfo, TokenParams, UpdateFeed, UpdateMode, PROTOCOL_VERSION};

use crate::archive::Manifest;
use crate::config::BuildSpec;
use crate::crypto::{EncryptedArchive, VerificationToken};

/// Format of build identifiers
pub const BUILD_ID_FORMAT: &str = "%Y%m%d%H%M%S";

/// Metadata errors
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("build record is already finalized")]
    Finalized,

    #[error("build record is not finalized yet")]
    NotFinalized,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Build identifier for `now`, strictly after `previous` when given.
///
/// Two builds within the same second (or a clock step backwards) still get
/// increasing ids.
pub fn build_id_after(now: DateTime<Local>, previous: Option<&str>) -> String {
    // Ids carry whole seconds only
    let candidate = now.naive_local().with_nanosecond(0).unwrap_or(now.naive_local());
    let previous = previous
        .and_then(|p| NaiveDateTime::parse_from_str(p.trim(), BUILD_ID_FORMAT).ok());
    let id = match previous {
        Some(prev) if candidate <= prev => prev + Duration::seconds(1),
        _ => candidate,
    };
    id.format(BUILD_ID_FORMAT).to_string()
}

/// Where and by whom the build ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub tool_version: String,
    pub platform: String,
    pub build_host: String,
    pub build_user: String,
    /// RFC 3339, local time
    pub created_at: String,
}

impl Provenance {
    /// Provenance of the current process
    pub fn current(created_at: DateTime<Local>) -> Self {
        Self {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            build_host: host_name(),
            build_user: user_name(),
            created_at: created_at.to_rfc3339(),
        }
    }
}

#[cfg(unix)]
fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(not(unix))]
fn host_name() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(unix)]
fn user_name() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(not(unix))]
fn user_name() -> String {
    std::env::var("USERNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Update parameters recorded for the build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub mode: UpdateMode,
    pub version_url: String,
    pub package_url: String,
}

/// Encryption facts recorded for the build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionRecord {
    pub params: TokenParams,
    pub password_check_token_b64: String,
    pub encrypted_archive_checksum_sha256: String,
    pub encrypted_size: u64,
}

/// Everything known about one build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_version: String,
    pub provenance: Provenance,
    pub content_source_dir: String,
    pub post_extraction_script: Option<String>,
    pub compression_method: String,
    pub manifest: Manifest,
    pub encryption: Option<EncryptionRecord>,
    pub update: Option<UpdateRecord>,
    pub need_root: bool,
    /// SHA-256 of the finished artifact, set by `finalize`
    pub script_checksum_sha256: Option<String>,
}

impl BuildRecord {
    pub fn new(spec: &BuildSpec, build_version: String, provenance: Provenance) -> Self {
        Self {
            build_version,
            provenance,
            content_source_dir: spec.content_root.display().to_string(),
            post_extraction_script: spec.entry_point.clone(),
            compression_method: spec.compression.method.name().to_string(),
            manifest: Manifest::default(),
            encryption: None,
            update: spec.update.spec().map(|u| UpdateRecord {
                mode: u.mode,
                version_url: u.version_url.clone(),
                package_url: u.package_url.clone(),
            }),
            need_root: spec.need_root,
            script_checksum_sha256: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.script_checksum_sha256.is_some()
    }

    fn ensure_open(&self) -> Result<(), MetadataError> {
        if self.is_finalized() {
            Err(MetadataError::Finalized)
        } else {
            Ok(())
        }
    }

    /// Record the archive manifest
    pub fn set_manifest(&mut self, manifest: Manifest) -> Result<(), MetadataError> {
        self.ensure_open()?;
        self.manifest = manifest;
        Ok(())
    }

    /// Record the encrypted archive and its token
    pub fn set_encryption(
        &mut self,
        encrypted: &EncryptedArchive,
        token: &VerificationToken,
    ) -> Result<(), MetadataError> {
        self.ensure_open()?;
        self.encryption = Some(EncryptionRecord {
            params: token.params.clone(),
            password_check_token_b64: token.ciphertext_b64.clone(),
            encrypted_archive_checksum_sha256: encrypted.sha256.clone(),
            encrypted_size: encrypted.size,
        });
        Ok(())
    }

    /// Seal the record with the checksum of the written artifact
    pub fn finalize(&mut self, artifact_checksum: String) -> Result<(), MetadataError> {
        self.ensure_open()?;
        debug!("Finalizing build record {}", self.build_version);
        self.script_checksum_sha256 = Some(artifact_checksum);
        Ok(())
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryption.is_some()
    }

    /// Public sidecar view: counts instead of file lists, no token fields
    /// for unencrypted builds
    pub fn public_metadata(&self) -> PublicMetadata {
        let (excluded_files, excluded_dirs) = self.manifest.exclusion_counts();
        let enc = self.encryption.as_ref();
        PublicMetadata {
            protocol_version: PROTOCOL_VERSION,
            shellpack_version: self.provenance.tool_version.clone(),
            build_version: self.build_version.clone(),
            created_at: self.provenance.created_at.clone(),
            platform: self.provenance.platform.clone(),
            build_host: self.provenance.build_host.clone(),
            build_user: self.provenance.build_user.clone(),
            content_source_dir: self.content_source_dir.clone(),
            post_extraction_script: self.post_extraction_script.clone(),
            compression_method: self.compression_method.clone(),
            need_root: self.need_root,
            files_included_count: self.manifest.files.len(),
            files_excluded_count: excluded_files + excluded_dirs,
            archive_size: self.manifest.archive_size,
            archive_checksum_sha256: self.manifest.archive_sha256.clone(),
            encryption_enabled: enc.is_some(),
            encryption_tool: enc.map(|e| e.params.tool.clone()),
            encrypted_size: enc.map(|e| e.encrypted_size),
            encrypted_archive_checksum_sha256: enc
                .map(|e| e.encrypted_archive_checksum_sha256.clone()),
            password_check_token_b64: enc.map(|e| e.password_check_token_b64.clone()),
            token_encryption_params: enc.map(|e| e.params.clone()),
            update_enabled: self.update.is_some(),
            update_mode: self.update.as_ref().map(|u| u.mode),
            script_checksum_sha256: self.script_checksum_sha256.clone(),
        }
    }

    /// Update-feed document. Requires a finalized record.
    pub fn update_feed(&self) -> Result<UpdateFeed, MetadataError> {
        let checksum = self
            .script_checksum_sha256
            .clone()
            .ok_or(MetadataError::NotFinalized)?;
        let enc = self.encryption.as_ref();
        Ok(UpdateFeed {
            protocol_version: PROTOCOL_VERSION,
            build_version: self.build_version.clone(),
            generated_at: self.provenance.created_at.clone(),
            script_checksum_sha256: Some(checksum),
            password_check_token_b64: enc.map(|e| e.password_check_token_b64.clone()),
            token_encryption_params: enc.map(|e| e.params.clone()),
            archive_info: Some(ArchiveInfo {
                size: self.manifest.archive_size,
                encrypted_size: enc.map(|e| e.encrypted_size),
                files_included_count: self.manifest.files.len(),
                post_extraction_script: self.post_extraction_script.clone(),
                compression_method: self.compression_method.clone(),
                encryption_enabled: enc.is_some(),
                encryption_tool: enc.map(|e| e.params.tool.clone()),
                build_platform: self.provenance.platform.clone(),
                archive_checksum_sha256: self.manifest.archive_sha256.clone(),
                encrypted_archive_checksum_sha256: enc
                    .map(|e| e.encrypted_archive_checksum_sha256.clone()),
            }),
        })
    }

    /// Write the public sidecar
    pub fn write_public_metadata(&self, path: &Path) -> Result<(), MetadataError> {
        self.public_metadata().write_to_file(path)
    }

    /// Write the update feed, creating parent directories
    pub fn write_update_feed(&self, path: &Path) -> Result<(), MetadataError> {
        let feed = self.update_feed()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(&feed)?)?;
        Ok(())
    }
}

/// Public metadata sidecar (`<artifact>.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicMetadata {
    pub protocol_version: u32,
    pub shellpack_version: String,
    pub build_version: String,
    pub created_at: String,
    pub platform: String,
    pub build_host: String,
    pub build_user: String,
    pub content_source_dir: String,
    pub post_extraction_script: Option<String>,
    pub compression_method: String,
    pub need_root: bool,
    pub files_included_count: usize,
    pub files_excluded_count: usize,
    pub archive_size: u64,
    pub archive_checksum_sha256: String,
    pub encryption_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_archive_checksum_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_check_token_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_encryption_params: Option<TokenParams>,
    pub update_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<UpdateMode>,
    pub script_checksum_sha256: Option<String>,
}

impl PublicMetadata {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), MetadataError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Build id recorded in an existing sidecar, if readable
    pub fn read_build_version(path: &Path) -> Option<String> {
        let json = fs::read_to_string(path).ok()?;
        Self::from_json(&json).ok().map(|m| m.build_version)
    }
}

/// Local time for a build id, for display
pub fn build_id_time(build_id: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(build_id, BUILD_ID_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}
