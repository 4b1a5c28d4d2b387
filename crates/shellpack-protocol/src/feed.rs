//! Update-feed document
//!
//! The small JSON document a deployed artifact polls to learn about newer
//! builds. It carries checksums and, for encrypted builds, the encrypted
//! verification token. It never carries a password or plaintext content.

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, PROTOCOL_VERSION};

/// Cipher parameters used to produce the verification token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenParams {
    /// Cipher tool (`openssl`, `gpg`)
    pub tool: String,
    /// Cipher name (`aes-256-cbc`, `AES256`)
    pub cipher: String,
    /// PBKDF2 iteration count (openssl only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iter: Option<u32>,
    /// String-to-key options (gpg only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s2k_options: Option<String>,
}

/// Secondary archive facts published alongside the build id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// Archive size in bytes (before encryption)
    pub size: u64,
    /// Encrypted archive size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_size: Option<u64>,
    /// Number of included files
    pub files_included_count: usize,
    /// Entry point run after extraction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_extraction_script: Option<String>,
    /// Compression method name
    pub compression_method: String,
    /// Whether the payload is encrypted
    pub encryption_enabled: bool,
    /// Cipher tool name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_tool: Option<String>,
    /// Build platform
    pub build_platform: String,
    /// SHA-256 of the compressed archive
    pub archive_checksum_sha256: String,
    /// SHA-256 of the encrypted archive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_archive_checksum_sha256: Option<String>,
}

/// The update-feed document (`version.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFeed {
    /// Wire format version
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    /// Build identifier of the published artifact
    pub build_version: String,
    /// When the feed was generated (RFC 3339)
    pub generated_at: String,
    /// SHA-256 of the published artifact file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_checksum_sha256: Option<String>,
    /// Base64 verification token (encrypted builds only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_check_token_b64: Option<String>,
    /// Parameters that produced the token (encrypted builds only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_encryption_params: Option<TokenParams>,
    /// Secondary archive facts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_info: Option<ArchiveInfo>,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

impl UpdateFeed {
    /// Parse a feed document
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Whether this feed announces a build newer than `current`.
    ///
    /// Build ids are `YYYYMMDDHHMMSS`; when both parse as integers they are
    /// compared numerically, otherwise any difference counts as newer.
    pub fn announces_newer_than(&self, current: &str) -> bool {
        let remote = self.build_version.trim();
        let current = current.trim();
        match (remote.parse::<u64>(), current.parse::<u64>()) {
            (Ok(r), Ok(c)) => r > c,
            _ => !remote.is_empty() && remote != current,
        }
    }

    /// Whether the feed carries a usable verification token
    pub fn has_token(&self) -> bool {
        self.password_check_token_b64
            .as_deref()
            .is_some_and(|t| !t.is_empty() && t != "null")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(version: &str) -> UpdateFeed {
        UpdateFeed {
            protocol_version: PROTOCOL_VERSION,
            build_version: version.to_string(),
            generated_at: "2026-01-01T00:00:00+00:00".to_string(),
            script_checksum_sha256: Some("ab".repeat(32)),
            password_check_token_b64: None,
            token_encryption_params: None,
            archive_info: None,
        }
    }

    #[test]
    fn test_newer_numeric() {
        let f = feed("20260102000000");
        assert!(f.announces_newer_than("20260101000000"));
        assert!(!f.announces_newer_than("20260102000000"));
        assert!(!f.announces_newer_than("20260103000000"));
    }

    #[test]
    fn test_newer_non_numeric() {
        let f = feed("release-b");
        assert!(f.announces_newer_than("release-a"));
        assert!(!f.announces_newer_than("release-b"));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let json = feed("1").to_json().unwrap();
        assert!(!json.contains("password_check_token_b64"));
        assert!(!json.contains("token_encryption_params"));
        assert!(json.contains("script_checksum_sha256"));
    }

    #[test]
    fn test_parse_minimal_feed() {
        let f = UpdateFeed::from_json(
            r#"{"build_version":"20260101000000","generated_at":"now"}"#,
        )
        .unwrap();
        assert_eq!(f.protocol_version, PROTOCOL_VERSION);
        assert!(!f.has_token());
    }

    #[test]
    fn test_token_params_roundtrip_shape() {
        let params = TokenParams {
            tool: "openssl".to_string(),
            cipher: "aes-256-cbc".to_string(),
            iter: Some(10000),
            s2k_options: None,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["iter"], 10000);
        assert!(value.get("s2k_options").is_none());
    }
}
