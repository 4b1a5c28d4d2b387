//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

use crate::compression::CompressionMethod;
use crate::crypto::{DEFAULT_GPG_CIPHER_ALGO, DEFAULT_OPENSSL_CIPHER, DEFAULT_OPENSSL_ITER};
use shellpack_protocol::UpdateMode;

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "shellpack.toml";

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Content root (default: "./content")
    pub content: String,

    /// Post-extraction entry point (default: "start.sh")
    pub script: String,

    /// Output artifact (default: "autoextract.sh")
    pub output_path: String,

    pub need_root: bool,

    /// Compression method (default: gzip)
    pub compression_method: CompressionMethod,

    /// Compression level (default: 9)
    pub compression_level: u32,

    /// Case-insensitive exclusion matching (default: true)
    pub exclude_ignore_case: bool,

    /// Add the standard exclusion catalogue (default: false)
    pub exclude_standard: bool,

    pub encryption_enabled: bool,

    /// Cipher tool (default: "openssl")
    pub encryption_tool: String,

    pub openssl_cipher: String,
    pub openssl_iter: u32,
    pub gpg_cipher: String,

    pub update_enabled: bool,

    /// Update mode (default: check-only)
    pub update_mode: UpdateMode,

    /// Write `<artifact>.json` (default: true)
    pub generate_metadata: bool,

    /// Log level for the optional log file (default: "info")
    pub log_level: String,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            content: "./content".to_string(),
            script: "start.sh".to_string(),
            output_path: "autoextract.sh".to_string(),
            need_root: false,
            compression_method: CompressionMethod::Gzip,
            compression_level: 9,
            exclude_ignore_case: true,
            exclude_standard: false,
            encryption_enabled: false,
            encryption_tool: "openssl".to_string(),
            openssl_cipher: DEFAULT_OPENSSL_CIPHER.to_string(),
            openssl_iter: DEFAULT_OPENSSL_ITER,
            gpg_cipher: DEFAULT_GPG_CIPHER_ALGO.to_string(),
            update_enabled: false,
            update_mode: UpdateMode::CheckOnly,
            generate_metadata: true,
            log_level: "info".to_string(),
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "content": self.content,
            "script": self.script,
            "generate_metadata": self.generate_metadata,
            "output": {
                "path": self.output_path,
                "need_root": self.need_root
            },
            "compression": {
                "method": self.compression_method.name(),
                "level": self.compression_level
            },
            "exclude": {
                "patterns": [],
                "ignore_case": self.exclude_ignore_case,
                "standard": self.exclude_standard
            },
            "encryption": {
                "enabled": self.encryption_enabled,
                "tool": self.encryption_tool,
                "openssl_cipher": self.openssl_cipher,
                "openssl_iter": self.openssl_iter,
                "gpg_cipher": self.gpg_cipher
            },
            "update": {
                "enabled": self.update_enabled,
                "mode": self.update_mode.name(),
                "version_url": "",
                "package_url": "",
                "feed_file": ""
            },
            "logging": {
                "file": "",
                "level": self.log_level
            },
            "template": {
                "path": ""
            }
        })
    }

    /// Commented config file written by `shellpack init`
    pub fn to_toml_template(&self) -> String {
        format!(
            r#"# shellpack build configuration

# Directory packed into the artifact, relative to this file
content = "{content}"

# Entry point run after extraction, relative to the content root.
# Leave empty to only extract.
script = "{script}"

# Write <artifact>.json next to the artifact
generate_metadata = {generate_metadata}

[output]
path = "{output_path}"
need_root = {need_root}

[compression]
# store, gzip, bzip2 or xz
method = "{method}"
level = {level}

[exclude]
# Shell globs against the path relative to the content root.
# A trailing "/" marks a directory pattern.
patterns = ["*.log", ".git/"]
ignore_case = {ignore_case}
# Add the standard catalogue (VCS, Python, temp files, IDE, macOS)
standard = {standard}

[encryption]
enabled = {enc_enabled}
# openssl or gpg. The password comes from SHELLPACK_PASSWORD or a prompt.
tool = "{tool}"
openssl_cipher = "{openssl_cipher}"
openssl_iter = {openssl_iter}
gpg_cipher = "{gpg_cipher}"

[update]
enabled = {upd_enabled}
# check-only, download-only, auto-replace or auto-replace-always
mode = "{mode}"
version_url = ""
package_url = ""
# Where to write the update feed document
feed_file = ""

[logging]
file = ""
level = "{log_level}"
"#,
            content = self.content,
            script = self.script,
            generate_metadata = self.generate_metadata,
            output_path = self.output_path,
            need_root = self.need_root,
            method = self.compression_method.name(),
            level = self.compression_level,
            ignore_case = self.exclude_ignore_case,
            standard = self.exclude_standard,
            enc_enabled = self.encryption_enabled,
            tool = self.encryption_tool,
            openssl_cipher = self.openssl_cipher,
            openssl_iter = self.openssl_iter,
            gpg_cipher = self.gpg_cipher,
            upd_enabled = self.update_enabled,
            mode = self.update_mode.name(),
            log_level = self.log_level,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let defaults = BuiltinDefaults::default();
        assert_eq!(defaults.content, "./content");
        assert_eq!(defaults.script, "start.sh");
        assert_eq!(defaults.output_path, "autoextract.sh");
        assert_eq!(defaults.compression_level, 9);
        assert!(defaults.exclude_ignore_case);
        assert!(defaults.generate_metadata);
        assert!(!defaults.encryption_enabled);
    }

    #[test]
    fn test_to_value() {
        let value = BuiltinDefaults::default().to_value();

        assert_eq!(value["compression"]["method"], "gzip");
        assert_eq!(value["update"]["mode"], "check-only");
        assert_eq!(value["encryption"]["openssl_iter"], 10_000);
        assert!(value["exclude"]["patterns"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_toml_template_parses() {
        let text = BuiltinDefaults::default().to_toml_template();
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        assert_eq!(parsed["compression"]["level"].as_integer(), Some(9));
        assert_eq!(parsed["update"]["mode"].as_str(), Some("check-only"));
    }
}
