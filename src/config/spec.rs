//! Validated, typed build settings

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::effective::{ConfigError, EffectiveConfig};
use crate::archive::{standard_patterns, ExcludeError, ExcludeRules};
use crate::compression::CompressionMethod;
use crate::crypto::{CipherSpec, S2kSpec};
use shellpack_protocol::UpdateMode;

/// Archive compression settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Compression {
    pub method: CompressionMethod,
    /// 1-9, ignored for store
    pub level: u32,
}

/// Exclusion settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludeSpec {
    pub patterns: Vec<String>,
    pub ignore_case: bool,
    /// Prepend the standard catalogue
    pub standard: bool,
}

impl ExcludeSpec {
    /// Compile into matching rules
    pub fn rules(&self) -> Result<ExcludeRules, ExcludeError> {
        let mut patterns: Vec<&str> = Vec::new();
        if self.standard {
            patterns.extend(standard_patterns());
        }
        let rules = ExcludeRules::new(&patterns, self.ignore_case)?;
        rules.with_patterns(&self.patterns)
    }
}

/// Archive encryption
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "cipher", rename_all = "lowercase")]
pub enum Encryption {
    Disabled,
    Enabled(CipherSpec),
}

impl Encryption {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Encryption::Enabled(_))
    }

    pub fn cipher(&self) -> Option<&CipherSpec> {
        match self {
            Encryption::Enabled(spec) => Some(spec),
            Encryption::Disabled => None,
        }
    }
}

/// Self-update parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateSpec {
    pub mode: UpdateMode,
    /// Where the feed document is published
    pub version_url: String,
    /// Where the newest artifact is published
    pub package_url: String,
    /// Local path the feed document is written to at build time
    pub feed_file: Option<PathBuf>,
}

/// Self-update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "params", rename_all = "lowercase")]
pub enum Update {
    Disabled,
    Enabled(UpdateSpec),
}

impl Update {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Update::Enabled(_))
    }

    pub fn spec(&self) -> Option<&UpdateSpec> {
        match self {
            Update::Enabled(spec) => Some(spec),
            Update::Disabled => None,
        }
    }
}

/// Everything a build needs, validated once
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSpec {
    pub content_root: PathBuf,
    pub output: PathBuf,
    /// Entry point relative to the content root; `None` only extracts
    pub entry_point: Option<String>,
    pub compression: Compression,
    pub exclude: ExcludeSpec,
    pub encryption: Encryption,
    pub update: Update,
    pub generate_metadata: bool,
    pub need_root: bool,
    /// User-supplied template replacing the built-in one
    pub template: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

impl BuildSpec {
    /// Validate a merged configuration
    pub fn from_value(config: &EffectiveConfig) -> Result<Self, ConfigError> {
        let content = config
            .get_nonempty_str("content")
            .ok_or_else(|| invalid("content", "must name the content directory"))?;
        let output = config
            .get_nonempty_str("output.path")
            .ok_or_else(|| invalid("output.path", "must name the artifact file"))?;
        let output = config.resolve_path(output);
        if output.file_name().is_none() {
            return Err(invalid("output.path", "must end in a file name"));
        }

        let entry_point = match config.get_nonempty_str("script") {
            Some(script) => Some(validate_entry_point(script)?),
            None => None,
        };

        Ok(Self {
            content_root: config.resolve_path(content),
            output,
            entry_point,
            compression: parse_compression(config)?,
            exclude: parse_exclude(config)?,
            encryption: parse_encryption(config)?,
            update: parse_update(config)?,
            generate_metadata: bool_or(config, "generate_metadata", true)?,
            need_root: bool_or(config, "output.need_root", false)?,
            template: config
                .get_nonempty_str("template.path")
                .map(|p| config.resolve_path(p)),
            log_file: config
                .get_nonempty_str("logging.file")
                .map(|p| config.resolve_path(p)),
            log_level: config
                .get_nonempty_str("logging.level")
                .unwrap_or("info")
                .to_lowercase(),
        })
    }

    /// Metadata sidecar path: `<artifact>.json`
    pub fn metadata_path(&self) -> PathBuf {
        sidecar(&self.output, "json")
    }
}

/// `<path>.<suffix>` without replacing an existing extension
pub fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::ValidationError(format!("{} {}", key, reason))
}

fn bool_or(config: &EffectiveConfig, key: &str, default: bool) -> Result<bool, ConfigError> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| invalid(key, "must be true or false")),
    }
}

fn validate_entry_point(script: &str) -> Result<String, ConfigError> {
    let path = Path::new(script);
    let escapes = path
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir));
    if escapes {
        return Err(invalid(
            "script",
            "must be a path inside the content directory",
        ));
    }
    Ok(script.trim_start_matches("./").to_string())
}

fn parse_compression(config: &EffectiveConfig) -> Result<Compression, ConfigError> {
    let name = config.get_str("compression.method").unwrap_or("gzip");
    let method: CompressionMethod = name
        .parse()
        .map_err(|e: shellpack_protocol::ProtocolError| ConfigError::ValidationError(e.to_string()))?;
    let level = config
        .get_u64("compression.level")
        .ok_or_else(|| invalid("compression.level", "must be an integer"))? as u32;
    Ok(Compression { method, level })
}

fn parse_exclude(config: &EffectiveConfig) -> Result<ExcludeSpec, ConfigError> {
    let patterns = config
        .get("exclude.patterns")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let spec = ExcludeSpec {
        patterns,
        ignore_case: bool_or(config, "exclude.ignore_case", true)?,
        standard: bool_or(config, "exclude.standard", false)?,
    };
    spec.rules()
        .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
    Ok(spec)
}

fn parse_encryption(config: &EffectiveConfig) -> Result<Encryption, ConfigError> {
    if !bool_or(config, "encryption.enabled", false)? {
        return Ok(Encryption::Disabled);
    }
    let tool = config.get_str("encryption.tool").unwrap_or("openssl");
    let spec = match tool.trim().to_lowercase().as_str() {
        "openssl" => CipherSpec::OpenSsl {
            cipher: config
                .get_nonempty_str("encryption.openssl_cipher")
                .ok_or_else(|| invalid("encryption.openssl_cipher", "must name a cipher"))?
                .to_string(),
            iterations: config
                .get_u64("encryption.openssl_iter")
                .ok_or_else(|| invalid("encryption.openssl_iter", "must be an integer"))?
                as u32,
        },
        "gpg" => CipherSpec::Gpg {
            cipher_algo: config
                .get_nonempty_str("encryption.gpg_cipher")
                .ok_or_else(|| invalid("encryption.gpg_cipher", "must name a cipher"))?
                .to_string(),
            s2k: S2kSpec::default(),
        },
        other => {
            return Err(ConfigError::ValidationError(format!(
                "encryption.tool must be openssl or gpg, got '{}'",
                other
            )))
        }
    };
    Ok(Encryption::Enabled(spec))
}

fn parse_update(config: &EffectiveConfig) -> Result<Update, ConfigError> {
    if !bool_or(config, "update.enabled", false)? {
        return Ok(Update::Disabled);
    }
    let mode: UpdateMode = config
        .get_str("update.mode")
        .unwrap_or("check-only")
        .parse()
        .map_err(|e: shellpack_protocol::ProtocolError| ConfigError::ValidationError(e.to_string()))?;

    let url = |key: &str| -> Result<String, ConfigError> {
        let value = config
            .get_nonempty_str(key)
            .ok_or_else(|| invalid(key, "is required when updates are enabled"))?;
        if !(value.starts_with("http://") || value.starts_with("https://")) {
            return Err(invalid(key, "must be an http(s) URL"));
        }
        Ok(value.to_string())
    };

    Ok(Update::Enabled(UpdateSpec {
        mode,
        version_url: url("update.version_url")?,
        package_url: url("update.package_url")?,
        feed_file: config
            .get_nonempty_str("update.feed_file")
            .map(|p| config.resolve_path(p)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_from(cli: serde_json::Value) -> Result<BuildSpec, ConfigError> {
        let config = EffectiveConfig::build(None, Some(cli), Path::new("/work"))?;
        BuildSpec::from_value(&config)
    }

    #[test]
    fn test_defaults() {
        let spec = spec_from(json!({})).unwrap();
        assert_eq!(spec.content_root, PathBuf::from("/work/./content"));
        assert_eq!(spec.output, PathBuf::from("/work/autoextract.sh"));
        assert_eq!(spec.entry_point.as_deref(), Some("start.sh"));
        assert_eq!(
            spec.compression,
            Compression {
                method: CompressionMethod::Gzip,
                level: 9
            }
        );
        assert!(spec.exclude.ignore_case);
        assert_eq!(spec.encryption, Encryption::Disabled);
        assert_eq!(spec.update, Update::Disabled);
        assert!(spec.generate_metadata);
        assert_eq!(spec.metadata_path(), PathBuf::from("/work/autoextract.sh.json"));
    }

    #[test]
    fn test_compression_alias() {
        let spec = spec_from(json!({"compression": {"method": "gz"}})).unwrap();
        assert_eq!(spec.compression.method, CompressionMethod::Gzip);
        let spec = spec_from(json!({"compression": {"method": "none"}})).unwrap();
        assert_eq!(spec.compression.method, CompressionMethod::Store);
    }

    #[test]
    fn test_unknown_compression() {
        let err = spec_from(json!({"compression": {"method": "zstd"}})).unwrap_err();
        assert!(err.to_string().contains("zstd"));
    }

    #[test]
    fn test_empty_script_disables_entry_point() {
        let spec = spec_from(json!({"script": ""})).unwrap();
        assert!(spec.entry_point.is_none());
    }

    #[test]
    fn test_escaping_script_rejected() {
        assert!(spec_from(json!({"script": "../evil.sh"})).is_err());
        assert!(spec_from(json!({"script": "/bin/sh"})).is_err());
        let spec = spec_from(json!({"script": "./bin/run.sh"})).unwrap();
        assert_eq!(spec.entry_point.as_deref(), Some("bin/run.sh"));
    }

    #[test]
    fn test_encryption_openssl() {
        let spec = spec_from(json!({"encryption": {"enabled": true}})).unwrap();
        assert_eq!(
            spec.encryption,
            Encryption::Enabled(CipherSpec::OpenSsl {
                cipher: "aes-256-cbc".to_string(),
                iterations: 10_000
            })
        );
    }

    #[test]
    fn test_encryption_gpg() {
        let spec = spec_from(json!({"encryption": {"enabled": true, "tool": "gpg"}})).unwrap();
        assert!(matches!(
            spec.encryption.cipher(),
            Some(CipherSpec::Gpg { cipher_algo, .. }) if cipher_algo == "AES256"
        ));
    }

    #[test]
    fn test_encryption_unknown_tool() {
        let err = spec_from(json!({"encryption": {"enabled": true, "tool": "age"}})).unwrap_err();
        assert!(err.to_string().contains("encryption.tool"));
    }

    #[test]
    fn test_update_requires_urls() {
        let err = spec_from(json!({"update": {"enabled": true}})).unwrap_err();
        assert!(err.to_string().contains("update.version_url"));

        let err = spec_from(json!({"update": {
            "enabled": true,
            "version_url": "ftp://example.com/feed.json",
            "package_url": "https://example.com/app.sh"
        }}))
        .unwrap_err();
        assert!(err.to_string().contains("http"));
    }

    #[test]
    fn test_update_enabled() {
        let spec = spec_from(json!({"update": {
            "enabled": true,
            "mode": "auto-replace",
            "version_url": "https://example.com/feed.json",
            "package_url": "https://example.com/app.sh",
            "feed_file": "dist/feed.json"
        }}))
        .unwrap();
        let update = spec.update.spec().unwrap();
        assert_eq!(update.mode, UpdateMode::AutoReplace);
        assert_eq!(update.feed_file, Some(PathBuf::from("/work/dist/feed.json")));
    }

    #[test]
    fn test_unknown_update_mode() {
        let err = spec_from(json!({"update": {
            "enabled": true,
            "mode": "sometimes",
            "version_url": "https://example.com/feed.json",
            "package_url": "https://example.com/app.sh"
        }}))
        .unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn test_standard_excludes_merge() {
        let spec = spec_from(json!({"exclude": {"patterns": ["*.log"], "standard": true}})).unwrap();
        let rules = spec.exclude.rules().unwrap();
        assert!(rules.is_dir_excluded(".git"));
        // listed once even though the catalogue also has it
        assert_eq!(rules.patterns().iter().filter(|p| *p == "*.log").count(), 1);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = spec_from(json!({"exclude": {"patterns": ["[oops"]}})).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
