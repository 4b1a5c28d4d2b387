//! Build pipeline
//!
//! Runs the build phase end to end:
//! - Archive the content tree and compute the manifest
//! - Encrypt the archive and produce the verification token
//! - Render the template and write the artifact
//! - Seal the build record and write the sidecar and update feed
//!
//! Intermediates live in a registered temporary directory, so an interrupt
//! or an error leaves nothing behind except when debugging.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::archive::{ArchiveError, Archiver, Manifest};
use crate::checksum;
use crate::config::{BuildSpec, ConfigError};
use crate::context::BuildContext;
use crate::crypto::{Cipher, CryptoError, Encryptor, Password};
use crate::metadata::{build_id_after, BuildRecord, MetadataError, Provenance, PublicMetadata};
use crate::signal::EXIT_CODE_CANCELLED;
use crate::template::{write_artifact, Template, TemplateError, TemplateFields};

/// Build errors
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("encryption error: {0}")]
    Encryption(#[from] CryptoError),

    #[error("encryption is enabled but no password was given")]
    MissingPassword,

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl BuildError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Config(_) => 2,
            BuildError::Archive(_) => 3,
            BuildError::Encryption(_) | BuildError::MissingPassword => 4,
            BuildError::Template(_) => 5,
            BuildError::Metadata(_) | BuildError::Io(_) => 1,
            BuildError::Cancelled => EXIT_CODE_CANCELLED,
        }
    }
}

/// Result type for build operations
pub type BuildResult<T> = Result<T, BuildError>;

/// What a successful build produced
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub artifact: PathBuf,
    pub artifact_sha256: String,
    pub build_version: String,
    /// Sealed record the sidecar and feed were written from
    pub record: BuildRecord,
    pub metadata_path: Option<PathBuf>,
    pub feed_path: Option<PathBuf>,
    /// Work directory kept for debugging
    pub kept_work_dir: Option<PathBuf>,
}

impl BuildReport {
    pub fn manifest(&self) -> &Manifest {
        &self.record.manifest
    }

    pub fn is_encrypted(&self) -> bool {
        self.record.encryption_enabled()
    }
}

/// One build of one [`BuildSpec`]
pub struct BuildPipeline<'a> {
    spec: &'a BuildSpec,
    ctx: &'a BuildContext,
    password: Option<Password>,
    cipher: Option<Box<dyn Cipher>>,
    now: Option<DateTime<Local>>,
    /// Outputs written so far
    written: Vec<PathBuf>,
}

impl<'a> BuildPipeline<'a> {
    pub fn new(spec: &'a BuildSpec, ctx: &'a BuildContext) -> Self {
        Self {
            spec,
            ctx,
            password: None,
            cipher: None,
            now: None,
            written: Vec::new(),
        }
    }

    /// Password for encrypted builds
    pub fn with_password(mut self, password: Password) -> Self {
        self.password = Some(password);
        self
    }

    /// Use this cipher instead of the configured one
    pub fn with_cipher(mut self, cipher: Box<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Fix the build time
    pub fn with_clock(mut self, now: DateTime<Local>) -> Self {
        self.now = Some(now);
        self
    }

    fn check_cancelled(&self) -> BuildResult<()> {
        if self.ctx.temps.state().is_cancel_requested() {
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }

    fn encryptor(&mut self) -> Option<Encryptor> {
        match self.cipher.take() {
            Some(cipher) => Some(Encryptor::new(cipher)),
            None => self.spec.encryption.cipher().map(Encryptor::from_spec),
        }
    }

    /// Run every step. On error the artifact and sidecars of this build are
    /// removed.
    pub fn run(mut self) -> BuildResult<BuildReport> {
        let spec = self.spec;
        let encrypting = spec.encryption.is_enabled() || self.cipher.is_some();
        if encrypting
            && self
                .password
                .as_ref()
                .map_or(true, |p| p.is_empty())
        {
            return Err(BuildError::MissingPassword);
        }

        let now = self.now.unwrap_or_else(Local::now);
        let previous = PublicMetadata::read_build_version(&spec.metadata_path());
        let build_version = build_id_after(now, previous.as_deref());
        info!("Building {} (build {})", spec.output.display(), build_version);

        let work = self.ctx.temps.temp_dir()?;
        let result = self.run_in(work.path(), build_version, now);
        if let Err(e) = &result {
            warn!("Build failed: {}", e);
            remove_outputs(&self.written);
        }

        let kept_work_dir = if self.ctx.debug {
            let kept = work.keep();
            info!("Keeping work directory {}", kept.display());
            Some(kept)
        } else {
            None
        };
        result.map(|mut report| {
            report.kept_work_dir = kept_work_dir;
            report
        })
    }

    fn run_in(
        &mut self,
        work: &Path,
        build_version: String,
        now: DateTime<Local>,
    ) -> BuildResult<BuildReport> {
        let spec = self.spec;
        let mut record = BuildRecord::new(spec, build_version, Provenance::current(now));

        self.check_cancelled()?;
        let archive = Archiver::new(spec.content_root.clone())
            .with_exclude(spec.exclude.rules().map_err(ArchiveError::from)?)
            .with_compression(spec.compression.method, spec.compression.level)
            .create(work)?;
        info!(
            "Archived {} files ({} excluded), {} bytes",
            archive.manifest.files.len(),
            archive.manifest.excluded.len(),
            archive.manifest.archive_size
        );
        record.set_manifest(archive.manifest.clone())?;

        self.check_cancelled()?;
        let mut payload = archive.path.clone();
        if let Some(encryptor) = self.encryptor() {
            let password = self.password.as_ref().ok_or(BuildError::MissingPassword)?;
            let encrypted = encryptor.encrypt_archive(&archive.path, password)?;
            let token = encryptor.encrypt_token(password)?;
            if !encryptor.verify_token(&token.ciphertext_b64, password)? {
                return Err(CryptoError::Unsupported(
                    "verification token does not decrypt with the build password".to_string(),
                )
                .into());
            }
            record.set_encryption(&encrypted, &token)?;
            payload = encrypted.path;
        }

        self.check_cancelled()?;
        let template = Template::load(spec.template.as_deref())?;
        debug!("Using template {}", template.origin());
        let fields = TemplateFields::from_record(&record, spec);
        let header = template.render(&fields)?;
        write_artifact(&header, &payload, &spec.output)?;
        self.written.push(spec.output.clone());

        let artifact_sha256 = checksum::sha256_file(&spec.output)?;
        record.finalize(artifact_sha256.clone())?;
        info!("Wrote {} ({})", spec.output.display(), artifact_sha256);

        let metadata_path = if spec.generate_metadata {
            let path = spec.metadata_path();
            self.written.push(path.clone());
            record.write_public_metadata(&path)?;
            debug!("Wrote metadata {}", path.display());
            Some(path)
        } else {
            None
        };

        let feed_path = match spec.update.spec().and_then(|u| u.feed_file.clone()) {
            Some(path) => {
                self.written.push(path.clone());
                record.write_update_feed(&path)?;
                info!("Wrote update feed {}", path.display());
                Some(path)
            }
            None => None,
        };

        Ok(BuildReport {
            artifact: spec.output.clone(),
            artifact_sha256,
            build_version: record.build_version.clone(),
            record,
            metadata_path,
            feed_path,
            kept_work_dir: None,
        })
    }
}

fn remove_outputs(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed partial output {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

/// Build a spec with the given context; shorthand for [`BuildPipeline`]
pub fn build(
    spec: &BuildSpec,
    ctx: &BuildContext,
    password: Option<Password>,
) -> BuildResult<BuildReport> {
    let mut pipeline = BuildPipeline::new(spec, ctx);
    if let Some(password) = password {
        pipeline = pipeline.with_password(password);
    }
    pipeline.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EffectiveConfig;
    use crate::crypto::MockCipher;
    use serde_json::{json, Value};
    use shellpack_protocol::HeaderInfo;
    use tempfile::TempDir;

    fn spec_for(dir: &Path, overrides: Value) -> BuildSpec {
        let config = EffectiveConfig::build(None, Some(overrides), dir).unwrap();
        BuildSpec::from_value(&config).unwrap()
    }

    fn content(dir: &Path) {
        fs::create_dir_all(dir.join("content/bin")).unwrap();
        fs::write(dir.join("content/bin/start.sh"), "#!/bin/sh\necho hi\n").unwrap();
        fs::write(dir.join("content/notes.txt"), "notes").unwrap();
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(BuildError::Config(ConfigError::ParseError(String::new())).exit_code(), 2);
        assert_eq!(BuildError::MissingPassword.exit_code(), 4);
        assert_eq!(BuildError::Template(TemplateError::MissingMarker).exit_code(), 5);
        assert_eq!(BuildError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_plain_build_writes_artifact_and_sidecar() {
        let dir = TempDir::new().unwrap();
        content(dir.path());
        let spec = spec_for(dir.path(), json!({"script": "bin/start.sh"}));
        let ctx = BuildContext::default();

        let report = build(&spec, &ctx, None).unwrap();
        assert!(report.artifact.exists());
        assert_eq!(report.manifest().files.len(), 2);
        assert!(!report.is_encrypted());
        assert_eq!(checksum::sha256_file(&report.artifact).unwrap(), report.artifact_sha256);

        let sidecar = fs::read_to_string(report.metadata_path.unwrap()).unwrap();
        let public = PublicMetadata::from_json(&sidecar).unwrap();
        assert_eq!(public.build_version, report.build_version);
        assert!(public.password_check_token_b64.is_none());

        let header = HeaderInfo::from_artifact(&fs::read(&report.artifact).unwrap()).unwrap();
        assert_eq!(header.get("SP_ENTRY_POINT"), Some("bin/start.sh"));
        assert_eq!(header.manifest.len(), 2);
    }

    #[test]
    fn test_encrypted_build_requires_password() {
        let dir = TempDir::new().unwrap();
        content(dir.path());
        let spec = spec_for(dir.path(), json!({"encryption": {"enabled": true}}));
        let ctx = BuildContext::default();

        let err = build(&spec, &ctx, None).unwrap_err();
        assert!(matches!(err, BuildError::MissingPassword));
        assert!(!spec.output.exists());
    }

    #[test]
    fn test_mock_cipher_build_records_token() {
        let dir = TempDir::new().unwrap();
        content(dir.path());
        let spec = spec_for(dir.path(), json!({}));
        let ctx = BuildContext::default();

        let report = BuildPipeline::new(&spec, &ctx)
            .with_cipher(Box::new(MockCipher::new()))
            .with_password(Password::new("p1"))
            .run()
            .unwrap();
        let enc = report.record.encryption.as_ref().unwrap();
        assert_eq!(enc.params.tool, MockCipher::TOOL);
        assert!(!enc.password_check_token_b64.is_empty());

        let header = HeaderInfo::from_artifact(&fs::read(&report.artifact).unwrap()).unwrap();
        assert!(header.flag("SP_ENCRYPTED"));
        assert_eq!(
            header.get("SP_ENCRYPTED_SHA256"),
            Some(enc.encrypted_archive_checksum_sha256.as_str())
        );
    }

    #[test]
    fn test_build_ids_increase() {
        let dir = TempDir::new().unwrap();
        content(dir.path());
        let spec = spec_for(dir.path(), json!({}));
        let ctx = BuildContext::default();
        let now = Local::now();

        let first = BuildPipeline::new(&spec, &ctx).with_clock(now).run().unwrap();
        let second = BuildPipeline::new(&spec, &ctx).with_clock(now).run().unwrap();
        assert!(second.build_version > first.build_version);
    }

    #[test]
    fn test_missing_content_fails_without_outputs() {
        let dir = TempDir::new().unwrap();
        let spec = spec_for(dir.path(), json!({"content": "nowhere"}));
        let ctx = BuildContext::default();

        let err = build(&spec, &ctx, None).unwrap_err();
        assert!(matches!(err, BuildError::Archive(ArchiveError::SourceMissing(_))));
        assert_eq!(err.exit_code(), 3);
        assert!(!spec.output.exists());
        assert!(!spec.metadata_path().exists());
    }

    #[test]
    fn test_failed_feed_write_removes_artifact() {
        let dir = TempDir::new().unwrap();
        content(dir.path());
        // A directory where the feed file should go
        fs::create_dir_all(dir.path().join("feed.json")).unwrap();
        let spec = spec_for(
            dir.path(),
            json!({
                "update": {
                    "enabled": true,
                    "version_url": "https://example.com/feed.json",
                    "package_url": "https://example.com/autoextract.sh",
                    "feed_file": "feed.json"
                }
            }),
        );
        let ctx = BuildContext::default();

        let err = build(&spec, &ctx, None).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(!spec.output.exists());
        assert!(!spec.metadata_path().exists());
        assert!(dir.path().join("feed.json").is_dir());
    }

    #[test]
    fn test_feed_file_written() {
        let dir = TempDir::new().unwrap();
        content(dir.path());
        let spec = spec_for(
            dir.path(),
            json!({
                "update": {
                    "enabled": true,
                    "version_url": "https://example.com/feed.json",
                    "package_url": "https://example.com/autoextract.sh",
                    "feed_file": "publish/feed.json"
                }
            }),
        );
        let ctx = BuildContext::default();
        let report = build(&spec, &ctx, None).unwrap();
        let feed_path = report.feed_path.unwrap();
        assert_eq!(feed_path, dir.path().join("publish/feed.json"));
        let feed = shellpack_protocol::UpdateFeed::from_json(&fs::read_to_string(feed_path).unwrap())
            .unwrap();
        assert_eq!(feed.script_checksum_sha256.as_deref(), Some(report.artifact_sha256.as_str()));
    }
}
