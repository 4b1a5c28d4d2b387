//! Reference runner for generated artifacts
//!
//! Executes the same protocol as the shell harness embedded in every
//! artifact: `Start → LocatePayload → (Decrypt) → Extract → VerifyManifest
//! → (UpdateCheck) → RunEntryPoint → Cleanup → End`, with `Abort` reachable
//! from any step. `shellpack extract` and the conformance tests drive it.

pub mod extract;
pub mod prompt;
pub mod update;

pub use extract::{unpack, verify_manifest, Unpacked, Verification};
pub use prompt::{
    EnvPassword, FixedPasswords, Interaction, PasswordChain, PasswordSource, ScriptedInteraction,
    TtyInteraction,
};
pub use update::{
    FeedClient, HttpFeedClient, UpdateChecker, UpdateError, UpdateOutcome, UpdateTarget,
};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use shellpack_protocol::header::{vars, HeaderInfo};
use shellpack_protocol::{
    split_artifact, CompressionMethod, ProtocolError, TokenParams, UpdateMode,
    MAX_DECRYPT_ATTEMPTS,
};

use crate::checksum;
use crate::crypto::{cipher_from_params, CryptoError, Password};
use crate::signal::{RegisteredTempDir, TempRegistry};

/// Fatal runtime errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("payload marker not found; the artifact is damaged")]
    MissingMarker,

    #[error("cannot decode the artifact: {0}")]
    Decode(String),

    #[error("this artifact must be run as root")]
    NeedRoot,

    #[error("decryption failed after {attempts} attempts")]
    Password { attempts: u32 },

    #[error("decryption unavailable: {0}")]
    Crypto(#[from] CryptoError),

    #[error("could not extract the archive: {0}")]
    Extract(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("entry point {path}: {reason}")]
    EntryPoint {
        path: String,
        reason: String,
        status: Option<i32>,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingMarker | Self::Decode(_) => 2,
            Self::Password { .. } | Self::Crypto(_) => 4,
            Self::Extract(_) => 5,
            Self::Integrity(_) => 6,
            Self::EntryPoint {
                status: Some(code), ..
            } if *code != 0 => *code,
            Self::EntryPoint { .. } => 7,
            Self::NeedRoot | Self::Io(_) => 1,
        }
    }
}

impl From<ProtocolError> for RuntimeError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::MissingMarker => Self::MissingMarker,
            other => Self::Decode(other.to_string()),
        }
    }
}

/// Protocol steps, in the order they can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Start,
    LocatePayload,
    Decrypt,
    Extract,
    VerifyManifest,
    UpdateCheck,
    RunEntryPoint,
    Cleanup,
    End,
    Abort,
}

/// Runtime switches, mirroring the artifact's own command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Extract here instead of a temporary directory; kept afterwards
    pub dir: Option<PathBuf>,
    pub extract_only: bool,
    pub force_download: bool,
    pub no_update_check: bool,
    pub no_verify: bool,
    pub no_cleanup: bool,
    /// Implies `no_cleanup`
    pub debug: bool,
    /// Arguments passed to the entry point
    pub entry_args: Vec<String>,
}

impl RunOptions {
    fn keep_temporaries(&self) -> bool {
        self.no_cleanup || self.debug
    }
}

/// What a completed run did
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub build_version: String,
    /// Where the content was extracted
    pub extract_dir: PathBuf,
    /// Whether `extract_dir` still exists
    pub extract_dir_kept: bool,
    pub unpacked: Unpacked,
    /// `None` when verification was disabled
    pub verification: Option<Verification>,
    /// `None` when no check ran; errors are kept as text
    pub update: Option<Result<UpdateOutcome, String>>,
    /// Exit status of the entry point, if it ran
    pub entry_status: Option<i32>,
    /// Steps taken, including those of a run restarted after an update
    pub trace: Vec<RunState>,
}

enum Step {
    Done(RunOutcome),
    /// The artifact was replaced; run the new one without an update check
    Restart,
}

/// Results of the steps between payload decoding and cleanup
struct Processed {
    unpacked: Unpacked,
    verification: Option<Verification>,
    update: Option<Result<UpdateOutcome, String>>,
    entry_status: Option<i32>,
}

/// Header facts the runner needs
#[derive(Debug, Clone)]
struct Declared {
    build_version: String,
    method: Option<CompressionMethod>,
    archive_sha256: String,
    encryption: Option<(TokenParams, String)>,
    entry_point: Option<String>,
    need_root: bool,
    update: Option<(UpdateMode, String, String)>,
}

impl Declared {
    fn from_header(info: &HeaderInfo) -> Result<Self, RuntimeError> {
        let encryption = if info.flag(vars::ENCRYPTED) {
            let params = TokenParams {
                tool: info.require(vars::ENC_TOOL)?.to_string(),
                cipher: info.get_or_empty(vars::ENC_CIPHER).to_string(),
                iter: info.get(vars::ENC_ITER).and_then(|i| i.parse().ok()),
                s2k_options: info
                    .get(vars::ENC_S2K)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            };
            Some((params, info.get_or_empty(vars::ENCRYPTED_SHA256).to_string()))
        } else {
            None
        };

        let update = if info.flag(vars::UPDATE_ENABLED) {
            let mode = info
                .get_or_empty(vars::UPDATE_MODE)
                .parse::<UpdateMode>()
                .unwrap_or_default();
            Some((
                mode,
                info.get_or_empty(vars::VERSION_URL).to_string(),
                info.get_or_empty(vars::PACKAGE_URL).to_string(),
            ))
        } else {
            None
        };

        Ok(Self {
            build_version: info.get_or_empty(vars::BUILD_VERSION).to_string(),
            method: info.get(vars::COMPRESSION).and_then(|m| m.parse().ok()),
            archive_sha256: info.get_or_empty(vars::ARCHIVE_SHA256).to_string(),
            encryption,
            entry_point: info
                .get(vars::ENTRY_POINT)
                .filter(|e| !e.is_empty())
                .map(str::to_string),
            need_root: info.flag(vars::NEED_ROOT),
            update,
        })
    }
}

/// Runs one artifact
pub struct Runner<'a> {
    artifact: PathBuf,
    options: RunOptions,
    passwords: Box<dyn PasswordSource + 'a>,
    interaction: Box<dyn Interaction + 'a>,
    feed_client: Option<Box<dyn FeedClient + 'a>>,
    temps: TempRegistry,
    trace: Vec<RunState>,
}

impl<'a> Runner<'a> {
    /// Runner reading passwords from `SHELLPACK_PASSWORD` and then the
    /// terminal, fetching updates over HTTP
    pub fn new(artifact: impl Into<PathBuf>, options: RunOptions) -> Self {
        Self {
            artifact: artifact.into(),
            options,
            passwords: Box::new(EnvPassword::new()),
            interaction: Box::new(TtyInteraction::new()),
            feed_client: None,
            temps: TempRegistry::new(),
            trace: Vec::new(),
        }
    }

    pub fn with_passwords(mut self, passwords: impl PasswordSource + 'a) -> Self {
        self.passwords = Box::new(passwords);
        self
    }

    pub fn with_interaction(mut self, interaction: impl Interaction + 'a) -> Self {
        self.interaction = Box::new(interaction);
        self
    }

    pub fn with_feed_client(mut self, client: impl FeedClient + 'a) -> Self {
        self.feed_client = Some(Box::new(client));
        self
    }

    pub fn with_temps(mut self, temps: TempRegistry) -> Self {
        self.temps = temps;
        self
    }

    /// Run to completion
    pub fn run(mut self) -> Result<RunOutcome, RuntimeError> {
        loop {
            match self.run_once() {
                Ok(Step::Done(mut outcome)) => {
                    outcome.trace = std::mem::take(&mut self.trace);
                    return Ok(outcome);
                }
                Ok(Step::Restart) => {
                    info!("Restarting with the updated artifact");
                    self.options.no_update_check = true;
                    self.options.force_download = false;
                }
                Err(e) => {
                    self.trace.push(RunState::Abort);
                    error!("{}", e);
                    return Err(e);
                }
            }
        }
    }

    fn enter(&mut self, state: RunState) {
        debug!("Runtime step: {:?}", state);
        self.trace.push(state);
    }

    fn run_once(&mut self) -> Result<Step, RuntimeError> {
        self.enter(RunState::Start);
        let bytes = fs::read(&self.artifact)?;

        self.enter(RunState::LocatePayload);
        let split = split_artifact(&bytes)?;
        let header = HeaderInfo::parse(split.header)?;
        let declared = Declared::from_header(&header)?;
        if declared.need_root && !running_as_root() {
            return Err(RuntimeError::NeedRoot);
        }
        let payload: Vec<u8> = split
            .payload
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let payload = BASE64
            .decode(payload)
            .map_err(|e| RuntimeError::Decode(format!("payload is not valid base64: {}", e)))?;
        drop(bytes);

        let work = self.temps.temp_dir()?;
        let (extract_dir, extract_temp) = match self.extraction_dir() {
            Ok(target) => target,
            Err(e) => {
                self.release_on_error(work, None);
                return Err(e);
            }
        };

        let steps = match self.process(&declared, &header, payload, work.path(), &extract_dir) {
            Ok(steps) => steps,
            Err(e) => {
                self.release_on_error(work, extract_temp);
                return Err(e);
            }
        };
        let Processed {
            unpacked,
            verification,
            update,
            entry_status,
        } = match steps {
            Some(processed) => processed,
            None => {
                self.enter(RunState::Cleanup);
                self.cleanup(work, extract_temp);
                return Ok(Step::Restart);
            }
        };

        self.enter(RunState::Cleanup);
        let extract_dir_kept = self.cleanup(work, extract_temp);
        self.enter(RunState::End);

        if let Some(status) = entry_status.filter(|s| *s != 0) {
            return Err(RuntimeError::EntryPoint {
                path: declared.entry_point.unwrap_or_default(),
                reason: format!("exited with status {}", status),
                status: Some(status),
            });
        }

        Ok(Step::Done(RunOutcome {
            build_version: declared.build_version,
            extract_dir,
            extract_dir_kept,
            unpacked,
            verification,
            update,
            entry_status,
            trace: Vec::new(),
        }))
    }

    /// Decrypt through the entry point; `None` when an update replaced the artifact
    fn process(
        &mut self,
        declared: &Declared,
        header: &HeaderInfo,
        payload: Vec<u8>,
        work: &Path,
        extract_dir: &Path,
    ) -> Result<Option<Processed>, RuntimeError> {
        let archive = match &declared.encryption {
            Some((params, encrypted_sha256)) => {
                self.enter(RunState::Decrypt);
                let encrypted = work.join("payload.enc");
                fs::write(&encrypted, &payload)?;
                if !encrypted_sha256.is_empty()
                    && checksum::sha256_file(&encrypted)? != *encrypted_sha256
                {
                    return Err(RuntimeError::Integrity(
                        "encrypted payload checksum mismatch".to_string(),
                    ));
                }
                let archive = work.join("payload.tar");
                self.decrypt(params, &encrypted, &archive, &declared.archive_sha256)?;
                archive
            }
            None => {
                let archive = work.join("payload.tar");
                fs::write(&archive, &payload)?;
                archive
            }
        };
        drop(payload);

        self.enter(RunState::Extract);
        if !declared.archive_sha256.is_empty()
            && checksum::sha256_file(&archive)? != declared.archive_sha256
        {
            return Err(RuntimeError::Integrity("archive checksum mismatch".to_string()));
        }
        let unpacked =
            unpack(&archive, extract_dir, declared.method).map_err(RuntimeError::Extract)?;

        let verification = if self.options.no_verify {
            None
        } else {
            self.enter(RunState::VerifyManifest);
            let verification = verify_manifest(extract_dir, &header.manifest)?;
            if !verification.is_ok() {
                return Err(RuntimeError::Integrity(format!(
                    "{} files do not match: {}",
                    verification.mismatched.len(),
                    verification.mismatched.join(", ")
                )));
            }
            Some(verification)
        };

        let mut update = None;
        if let (Some(target), false) = (self.update_target(declared), self.options.no_update_check) {
            self.enter(RunState::UpdateCheck);
            let result = self.check_update(&target, work);
            if let Ok(UpdateOutcome::Replaced { .. }) = result {
                return Ok(None);
            }
            update = Some(result.map_err(|e| {
                warn!("Update skipped: {}", e);
                e.to_string()
            }));
        }

        let mut entry_status = None;
        if !self.options.extract_only {
            if let Some(entry) = &declared.entry_point {
                self.enter(RunState::RunEntryPoint);
                entry_status = Some(self.run_entry_point(extract_dir, entry)?);
            }
        }

        Ok(Some(Processed {
            unpacked,
            verification,
            update,
            entry_status,
        }))
    }

    /// Target directory and, when temporary, its guard
    fn extraction_dir(&self) -> Result<(PathBuf, Option<RegisteredTempDir>), RuntimeError> {
        match &self.options.dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                Ok((dir.canonicalize()?, None))
            }
            None => {
                let dir = self.temps.temp_dir()?;
                Ok((dir.path().to_path_buf(), Some(dir)))
            }
        }
    }

    fn decrypt(
        &mut self,
        params: &TokenParams,
        encrypted: &Path,
        archive: &Path,
        archive_sha256: &str,
    ) -> Result<(), RuntimeError> {
        let cipher = cipher_from_params(params)?;
        for attempt in 1..=MAX_DECRYPT_ATTEMPTS {
            let password = match self.passwords.next_password(attempt) {
                Some(p) => p,
                None => match self.interaction.prompt_secret("Password") {
                    Some(p) => Password::new(p),
                    None => {
                        return Err(RuntimeError::Password {
                            attempts: attempt - 1,
                        })
                    }
                },
            };

            match cipher.decrypt_file(encrypted, archive, &password) {
                Ok(()) => {
                    // A wrong key can still unpad cleanly
                    if archive_sha256.is_empty()
                        || checksum::sha256_file(archive)? == archive_sha256
                    {
                        self.passwords.accepted();
                        info!("Payload decrypted");
                        return Ok(());
                    }
                }
                Err(e) if e.is_rejection() => {}
                Err(e) => return Err(e.into()),
            }
            let _ = fs::remove_file(archive);
            warn!("Wrong password ({}/{})", attempt, MAX_DECRYPT_ATTEMPTS);
        }
        Err(RuntimeError::Password {
            attempts: MAX_DECRYPT_ATTEMPTS,
        })
    }

    fn update_target(&self, declared: &Declared) -> Option<UpdateTarget> {
        let (mode, version_url, package_url) = declared.update.clone()?;
        Some(UpdateTarget {
            artifact: self
                .artifact
                .canonicalize()
                .unwrap_or_else(|_| self.artifact.clone()),
            build_version: declared.build_version.clone(),
            mode,
            version_url,
            package_url,
            encryption: declared.encryption.as_ref().map(|(p, _)| p.clone()),
        })
    }

    fn check_update(&mut self, target: &UpdateTarget, work: &Path) -> Result<UpdateOutcome, UpdateError> {
        let http;
        let client: &dyn FeedClient = match &self.feed_client {
            Some(client) => client.as_ref(),
            None => {
                http = HttpFeedClient::new()?;
                &http
            }
        };
        UpdateChecker::new(client, self.interaction.as_mut())
            .with_force_download(self.options.force_download)
            .check(target, work)
    }

    fn run_entry_point(&self, dir: &Path, entry: &str) -> Result<i32, RuntimeError> {
        let fail = |reason: String| RuntimeError::EntryPoint {
            path: entry.to_string(),
            reason,
            status: None,
        };
        if Path::new(entry)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir))
        {
            return Err(fail("path leaves the extraction directory".to_string()));
        }
        let path = dir.join(entry);
        if !path.is_file() {
            return Err(fail("not found".to_string()));
        }
        make_executable(&path)?;

        info!("Running {}", entry);
        let status = Command::new(&path)
            .args(&self.options.entry_args)
            .current_dir(dir)
            .status()
            .map_err(|e| fail(e.to_string()))?;
        let code = status.code().unwrap_or(1);
        if code != 0 {
            error!("{} exited with status {}", entry, code);
        }
        Ok(code)
    }

    /// A failed run leaves its temporaries behind only when asked to
    fn release_on_error(&self, work: RegisteredTempDir, extract_temp: Option<RegisteredTempDir>) {
        if !self.options.keep_temporaries() {
            return;
        }
        info!("Keeping work directory {}", work.keep().display());
        if let Some(dir) = extract_temp {
            info!("Keeping extraction directory {}", dir.keep().display());
        }
    }

    /// Release temporaries; returns whether the extraction dir remains
    fn cleanup(&self, work: RegisteredTempDir, extract_temp: Option<RegisteredTempDir>) -> bool {
        let keep = self.options.keep_temporaries();
        if keep {
            info!("Keeping work directory {}", work.keep().display());
        }
        match extract_temp {
            None => true,
            Some(dir) if keep || self.options.extract_only => {
                dir.keep();
                true
            }
            Some(_) => false,
        }
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    true
}

fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
