//! Self-update step of the runner
//!
//! Fetches the update feed, compares build versions, checks the password
//! token for encrypted builds, downloads and verifies the published
//! artifact, then acts according to the update mode. Every failure is an
//! [`UpdateError`] that the runner logs before carrying on.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use shellpack_protocol::{TokenParams, UpdateFeed, UpdateMode, UPDATE_TIMEOUT_SECS};

use super::prompt::Interaction;
use crate::checksum;
use crate::crypto::{verify_published_token, CryptoError, Password};

/// Update errors. None of these abort a run.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("could not fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("update feed is malformed: {0}")]
    Feed(String),

    #[error("the feed has no password check token")]
    MissingToken,

    #[error("no password available to check the published token")]
    NoPassword,

    #[error("password rejected by the published token")]
    PasswordRejected,

    #[error("the feed has no artifact checksum")]
    MissingChecksum,

    #[error("download does not match the published checksum (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("token check failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Source of update feeds and packages
pub trait FeedClient {
    fn fetch_feed(&self, url: &str) -> Result<UpdateFeed, UpdateError>;

    /// Download `url` into `dest`
    fn download(&self, url: &str, dest: &Path) -> Result<(), UpdateError>;
}

impl<T: FeedClient + ?Sized> FeedClient for &T {
    fn fetch_feed(&self, url: &str) -> Result<UpdateFeed, UpdateError> {
        (**self).fetch_feed(url)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), UpdateError> {
        (**self).download(url, dest)
    }
}

/// HTTP(S) client with a bounded timeout
pub struct HttpFeedClient {
    client: Client,
}

impl HttpFeedClient {
    pub fn new() -> Result<Self, UpdateError> {
        Self::with_timeout(Duration::from_secs(UPDATE_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, UpdateError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("shellpack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpdateError::Fetch {
                url: String::new(),
                reason: format!("cannot create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, UpdateError> {
        let fetch_err = |reason: String| UpdateError::Fetch {
            url: url.to_string(),
            reason,
        };
        let response = self.client.get(url).send().map_err(|e| fetch_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", response.status())));
        }
        Ok(response)
    }
}

impl FeedClient for HttpFeedClient {
    fn fetch_feed(&self, url: &str) -> Result<UpdateFeed, UpdateError> {
        let body = self
            .get(url)?
            .text()
            .map_err(|e| UpdateError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        UpdateFeed::from_json(&body).map_err(|e| UpdateError::Feed(e.to_string()))
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), UpdateError> {
        let mut response = self.get(url)?;
        let mut file = File::create(dest)?;
        if let Err(e) = response.copy_to(&mut file) {
            drop(file);
            let _ = fs::remove_file(dest);
            return Err(UpdateError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }
}

/// What the running artifact declares about updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTarget {
    /// The artifact being run
    pub artifact: PathBuf,
    pub build_version: String,
    pub mode: UpdateMode,
    pub version_url: String,
    pub package_url: String,
    /// Cipher parameters from the header, for encrypted builds
    pub encryption: Option<TokenParams>,
}

/// Outcome of an update check that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    /// Newer build announced, nothing downloaded
    Available { version: String },
    /// Newer build saved beside the running artifact
    Downloaded { version: String, path: PathBuf },
    /// Running artifact replaced; the previous one kept as `backup`
    Replaced { version: String, backup: PathBuf },
}

/// Performs one update check
pub struct UpdateChecker<'a> {
    client: &'a dyn FeedClient,
    interaction: &'a mut dyn Interaction,
    force_download: bool,
}

impl<'a> UpdateChecker<'a> {
    pub fn new(client: &'a dyn FeedClient, interaction: &'a mut dyn Interaction) -> Self {
        Self {
            client,
            interaction,
            force_download: false,
        }
    }

    /// Download even when the feed is not newer. The mode still applies.
    pub fn with_force_download(mut self, force: bool) -> Self {
        self.force_download = force;
        self
    }

    /// Run the check; `work_dir` holds the download until it is placed
    pub fn check(&mut self, target: &UpdateTarget, work_dir: &Path) -> Result<UpdateOutcome, UpdateError> {
        debug!("Fetching update feed {}", target.version_url);
        let feed = self.client.fetch_feed(&target.version_url)?;

        if !self.force_download && !feed.announces_newer_than(&target.build_version) {
            info!("Up to date (build {})", target.build_version);
            return Ok(UpdateOutcome::UpToDate);
        }
        let version = feed.build_version.clone();
        info!(
            "Build {} is available (running {})",
            version, target.build_version
        );
        if target.mode == UpdateMode::CheckOnly {
            info!("Download it from {}", target.package_url);
            return Ok(UpdateOutcome::Available { version });
        }

        if let Some(header_params) = &target.encryption {
            self.check_token(&feed, header_params, &version)?;
        }

        let expected = feed
            .script_checksum_sha256
            .as_deref()
            .filter(|c| !c.is_empty() && *c != "null")
            .ok_or(UpdateError::MissingChecksum)?
            .to_ascii_lowercase();

        let download = work_dir.join("download");
        self.client.download(&target.package_url, &download)?;
        let actual = checksum::sha256_file(&download)?;
        if actual != expected {
            let _ = fs::remove_file(&download);
            return Err(UpdateError::ChecksumMismatch { expected, actual });
        }
        debug!("Download verified: {}", actual);

        let beside = beside_path(&target.artifact, &target.package_url);
        match target.mode {
            UpdateMode::CheckOnly => Ok(UpdateOutcome::Available { version }),
            UpdateMode::DownloadOnly => save_beside(&download, &beside, version),
            UpdateMode::AutoReplace => {
                let question = format!(
                    "Replace {} with build {}?",
                    target.artifact.display(),
                    version
                );
                if self.interaction.confirm(&question) {
                    replace_artifact(&download, &target.artifact, version)
                } else {
                    save_beside(&download, &beside, version)
                }
            }
            UpdateMode::AutoReplaceAlways => replace_artifact(&download, &target.artifact, version),
        }
    }

    fn check_token(
        &mut self,
        feed: &UpdateFeed,
        header_params: &TokenParams,
        version: &str,
    ) -> Result<(), UpdateError> {
        if !feed.has_token() {
            return Err(UpdateError::MissingToken);
        }
        let token = feed.password_check_token_b64.as_deref().unwrap_or_default();
        let params = feed
            .token_encryption_params
            .clone()
            .unwrap_or_else(|| header_params.clone());

        let prompt = format!("Password for build {}", version);
        let password = self
            .interaction
            .prompt_secret(&prompt)
            .map(Password::new)
            .ok_or(UpdateError::NoPassword)?;

        if verify_published_token(token, &params, &password)? {
            info!("Password accepted");
            Ok(())
        } else {
            Err(UpdateError::PasswordRejected)
        }
    }
}

/// Where a non-replacing download lands: the package's file name next to
/// the artifact, or `<artifact>.new` if that is the artifact itself
pub fn beside_path(artifact: &Path, package_url: &str) -> PathBuf {
    let dir = artifact.parent().unwrap_or(Path::new("."));
    let without_query = package_url.split(['?', '#']).next().unwrap_or_default();
    let name = without_query
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("update.sh");
    let candidate = dir.join(name);
    if candidate == artifact {
        crate::config::sidecar(artifact, "new")
    } else {
        candidate
    }
}

fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn save_beside(download: &Path, target: &Path, version: String) -> Result<UpdateOutcome, UpdateError> {
    if let Err(e) = fs::copy(download, target).and_then(|_| make_executable(target)) {
        let _ = fs::remove_file(target);
        return Err(e.into());
    }
    info!("Saved build {} to {}", version, target.display());
    Ok(UpdateOutcome::Downloaded {
        version,
        path: target.to_path_buf(),
    })
}

/// Stage next to the artifact, back it up, then rename over it
fn replace_artifact(download: &Path, artifact: &Path, version: String) -> Result<UpdateOutcome, UpdateError> {
    let staged = crate::config::sidecar(artifact, &format!("new.{}", std::process::id()));
    let backup = crate::config::sidecar(artifact, "bak");

    let result = fs::copy(download, &staged)
        .and_then(|_| make_executable(&staged))
        .and_then(|_| fs::copy(artifact, &backup).map(|_| ()))
        .and_then(|_| fs::rename(&staged, artifact));
    if let Err(e) = result {
        warn!("Replacing {} failed: {}", artifact.display(), e);
        let _ = fs::remove_file(&staged);
        return Err(e.into());
    }

    info!(
        "Updated to build {}, previous version kept as {}",
        version,
        backup.display()
    );
    Ok(UpdateOutcome::Replaced { version, backup })
}
