//! Password-based encryption of the archive and the verification token
//!
//! Ciphers are external tools behind the [`Cipher`] trait: `openssl enc`
//! with PBKDF2, or symmetric `gpg`. No cipher is implemented here. The
//! verification token is the fixed [`PASSWORD_CHECK_TOKEN`] encrypted with
//! the archive password and parameters, so a deployed artifact can test a
//! password against the update feed before downloading anything.

mod gpg;
#[cfg(any(test, feature = "test-cipher"))]
pub mod mock;
mod openssl;
mod tool;

pub use gpg::{GpgCipher, S2kSpec};
#[cfg(any(test, feature = "test-cipher"))]
pub use mock::MockCipher;
pub use openssl::OpenSslCipher;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

use shellpack_protocol::{TokenParams, PASSWORD_CHECK_TOKEN};

use crate::checksum;

/// Default openssl cipher
pub const DEFAULT_OPENSSL_CIPHER: &str = "aes-256-cbc";

/// Default PBKDF2 iteration count
pub const DEFAULT_OPENSSL_ITER: u32 = 10_000;

/// Default gpg cipher algorithm
pub const DEFAULT_GPG_CIPHER_ALGO: &str = "AES256";

/// Encryption errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption tool '{0}' not found in PATH")]
    ToolNotFound(&'static str),

    #[error("{tool} exited with status {status:?}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        status: Option<i32>,
        stderr: String,
        stdout: String,
    },

    #[error("unsupported encryption setting: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CryptoError {
    /// Whether the failure came from the tool rejecting its input (wrong
    /// password, corrupt data) rather than from the environment
    pub fn is_rejection(&self) -> bool {
        matches!(self, CryptoError::ToolFailed { .. })
    }
}

/// A password held in memory. Never printed, wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password([REDACTED])")
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Cipher parameters chosen at build time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "lowercase")]
pub enum CipherSpec {
    /// `openssl enc -<cipher> -salt -pbkdf2 -iter <iterations>`
    #[serde(rename = "openssl")]
    OpenSsl { cipher: String, iterations: u32 },
    /// `gpg --symmetric --cipher-algo <cipher_algo>` with iterated+salted S2K
    Gpg { cipher_algo: String, s2k: S2kSpec },
}

impl Default for CipherSpec {
    fn default() -> Self {
        CipherSpec::OpenSsl {
            cipher: DEFAULT_OPENSSL_CIPHER.to_string(),
            iterations: DEFAULT_OPENSSL_ITER,
        }
    }
}

impl CipherSpec {
    /// Tool name
    pub fn tool(&self) -> &'static str {
        match self {
            CipherSpec::OpenSsl { .. } => OpenSslCipher::TOOL,
            CipherSpec::Gpg { .. } => GpgCipher::TOOL,
        }
    }

    /// Instantiate the adapter for these parameters
    pub fn cipher(&self) -> Box<dyn Cipher> {
        match self {
            CipherSpec::OpenSsl { cipher, iterations } => {
                Box::new(OpenSslCipher::new(cipher.clone(), *iterations))
            }
            CipherSpec::Gpg { cipher_algo, s2k } => {
                Box::new(GpgCipher::new(cipher_algo.clone(), s2k.clone()))
            }
        }
    }
}

/// Capability interface over an external symmetric cipher
pub trait Cipher {
    /// Tool name recorded in metadata (`openssl`, `gpg`)
    fn name(&self) -> &'static str;

    /// Suffix of an encrypted file (`enc`, `gpg`)
    fn extension(&self) -> &'static str;

    /// Encrypt a small in-memory buffer
    fn encrypt(&self, plaintext: &[u8], password: &Password) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt a small in-memory buffer
    fn decrypt(&self, ciphertext: &[u8], password: &Password) -> Result<Vec<u8>, CryptoError>;

    /// Encrypt `src` into `dst`. `dst` does not exist afterwards on failure.
    fn encrypt_file(&self, src: &Path, dst: &Path, password: &Password) -> Result<(), CryptoError> {
        let data = fs::read(src)?;
        let out = self.encrypt(&data, password)?;
        fs::write(dst, out)?;
        Ok(())
    }

    /// Decrypt `src` into `dst`. `dst` does not exist afterwards on failure.
    fn decrypt_file(&self, src: &Path, dst: &Path, password: &Password) -> Result<(), CryptoError> {
        let data = fs::read(src)?;
        let out = self.decrypt(&data, password)?;
        fs::write(dst, out)?;
        Ok(())
    }

    /// Parameters recorded alongside the verification token
    fn params(&self) -> TokenParams;
}

/// Rebuild a cipher from the parameters published with a token
pub fn cipher_from_params(params: &TokenParams) -> Result<Box<dyn Cipher>, CryptoError> {
    external_cipher(params)
        .or_else(|| in_process_cipher(params))
        .ok_or_else(|| CryptoError::Unsupported(format!("cipher tool '{}'", params.tool)))
}

#[cfg(any(test, feature = "test-cipher"))]
fn in_process_cipher(params: &TokenParams) -> Option<Box<dyn Cipher>> {
    (params.tool == MockCipher::TOOL).then(|| Box::new(MockCipher::new()) as Box<dyn Cipher>)
}

#[cfg(not(any(test, feature = "test-cipher")))]
fn in_process_cipher(_params: &TokenParams) -> Option<Box<dyn Cipher>> {
    None
}

/// Ciphers an artifact header or update feed may name
fn external_cipher(params: &TokenParams) -> Option<Box<dyn Cipher>> {
    match params.tool.as_str() {
        OpenSslCipher::TOOL => Some(Box::new(OpenSslCipher::new(
            params.cipher.clone(),
            params.iter.unwrap_or(DEFAULT_OPENSSL_ITER),
        ))),
        GpgCipher::TOOL => Some(Box::new(GpgCipher::new(
            params.cipher.clone(),
            S2kSpec::default(),
        ))),
        _ => None,
    }
}

/// Encrypted password-verification token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationToken {
    /// Base64 (standard alphabet) of the ciphertext
    pub ciphertext_b64: String,
    /// Parameters used to produce it
    pub params: TokenParams,
}

impl VerificationToken {
    /// The plaintext every token encrypts
    pub fn plaintext() -> &'static str {
        PASSWORD_CHECK_TOKEN
    }
}

/// An encrypted archive written beside its plaintext
#[derive(Debug, Clone)]
pub struct EncryptedArchive {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// Archive and token encryption with one cipher
pub struct Encryptor {
    cipher: Box<dyn Cipher>,
}

impl Encryptor {
    pub fn new(cipher: Box<dyn Cipher>) -> Self {
        Self { cipher }
    }

    pub fn from_spec(spec: &CipherSpec) -> Self {
        Self::new(spec.cipher())
    }

    pub fn cipher(&self) -> &dyn Cipher {
        self.cipher.as_ref()
    }

    /// Path of the encrypted sibling of `archive`
    pub fn encrypted_path(&self, archive: &Path) -> PathBuf {
        let mut name = archive.as_os_str().to_os_string();
        name.push(".");
        name.push(self.cipher.extension());
        PathBuf::from(name)
    }

    /// Encrypt the archive into a sibling file
    pub fn encrypt_archive(
        &self,
        archive: &Path,
        password: &Password,
    ) -> Result<EncryptedArchive, CryptoError> {
        let path = self.encrypted_path(archive);
        info!("Encrypting archive with {}", self.cipher.name());
        if let Err(e) = self.cipher.encrypt_file(archive, &path, password) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        let sha256 = checksum::sha256_file(&path)?;
        let size = fs::metadata(&path)?.len();
        debug!("Encrypted archive checksum: {}", sha256);
        Ok(EncryptedArchive { path, sha256, size })
    }

    /// Encrypt the fixed verification plaintext
    pub fn encrypt_token(&self, password: &Password) -> Result<VerificationToken, CryptoError> {
        let ciphertext = self
            .cipher
            .encrypt(PASSWORD_CHECK_TOKEN.as_bytes(), password)?;
        Ok(VerificationToken {
            ciphertext_b64: BASE64.encode(ciphertext),
            params: self.cipher.params(),
        })
    }

    /// Whether `password` decrypts the token to the exact verification
    /// plaintext. Tool rejection and malformed tokens count as `false`;
    /// a missing tool is an error.
    pub fn verify_token(&self, token_b64: &str, password: &Password) -> Result<bool, CryptoError> {
        verify_with(self.cipher.as_ref(), token_b64, password)
    }
}

/// Verify a published token using the parameters published with it
pub fn verify_published_token(
    token_b64: &str,
    params: &TokenParams,
    password: &Password,
) -> Result<bool, CryptoError> {
    let cipher = cipher_from_params(params)?;
    verify_with(cipher.as_ref(), token_b64, password)
}

fn verify_with(cipher: &dyn Cipher, token_b64: &str, password: &Password) -> Result<bool, CryptoError> {
    let ciphertext = match BASE64.decode(token_b64.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Token is not valid base64: {}", e);
            return Ok(false);
        }
    };
    match cipher.decrypt(&ciphertext, password) {
        Ok(plain) => Ok(plain == PASSWORD_CHECK_TOKEN.as_bytes()),
        Err(e) if e.is_rejection() => Ok(false),
        Err(e) => Err(e),
    }
}
