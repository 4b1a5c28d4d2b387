//! Symmetric `gpg` adapter
//!
//! The passphrase is a direct `--passphrase` argument with loopback
//! pinentry. Files go by path; buffers stream through stdin and stdout.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use shellpack_protocol::TokenParams;

use super::tool::{require_tool, run_piped, run_to_file};
use super::{Cipher, CryptoError, Password};

/// Iterated and salted string-to-key parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S2kSpec {
    pub mode: u8,
    pub digest_algo: String,
    pub count: u32,
}

impl Default for S2kSpec {
    fn default() -> Self {
        Self {
            mode: 3,
            digest_algo: "SHA512".to_string(),
            count: 65_011_712,
        }
    }
}

impl S2kSpec {
    /// Command-line arguments
    pub fn args(&self) -> Vec<String> {
        vec![
            "--s2k-mode".to_string(),
            self.mode.to_string(),
            "--s2k-digest-algo".to_string(),
            self.digest_algo.clone(),
            "--s2k-count".to_string(),
            self.count.to_string(),
        ]
    }

    /// Arguments as one string, as published with the token
    pub fn options_string(&self) -> String {
        self.args().join(" ")
    }
}

/// Symmetric encryption through GnuPG
#[derive(Debug, Clone)]
pub struct GpgCipher {
    cipher_algo: String,
    s2k: S2kSpec,
    home: Option<PathBuf>,
}

impl GpgCipher {
    pub const TOOL: &'static str = "gpg";

    pub fn new(cipher_algo: impl Into<String>, s2k: S2kSpec) -> Self {
        Self {
            cipher_algo: cipher_algo.into(),
            s2k,
            home: None,
        }
    }

    /// Use a dedicated GnuPG home directory
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    fn command(&self, decrypt: bool, password: &Password) -> Result<Command, CryptoError> {
        let program = require_tool(Self::TOOL)?;
        let mut cmd = Command::new(program);
        if let Some(ref home) = self.home {
            cmd.arg("--homedir").arg(home);
        }
        cmd.args([
            "--quiet",
            "--batch",
            "--yes",
            "--no-symkey-cache",
            "--pinentry-mode",
            "loopback",
            "--passphrase",
        ]);
        cmd.arg(password.expose());
        if decrypt {
            cmd.arg("--decrypt");
        } else {
            cmd.arg("--symmetric")
                .args(["--cipher-algo", &self.cipher_algo])
                .args(self.s2k.args());
        }
        Ok(cmd)
    }

    fn run_file(&self, decrypt: bool, src: &Path, dst: &Path, password: &Password) -> Result<(), CryptoError> {
        let mut cmd = self.command(decrypt, password)?;
        cmd.arg("--output").arg(dst).arg(src);
        run_to_file(Self::TOOL, cmd, &[], dst)
    }

    /// Stdin to stdout; nothing reaches the disk
    fn run_buffer(&self, decrypt: bool, data: &[u8], password: &Password) -> Result<Vec<u8>, CryptoError> {
        let cmd = self.command(decrypt, password)?;
        run_piped(Self::TOOL, cmd, data)
    }
}

impl Cipher for GpgCipher {
    fn name(&self) -> &'static str {
        Self::TOOL
    }

    fn extension(&self) -> &'static str {
        "gpg"
    }

    fn encrypt(&self, plaintext: &[u8], password: &Password) -> Result<Vec<u8>, CryptoError> {
        self.run_buffer(false, plaintext, password)
    }

    fn decrypt(&self, ciphertext: &[u8], password: &Password) -> Result<Vec<u8>, CryptoError> {
        self.run_buffer(true, ciphertext, password)
    }

    fn encrypt_file(&self, src: &Path, dst: &Path, password: &Password) -> Result<(), CryptoError> {
        self.run_file(false, src, dst, password)
    }

    fn decrypt_file(&self, src: &Path, dst: &Path, password: &Password) -> Result<(), CryptoError> {
        self.run_file(true, src, dst, password)
    }

    fn params(&self) -> TokenParams {
        TokenParams {
            tool: Self::TOOL.to_string(),
            cipher: self.cipher_algo.clone(),
            iter: None,
            s2k_options: Some(self.s2k.options_string()),
        }
    }
}
