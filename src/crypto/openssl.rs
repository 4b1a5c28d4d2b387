//! `openssl enc` adapter
//!
//! The password is handed over in the child's environment
//! (`-pass env:SHELLPACK_ENC_PASS`) and never appears on the command line.

use std::path::Path;
use std::process::Command;

use shellpack_protocol::{TokenParams, CIPHER_PASS_ENV};

use super::tool::{require_tool, run_piped, run_to_file};
use super::{Cipher, CryptoError, Password};

/// Symmetric encryption through `openssl enc` with PBKDF2
#[derive(Debug, Clone)]
pub struct OpenSslCipher {
    cipher: String,
    iterations: u32,
}

impl OpenSslCipher {
    pub const TOOL: &'static str = "openssl";

    pub fn new(cipher: impl Into<String>, iterations: u32) -> Self {
        Self {
            cipher: cipher.into(),
            iterations,
        }
    }

    fn command(&self, decrypt: bool, password: &Password) -> Result<Command, CryptoError> {
        let program = require_tool(Self::TOOL)?;
        let mut cmd = Command::new(program);
        cmd.arg("enc").arg(format!("-{}", self.cipher));
        if decrypt {
            cmd.arg("-d");
        } else {
            cmd.arg("-salt");
        }
        cmd.args(["-pbkdf2", "-iter"])
            .arg(self.iterations.to_string())
            .args(["-pass", &format!("env:{}", CIPHER_PASS_ENV)])
            .env(CIPHER_PASS_ENV, password.expose());
        Ok(cmd)
    }

    fn run_file(&self, decrypt: bool, src: &Path, dst: &Path, password: &Password) -> Result<(), CryptoError> {
        let mut cmd = self.command(decrypt, password)?;
        cmd.arg("-in").arg(src).arg("-out").arg(dst);
        run_to_file(Self::TOOL, cmd, &[], dst)
    }
}

impl Cipher for OpenSslCipher {
    fn name(&self) -> &'static str {
        Self::TOOL
    }

    fn extension(&self) -> &'static str {
        "enc"
    }

    fn encrypt(&self, plaintext: &[u8], password: &Password) -> Result<Vec<u8>, CryptoError> {
        let cmd = self.command(false, password)?;
        run_piped(Self::TOOL, cmd, plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8], password: &Password) -> Result<Vec<u8>, CryptoError> {
        let cmd = self.command(true, password)?;
        run_piped(Self::TOOL, cmd, ciphertext)
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
            cipher: self.cipher.clone(),
            iter: Some(self.iterations),
            s2k_options: None,
        }
    }
}
