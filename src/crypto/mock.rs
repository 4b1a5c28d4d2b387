//! In-process cipher for tests and dry runs
//!
//! Not a real cipher. The layout is `salt(8) || tag(32) || body`, where the
//! tag is `sha256(salt || password || "tag")` and the body is the plaintext
//! XOR a SHA-256 counter keystream. A wrong password fails the tag check,
//! which is reported the same way a real tool rejects a password.

use rand::RngCore;
use sha2::{Digest, Sha256};

use shellpack_protocol::TokenParams;

use super::{Cipher, CryptoError, Password};

const SALT_LEN: usize = 8;
const TAG_LEN: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct MockCipher;

impl MockCipher {
    pub const TOOL: &'static str = "mock";

    pub fn new() -> Self {
        Self
    }

    fn tag(salt: &[u8], password: &Password) -> [u8; TAG_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.expose().as_bytes());
        hasher.update(b"tag");
        hasher.finalize().into()
    }

    fn apply_keystream(salt: &[u8], password: &Password, data: &mut [u8]) {
        for (counter, chunk) in data.chunks_mut(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(salt);
            hasher.update(password.expose().as_bytes());
            hasher.update((counter as u64).to_be_bytes());
            let block = hasher.finalize();
            for (byte, key) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key;
            }
        }
    }

    fn rejected(reason: &str) -> CryptoError {
        CryptoError::ToolFailed {
            tool: Self::TOOL,
            status: Some(1),
            stderr: reason.to_string(),
            stdout: String::new(),
        }
    }
}

impl Cipher for MockCipher {
    fn name(&self) -> &'static str {
        Self::TOOL
    }

    fn extension(&self) -> &'static str {
        "mock"
    }

    fn encrypt(&self, plaintext: &[u8], password: &Password) -> Result<Vec<u8>, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut body = plaintext.to_vec();
        Self::apply_keystream(&salt, password, &mut body);

        let mut out = Vec::with_capacity(SALT_LEN + TAG_LEN + body.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&Self::tag(&salt, password));
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], password: &Password) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < SALT_LEN + TAG_LEN {
            return Err(Self::rejected("ciphertext too short"));
        }
        let (salt, rest) = ciphertext.split_at(SALT_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);
        if tag != Self::tag(salt, password) {
            return Err(Self::rejected("bad decrypt"));
        }
        let mut plain = body.to_vec();
        Self::apply_keystream(salt, password, &mut plain);
        Ok(plain)
    }

    fn params(&self) -> TokenParams {
        TokenParams {
            tool: Self::TOOL.to_string(),
            cipher: "xor-sha256".to_string(),
            iter: None,
            s2k_options: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = MockCipher::new();
        let password = Password::new("secret");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let encrypted = cipher.encrypt(&data, &password).unwrap();
        assert_ne!(&encrypted[SALT_LEN + TAG_LEN..], &data[..]);
        assert_eq!(cipher.decrypt(&encrypted, &password).unwrap(), data);
    }

    #[test]
    fn test_wrong_password_rejected() {
        let cipher = MockCipher::new();
        let encrypted = cipher.encrypt(b"data", &Password::new("a")).unwrap();
        let err = cipher.decrypt(&encrypted, &Password::new("b")).unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn test_truncated_rejected() {
        let cipher = MockCipher::new();
        assert!(cipher.decrypt(b"short", &Password::new("a")).is_err());
    }
}
