//! shellpack protocol types
//!
//! Defines the contract between the build phase and the code that runs
//! inside a generated artifact: marker framing, placeholder syntax, the
//! header variable block, and the update-feed document.

pub mod error;
pub mod feed;
pub mod framing;
pub mod header;
pub mod placeholder;
pub mod vocab;

pub use error::ProtocolError;
pub use feed::{ArchiveInfo, TokenParams, UpdateFeed};
pub use framing::{frame_artifact, split_artifact, SplitArtifact};
pub use header::{HeaderInfo, ManifestLine};
pub use placeholder::{find_placeholders, placeholder};
pub use vocab::{CompressionMethod, UpdateMode};

/// Wire format version rendered into every artifact header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Line separating the text header from the base64 payload.
///
/// Must appear exactly once in a generated artifact, as a full line.
pub const MARKER: &str = "__SHELLPACK_PAYLOAD_BELOW__";

/// Fixed plaintext encrypted into the password-verification token.
pub const PASSWORD_CHECK_TOKEN: &str = "shellpack_passwd_ok_v1";

/// Environment variable a user may set to pre-supply the password.
pub const PASSWORD_ENV: &str = "SHELLPACK_PASSWORD";

/// Transient environment variable used to hand the password to openssl.
pub const CIPHER_PASS_ENV: &str = "SHELLPACK_ENC_PASS";

/// Number of decryption attempts before the runtime aborts.
pub const MAX_DECRYPT_ATTEMPTS: u32 = 3;

/// Network timeout for update-feed fetches, in seconds.
pub const UPDATE_TIMEOUT_SECS: u64 = 20;

/// Sentinel checksum for zero-byte files.
pub const EMPTY_SENTINEL: &str = "empty";

/// Sentinel checksum for symbolic links.
pub const SYMLINK_SENTINEL: &str = "symlink";
