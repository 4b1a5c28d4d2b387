//! Error types for the artifact wire format.

use thiserror::Error;

/// Errors raised while framing or parsing an artifact.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The marker line was not found in the artifact.
    #[error("payload marker line not found")]
    MissingMarker,

    /// The marker line appears more than once as a full line.
    #[error("payload marker line appears {0} times")]
    DuplicateMarker(usize),

    /// The header is not valid UTF-8.
    #[error("artifact header is not valid UTF-8")]
    InvalidHeader,

    /// A vocabulary value is unknown.
    #[error("unknown {kind}: '{value}'")]
    UnknownValue {
        /// Vocabulary name (compression method, update mode)
        kind: &'static str,
        /// Offending value
        value: String,
    },

    /// A shell-quoted value could not be decoded.
    #[error("malformed quoted value for {0}")]
    BadQuoting(String),

    /// The update feed could not be parsed.
    #[error("update feed parse error: {0}")]
    Feed(#[from] serde_json::Error),
}
