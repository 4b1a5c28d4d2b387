//! shellpack - self-extracting shell artifacts
//!
//! This crate packs a content tree into a single shell script that carries
//! its own archive. The build phase archives, optionally encrypts, and
//! renders the extraction harness; the runtime phase verifies, decrypts,
//! extracts, checks for updates and runs the embedded entry point.
//!
//! The wire format shared by both phases lives in `shellpack-protocol`.

pub mod archive;
pub mod checksum;
pub mod compression;
pub mod config;
pub mod context;
pub mod crypto;
pub mod inspect;
pub mod metadata;
pub mod pipeline;
pub mod runtime;
pub mod signal;
pub mod template;

pub use archive::{Archiver, Manifest};
pub use config::{BuildSpec, EffectiveConfig};
pub use context::{BuildContext, Verbosity};
pub use pipeline::{build, BuildError, BuildPipeline, BuildReport};
pub use runtime::{RunOptions, RunOutcome, Runner, RuntimeError};
