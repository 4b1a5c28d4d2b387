//! Build configuration
//!
//! Three layers merged in order:
//! 1. Built-in defaults
//! 2. Config file (`shellpack.toml`)
//! 3. CLI overrides
//!
//! The merged value is then validated into an immutable [`BuildSpec`].

mod defaults;
mod effective;
mod merge;
mod spec;

pub use defaults::{BuiltinDefaults, DEFAULT_CONFIG_FILE};
pub use effective::{ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig};
pub use merge::{deep_merge, merge_layers};
pub use spec::{BuildSpec, Compression, Encryption, ExcludeSpec, Update, UpdateSpec};
pub use spec::sidecar;
