//! Build context shared by the pipeline and the runner
//!
//! Carries output policy explicitly instead of reading globals.

use std::io::IsTerminal;

use serde::{Deserialize, Serialize};

use crate::signal::TempRegistry;

/// How chatty the command is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    /// From `-v`/`-q` flags; quiet wins
    pub fn from_flags(verbose: u8, quiet: bool) -> Self {
        if quiet {
            Self::Quiet
        } else if verbose > 0 {
            Self::Verbose
        } else {
            Self::Normal
        }
    }

    /// Default tracing filter directive
    pub fn filter_directive(&self) -> &'static str {
        match self {
            Self::Quiet => "warn",
            Self::Normal => "info",
            Self::Verbose => "debug",
        }
    }
}

/// When to colorize terminal output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ColorPolicy {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorPolicy {
    /// Resolve against stderr and `NO_COLOR`
    pub fn enabled(&self) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto => {
                std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal()
            }
        }
    }
}

/// Context passed to every component
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub verbosity: Verbosity,
    /// Keep intermediates and log more
    pub debug: bool,
    pub color: ColorPolicy,
    /// Registry for interrupt-safe temporary directories
    pub temps: TempRegistry,
}

impl BuildContext {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            ..Self::default()
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_color(mut self, color: ColorPolicy) -> Self {
        self.color = color;
        self
    }

    pub fn with_temps(mut self, temps: TempRegistry) -> Self {
        self.temps = temps;
        self
    }

    pub fn is_quiet(&self) -> bool {
        self.verbosity == Verbosity::Quiet
    }
}
