//! Signal handling for interrupted builds and extractions (SIGINT/SIGTERM)
//!
//! Temporary directories are created through a [`TempRegistry`]. On the
//! first signal the handler removes every directory still registered and
//! exits with [`EXIT_CODE_CANCELLED`]. Normal and error paths release the
//! directories through `Drop`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

/// Exit code for interrupted runs
pub const EXIT_CODE_CANCELLED: i32 = 130;

/// Prefix of every temporary directory shellpack creates
pub const TEMP_PREFIX: &str = "shellpack.";

/// Signal handler state
#[derive(Debug, Default)]
pub struct SignalState {
    /// A signal was received
    cancel_requested: AtomicBool,
    /// Signals received so far
    signal_count: AtomicU8,
    /// Directories to remove on interrupt
    temp_dirs: Mutex<Vec<PathBuf>>,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record a signal and decide what to do with it
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);
        if count == 0 {
            self.cancel_requested.store(true, Ordering::SeqCst);
            SignalAction::SweepAndExit
        } else {
            SignalAction::Ignore
        }
    }

    fn register(&self, path: PathBuf) {
        if let Ok(mut dirs) = self.temp_dirs.lock() {
            dirs.push(path);
        }
    }

    fn unregister(&self, path: &Path) {
        if let Ok(mut dirs) = self.temp_dirs.lock() {
            dirs.retain(|p| p != path);
        }
    }

    /// Paths currently registered
    pub fn registered(&self) -> Vec<PathBuf> {
        self.temp_dirs.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Remove every registered directory. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let dirs = match self.temp_dirs.lock() {
            Ok(mut dirs) => std::mem::take(&mut *dirs),
            Err(_) => return 0,
        };
        dirs.iter()
            .filter(|dir| fs::remove_dir_all(dir).is_ok())
            .count()
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: remove temporaries and exit
    SweepAndExit,
    /// Further signals while the sweep runs
    Ignore,
}

/// Creates temporary directories that an interrupt will clean up
#[derive(Debug, Clone, Default)]
pub struct TempRegistry {
    state: Arc<SignalState>,
    base: Option<PathBuf>,
}

impl TempRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose directories default to `base` instead of the system temp dir
    pub fn rooted_at(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
            ..Self::default()
        }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// New registered directory under the registry's base
    pub fn temp_dir(&self) -> io::Result<RegisteredTempDir> {
        if let Some(base) = &self.base {
            return self.temp_dir_in(base);
        }
        let dir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        self.adopt(dir)
    }

    /// New registered directory under `parent`
    pub fn temp_dir_in(&self, parent: &Path) -> io::Result<RegisteredTempDir> {
        let dir = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(parent)?;
        self.adopt(dir)
    }

    fn adopt(&self, dir: TempDir) -> io::Result<RegisteredTempDir> {
        self.state.register(dir.path().to_path_buf());
        Ok(RegisteredTempDir {
            dir: Some(dir),
            state: Arc::clone(&self.state),
        })
    }
}

/// A [`TempDir`] that is also known to the signal handler
#[derive(Debug)]
pub struct RegisteredTempDir {
    dir: Option<TempDir>,
    state: Arc<SignalState>,
}

impl RegisteredTempDir {
    pub fn path(&self) -> &Path {
        self.dir.as_ref().map(TempDir::path).unwrap_or(Path::new(""))
    }

    /// Keep the directory on disk and stop tracking it
    pub fn keep(mut self) -> PathBuf {
        match self.dir.take() {
            Some(dir) => {
                self.state.unregister(dir.path());
                dir.into_path()
            }
            None => PathBuf::new(),
        }
    }
}

impl Drop for RegisteredTempDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            self.state.unregister(dir.path());
        }
    }
}

/// Installs the process-wide interrupt handler
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new(registry: &TempRegistry) -> Self {
        Self {
            state: registry.state(),
        }
    }

    /// Install the handler. Must be called once at program startup.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || {
            if state.handle_signal() == SignalAction::SweepAndExit {
                let removed = state.sweep();
                eprintln!("\nInterrupted, removed {} temporary directories", removed);
                std::process::exit(EXIT_CODE_CANCELLED);
            }
        })
    }
}
