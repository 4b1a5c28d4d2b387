//! User interaction and password sources for the runner

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};

use tracing::debug;

use shellpack_protocol::PASSWORD_ENV;

use crate::crypto::Password;

/// Questions the runner may ask the person running an artifact
pub trait Interaction {
    /// Read a secret without echo. `None` when no terminal is available.
    fn prompt_secret(&mut self, prompt: &str) -> Option<String>;

    /// Yes/no question, defaulting to no
    fn confirm(&mut self, question: &str) -> bool;
}

/// Interaction through the controlling terminal (`/dev/tty`)
#[derive(Debug, Default)]
pub struct TtyInteraction;

impl TtyInteraction {
    pub fn new() -> Self {
        Self
    }

    fn open() -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open("/dev/tty")
    }

    fn read_line(tty: &File) -> io::Result<String> {
        let mut line = String::new();
        BufReader::new(tty).read_line(&mut line)?;
        Ok(line.trim_end_matches(['\n', '\r']).to_string())
    }
}

#[cfg(unix)]
fn read_without_echo(tty: &File) -> io::Result<String> {
    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

    let original = tcgetattr(tty).map_err(io::Error::from)?;
    let mut silent = original.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    silent.local_flags.insert(LocalFlags::ECHONL);
    tcsetattr(tty, SetArg::TCSANOW, &silent).map_err(io::Error::from)?;

    let line = TtyInteraction::read_line(tty);
    // Restore even when the read failed
    let restored = tcsetattr(tty, SetArg::TCSANOW, &original).map_err(io::Error::from);
    let line = line?;
    restored?;
    Ok(line)
}

#[cfg(not(unix))]
fn read_without_echo(tty: &File) -> io::Result<String> {
    TtyInteraction::read_line(tty)
}

impl Interaction for TtyInteraction {
    fn prompt_secret(&mut self, prompt: &str) -> Option<String> {
        let mut tty = match Self::open() {
            Ok(tty) => tty,
            Err(e) => {
                debug!("No terminal for password prompt: {}", e);
                return None;
            }
        };
        write!(tty, "{}: ", prompt).ok()?;
        tty.flush().ok()?;
        read_without_echo(&tty).ok()
    }

    fn confirm(&mut self, question: &str) -> bool {
        let Ok(mut tty) = Self::open() else {
            return false;
        };
        if write!(tty, "{} [y/N] ", question).and_then(|_| tty.flush()).is_err() {
            return false;
        }
        matches!(
            Self::read_line(&tty).as_deref().map(str::trim),
            Ok("y" | "Y" | "yes" | "YES")
        )
    }
}

/// Pre-recorded answers, for non-interactive runs and tests
#[derive(Debug, Default, Clone)]
pub struct ScriptedInteraction {
    secrets: VecDeque<String>,
    confirmations: VecDeque<bool>,
    /// Every prompt shown, in order
    pub prompts: Vec<String>,
}

impl ScriptedInteraction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secrets.push_back(secret.into());
        self
    }

    pub fn with_confirmation(mut self, answer: bool) -> Self {
        self.confirmations.push_back(answer);
        self
    }
}

impl Interaction for ScriptedInteraction {
    fn prompt_secret(&mut self, prompt: &str) -> Option<String> {
        self.prompts.push(prompt.to_string());
        self.secrets.pop_front()
    }

    fn confirm(&mut self, question: &str) -> bool {
        self.prompts.push(question.to_string());
        self.confirmations.pop_front().unwrap_or(false)
    }
}

/// Where decryption passwords come from
pub trait PasswordSource {
    /// Password for attempt `attempt` (1-based). `None` ends the attempts.
    fn next_password(&mut self, attempt: u32) -> Option<Password>;

    /// The last password decrypted the payload
    fn accepted(&mut self) {}
}

/// A fixed list of passwords, tried in order
#[derive(Debug, Default)]
pub struct FixedPasswords(VecDeque<Password>);

impl FixedPasswords {
    pub fn new<I, S>(passwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(passwords.into_iter().map(Password::new).collect())
    }
}

impl PasswordSource for FixedPasswords {
    fn next_password(&mut self, _attempt: u32) -> Option<Password> {
        self.0.pop_front()
    }
}

/// `SHELLPACK_PASSWORD`, offered once and removed from the environment
/// after a successful decrypt
#[derive(Debug, Default)]
pub struct EnvPassword {
    offered: bool,
}

impl EnvPassword {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PasswordSource for EnvPassword {
    fn next_password(&mut self, _attempt: u32) -> Option<Password> {
        if self.offered {
            return None;
        }
        self.offered = true;
        std::env::var(PASSWORD_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .map(Password::new)
    }

    fn accepted(&mut self) {
        if self.offered {
            std::env::remove_var(PASSWORD_ENV);
        }
    }
}

/// Tries each source in turn until one yields a password
#[derive(Default)]
pub struct PasswordChain<'a> {
    sources: Vec<Box<dyn PasswordSource + 'a>>,
    current: usize,
}

impl<'a> PasswordChain<'a> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            current: 0,
        }
    }

    pub fn then(mut self, source: impl PasswordSource + 'a) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

impl PasswordSource for PasswordChain<'_> {
    fn next_password(&mut self, attempt: u32) -> Option<Password> {
        while let Some(source) = self.sources.get_mut(self.current) {
            if let Some(password) = source.next_password(attempt) {
                return Some(password);
            }
            self.current += 1;
        }
        None
    }

    fn accepted(&mut self) {
        if let Some(source) = self.sources.get_mut(self.current) {
            source.accepted();
        }
    }
}
