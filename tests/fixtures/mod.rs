//! Shared helpers for integration tests
//!
//! A [`Workspace`] is a temporary directory holding a `content/` tree and
//! the artifacts built from it.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::TempDir;

use shellpack::config::{BuildSpec, EffectiveConfig};
use shellpack::crypto::{MockCipher, Password};
use shellpack::runtime::{FixedPasswords, RunOptions, Runner, ScriptedInteraction};
use shellpack::{BuildContext, BuildPipeline, BuildReport};

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("content")).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn content(&self) -> PathBuf {
        self.root().join("content")
    }

    /// Write a file under `content/`, creating parents
    pub fn write(&self, rel: &str, data: impl AsRef<[u8]>) -> PathBuf {
        let path = self.content().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, data).unwrap();
        path
    }

    /// Executable entry point under `content/`
    pub fn write_script(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.write(rel, format!("#!/bin/sh\n{}\n", body));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    /// Validated spec for this workspace with `overrides` layered on top
    pub fn spec(&self, overrides: Value) -> BuildSpec {
        let config = EffectiveConfig::build(None, Some(overrides), self.root()).unwrap();
        BuildSpec::from_value(&config).unwrap()
    }

    pub fn build(&self, overrides: Value) -> BuildReport {
        let spec = self.spec(overrides);
        BuildPipeline::new(&spec, &BuildContext::default())
            .run()
            .unwrap()
    }

    /// Encrypted build with the in-process test cipher
    pub fn build_mock_encrypted(&self, overrides: Value, password: &str) -> BuildReport {
        let spec = self.spec(overrides);
        BuildPipeline::new(&spec, &BuildContext::default())
            .with_cipher(Box::new(MockCipher::new()))
            .with_password(Password::new(password))
            .run()
            .unwrap()
    }

    /// Fresh directory for extraction
    pub fn out_dir(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }
}

/// Runner that never touches the terminal or the network
pub fn quiet_runner<'a>(artifact: &Path, options: RunOptions, passwords: &[&str]) -> Runner<'a> {
    Runner::new(artifact, options)
        .with_passwords(FixedPasswords::new(passwords.iter().copied()))
        .with_interaction(ScriptedInteraction::new())
}

/// Options extracting into `dir` without running anything
pub fn extract_only(dir: &Path) -> RunOptions {
    RunOptions {
        dir: Some(dir.to_path_buf()),
        extract_only: true,
        no_update_check: true,
        ..RunOptions::default()
    }
}

/// Every regular file under `dir`, as sorted relative paths with contents
pub fn tree(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(dir).unwrap();
            (
                rel.to_string_lossy().replace('\\', "/"),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}
