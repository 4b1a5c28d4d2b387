//! Running external cipher tools

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;

use tracing::debug;

use super::CryptoError;

/// Locate a tool on PATH
pub(crate) fn require_tool(tool: &'static str) -> Result<PathBuf, CryptoError> {
    which::which(tool).map_err(|_| CryptoError::ToolNotFound(tool))
}

/// Run `cmd`, feed `input` on stdin, collect stdout
pub(crate) fn run_piped(
    tool: &'static str,
    mut cmd: Command,
    input: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    debug!("Running {}", tool);
    let child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let output = feed_and_collect(tool, child, input)?;
    Ok(output.stdout)
}

/// Run a command that writes `dst` itself. `dst` is removed on failure.
pub(crate) fn run_to_file(
    tool: &'static str,
    mut cmd: Command,
    input: &[u8],
    dst: &Path,
) -> Result<(), CryptoError> {
    debug!("Running {} -> {}", tool, dst.display());
    let result = (|| {
        let child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        feed_and_collect(tool, child, input).map(drop)
    })();

    if result.is_err() {
        let _ = fs::remove_file(dst);
    }
    result
}

/// Write stdin from a second thread while the child's output is drained
fn feed_and_collect(tool: &'static str, mut child: Child, input: &[u8]) -> Result<Output, CryptoError> {
    let stdin = child.stdin.take();
    let (written, output) = thread::scope(|scope| {
        let writer = scope.spawn(move || match stdin {
            Some(mut pipe) => pipe.write_all(input),
            None => Ok(()),
        });
        let output = child.wait_with_output();
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
        (written, output)
    });
    let output = output?;
    check_status(tool, &output)?;
    // The tool may exit without reading all of its input
    match written {
        Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e.into()),
        _ => Ok(output),
    }
}

fn check_status(tool: &'static str, output: &Output) -> Result<(), CryptoError> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!("{} failed: {}", tool, stderr);
    Err(CryptoError::ToolFailed {
        tool,
        status: output.status.code(),
        stderr,
        stdout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_input_streams_through() {
        let Ok(cat) = which::which("cat") else {
            eprintln!("cat not installed, skipping");
            return;
        };
        let input: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let output = run_piped("cat", Command::new(cat), &input).unwrap();
        assert_eq!(output.len(), input.len());
        assert!(output == input);
    }

    #[test]
    fn test_failure_reports_stderr() {
        let Ok(sh) = which::which("sh") else {
            eprintln!("sh not installed, skipping");
            return;
        };
        let mut cmd = Command::new(sh);
        cmd.args(["-c", "echo bad >&2; exit 3"]);
        let err = run_piped("sh", cmd, b"ignored").unwrap_err();
        match err {
            CryptoError::ToolFailed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
