//! Thin wrapper for invoking external tools.
//!
//! Keeps process plumbing in one place so the cryptsetup, tpm2-tools and
//! initramfs wrappers only deal with arguments and exit codes.

use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    binary: PathBuf,
}

#[derive(Debug)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Most useful human readable text from the run, stderr first.
    pub fn diagnostic(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = String::from_utf8_lossy(&self.stdout);
        match stdout.trim() {
            "" => format!("no output ({})", self.status),
            text => text.to_string(),
        }
    }
}

impl Tool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run to completion with captured output, optionally feeding `input` on
    /// stdin.
    pub fn output<I, S>(&self, args: I, input: Option<&[u8]>) -> io::Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(match input {
                Some(_) => Stdio::piped(),
                None => Stdio::null(),
            });
        log::debug!("Running {:?}", command);

        let mut child = command.spawn()?;
        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload)?;
                stdin.flush()?;
            }
        }
        let raw = child.wait_with_output()?;
        Ok(Output {
            stdout: raw.stdout,
            stderr: raw.stderr,
            status: raw.status,
        })
    }

    /// Capture stdout only; stdin and stderr stay on the terminal so the tool
    /// can prompt.
    pub fn prompt<I, S>(&self, args: I) -> io::Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::inherit())
            .stderr(Stdio::inherit())
            .stdout(Stdio::piped());
        log::debug!("Running {:?} for input", command);
        let raw = command.output()?;
        Ok(Output {
            stdout: raw.stdout,
            stderr: raw.stderr,
            status: raw.status,
        })
    }

    /// Run attached to the caller's terminal, for tools that prompt.
    pub fn interactive<I, S>(&self, args: I) -> io::Result<ExitStatus>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.args(args);
        log::debug!("Running {:?} interactively", command);
        command.status()
    }
}

/// First candidate that exists on disk.
pub fn locate<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(AsRef::as_ref)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn captures_stdout_and_stdin() -> Result<()> {
        let out = Tool::new("cat").output(Vec::<&str>::new(), Some(b"hello"))?;
        assert!(out.success());
        assert_eq!(out.stdout, b"hello");
        Ok(())
    }

    #[test]
    fn diagnostic_prefers_stderr() -> Result<()> {
        let out = Tool::new("sh").output(["-c", "echo out; echo err >&2; exit 3"], None)?;
        assert!(!out.success());
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.diagnostic(), "err");
        Ok(())
    }

    #[test]
    fn locate_picks_first_existing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let present = dir.path().join("present");
        std::fs::write(&present, b"")?;
        let found = locate(&[dir.path().join("absent"), present.clone()]);
        assert_eq!(found, Some(present));
        assert_eq!(locate(&[dir.path().join("absent")]), None);
        Ok(())
    }
}
