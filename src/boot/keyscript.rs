//! The boot-time key retrieval state machine.
//!
//! cryptsetup calls the keyscript again for the same volume whenever the key
//! it produced was rejected. A per-volume marker in boot-scoped storage
//! separates the first call (read the TPM) from every later one (prompt), and
//! is gone again after the next reboot.

use crate::command::Tool;
use crate::tpm::{NvIndex, NvStore, TpmError};
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum KeyscriptError {
    #[error("failed to claim attempt marker {path}: {source}")]
    Marker { path: PathBuf, source: io::Error },
    #[error("passphrase prompt failed: {0}")]
    Prompt(String),
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = KeyscriptError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// No earlier attempt this boot: read the key from the TPM.
    FirstAttempt,
    /// The TPM key was already tried and failed: ask the operator.
    FallbackPrompt,
}

#[derive(Debug, Clone)]
pub struct AttemptMarker {
    path: PathBuf,
}

impl AttemptMarker {
    pub fn new(dir: &Path, volume: &str) -> Self {
        let volume: String = volume
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();
        let volume = if volume.is_empty() { "volume" } else { &volume };
        Self {
            path: dir.join(format!("tpm2-getkey.{volume}.tried")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check and create the marker in one `O_CREAT | O_EXCL` open, so two
    /// racing callers cannot both see a first attempt.
    pub fn claim(&self) -> Result<Attempt> {
        let marker_err = |source| KeyscriptError::Marker {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(marker_err)?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&self.path)
        {
            Ok(_) => Ok(Attempt::FirstAttempt),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(Attempt::FallbackPrompt),
            Err(err) => Err(marker_err(err)),
        }
    }
}

pub trait PassphrasePrompt {
    fn prompt(&mut self, message: &str) -> Result<Zeroizing<Vec<u8>>>;
}

/// cryptsetup's `askpass` helper, which knows how to reach plymouth or the
/// console from inside the initramfs.
#[derive(Debug, Clone)]
pub struct Askpass {
    tool: Tool,
}

impl Askpass {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            tool: Tool::new(binary),
        }
    }
}

impl PassphrasePrompt for Askpass {
    fn prompt(&mut self, message: &str) -> Result<Zeroizing<Vec<u8>>> {
        let out = self.tool.prompt([message])?;
        let passphrase = Zeroizing::new(out.stdout);
        if !out.status.success() {
            return Err(KeyscriptError::Prompt(format!(
                "{} exited with {}",
                self.tool.binary().display(),
                out.status
            )));
        }
        Ok(passphrase)
    }
}

/// What cryptsetup tells a keyscript about the volume being unlocked.
#[derive(Debug, Clone)]
pub struct KeyRequest {
    pub name: String,
    pub source: String,
    pub index: NvIndex,
    pub size: u16,
}

impl KeyRequest {
    pub fn fallback_message(&self) -> String {
        format!(
            "Automatic disk unlock via TPM failed for {} ({}) Enter passphrase: ",
            self.source, self.name
        )
    }
}

/// Produce the unlock key for `request`: from the TPM on the first attempt
/// of this boot, from the operator on every later one.
pub fn get_key<N, P>(
    marker: &AttemptMarker,
    nv: &mut N,
    prompt: &mut P,
    request: &KeyRequest,
) -> Result<Zeroizing<Vec<u8>>>
where
    N: NvStore + ?Sized,
    P: PassphrasePrompt + ?Sized,
{
    match marker.claim()? {
        Attempt::FirstAttempt => {
            log::debug!("First attempt for {}, reading {}", request.name, request.index);
            Ok(nv.read(request.index, request.size)?)
        }
        Attempt::FallbackPrompt => {
            log::debug!("{} already tried this boot, prompting", request.name);
            prompt.prompt(&request.fallback_message())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tpm::Result as TpmResult;
    use eyre::Result;
    use std::os::unix::fs::PermissionsExt;
    use std::process::Command;

    #[derive(Default)]
    struct CountingNv {
        reads: usize,
        fail: bool,
    }

    impl NvStore for CountingNv {
        fn undefine_if_present(&mut self, _index: NvIndex) -> TpmResult<bool> {
            Ok(false)
        }
        fn define(&mut self, _index: NvIndex, _size: u16) -> TpmResult<()> {
            Ok(())
        }
        fn write(&mut self, _index: NvIndex, _data: &[u8]) -> TpmResult<()> {
            Ok(())
        }
        fn read(&mut self, index: NvIndex, size: u16) -> TpmResult<Zeroizing<Vec<u8>>> {
            self.reads += 1;
            if self.fail {
                return Err(TpmError::ShortRead {
                    index,
                    expected: size.into(),
                    actual: 0,
                });
            }
            Ok(Zeroizing::new(vec![b'k'; size.into()]))
        }
    }

    #[derive(Default)]
    struct CountingPrompt {
        prompts: Vec<String>,
    }

    impl PassphrasePrompt for CountingPrompt {
        fn prompt(&mut self, message: &str) -> super::Result<Zeroizing<Vec<u8>>> {
            self.prompts.push(message.to_string());
            Ok(Zeroizing::new(b"typed".to_vec()))
        }
    }

    fn request(name: &str) -> KeyRequest {
        KeyRequest {
            name: name.to_string(),
            source: "/dev/sdX3".to_string(),
            index: NvIndex::default(),
            size: 64,
        }
    }

    #[test]
    fn first_attempt_reads_tpm_and_creates_marker() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = AttemptMarker::new(dir.path(), "sdX3_crypt");
        let (mut nv, mut prompt) = (CountingNv::default(), CountingPrompt::default());

        let key = get_key(&marker, &mut nv, &mut prompt, &request("sdX3_crypt"))?;
        assert_eq!(key.len(), 64);
        assert_eq!(nv.reads, 1);
        assert!(prompt.prompts.is_empty());
        assert!(marker.path().exists());
        Ok(())
    }

    #[test]
    fn later_attempts_prompt_without_touching_tpm() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = AttemptMarker::new(dir.path(), "sdX3_crypt");
        let (mut nv, mut prompt) = (CountingNv::default(), CountingPrompt::default());
        let request = request("sdX3_crypt");

        get_key(&marker, &mut nv, &mut prompt, &request)?;
        for attempt in 2..=4 {
            let key = get_key(&marker, &mut nv, &mut prompt, &request)?;
            assert_eq!(&key[..], b"typed");
            assert_eq!(nv.reads, 1);
            assert_eq!(prompt.prompts.len(), attempt - 1);
        }
        assert_eq!(
            prompt.prompts[0],
            "Automatic disk unlock via TPM failed for /dev/sdX3 (sdX3_crypt) Enter passphrase: "
        );
        Ok(())
    }

    #[test]
    fn failed_read_still_moves_to_fallback() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = AttemptMarker::new(dir.path(), "sdX3_crypt");
        let mut nv = CountingNv {
            fail: true,
            ..CountingNv::default()
        };
        let mut prompt = CountingPrompt::default();
        let request = request("sdX3_crypt");

        assert!(get_key(&marker, &mut nv, &mut prompt, &request).is_err());
        get_key(&marker, &mut nv, &mut prompt, &request)?;
        assert_eq!(nv.reads, 1);
        assert_eq!(prompt.prompts.len(), 1);
        Ok(())
    }

    #[test]
    fn markers_are_per_volume() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = AttemptMarker::new(dir.path(), "root_crypt");
        let b = AttemptMarker::new(dir.path(), "home_crypt");
        assert_eq!(a.claim()?, Attempt::FirstAttempt);
        assert_eq!(b.claim()?, Attempt::FirstAttempt);
        assert_eq!(a.claim()?, Attempt::FallbackPrompt);
        assert_eq!(
            AttemptMarker::new(dir.path(), "x/y").path(),
            dir.path().join("tpm2-getkey.x_y.tried")
        );
        Ok(())
    }

    /// Runs the rendered shell keyscript against stand-in `tpm2_nvread` and
    /// `askpass` scripts.
    #[test]
    fn shell_keyscript_follows_the_same_states() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin)?;
        let reads = dir.path().join("reads");
        let scripts = [
            (
                bin.join("tpm2_nvread"),
                format!("#!/bin/sh\necho read >> \"{}\"\nprintf tpmkey\n", reads.display()),
            ),
            (
                dir.path().join("askpass"),
                "#!/bin/sh\nprintf typed\n".to_string(),
            ),
        ];
        for (path, body) in &scripts {
            fs::write(path, body)?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        }

        let config = Config {
            marker_dir: dir.path().join("run"),
            tools: crate::config::ToolPaths {
                askpass: dir.path().join("askpass"),
                ..Default::default()
            },
            ..Config::default()
        };
        let binaries = crate::boot::HookBinaries {
            nvread: bin.join("tpm2_nvread"),
            libraries: vec![],
        };
        let rendered = crate::boot::BootArtifacts::render(&config, &binaries, "device:/dev/tpmrm0");
        let keyscript = dir.path().join("tpm2-getkey");
        fs::write(&keyscript, rendered.keyscript)?;

        let path = format!(
            "{}:{}",
            bin.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let run = || {
            Command::new("sh")
                .arg(&keyscript)
                .env("PATH", &path)
                .env("CRYPTTAB_NAME", "sdX3_crypt")
                .env("CRYPTTAB_SOURCE", "/dev/sdX3")
                .output()
        };

        let first = run()?;
        assert_eq!(first.stdout, b"tpmkey");
        assert!(AttemptMarker::new(&config.marker_dir, "sdX3_crypt")
            .path()
            .exists());

        let second = run()?;
        assert_eq!(second.stdout, b"typed");
        assert_eq!(fs::read_to_string(&reads)?.lines().count(), 1);
        Ok(())
    }
}
