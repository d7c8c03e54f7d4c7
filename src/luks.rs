use crate::command::Tool;
use either::Either;
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LuksError {
    #[error("cryptsetup luksAddKey on {device} exited with {status}")]
    AddKeyRejected { device: PathBuf, status: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = LuksError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuksVersion {
    Luks1,
    Luks2,
}

impl fmt::Display for LuksVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Luks1 => f.write_str("LUKS1"),
            Self::Luks2 => f.write_str("LUKS2"),
        }
    }
}

/// The volume-encryption operations the provisioning run relies on.
pub trait VolumeTool {
    /// `None` when `device` is not a LUKS volume (or cannot be opened).
    fn luks_version(&self, device: &Path) -> Result<Option<LuksVersion>>;

    fn is_luks(&self, device: &Path) -> Result<bool> {
        Ok(self.luks_version(device)?.is_some())
    }

    /// Backing device of an open mapping, from `cryptsetup status`.
    fn backing_device(&self, name: &str) -> Result<Option<PathBuf>>;

    /// Add `keyfile` as a new key slot. cryptsetup prompts on the terminal
    /// for an existing passphrase; it never passes through this process.
    fn add_key(&mut self, device: &Path, keyfile: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Cryptsetup {
    tool: Tool,
}

impl Cryptsetup {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            tool: Tool::new(binary),
        }
    }
}

impl VolumeTool for Cryptsetup {
    fn luks_version(&self, device: &Path) -> Result<Option<LuksVersion>> {
        let handle = match cryptsetup_rs::open(device).and_then(|builder| builder.luks()) {
            Ok(handle) => handle,
            Err(err) => {
                log::debug!("{} did not load as LUKS: {:?}", device.display(), err);
                return Ok(None);
            }
        };
        Ok(Some(match handle {
            Either::Left(_) => LuksVersion::Luks1,
            Either::Right(_) => LuksVersion::Luks2,
        }))
    }

    fn backing_device(&self, name: &str) -> Result<Option<PathBuf>> {
        let out = self.tool.output(["status", name], None)?;
        // Inactive or unknown mappings exit nonzero and print no device line.
        let device = parse_status_device(&String::from_utf8_lossy(&out.stdout));
        if device.is_none() {
            log::debug!("cryptsetup status {name}: {}", out.diagnostic());
        }
        Ok(device)
    }

    fn add_key(&mut self, device: &Path, keyfile: &Path) -> Result<()> {
        let status = self.tool.interactive([
            OsStr::new("luksAddKey"),
            device.as_os_str(),
            keyfile.as_os_str(),
        ])?;
        if status.success() {
            return Ok(());
        }
        Err(LuksError::AddKeyRejected {
            device: device.to_path_buf(),
            status: status.to_string(),
        })
    }
}

/// Pull the `device:` line out of `cryptsetup status` output.
pub fn parse_status_device(status: &str) -> Option<PathBuf> {
    status.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix("device:")?;
        match rest.trim() {
            "" => None,
            device => Some(PathBuf::from(device)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    const STATUS: &str = "/dev/mapper/sda3_crypt is active and is in use.
  type:    LUKS2
  cipher:  aes-xts-plain64
  keysize: 512 bits
  key location: keyring
  device:  /dev/sda3
  sector size:  512
  offset:  32768 sectors
  size:    999161856 sectors
  mode:    read/write
";

    #[test]
    fn status_device_line() {
        assert_eq!(parse_status_device(STATUS), Some(PathBuf::from("/dev/sda3")));
    }

    #[test]
    fn status_without_device() {
        assert_eq!(
            parse_status_device("/dev/mapper/foo is inactive.\n"),
            None
        );
        assert_eq!(parse_status_device("  device:   \n"), None);
    }

    #[test]
    fn missing_path_is_not_luks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cryptsetup = Cryptsetup::new("cryptsetup");
        assert!(!cryptsetup.is_luks(&dir.path().join("nope"))?);
        Ok(())
    }

    #[test]
    fn add_key_reports_exit_status() -> Result<()> {
        let mut cryptsetup = Cryptsetup::new("false");
        match cryptsetup.add_key(Path::new("/dev/sdX3"), Path::new("/root/key")) {
            Err(LuksError::AddKeyRejected { device, .. }) => {
                assert_eq!(device, PathBuf::from("/dev/sdX3"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }
}
