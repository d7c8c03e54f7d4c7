use crate::command::Tool;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const OSRELEASE: &str = "/proc/sys/kernel/osrelease";

#[derive(Error, Debug)]
pub enum InitramfsError {
    #[error("initramfs {0} does not exist, nothing to back up")]
    MissingImage(PathBuf),
    #[error("{tool} failed: {message}")]
    Tool { tool: PathBuf, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = InitramfsError> = core::result::Result<T, E>;

/// Builds the initramfs for a kernel release.
pub trait ImageBuilder {
    fn kernel_release(&self) -> Result<String>;
    fn rebuild(&mut self, image: &Path, release: &str) -> Result<()>;
    /// File listing of `image`, `None` when no listing tool is installed.
    fn list(&self, image: &Path) -> Result<Option<String>>;
}

/// `mkinitramfs`/`lsinitramfs` from initramfs-tools.
#[derive(Debug, Clone)]
pub struct InitramfsTools {
    mkinitramfs: Tool,
    lsinitramfs: Tool,
}

impl InitramfsTools {
    pub fn new(mkinitramfs: impl Into<PathBuf>, lsinitramfs: impl Into<PathBuf>) -> Self {
        Self {
            mkinitramfs: Tool::new(mkinitramfs),
            lsinitramfs: Tool::new(lsinitramfs),
        }
    }
}

impl ImageBuilder for InitramfsTools {
    fn kernel_release(&self) -> Result<String> {
        Ok(fs::read_to_string(OSRELEASE)?.trim().to_string())
    }

    fn rebuild(&mut self, image: &Path, release: &str) -> Result<()> {
        let out = self
            .mkinitramfs
            .output(
                [OsStr::new("-o"), image.as_os_str(), OsStr::new(release)],
                None,
            )?;
        if out.success() {
            return Ok(());
        }
        Err(InitramfsError::Tool {
            tool: self.mkinitramfs.binary().to_path_buf(),
            message: out.diagnostic(),
        })
    }

    fn list(&self, image: &Path) -> Result<Option<String>> {
        let out = match self.lsinitramfs.output([image], None) {
            Ok(out) => out,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if !out.success() {
            return Err(InitramfsError::Tool {
                tool: self.lsinitramfs.binary().to_path_buf(),
                message: out.diagnostic(),
            });
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).into_owned()))
    }
}

/// `<boot_dir>/initrd.img-<release>`, the Debian naming.
pub fn image_path(boot_dir: &Path, release: &str) -> PathBuf {
    boot_dir.join(format!("initrd.img-{release}"))
}

/// `<image>.orig`
pub fn backup_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".orig");
    PathBuf::from(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backup {
    Created(PathBuf),
    /// A `.orig` from an earlier run already exists and was left alone; it is
    /// the image from before any provisioning.
    Kept(PathBuf),
}

impl Backup {
    pub fn path(&self) -> &Path {
        match self {
            Self::Created(path) | Self::Kept(path) => path,
        }
    }
}

pub fn backup_image(image: &Path) -> Result<Backup> {
    if !image.exists() {
        return Err(InitramfsError::MissingImage(image.to_path_buf()));
    }
    let backup = backup_path(image);
    if backup.exists() {
        return Ok(Backup::Kept(backup));
    }
    fs::copy(image, &backup)?;
    Ok(Backup::Created(backup))
}

/// Which of `names` do not appear as a path component in `listing`.
pub fn missing_entries<'a>(listing: &str, names: &[&'a str]) -> Vec<&'a str> {
    names
        .iter()
        .copied()
        .filter(|name| {
            !listing
                .lines()
                .any(|line| line.trim_end().rsplit('/').next() == Some(*name))
        })
        .collect()
}
