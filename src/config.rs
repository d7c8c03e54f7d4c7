//! Runtime configuration.
//!
//! Everything has a default matching a stock Debian/Ubuntu initramfs-tools
//! layout, so the YAML file at `/etc/tpm-nv-luks.yaml` is optional. Only the
//! fields that differ need to be listed:
//!
//! ```yaml
//! key_size: 96
//! nv_backend: tpm2-tools
//! tools:
//!   cryptsetup: /usr/sbin/cryptsetup
//! ```

use crate::tpm::NvIndex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tpm-nv-luks.yaml";
pub const DEFAULT_KEY_SIZE: u16 = 64;
/// Keys shorter than this are accepted but logged as weak.
pub const RECOMMENDED_MIN_KEY_SIZE: u16 = 32;
/// Largest NV write we issue in a single command.
pub const MAX_KEY_SIZE: u16 = 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("key_size must be between 1 and {max}, got {0}", max = MAX_KEY_SIZE)]
    KeySize(u16),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

/// Which implementation talks to the TPM NV storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NvBackendKind {
    /// Native TSS2 ESAPI calls.
    Esapi,
    /// The `tpm2_nv*` command line tools.
    Tpm2Tools,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Default for Ownership {
    fn default() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// External binaries. Bare names are looked up on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub cryptsetup: PathBuf,
    /// Path of the prompt helper *inside the initramfs*.
    pub askpass: PathBuf,
    pub mkinitramfs: PathBuf,
    pub lsinitramfs: PathBuf,
    pub tpm2_nvreadpublic: PathBuf,
    pub tpm2_nvundefine: PathBuf,
    pub tpm2_nvdefine: PathBuf,
    pub tpm2_nvwrite: PathBuf,
    pub tpm2_nvread: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            cryptsetup: "cryptsetup".into(),
            askpass: "/lib/cryptsetup/askpass".into(),
            mkinitramfs: "mkinitramfs".into(),
            lsinitramfs: "lsinitramfs".into(),
            tpm2_nvreadpublic: "tpm2_nvreadpublic".into(),
            tpm2_nvundefine: "tpm2_nvundefine".into(),
            tpm2_nvdefine: "tpm2_nvdefine".into(),
            tpm2_nvwrite: "tpm2_nvwrite".into(),
            tpm2_nvread: "tpm2_nvread".into(),
        }
    }
}

/// What the initramfs hook has to copy into the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HookRequirements {
    /// Candidate locations of `tpm2_nvread` on the running system.
    pub nvread_candidates: Vec<PathBuf>,
    /// Shared libraries loaded at runtime by `tpm2_nvread`.
    pub libraries: Vec<String>,
    pub library_dirs: Vec<PathBuf>,
}

impl Default for HookRequirements {
    fn default() -> Self {
        Self {
            nvread_candidates: vec![
                "/usr/bin/tpm2_nvread".into(),
                "/usr/local/bin/tpm2_nvread".into(),
                "/bin/tpm2_nvread".into(),
            ],
            libraries: vec![
                "libtss2-tcti-device.so.0".into(),
                "libtss2-tcti-device.so.0.0.0".into(),
            ],
            library_dirs: vec![
                "/usr/lib/x86_64-linux-gnu".into(),
                "/lib/x86_64-linux-gnu".into(),
                "/usr/lib/aarch64-linux-gnu".into(),
                "/usr/lib64".into(),
                "/usr/lib".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Length of the generated secret, which is also the NV index size.
    pub key_size: u16,
    pub nv_index: NvIndex,
    pub nv_backend: NvBackendKind,
    /// Where the secret lives between generation and enrollment.
    pub secret_path: PathBuf,
    pub crypttab_path: PathBuf,
    pub keyscript_path: PathBuf,
    pub hook_path: PathBuf,
    /// Boot-scoped (tmpfs) directory holding the per-volume attempt markers.
    pub marker_dir: PathBuf,
    pub boot_dir: PathBuf,
    pub owner: Ownership,
    pub tools: ToolPaths,
    pub initramfs: HookRequirements,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_size: DEFAULT_KEY_SIZE,
            nv_index: NvIndex::default(),
            nv_backend: NvBackendKind::Esapi,
            secret_path: "/root/.tpm-nv-luks.key".into(),
            crypttab_path: "/etc/crypttab".into(),
            keyscript_path: "/usr/local/sbin/tpm2-getkey".into(),
            hook_path: "/etc/initramfs-tools/hooks/tpm2-decryptkey".into(),
            marker_dir: "/run".into(),
            boot_dir: "/boot".into(),
            owner: Ownership::default(),
            tools: ToolPaths::default(),
            initramfs: HookRequirements::default(),
        }
    }
}

impl Config {
    /// Load the config at `path`, falling back to defaults when it does not
    /// exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config = Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> core::result::Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to an empty map.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_size == 0 || self.key_size > MAX_KEY_SIZE {
            return Err(ConfigError::KeySize(self.key_size));
        }
        if self.key_size < RECOMMENDED_MIN_KEY_SIZE {
            log::warn!(
                "key_size {} is below {} characters, the TPM key will be weaker than a good passphrase",
                self.key_size,
                RECOMMENDED_MIN_KEY_SIZE
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn defaults_match_stock_layout() {
        let config = Config::default();
        assert_eq!(config.key_size, 64);
        assert_eq!(config.nv_index.value(), 0x1500016);
        assert_eq!(
            config.keyscript_path,
            PathBuf::from("/usr/local/sbin/tpm2-getkey")
        );
        assert_eq!(config.nv_backend, NvBackendKind::Esapi);
    }

    #[test]
    fn empty_document_is_default() -> Result<()> {
        assert_eq!(Config::from_yaml("\n")?, Config::default());
        Ok(())
    }

    #[test]
    fn partial_document_keeps_other_defaults() -> Result<()> {
        let config = Config::from_yaml(
            "key_size: 96\nnv_backend: tpm2-tools\nnv_index: 22020119\ntools:\n  cryptsetup: /usr/sbin/cryptsetup\n",
        )?;
        assert_eq!(config.key_size, 96);
        assert_eq!(config.nv_backend, NvBackendKind::Tpm2Tools);
        assert_eq!(config.nv_index.value(), 0x1500017);
        assert_eq!(
            config.tools.cryptsetup,
            PathBuf::from("/usr/sbin/cryptsetup")
        );
        assert_eq!(config.tools.mkinitramfs, PathBuf::from("mkinitramfs"));
        assert_eq!(config.crypttab_path, PathBuf::from("/etc/crypttab"));
        Ok(())
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(Config::from_yaml("keysize: 64\n").is_err());
    }

    #[test]
    fn nv_index_outside_owner_range_rejected() {
        assert!(Config::from_yaml("nv_index: 42\n").is_err());
    }

    #[test]
    fn key_size_bounds() {
        let mut config = Config::default();
        config.key_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::KeySize(0))));
        config.key_size = MAX_KEY_SIZE + 1;
        assert!(config.validate().is_err());
        // Short keys only warn.
        config.key_size = 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_gives_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::load(dir.path().join("absent.yaml"))?;
        assert_eq!(config, Config::default());
        Ok(())
    }

    #[test]
    fn load_reports_path_on_parse_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "key_size: [1, 2]\n")?;
        match Config::load(&path) {
            Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }
}
