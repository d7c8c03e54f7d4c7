use crate::config::{Config, NvBackendKind};
use ambassador::{delegatable_trait, Delegate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use zeroize::Zeroizing;

pub use esapi::EsapiNvStore;
pub use tools::Tpm2Tools;

mod esapi;
mod tools;

/// Owner-hierarchy NV index range (TPM2_HR_NV_INDEX, owner part).
const NV_INDEX_FIRST: u32 = 0x0100_0000;
const NV_INDEX_LAST: u32 = 0x01ff_ffff;
pub const DEFAULT_NV_INDEX: u32 = 0x0150_0016;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error(
        "NV index {0:#x} is outside the owner range {first:#x}..={last:#x}",
        first = NV_INDEX_FIRST,
        last = NV_INDEX_LAST
    )]
    InvalidNvIndex(u32),
    #[error("failed to initialise TPM context: {0}")]
    Context(String),
    #[error("TPM context mutex poisoned")]
    ContextPoisoned,
    #[error("{tool} failed: {message}")]
    Tool { tool: PathBuf, message: String },
    #[error("NV index {index} returned {actual} bytes, expected {expected}")]
    ShortRead {
        index: NvIndex,
        expected: usize,
        actual: usize,
    },
    #[error("{0} bytes do not fit in an NV index")]
    TooLarge(usize),
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

/// An NV index in the owner range, e.g. `0x1500016`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct NvIndex(u32);

impl NvIndex {
    pub fn new(value: u32) -> Result<Self> {
        match value {
            NV_INDEX_FIRST..=NV_INDEX_LAST => Ok(Self(value)),
            _ => Err(TpmError::InvalidNvIndex(value)),
        }
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for NvIndex {
    fn default() -> Self {
        Self(DEFAULT_NV_INDEX)
    }
}

impl TryFrom<u32> for NvIndex {
    type Error = TpmError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<NvIndex> for u32 {
    fn from(index: NvIndex) -> Self {
        index.0
    }
}

impl fmt::Display for NvIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The NV storage operations the provisioning run and the keyscript need.
#[delegatable_trait]
pub trait NvStore {
    /// Remove `index` if it is defined. Returns whether anything was removed.
    fn undefine_if_present(&mut self, index: NvIndex) -> Result<bool>;
    fn define(&mut self, index: NvIndex, size: u16) -> Result<()>;
    fn write(&mut self, index: NvIndex, data: &[u8]) -> Result<()>;
    fn read(&mut self, index: NvIndex, size: u16) -> Result<Zeroizing<Vec<u8>>>;
}

/// The configured [`NvStore`] implementation.
#[derive(Delegate)]
#[delegate(NvStore)]
pub enum NvBackend {
    Esapi(EsapiNvStore),
    Tools(Tpm2Tools),
}

impl NvBackend {
    pub fn from_config(config: &Config) -> Self {
        match config.nv_backend {
            NvBackendKind::Esapi => Self::Esapi(EsapiNvStore::new()),
            NvBackendKind::Tpm2Tools => Self::Tools(Tpm2Tools::new(&config.tools)),
        }
    }
}

/// Read exactly `size` bytes, treating a short read as an error.
pub(crate) fn check_read_len(index: NvIndex, size: u16, data: &[u8]) -> Result<()> {
    if data.len() != usize::from(size) {
        return Err(TpmError::ShortRead {
            index,
            expected: size.into(),
            actual: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv_index_display() {
        assert_eq!(NvIndex::default().to_string(), "0x1500016");
    }

    #[test]
    fn nv_index_range() {
        assert!(NvIndex::new(0x0100_0000).is_ok());
        assert!(NvIndex::new(0x01ff_ffff).is_ok());
        assert!(matches!(
            NvIndex::new(0x8101_0002),
            Err(TpmError::InvalidNvIndex(0x8101_0002))
        ));
        assert!(NvIndex::new(0x00ff_ffff).is_err());
    }

    #[test]
    fn short_read_detected() {
        let index = NvIndex::default();
        assert!(check_read_len(index, 4, b"abcd").is_ok());
        assert!(matches!(
            check_read_len(index, 4, b"ab"),
            Err(TpmError::ShortRead {
                expected: 4,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn backend_follows_config() {
        let mut config = Config::default();
        config.nv_backend = NvBackendKind::Tpm2Tools;
        assert!(matches!(NvBackend::from_config(&config), NvBackend::Tools(_)));
        config.nv_backend = NvBackendKind::Esapi;
        assert!(matches!(NvBackend::from_config(&config), NvBackend::Esapi(_)));
    }
}
