use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

/// A generated LUKS key: printable ASCII alphanumerics only, so it survives
/// being passed around as a keyfile, through `tpm2_nvread` and on a terminal.
#[derive(Clone)]
pub struct Secret(Zeroizing<Vec<u8>>);

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

impl Secret {
    /// Draw bytes from `rng` and keep only those that are ASCII alphanumeric
    /// until `len` characters are collected. Rejecting instead of reducing
    /// modulo 62 keeps every character equally likely.
    pub fn generate<R: RngCore + ?Sized>(rng: &mut R, len: usize) -> Self {
        let mut secret = Zeroizing::new(Vec::with_capacity(len));
        let mut buf = Zeroizing::new([0u8; 64]);
        while secret.len() < len {
            rng.fill_bytes(&mut *buf);
            for byte in buf.iter().copied().filter(u8::is_ascii_alphanumeric) {
                if secret.len() == len {
                    break;
                }
                secret.push(byte);
            }
        }
        Self(secret)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SHA-256 of the secret, hex encoded. Safe to log; lets an operator check
    /// an offline copy without printing the key.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.as_bytes()))
    }
}

impl PartialEq<[u8]> for Secret {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

/// The secret staged on disk for `cryptsetup luksAddKey`.
///
/// Deliberately not removed on drop: if enrollment fails the file is left for
/// the operator to retry with.
#[derive(Debug)]
pub struct SecretFile {
    path: PathBuf,
}

impl SecretFile {
    /// Write `secret` to `path` with mode 0400, replacing any previous file
    /// atomically. No trailing newline, cryptsetup would treat it as key data.
    pub fn create(path: &Path, secret: &Secret) -> io::Result<Self> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(parent)?;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o400))?;
        temp.as_file_mut().write_all(secret.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|err| err.error)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}
