//! Recovery instructions printed at the end of a successful run.

use crate::tpm::NvIndex;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guidance {
    pub device: PathBuf,
    pub index: NvIndex,
    pub key_size: u16,
    /// SHA-256 of the secret, hex encoded.
    pub fingerprint: String,
    pub release: String,
    pub backup_image: PathBuf,
}

impl Guidance {
    pub fn backup_command(&self) -> String {
        format!("tpm2_nvread -C o -s {} {}", self.key_size, self.index)
    }

    pub fn remove_passphrase_command(&self) -> String {
        format!("cryptsetup luksRemoveKey {}", self.device.display())
    }

    fn backup_image_name(&self) -> String {
        self.backup_image
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("initrd.img-{}.orig", self.release))
    }
}

impl fmt::Display for Guidance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let original = format!("initrd.img-{}", self.release);
        writeln!(f, "{} will now unlock from the TPM at boot.", self.device.display())?;
        writeln!(f)?;
        writeln!(f, "1. Back up the secret somewhere offline:")?;
        writeln!(f)?;
        writeln!(f, "     {} > tpm-nv-luks.key", self.backup_command())?;
        writeln!(f)?;
        writeln!(f, "   Its SHA-256 must be {}", self.fingerprint)?;
        writeln!(f, "   (check with `sha256sum tpm-nv-luks.key`).")?;
        writeln!(f)?;
        writeln!(
            f,
            "2. Only once that backup is confirmed, the original passphrase can be removed:"
        )?;
        writeln!(f)?;
        writeln!(f, "     {}", self.remove_passphrase_command())?;
        writeln!(f)?;
        writeln!(
            f,
            "   Without the backup, a TPM clear or failure leaves the volume unrecoverable."
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "3. If the system fails to boot, the previous initramfs is kept as {}.",
            self.backup_image.display()
        )?;
        writeln!(f, "   To boot it once:")?;
        writeln!(f, "     - hold Shift (BIOS) or press Esc (UEFI) to show the GRUB menu")?;
        writeln!(f, "     - highlight the default entry and press `e`")?;
        writeln!(
            f,
            "     - on the `initrd` line change {original} to {}",
            self.backup_image_name()
        )?;
        writeln!(f, "     - press Ctrl-x or F10 to boot")?;
        write!(
            f,
            "   and type the passphrase at the prompt. Running `update-initramfs -u` afterwards\n   rebuilds {original} from the installed hook."
        )
    }
}
