//! Boot-time artifacts: the crypttab keyscript and the initramfs hook that
//! makes `tpm2_nvread` available to it.

use crate::command::locate;
use crate::config::{Config, HookRequirements, Ownership};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{fchown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub mod initramfs;
pub mod keyscript;

/// The keyscript prints key material, so only root and its group may run it.
pub const KEYSCRIPT_MODE: u32 = 0o750;
pub const HOOK_MODE: u32 = 0o755;

const KEYSCRIPT_TEMPLATE: &str = include_str!("../../templates/tpm2-getkey.sh");
const HOOK_TEMPLATE: &str = include_str!("../../templates/tpm2-decryptkey.hook");

#[derive(Error, Debug)]
pub enum BootError {
    #[error("{0} not found on this system")]
    Missing(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = BootError> = core::result::Result<T, E>;

/// Host paths of everything the hook copies into the initramfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookBinaries {
    pub nvread: PathBuf,
    pub libraries: Vec<PathBuf>,
}

impl HookBinaries {
    pub fn locate(requirements: &HookRequirements) -> Result<Self> {
        let nvread = locate(&requirements.nvread_candidates)
            .ok_or_else(|| BootError::Missing("tpm2_nvread".into()))?;
        let libraries = requirements
            .libraries
            .iter()
            .map(|name| {
                let candidates: Vec<PathBuf> = requirements
                    .library_dirs
                    .iter()
                    .map(|dir| dir.join(name))
                    .collect();
                locate(&candidates).ok_or_else(|| BootError::Missing(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { nvread, libraries })
    }
}

/// Rendered file contents, ready to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootArtifacts {
    pub keyscript: String,
    pub hook: String,
}

impl BootArtifacts {
    pub fn render(config: &Config, binaries: &HookBinaries, tcti: &str) -> Self {
        let keyscript = KEYSCRIPT_TEMPLATE
            .replace("{{VERSION}}", env!("CARGO_PKG_VERSION"))
            .replace("{{NV_INDEX}}", &config.nv_index.to_string())
            .replace("{{KEY_SIZE}}", &config.key_size.to_string())
            .replace("{{MARKER_DIR}}", &config.marker_dir.display().to_string())
            .replace("{{ASKPASS}}", &config.tools.askpass.display().to_string())
            .replace("{{TCTI}}", tcti);

        let required = std::iter::once(&binaries.nvread)
            .chain(&binaries.libraries)
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let copy_libraries = binaries
            .libraries
            .iter()
            .map(|lib| format!("copy_exec {} /lib", lib.display()))
            .collect::<Vec<_>>()
            .join("\n");
        let hook = HOOK_TEMPLATE
            .replace("{{VERSION}}", env!("CARGO_PKG_VERSION"))
            .replace("{{KEYSCRIPT}}", &config.keyscript_path.display().to_string())
            .replace("{{REQUIRED}}", &required)
            .replace("{{NVREAD}}", &binaries.nvread.display().to_string())
            .replace("{{COPY_LIBRARIES}}", &copy_libraries);

        Self { keyscript, hook }
    }
}

/// Atomically write `contents` to `path` with `mode`, handing the file to
/// `owner` when the writing process is someone else.
pub fn install(path: &Path, contents: &str, mode: u32, owner: &Ownership) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(contents.as_bytes())?;
    temp.as_file().sync_all()?;

    let meta = temp.as_file().metadata()?;
    if meta.uid() != owner.uid || meta.gid() != owner.gid {
        fchown(temp.as_file(), Some(owner.uid), Some(owner.gid))?;
    }
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use std::process::Command;

    fn current_owner() -> Ownership {
        unsafe {
            Ownership {
                uid: libc::geteuid(),
                gid: libc::getegid(),
            }
        }
    }

    fn fake_binaries(root: &Path) -> Result<(HookRequirements, HookBinaries)> {
        let bin = root.join("bin");
        let lib = root.join("lib");
        fs::create_dir_all(&bin)?;
        fs::create_dir_all(&lib)?;
        fs::write(bin.join("tpm2_nvread"), b"")?;
        fs::write(lib.join("libtss2-tcti-device.so.0"), b"")?;
        fs::write(lib.join("libtss2-tcti-device.so.0.0.0"), b"")?;
        let requirements = HookRequirements {
            nvread_candidates: vec![root.join("nope/tpm2_nvread"), bin.join("tpm2_nvread")],
            library_dirs: vec![root.join("nope"), lib.clone()],
            ..HookRequirements::default()
        };
        let binaries = HookBinaries {
            nvread: bin.join("tpm2_nvread"),
            libraries: vec![
                lib.join("libtss2-tcti-device.so.0"),
                lib.join("libtss2-tcti-device.so.0.0.0"),
            ],
        };
        Ok((requirements, binaries))
    }

    #[test]
    fn locate_resolves_binary_and_libraries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (requirements, expected) = fake_binaries(dir.path())?;
        assert_eq!(HookBinaries::locate(&requirements)?, expected);
        Ok(())
    }

    #[test]
    fn locate_reports_missing_library() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut requirements, _) = fake_binaries(dir.path())?;
        requirements.libraries.push("libtss2-tcti-missing.so.0".into());
        match HookBinaries::locate(&requirements) {
            Err(BootError::Missing(name)) => assert_eq!(name, "libtss2-tcti-missing.so.0"),
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn keyscript_rendering() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (_, binaries) = fake_binaries(dir.path())?;
        let artifacts =
            BootArtifacts::render(&Config::default(), &binaries, "device:/dev/tpmrm0");
        assert!(artifacts
            .keyscript
            .contains("exec tpm2_nvread -C o -s 64 0x1500016"));
        assert!(artifacts.keyscript.contains("MARKER_DIR=\"/run\""));
        assert!(artifacts.keyscript.contains("exec /lib/cryptsetup/askpass "));
        assert!(!artifacts.keyscript.contains("{{"));
        assert!(!artifacts.hook.contains("{{"));
        assert!(artifacts.hook.contains(&format!(
            "copy_exec {} /bin",
            binaries.nvread.display()
        )));
        Ok(())
    }

    #[test]
    fn hook_prereqs_is_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (_, binaries) = fake_binaries(dir.path())?;
        let artifacts = BootArtifacts::render(&Config::default(), &binaries, "device:/dev/tpmrm0");
        let hook = dir.path().join("hook");
        fs::write(&hook, &artifacts.hook)?;

        let out = Command::new("sh").arg(&hook).arg("prereqs").output()?;
        assert!(out.status.success());
        assert_eq!(String::from_utf8(out.stdout)?.trim(), "");
        Ok(())
    }

    #[test]
    fn hook_fails_loudly_when_binary_disappears() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (_, binaries) = fake_binaries(dir.path())?;
        let artifacts = BootArtifacts::render(&Config::default(), &binaries, "device:/dev/tpmrm0");
        let hook = dir.path().join("hook");
        fs::write(&hook, &artifacts.hook)?;
        fs::remove_file(&binaries.libraries[1])?;

        let out = Command::new("sh").arg(&hook).output()?;
        assert_eq!(out.status.code(), Some(1));
        assert!(String::from_utf8(out.stderr)?.contains("libtss2-tcti-device.so.0.0.0"));
        Ok(())
    }

    #[test]
    fn install_hands_file_to_configured_owner() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hooks/tpm2-decryptkey");
        let me = current_owner();
        if me.uid == 0 {
            let owner = Ownership { uid: 1, gid: 1 };
            install(&path, "#!/bin/sh\n", HOOK_MODE, &owner)?;
            let meta = fs::metadata(&path)?;
            assert_eq!((meta.uid(), meta.gid()), (1, 1));
            assert_eq!(meta.mode() & 0o7777, HOOK_MODE);
        } else {
            // Giving a file to root needs root; the target must stay absent.
            let err = install(&path, "#!/bin/sh\n", HOOK_MODE, &Ownership::default()).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
            assert!(!path.exists());
        }
        Ok(())
    }

    #[test]
    fn install_sets_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sbin/tpm2-getkey");
        install(&path, "#!/bin/sh\n", KEYSCRIPT_MODE, &current_owner())?;
        assert_eq!(fs::read_to_string(&path)?, "#!/bin/sh\n");
        assert_eq!(fs::metadata(&path)?.mode() & 0o7777, KEYSCRIPT_MODE);

        install(&path, "#!/bin/sh\nexit 0\n", HOOK_MODE, &current_owner())?;
        assert_eq!(fs::read_to_string(&path)?, "#!/bin/sh\nexit 0\n");
        assert_eq!(fs::metadata(&path)?.mode() & 0o7777, HOOK_MODE);
        Ok(())
    }
}
