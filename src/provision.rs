//! The provisioning run: five stages executed strictly in order, stopping at
//! the first failure.
//!
//! Nothing is rolled back. An error carries the stage it happened in and the
//! stages that had already completed, and the partial state (NV index, secret
//! file, backups) stays where it is for the operator to finish or undo by hand.

use crate::boot::initramfs::{self, Backup, ImageBuilder, InitramfsError};
use crate::boot::{self, BootArtifacts, HookBinaries, HOOK_MODE, KEYSCRIPT_MODE};
use crate::config::{Config, ConfigError};
use crate::crypttab::{self, KeyscriptPatch};
use crate::guidance::Guidance;
use crate::luks::{LuksError, LuksVersion, VolumeTool};
use crate::secret::{Secret, SecretFile};
use crate::tpm::{NvIndex, NvStore, TpmError};
use rand::rngs::OsRng;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preflight,
    SecretProvisioning,
    KeyEnrollment,
    BootIntegration,
    OperatorGuidance,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Preflight => "preflight",
            Self::SecretProvisioning => "secret provisioning",
            Self::KeyEnrollment => "key enrollment",
            Self::BootIntegration => "boot integration",
            Self::OperatorGuidance => "operator guidance",
        })
    }
}

#[derive(Error, Debug)]
pub enum Failure {
    #[error("must be run as root")]
    InsufficientPrivilege,
    #[error("no encrypted volume found: {0}")]
    NoVolumeFound(String),
    #[error("{} is not a LUKS volume", .0.display())]
    NotAnEncryptedVolume(PathBuf),
    #[error("NV index {index} did not read back the secret that was written")]
    VerificationMismatch { index: NvIndex },
    #[error(
        "adding the key to {} failed, the secret is still in {} and NV index {index}: {source}",
        .device.display(),
        .secret.display()
    )]
    EnrollmentFailed {
        device: PathBuf,
        secret: PathBuf,
        index: NvIndex,
        source: LuksError,
    },
    #[error("failed to install {}: {reason}", .path.display())]
    ArtifactInstallFailed { path: PathBuf, reason: String },
    #[error("initramfs rebuild failed: {0}")]
    ImageRebuildFailed(#[source] InitramfsError),
    #[error("failed to write secret file {}: {source}", .path.display())]
    SecretFile { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Luks(#[from] LuksError),
}

/// A failed run: where it stopped and what had already been done.
#[derive(Debug)]
pub struct ProvisionError {
    pub stage: Stage,
    pub completed: Vec<Stage>,
    pub failure: Failure,
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.failure)?;
        if !self.completed.is_empty() {
            let done: Vec<String> = self.completed.iter().map(Stage::to_string).collect();
            write!(f, " (completed: {})", done.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.failure)
    }
}

pub type Result<T, E = ProvisionError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub device: PathBuf,
    pub version: LuksVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootChanges {
    pub release: String,
    pub image: PathBuf,
    pub backup: Backup,
    pub crypttab: KeyscriptPatch,
    /// crypttab entries after the patched one, left for manual editing.
    pub untouched_entries: usize,
    /// Everything logged as a warning while integrating.
    pub warnings: Vec<String>,
}

fn warn(warnings: &mut Vec<String>, message: String) {
    log::warn!("{message}");
    warnings.push(message);
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub volume: Volume,
    pub fingerprint: String,
    pub boot: BootChanges,
    pub guidance: Guidance,
}

#[derive(Default)]
struct Progress {
    completed: Vec<Stage>,
}

impl Progress {
    fn stage<T>(
        &mut self,
        stage: Stage,
        step: impl FnOnce() -> core::result::Result<T, Failure>,
    ) -> Result<T> {
        log::info!("== {stage} ==");
        match step() {
            Ok(value) => {
                self.completed.push(stage);
                Ok(value)
            }
            Err(failure) => Err(ProvisionError {
                stage,
                completed: self.completed.clone(),
                failure,
            }),
        }
    }
}

pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

pub struct Provisioner<V, N, B> {
    config: Config,
    volumes: V,
    nv: N,
    images: B,
    privileged: bool,
    tcti: String,
}

impl<V, N, B> Provisioner<V, N, B>
where
    V: VolumeTool,
    N: NvStore,
    B: ImageBuilder,
{
    pub fn new(config: Config, volumes: V, nv: N, images: B) -> Self {
        Self {
            config,
            volumes,
            nv,
            images,
            privileged: running_as_root(),
            tcti: String::from("device:/dev/tpmrm0"),
        }
    }

    /// Override the effective-uid check.
    pub fn with_privilege(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// TCTI baked into the keyscript for `tpm2_nvread`.
    pub fn with_tcti(mut self, tcti: impl Into<String>) -> Self {
        self.tcti = tcti.into();
        self
    }

    pub fn volumes(&self) -> &V {
        &self.volumes
    }

    pub fn nv(&self) -> &N {
        &self.nv
    }

    pub fn images(&self) -> &B {
        &self.images
    }

    /// Provision `device`, or the backing device of the first crypttab entry
    /// when none is given.
    pub fn run(&mut self, device: Option<&Path>) -> Result<Report> {
        let mut progress = Progress::default();
        let volume = progress.stage(Stage::Preflight, || self.preflight(device))?;
        let staged = progress.stage(Stage::SecretProvisioning, || self.provision_secret())?;
        let fingerprint = progress.stage(Stage::KeyEnrollment, || self.enroll(&volume, staged))?;
        let boot = progress.stage(Stage::BootIntegration, || self.integrate_boot())?;
        let guidance = progress.stage(Stage::OperatorGuidance, || {
            Ok(Guidance {
                device: volume.device.clone(),
                index: self.config.nv_index,
                key_size: self.config.key_size,
                fingerprint: fingerprint.clone(),
                release: boot.release.clone(),
                backup_image: boot.backup.path().to_path_buf(),
            })
        })?;
        Ok(Report {
            fingerprint,
            volume,
            boot,
            guidance,
        })
    }

    fn preflight(&self, device: Option<&Path>) -> core::result::Result<Volume, Failure> {
        if !self.privileged {
            return Err(Failure::InsufficientPrivilege);
        }
        self.config.validate()?;

        let device = match device {
            Some(device) => device.to_path_buf(),
            None => self.discover()?,
        };
        log::info!("Checking {} for a LUKS header", device.display());
        match self.volumes.luks_version(&device)? {
            Some(version) => {
                log::info!("{} is {version}", device.display());
                Ok(Volume { device, version })
            }
            None => Err(Failure::NotAnEncryptedVolume(device)),
        }
    }

    fn discover(&self) -> core::result::Result<PathBuf, Failure> {
        let crypttab = &self.config.crypttab_path;
        log::info!("Looking up the first entry of {}", crypttab.display());
        let entry = crypttab::read_first_entry(crypttab)
            .map_err(|err| Failure::NoVolumeFound(format!("{}: {err}", crypttab.display())))?;
        log::info!("Resolving backing device of {}", entry.name);
        self.volumes.backing_device(&entry.name)?.ok_or_else(|| {
            Failure::NoVolumeFound(format!("mapping {} has no backing device", entry.name))
        })
    }

    fn provision_secret(&mut self) -> core::result::Result<Staged, Failure> {
        let index = self.config.nv_index;
        let size = self.config.key_size;

        log::info!("Clearing NV index {index}");
        if self.nv.undefine_if_present(index)? {
            log::info!("Removed existing NV index {index}");
        }
        log::info!("Defining NV index {index} with {size} bytes");
        self.nv.define(index, size)?;

        log::info!("Generating a {size} character secret");
        let secret = Secret::generate(&mut OsRng, size.into());
        let path = &self.config.secret_path;
        log::info!("Writing secret file {}", path.display());
        let file = SecretFile::create(path, &secret).map_err(|source| Failure::SecretFile {
            path: path.clone(),
            source,
        })?;

        log::info!("Writing secret to NV index {index}");
        self.nv.write(index, secret.as_bytes())?;
        log::info!("Reading back NV index {index}");
        let read = match self.nv.read(index, size) {
            Ok(read) => read,
            Err(TpmError::ShortRead { .. }) => return Err(Failure::VerificationMismatch { index }),
            Err(err) => return Err(err.into()),
        };
        if secret != read[..] {
            return Err(Failure::VerificationMismatch { index });
        }
        log::info!("Secret fingerprint (sha256): {}", secret.fingerprint());
        Ok(Staged { secret, file })
    }

    /// Enroll the staged secret and drop it, returning its fingerprint.
    fn enroll(&mut self, volume: &Volume, staged: Staged) -> core::result::Result<String, Failure> {
        let Staged { secret, file } = staged;
        let keyfile = file.path().to_path_buf();
        log::info!(
            "Adding the secret as a new key on {}, cryptsetup will ask for an existing passphrase",
            volume.device.display()
        );
        if let Err(source) = self.volumes.add_key(&volume.device, &keyfile) {
            return Err(Failure::EnrollmentFailed {
                device: volume.device.clone(),
                secret: keyfile,
                index: self.config.nv_index,
                source,
            });
        }
        log::info!("Removing secret file {}", keyfile.display());
        file.remove().map_err(|source| Failure::SecretFile {
            path: keyfile,
            source,
        })?;
        Ok(secret.fingerprint())
    }

    fn integrate_boot(&mut self) -> core::result::Result<BootChanges, Failure> {
        let config = &self.config;
        let mut warnings = Vec::new();

        log::info!("Locating tpm2_nvread and TCTI libraries for the initramfs");
        let binaries = HookBinaries::locate(&config.initramfs).map_err(|err| {
            Failure::ArtifactInstallFailed {
                path: config.hook_path.clone(),
                reason: err.to_string(),
            }
        })?;
        let artifacts = BootArtifacts::render(config, &binaries, &self.tcti);
        for (path, contents, mode) in [
            (&config.keyscript_path, &artifacts.keyscript, KEYSCRIPT_MODE),
            (&config.hook_path, &artifacts.hook, HOOK_MODE),
        ] {
            log::info!("Installing {} (mode {mode:o})", path.display());
            boot::install(path, contents, mode, &config.owner).map_err(|err| {
                Failure::ArtifactInstallFailed {
                    path: path.clone(),
                    reason: err.to_string(),
                }
            })?;
        }

        log::info!(
            "Adding keyscript={} to the first entry of {}",
            config.keyscript_path.display(),
            config.crypttab_path.display()
        );
        let patched = crypttab::patch_file(&config.crypttab_path, &config.keyscript_path)
            .map_err(|err| Failure::ArtifactInstallFailed {
                path: config.crypttab_path.clone(),
                reason: err.to_string(),
            })?;
        match &patched.outcome {
            KeyscriptPatch::Appended => {}
            KeyscriptPatch::Replaced { previous } => warn(
                &mut warnings,
                format!(
                    "Replaced keyscript={previous} on line {} of {}",
                    patched.line,
                    config.crypttab_path.display()
                ),
            ),
            KeyscriptPatch::AlreadyPresent => log::info!("Keyscript already configured"),
        }
        if patched.remaining_entries > 0 {
            warn(
                &mut warnings,
                format!(
                    "{} has {} more entries after line {}, only the first was changed",
                    config.crypttab_path.display(),
                    patched.remaining_entries,
                    patched.line
                ),
            );
        }

        let release = self
            .images
            .kernel_release()
            .map_err(Failure::ImageRebuildFailed)?;
        let image = initramfs::image_path(&config.boot_dir, &release);
        log::info!("Backing up {}", image.display());
        let backup = initramfs::backup_image(&image).map_err(Failure::ImageRebuildFailed)?;
        if let Backup::Kept(path) = &backup {
            warn(
                &mut warnings,
                format!(
                    "{} already exists from an earlier run, keeping it",
                    path.display()
                ),
            );
        }
        log::info!("Rebuilding {} for {release}", image.display());
        self.images
            .rebuild(&image, &release)
            .map_err(Failure::ImageRebuildFailed)?;
        self.audit(&image, &mut warnings);

        Ok(BootChanges {
            release,
            image,
            backup,
            crypttab: patched.outcome,
            untouched_entries: patched.remaining_entries,
            warnings,
        })
    }

    /// Check the rebuilt image for what the keyscript needs. Only ever warns,
    /// the image is already in place.
    fn audit(&self, image: &Path, warnings: &mut Vec<String>) {
        let keyscript = self
            .config
            .keyscript_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self.images.list(image) {
            Ok(Some(listing)) => {
                let missing = initramfs::missing_entries(&listing, &["tpm2_nvread", &keyscript]);
                if missing.is_empty() {
                    log::info!("{} contains tpm2_nvread and {keyscript}", image.display());
                } else {
                    warn(
                        warnings,
                        format!("{} is missing {}", image.display(), missing.join(", ")),
                    );
                }
            }
            Ok(None) => warn(
                warnings,
                "lsinitramfs not available, skipping image audit".to_string(),
            ),
            Err(err) => warn(warnings, format!("Could not list {}: {err}", image.display())),
        }
    }
}

/// The verified secret and its staging file, between provisioning and
/// enrollment.
struct Staged {
    secret: Secret,
    file: SecretFile,
}
