//! Automatic LUKS unlock from a TPM2 NV index.
//!
//! A provisioning run stores a random secret in an owner-authorised NV index,
//! enrolls it as an additional LUKS key, and wires a keyscript into crypttab
//! and the initramfs so the volume unlocks at boot without a passphrase. The
//! passphrase prompt comes back whenever the TPM key is rejected.
//!
//! # Get Started
//!
//! ## On Linux with hardware TPM:
//! ```bash
//! sudo tpm-nv-luks            # first crypttab entry
//! sudo tpm-nv-luks /dev/sda3  # explicit device
//! ```
//!
//! ## Against a simulator:
//! ```bash
//! TCTI=mssim:host=localhost,port=2321 tpm-nv-luks getkey sda3_crypt
//! ```

pub mod boot;
pub mod cli;
pub mod command;
pub mod config;
pub mod crypttab;
pub mod guidance;
pub mod luks;
pub mod provision;
pub mod secret;
pub mod tpm;
