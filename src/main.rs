/// To build distributable binary (WIP):
/// ```
/// rustup target add x86_64-unknown-linux-musl
/// TPM_NV_LUKS_BUILD_STATIC=1 cargo build --release --target=x86_64-unknown-linux-musl
/// ```
/// The static binary can then be copied into the initramfs in place of
/// `tpm2_nvread`. The config file stays behind on the root filesystem, so
/// the keyscript has to pass the provisioned values itself:
/// ```sh
/// exec /bin/tpm-nv-luks getkey --index 0x1500016 --size 64 --marker-dir /run
/// ```
use eyre::Result;
use std::env;
use tpm_nv_luks::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    env::set_var("TSS2_LOG", "all+NONE");
    cli.run()?;
    Ok(())
}
