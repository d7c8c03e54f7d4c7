use crate::boot::initramfs::InitramfsTools;
use crate::boot::keyscript::{get_key, Askpass, AttemptMarker, KeyRequest};
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::luks::Cryptsetup;
use crate::provision::Provisioner;
use crate::tpm::{NvBackend, NvIndex};
use clap::{Args, Parser, Subcommand};
use eyre::Result;
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;

const TPM_ENV_VAR: &str = "TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file, missing means built-in defaults
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = DEFAULT_CONFIG_PATH,
        env = "TPM_NV_LUKS_CONFIG"
    )]
    config: PathBuf,

    /// TPM device specified in TCTI format
    #[arg(short = 'T', long, default_value = "device:/dev/tpmrm0", env = TPM_ENV_VAR)]
    tcti: String,

    /// LUKS device to provision, defaults to the backing device of the first
    /// crypttab entry
    #[arg(value_name = "DEVICE")]
    device: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the unlock key for cryptsetup: read from the TPM on the first
    /// attempt of this boot, prompt for a passphrase on every later one
    Getkey(GetkeyArgs),
}

/// The config file is not part of the initramfs, so at boot the values used
/// at provisioning time have to be passed on the command line.
#[derive(Args, Debug)]
struct GetkeyArgs {
    /// Mapping name, e.g. `sda3_crypt`
    #[arg(value_name = "NAME", env = "CRYPTTAB_NAME", default_value = "")]
    name: String,

    /// Source device, used in the passphrase prompt
    #[arg(long, env = "CRYPTTAB_SOURCE", default_value = "")]
    source: String,

    /// NV index holding the key, e.g. `0x1500016`
    #[arg(long, value_name = "INDEX", value_parser = parse_nv_index)]
    index: Option<NvIndex>,

    /// Key size in bytes
    #[arg(long, value_name = "BYTES")]
    size: Option<u16>,

    /// Directory for the per-boot attempt markers
    #[arg(long, value_name = "DIR")]
    marker_dir: Option<PathBuf>,

    /// Passphrase prompt helper
    #[arg(long, value_name = "PATH")]
    askpass: Option<PathBuf>,
}

impl GetkeyArgs {
    /// Command line values win over the config file.
    fn apply(&self, config: &mut Config) {
        if let Some(index) = self.index {
            config.nv_index = index;
        }
        if let Some(size) = self.size {
            config.key_size = size;
        }
        if let Some(dir) = &self.marker_dir {
            config.marker_dir = dir.clone();
        }
        if let Some(askpass) = &self.askpass {
            config.tools.askpass = askpass.clone();
        }
    }

    fn request(&self, config: &Config) -> KeyRequest {
        KeyRequest {
            name: self.name.clone(),
            source: self.source.clone(),
            index: config.nv_index,
            size: config.key_size,
        }
    }
}

/// Hex with `0x` prefix, or decimal.
fn parse_nv_index(s: &str) -> Result<NvIndex, String> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|err| format!("`{s}` is not an NV index: {err}"))?;
    NvIndex::new(value).map_err(|err| err.to_string())
}

impl Cli {
    pub fn new() -> Self {
        let cli = Cli::parse();
        env::set_var(TPM_ENV_VAR, &cli.tcti);
        cli
    }

    pub fn run(&self) -> Result<&Self> {
        let config = Config::load(&self.config)?;
        match &self.command {
            None => self.provision(config)?,
            Some(Commands::Getkey(args)) => self.getkey(config, args)?,
        };
        Ok(self)
    }

    fn provision(&self, config: Config) -> Result<()> {
        let volumes = Cryptsetup::new(&config.tools.cryptsetup);
        let nv = NvBackend::from_config(&config);
        let images = InitramfsTools::new(&config.tools.mkinitramfs, &config.tools.lsinitramfs);
        let report = Provisioner::new(config, volumes, nv, images)
            .with_tcti(&self.tcti)
            .run(self.device.as_deref())?;
        println!("{}", report.guidance);
        Ok(())
    }

    fn getkey(&self, mut config: Config, args: &GetkeyArgs) -> Result<()> {
        args.apply(&mut config);
        config.validate()?;
        let marker = AttemptMarker::new(&config.marker_dir, &args.name);
        let mut nv = NvBackend::from_config(&config);
        let mut askpass = Askpass::new(&config.tools.askpass);
        let request = args.request(&config);
        let key = get_key(&marker, &mut nv, &mut askpass, &request)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&key)?;
        stdout.flush()?;
        Ok(())
    }
}
