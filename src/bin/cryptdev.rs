//! cryptdev CLI - LUKS1 volume management
//!
//! Formats devices, manages key slots and opens volumes through dm-crypt.

use clap::{Parser, Subcommand};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use cryptdev::config::Config;
use cryptdev::dm::{self, DeviceMapper};
use cryptdev::passphrase::{PassphraseReader, ReaderPassphraseReader, TerminalPassphraseReader};
use cryptdev::{
    ActivateFlags, CryptError, Device, DeviceOptions, DmsetupBackend, Errno, ErrorCategory,
    ErrorKind, FormatParams, GenericParams, KeySlotStatus, Luks1Params, MappingState, Result,
    Slot, logging,
};

#[derive(Parser)]
#[command(name = "cryptdev")]
#[command(version)]
#[command(about = "Manage LUKS1 encrypted volumes.", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $CRYPTDEV_CONFIG or /etc/cryptdev.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Read the passphrase from FILE instead of the terminal ("-" for stdin)
    #[arg(short = 'd', long, global = true, value_name = "FILE")]
    key_file: Option<PathBuf>,

    /// Do not ask for confirmation before destructive operations
    #[arg(short = 'q', long, global = true)]
    batch_mode: bool,

    /// Log debug messages to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new LUKS1 header and bind the passphrase to a key slot
    #[command(alias = "luksFormat")]
    Format {
        /// Block device or image file
        device: PathBuf,

        /// Cipher algorithm
        #[arg(long)]
        cipher: Option<String>,

        /// Cipher block mode and IV generator
        #[arg(long)]
        cipher_mode: Option<String>,

        /// Volume key size in bits
        #[arg(short = 's', long)]
        key_size: Option<usize>,

        /// Hash for PBKDF2 and the anti-forensic splitter
        #[arg(long)]
        hash: Option<String>,

        /// PBKDF2 iteration time in milliseconds
        #[arg(short = 'i', long, value_name = "MS")]
        iter_time: Option<u64>,

        /// Payload alignment in 512-byte sectors
        #[arg(long, value_name = "SECTORS")]
        align_payload: Option<u64>,

        /// Key slot for the initial passphrase
        #[arg(short = 'S', long, default_value_t = 0)]
        key_slot: usize,
    },

    /// Add a passphrase, authorized by an existing one
    #[command(alias = "luksAddKey")]
    AddKey {
        /// Block device or image file
        device: PathBuf,

        /// File holding the new passphrase (prompted for when omitted)
        new_key_file: Option<PathBuf>,

        /// Key slot for the new passphrase (first free slot when omitted)
        #[arg(short = 'S', long)]
        key_slot: Option<usize>,

        /// PBKDF2 iteration time in milliseconds
        #[arg(short = 'i', long, value_name = "MS")]
        iter_time: Option<u64>,
    },

    /// Disable a key slot and wipe its key material
    #[command(alias = "luksKillSlot")]
    RemoveKey {
        /// Block device or image file
        device: PathBuf,

        /// Key slot to destroy
        slot: usize,
    },

    /// Unlock a device and map its payload
    #[command(alias = "luksOpen")]
    Open {
        /// Block device or image file
        device: PathBuf,

        /// Name of the mapping under /dev/mapper
        #[arg(required_unless_present = "test_passphrase")]
        name: Option<String>,

        /// Only try this key slot
        #[arg(short = 'S', long)]
        key_slot: Option<usize>,

        /// Map the payload read-only
        #[arg(short, long)]
        readonly: bool,

        /// Pass discard requests through to the device
        #[arg(long)]
        allow_discards: bool,

        /// Check the passphrase without creating a mapping
        #[arg(long)]
        test_passphrase: bool,
    },

    /// Remove a mapping
    #[command(alias = "luksClose")]
    Close {
        /// Name of the mapping
        name: String,
    },

    /// Report whether a mapping is active
    Status {
        /// Name of the mapping
        name: String,
    },

    /// Print the header and key slot table
    #[command(alias = "luksDump")]
    Dump {
        /// Block device or image file
        device: PathBuf,

        /// Unlock with the passphrase and also print the volume key
        #[arg(long)]
        volume_key: bool,
    },

    /// Exit successfully if the device holds a valid LUKS1 header
    #[command(alias = "isLuks")]
    IsLuks {
        /// Block device or image file
        device: PathBuf,
    },

    /// Save the header region to a new file
    #[command(alias = "luksHeaderBackup")]
    HeaderBackup {
        /// Block device or image file
        device: PathBuf,

        /// Backup file to create
        #[arg(long = "header-backup-file", value_name = "FILE")]
        file: PathBuf,
    },

    /// Overwrite the header region from a backup file
    #[command(alias = "luksHeaderRestore")]
    HeaderRestore {
        /// Block device or image file
        device: PathBuf,

        /// Backup file to restore from
        #[arg(long = "header-backup-file", value_name = "FILE")]
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "warn" });

    if let Err(e) = run(&cli) {
        eprintln!("Error: {:#}", e);
        process::exit(e.errno().value());
    }
}

fn run(cli: &Cli) -> Result<()> {
    // An explicitly named config file must exist.
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(Config::default_path())?,
    };

    match &cli.command {
        Commands::Format {
            device,
            cipher,
            cipher_mode,
            key_size,
            hash,
            iter_time,
            align_payload,
            key_slot,
        } => {
            let mut generic = GenericParams {
                cipher: cipher.clone().unwrap_or_default(),
                cipher_mode: cipher_mode.clone().unwrap_or_default(),
                volume_key_size: match key_size {
                    Some(bits) if bits % 8 != 0 => {
                        return Err(CryptError::invalid(
                            ErrorKind::UnsupportedAlgorithm,
                            format!("key size {bits} is not a multiple of 8 bits"),
                        ));
                    }
                    Some(bits) => bits / 8,
                    None => 0,
                },
            };
            let mut params = Luks1Params {
                hash: hash.clone().unwrap_or_default(),
                data_alignment: align_payload.unwrap_or(0),
            };

            let mut device = Device::init_with(device, device_options(&config, *iter_time))?;
            params.check_keyslot(*key_slot)?;
            confirm(
                cli.batch_mode,
                &format!("This will overwrite data on {} irrevocably.", device.path().display()),
            )?;
            let passphrase = get_passphrase_reader(cli.key_file.as_deref(), true)?
                .read_passphrase("Enter passphrase: ")?;

            device.format(&mut params, &mut generic)?;
            device.add_passphrase_by_volume_key(Slot::Index(*key_slot), None, &passphrase)?;
            Ok(())
        }
        Commands::AddKey {
            device,
            new_key_file,
            key_slot,
            iter_time,
        } => {
            let mut device = open_device(device, &config, *iter_time)?;
            let existing = get_passphrase_reader(cli.key_file.as_deref(), false)?
                .read_passphrase("Enter any existing passphrase: ")?;
            let new = get_passphrase_reader(new_key_file.as_deref(), true)?
                .read_passphrase("Enter new passphrase for key slot: ")?;

            let slot = key_slot.map(Slot::Index).unwrap_or_default();
            device.add_passphrase_by_passphrase(slot, &existing, &new)?;
            Ok(())
        }
        Commands::RemoveKey { device, slot } => {
            let mut device = open_device(device, &config, None)?;
            confirm(
                cli.batch_mode,
                &format!("This will wipe key slot {slot} of {}.", device.path().display()),
            )?;
            device.destroy_keyslot(*slot)
        }
        Commands::Open {
            device,
            name,
            key_slot,
            readonly,
            allow_discards,
            test_passphrase,
        } => {
            let mut device = open_device(device, &config, None)?;
            let passphrase = get_passphrase_reader(cli.key_file.as_deref(), false)?
                .read_passphrase(&format!("Enter passphrase for {}: ", device.path().display()))?;

            let mut flags = ActivateFlags::empty();
            if *readonly {
                flags |= ActivateFlags::READONLY;
            }
            if *allow_discards {
                flags |= ActivateFlags::ALLOW_DISCARDS;
            }
            let name = if *test_passphrase { None } else { name.as_deref() };
            let slot = key_slot.map(Slot::Index).unwrap_or_default();
            let index = device.activate_by_passphrase(name, slot, &passphrase, flags)?;
            if name.is_none() {
                println!("Key slot {index} unlocked.");
            }
            Ok(())
        }
        Commands::Close { name } => {
            dm::check_name(name)?;
            DmsetupBackend::from_config(&config).remove(name)
        }
        Commands::Status { name } => {
            dm::check_name(name)?;
            match DmsetupBackend::from_config(&config).status(name)? {
                MappingState::Inactive => println!("/dev/mapper/{name} is inactive."),
                MappingState::Active => println!("/dev/mapper/{name} is active."),
                MappingState::Busy => println!("/dev/mapper/{name} is active and is in use."),
            }
            Ok(())
        }
        Commands::Dump { device, volume_key } => {
            let device = open_device(device, &config, None)?;
            dump(&device)?;
            if *volume_key {
                let passphrase = get_passphrase_reader(cli.key_file.as_deref(), false)?
                    .read_passphrase(&format!("Enter passphrase for {}: ", device.path().display()))?;
                let key = device.volume_key_get(Slot::Any, &passphrase)?;
                println!("MK dump:\t{}", key.to_hex().as_str());
            }
            Ok(())
        }
        Commands::IsLuks { device } => open_device(device, &config, None).map(|_| ()),
        Commands::HeaderBackup { device, file } => {
            let device = open_device(device, &config, None)?;
            device.header_backup(file)
        }
        Commands::HeaderRestore { device, file } => {
            let mut device = Device::init_with(device, device_options(&config, None))?;
            confirm(
                cli.batch_mode,
                &format!(
                    "Device {} will be overwritten with the header in {}.",
                    device.path().display(),
                    file.display()
                ),
            )?;
            device.header_restore(&mut Luks1Params::default(), file)
        }
    }
}

fn device_options(config: &Config, iter_time_ms: Option<u64>) -> DeviceOptions {
    let options = DeviceOptions::from_config(config);
    match iter_time_ms {
        Some(ms) => options.with_iteration_time(Duration::from_millis(ms)),
        None => options,
    }
}

fn open_device(path: &Path, config: &Config, iter_time_ms: Option<u64>) -> Result<Device> {
    let mut device = Device::init_with(path, device_options(config, iter_time_ms))?;
    device.load(&mut Luks1Params::default())?;
    Ok(device)
}

fn get_passphrase_reader(key_file: Option<&Path>, verify: bool) -> Result<Box<dyn PassphraseReader>> {
    match key_file {
        Some(path) => Ok(Box::new(ReaderPassphraseReader::from_key_file(path)?)),
        None if verify => Ok(Box::new(TerminalPassphraseReader::verifying())),
        None => Ok(Box::new(TerminalPassphraseReader::new())),
    }
}

fn confirm(batch_mode: bool, warning: &str) -> Result<()> {
    if batch_mode {
        return Ok(());
    }
    if !io::stdin().is_terminal() {
        return Err(CryptError::new(
            ErrorCategory::Invalid,
            Errno::NotPermitted,
            "confirmation needs a terminal; pass --batch-mode to skip it",
        ));
    }

    eprint!("\nWARNING!\n========\n{warning}\n\nAre you sure? (Type uppercase yes): ");
    let mut answer = String::new();
    io::stdin()
        .read_line(&mut answer)
        .map_err(|e| CryptError::io("failed to read confirmation", e))?;
    if answer.trim_end() != "YES" {
        return Err(CryptError::new(
            ErrorCategory::Invalid,
            Errno::NotPermitted,
            "operation aborted",
        ));
    }
    Ok(())
}

fn dump(device: &Device) -> Result<()> {
    let Some(header) = device.header() else {
        return Ok(());
    };

    println!("LUKS header information for {}\n", device.path().display());
    println!("Version:       \t1");
    println!("Cipher name:   \t{}", header.cipher().cipher_name());
    println!("Cipher mode:   \t{}", header.cipher().mode_name());
    println!("Hash spec:     \t{}", header.hash().name());
    println!("Payload offset:\t{}", header.payload_offset());
    println!("MK bits:       \t{}", header.volume_key_size() * 8);
    println!("MK iterations: \t{}", header.digest_iterations());
    println!("UUID:          \t{}\n", header.uuid());

    for index in 0..header.keyslot_max() {
        let info = header.keyslot_info(index)?;
        println!("Key Slot {index}: {}", info.status);
        if info.status == KeySlotStatus::Active {
            println!("\tIterations:         \t{}", info.iterations);
            println!("\tSalt:               \t{}", hex::encode(&info.salt));
            println!("\tKey material offset:\t{}", info.material_offset);
            println!("\tAF stripes:         \t{}", info.stripes);
        }
    }
    Ok(())
}
