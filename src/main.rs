use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use picokit::constants::Layout;
use picokit::device::ChipDB;
use picokit::format::{self, ImageFormat};
use picokit::partition::Partition;
use picokit::transport::SerialTransport;
use picokit::{Outcome, Programmer};

/// Dump size when the target is not in the chip table.
const DEFAULT_DUMP_SIZE: u32 = 128 * 1024;

#[derive(Parser)]
#[command(
    name = "picokit",
    about = "Host driver for the PICokit PIC18 ICSP programmer",
    version
)]
struct Cli {
    /// Serial port of the programmer, first available port if omitted
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = Layout::PIC18.baudrate)]
    baud: u32,

    /// Response timeout in seconds
    #[arg(long, global = true, default_value_t = Layout::PIC18.read_timeout.as_secs())]
    timeout: u64,

    /// Show protocol frames
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Hide progress bars
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show programmer firmware version
    Version {},
    /// Read target device ID and revision
    Diag {},
    /// Bulk erase all target memory
    Wipe {},
    /// Program an image file (Intel HEX or binary) and reset
    Write {
        /// The path to the image to be programmed
        path: PathBuf,
    },
    /// Verify target memory against an image file
    Verify { path: PathBuf },
    /// Read target memory to a file
    Dump {
        path: PathBuf,
        /// Start address
        #[arg(long, default_value = "0", value_parser = parse_number)]
        start: u32,
        /// Size in bytes, defaults to the target's flash size
        #[arg(long, value_parser = parse_number)]
        size: Option<u32>,
        #[arg(long, value_enum, default_value_t = ImageFormat::IntelHex)]
        format: ImageFormat,
    },
    /// Read and decode config bytes
    Config {},
    /// Run the programmer's EEPROM write/read self-test
    TestEeprom {},
    /// Release the target from ICSP
    Reset {},
    /// List serial ports
    Ports {},
}

fn parse_number(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", s, e))
}

fn main() {
    let cli = Cli::parse();

    let _ = simplelog::TermLogger::init(
        if cli.verbose {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        log::warn!("cannot install Ctrl-C handler: {}", e);
    }

    let outcome = match run(cli, cancel) {
        Ok(outcome) => outcome,
        Err(e) => {
            let outcome = Outcome::from_error(&e);
            if outcome == Outcome::Cancelled {
                log::error!("Aborted.");
            } else {
                log::error!("Error: {:#}", e);
            }
            outcome
        }
    };
    std::process::exit(outcome.exit_code());
}

fn run(cli: Cli, cancel: Arc<AtomicBool>) -> Result<Outcome> {
    match cli.command {
        Commands::Ports {} => {
            for port in SerialTransport::scan_ports()? {
                println!("{}", port);
            }
            Ok(Outcome::Success)
        }
        _ => run_with_programmer(cli, cancel),
    }
}

fn run_with_programmer(cli: Cli, cancel: Arc<AtomicBool>) -> Result<Outcome> {
    let layout = Layout {
        baudrate: cli.baud,
        read_timeout: Duration::from_secs(cli.timeout),
        ..Layout::PIC18
    };
    let transport = match &cli.port {
        Some(port) => SerialTransport::open_with(port, &layout),
        None => SerialTransport::open_any(&layout),
    }
    .context("failed to open programmer")?;

    // the port closes when `programmer` drops, on every path out of here
    let mut programmer = Programmer::new(transport, layout)
        .with_cancel_flag(cancel)
        .with_progress(!cli.quiet);

    match cli.command {
        Commands::Version {} => {
            log::info!("Firmware: {}", programmer.version()?);
        }
        Commands::Diag {} => {
            let info = programmer.diagnose()?;
            log::info!("Device:   {}", info.name);
            log::info!("ID:       0x{:04X}", info.device_id);
            log::info!("Revision: {} (0x{:04X})", info.revision, info.revision.0);
        }
        Commands::Wipe {} => {
            programmer.erase()?;
        }
        Commands::Write { path } => {
            let image = format::read_image_from_file(&path)?;
            log::info!("Image: {} bytes in {} segments", image.len(), image.segments().len());
            let flash_end = Partition::new(&image, layout).flash_end();
            let db = ChipDB::load()?;
            programmer
                .program_with(&image, |info| {
                    if let (Some(chip), Some(end)) = (db.find_chip(info.device_id), flash_end) {
                        if end >= chip.flash_size {
                            log::warn!(
                                "Image has flash data at 0x{:06X}, beyond {} flash",
                                end,
                                chip
                            );
                        }
                    }
                })
                .context("programming failed")?;
        }
        Commands::Verify { path } => {
            let image = format::read_image_from_file(&path)?;
            log::info!("Verifying against {}", path.display());
            let report = programmer.verify(&image)?;
            if !report.passed() {
                return Ok(Outcome::VerifyFailed);
            }
        }
        Commands::Dump {
            path,
            start,
            size,
            format: out_format,
        } => {
            let size = match size {
                Some(size) => size,
                None => {
                    let info = programmer.diagnose()?;
                    ChipDB::load()?
                        .find_chip(info.device_id)
                        .map(|chip| chip.flash_size)
                        .unwrap_or(DEFAULT_DUMP_SIZE)
                }
            };
            let image = programmer.dump(start, size)?;
            format::write_image_to_file(&image, &path, out_format)?;
        }
        Commands::Config {} => {
            let base = layout.config_start;
            let bytes = programmer.read_config()?;
            let rows = ChipDB::load()?.decode_config(None, base, &bytes);
            println!("{}", "-".repeat(72));
            println!("{:<12} {:<8} {:<6} Description", "Register", "Addr", "Value");
            println!("{}", "-".repeat(72));
            for row in rows {
                println!(
                    "{:<12} {:06X}   0x{:02X}   {}",
                    row.register, row.address, row.value, row.description
                );
            }
            println!("{}", "-".repeat(72));
        }
        Commands::TestEeprom {} => {
            if programmer.test_eeprom()? {
                log::info!("EEPROM test PASS");
            } else {
                log::error!("EEPROM test FAIL");
                return Ok(Outcome::VerifyFailed);
            }
        }
        Commands::Reset {} => {
            programmer.reset()?;
        }
        Commands::Ports {} => (),
    }

    Ok(Outcome::Success)
}
