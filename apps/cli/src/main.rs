use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use irecv_core::exploit::limera1n;
use irecv_core::{DeviceSession, FirmwareImage, NusbBus, NusbTransport, SessionConfig};
use tracing::{error, info, warn};

/// Shared slot holding the open device, so the signal handler can release it.
type SessionSlot = Arc<Mutex<Option<DeviceSession<NusbTransport>>>>;

/// Exit status after a termination signal.
const SIGNAL_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about = "Apple Recovery/WTF/DFU bootloader client (Pure Rust)", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load session settings from a TOML file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file to the device
    Send { file: PathBuf },
    /// Send a file and confirm every execution stage
    Upload { file: PathBuf },
    /// Send a file, then reset the device
    UploadReset { file: PathBuf },
    /// Optionally upload a payload, then send the execute trigger
    Exploit { payload: Option<PathBuf> },
    /// Run the limera1n sequence against a WTF-mode device
    Limera1n {
        /// Device model, e.g. iPhone3,1
        model: String,
        /// Shellcode blob placed on the heap (at most 0x800 bytes)
        #[arg(long)]
        shellcode: PathBuf,
    },
    /// Send a zero-length control request
    RawControl {
        /// bmRequestType, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_byte)]
        request_type: u8,
        /// bRequest, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_byte)]
        request: u8,
    },
    /// Send a text command to the bootloader shell
    Command {
        #[arg(required = true, num_args = 1..)]
        words: Vec<String>,
    },
    /// Read a bootloader environment variable
    Getenv { name: String },
    /// Read the return value of the last command
    Getret,
    /// Reset the device
    Reset,
    /// Print pending console output (Recovery mode)
    Receive,
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid byte value '{}': {}", s, e))
}

fn lock(slot: &SessionSlot) -> MutexGuard<'_, Option<DeviceSession<NusbTransport>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drop whatever session the slot holds, waiting for an in-flight operation
/// to hand the lock back first. Returns whether a session was released.
fn release<S>(slot: &Mutex<Option<S>>) -> bool {
    let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.take().is_some()
}

fn current<'a>(
    guard: &'a mut MutexGuard<'_, Option<DeviceSession<NusbTransport>>>,
) -> Result<&'a mut DeviceSession<NusbTransport>> {
    guard.as_mut().context("Device was released")
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let slot: SessionSlot = Arc::new(Mutex::new(None));

    let handler_slot = slot.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        // The main thread only holds the lock for a single operation
        if release(&handler_slot) {
            info!("Device released");
        }
        std::process::exit(SIGNAL_EXIT_CODE);
    }) {
        warn!(error = %e, "Unable to install signal handler");
    }

    let result = run(&args, &slot);
    release(&slot);

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args, slot: &SessionSlot) -> Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Unable to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    let session = DeviceSession::connect(&NusbBus, config).context("Unable to connect to device")?;
    info!(mode = %session.mode(), "Found device");
    *lock(slot) = Some(session);

    match &args.command {
        Command::Send { file } => {
            let report = current(&mut lock(slot))?.send_file(file)?;
            info!(bytes = report.bytes_sent, chunks = report.chunks, "Sent {}", file.display());
        }
        Command::Upload { file } => {
            let report = current(&mut lock(slot))?.upload_and_execute(file)?;
            info!(bytes = report.bytes_sent, "Uploaded and executed {}", file.display());
        }
        Command::UploadReset { file } => {
            let report = current(&mut lock(slot))?.upload_then_reset(file)?;
            info!(bytes = report.bytes_sent, "Uploaded {}, device reset", file.display());
        }
        Command::Exploit { payload } => {
            let image = payload.as_ref().map(FirmwareImage::load).transpose()?;
            current(&mut lock(slot))?.exploit(image.as_ref())?;
            info!("Exploit sent");
        }
        Command::Limera1n { model, shellcode } => {
            let shellcode = std::fs::read(shellcode)
                .with_context(|| format!("Unable to read shellcode {}", shellcode.display()))?;
            let session = lock(slot).take().context("Device was released")?;
            let report = limera1n(session, &NusbBus, model, &shellcode)?;
            info!(
                mode = %report.session.mode(),
                unacknowledged = report.unacknowledged_transfers,
                "limera1n complete"
            );
            *lock(slot) = Some(report.session);
        }
        Command::RawControl {
            request_type,
            request,
        } => {
            current(&mut lock(slot))?.raw_control(*request_type, *request)?;
        }
        Command::Command { words } => {
            current(&mut lock(slot))?.send_command(&words.join(" "))?;
        }
        Command::Getenv { name } => {
            let value = current(&mut lock(slot))?.getenv(name)?;
            println!("{}", value);
        }
        Command::Getret => {
            let value = current(&mut lock(slot))?.getret()?;
            println!("{}", value);
        }
        Command::Reset => {
            current(&mut lock(slot))?.reset()?;
        }
        Command::Receive => {
            let output = current(&mut lock(slot))?.receive()?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&output)?;
            stdout.flush()?;
        }
    }

    Ok(())
}
