//! `medcab`: operate a DS12/DS16 medication cabinet from the command line.

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use medcab_core::{DeviceKind, constants};
use medcab_hardware::{MockBackend, SystemSerial};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

mod run;

/// Talk to a DS12/DS16 cabinet over its serial link.
#[derive(Parser, Debug)]
#[command(name = "medcab", author, version, about, long_about = None)]
struct Cli {
    /// Serial port of the cabinet. Auto-detected when omitted.
    #[arg(short, long, env = "MEDCAB_PORT", global = true)]
    port: Option<String>,

    /// Controller variant (DS12 or DS16). Defaults to the compiled-in one.
    #[arg(short, long, env = "MEDCAB_DEVICE", global = true)]
    device: Option<DeviceKind>,

    /// Time to wait for one response frame.
    #[arg(long, env = "MEDCAB_TIMEOUT_MS", default_value_t = constants::DEFAULT_TIMEOUT_MS, global = true)]
    timeout_ms: u64,

    /// Attempts per command before giving up.
    #[arg(long, env = "MEDCAB_RETRIES", default_value_t = constants::DEFAULT_MAX_RETRIES, global = true)]
    retries: u32,

    /// Run against a simulated cabinet instead of real hardware.
    #[arg(long, global = true)]
    simulate: bool,

    /// Print events and results as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// List serial ports with their cabinet confidence.
    Ports,

    /// Check that a port can be opened.
    Probe {
        path: String,

        #[arg(long, default_value_t = constants::DEFAULT_PROBE_TIMEOUT_MS)]
        probe_timeout_ms: u64,
    },

    /// Show the open/closed state of every slot.
    Status,

    /// Show the controller firmware version.
    Version,

    /// Unlock a slot.
    Unlock(run::OperationArgs),

    /// Unlock an occupied slot for dispensing.
    Dispense(run::OperationArgs),
}

impl Cli {
    fn kind(&self) -> DeviceKind {
        self.device.unwrap_or_else(DeviceKind::compiled)
    }
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    debug!(?cli, "Parsed arguments");

    let result = if cli.simulate {
        let (backend, handle) = MockBackend::new(cli.kind());
        run::simulate(&handle);
        run::run(&cli, backend).await
    } else {
        run::run(&cli, SystemSerial::new()).await
    };

    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}
