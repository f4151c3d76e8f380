use std::convert::Infallible;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use medcab_core::{ConnectionConfig, DeviceConfig, Hn, Passkey, SlotId, SlotState};
use medcab_dispensing::{
    CabinetEvent, DeviceController, DispensingPhase, EventStream, InMemorySlotRepository,
    OperationKind, OperationRequest,
};
use medcab_hardware::{
    CommandChannel, DetectedPort, MockCabinetHandle, PortDetector, SerialBackend, SerialTransport,
};
use medcab_protocol::ResponseParser;
use tracing::{info, warn};

use crate::{Cli, Command};

/// Polls each simulated drawer stays open before it closes itself.
const SIMULATED_OPEN_POLLS: u32 = 3;

#[derive(Args, Debug, Clone)]
pub struct OperationArgs {
    /// Slot number, starting at 1.
    pub slot: u8,

    /// Hospital number of the patient.
    #[arg(long)]
    pub hn: String,

    /// Operator passkey, already verified by the caller.
    #[arg(long, env = "MEDCAB_PASSKEY", hide_env_values = true, value_parser = parse_passkey)]
    pub passkey: Passkey,

    /// Keep polling until the drawer is closed again.
    #[arg(long)]
    pub wait: bool,

    /// Interval between status polls while waiting.
    #[arg(long, default_value_t = 1000)]
    pub poll_ms: u64,
}

fn parse_passkey(s: &str) -> std::result::Result<Passkey, Infallible> {
    Ok(Passkey::new(s))
}

/// Make the simulated operator close drawers on their own.
pub fn simulate(handle: &MockCabinetHandle) {
    handle.close_after_polls(Some(SIMULATED_OPEN_POLLS));
    info!(device = %handle.kind(), "Using simulated cabinet");
}

pub async fn run<B: SerialBackend>(cli: &Cli, backend: B) -> Result<()> {
    let kind = cli.kind();
    let detector = PortDetector::new(backend, kind);

    match &cli.command {
        Command::Ports => return list_ports(&detector, cli.json),
        Command::Probe {
            path,
            probe_timeout_ms,
        } => {
            if detector.test_connection(path, Duration::from_millis(*probe_timeout_ms)) {
                println!("{path}: ok ({kind}, {} baud)", kind.baud_rate());
                return Ok(());
            }
            bail!("{path}: cannot be opened at {} baud", kind.baud_rate());
        }
        _ => {}
    }

    let path = resolve_port(cli, &detector)?;
    let connection = ConnectionConfig::for_device(kind, &path)
        .timeout_ms(cli.timeout_ms)
        .max_retries(cli.retries);
    let config = DeviceConfig::new(kind, &path).connection(connection);

    let mut transport = SerialTransport::new(config.connection.clone(), ResponseParser::new(kind));
    transport
        .connect(detector.backend())
        .await
        .with_context(|| format!("cannot open cabinet on {path}"))?;

    let (mut controller, mut events) =
        DeviceController::new(config, transport, InMemorySlotRepository::new());

    let outcome = match &cli.command {
        Command::Status => status(&mut controller, &mut events, cli.json).await,
        Command::Version => {
            let version = controller.firmware_version().await?;
            if cli.json {
                println!("{}", serde_json::json!({ "version": version }));
            } else {
                println!("{version}");
            }
            Ok(())
        }
        Command::Unlock(args) => {
            operate(&mut controller, &mut events, args, OperationKind::Unlock, cli.json).await
        }
        Command::Dispense(args) => {
            operate(&mut controller, &mut events, args, OperationKind::Dispense, cli.json).await
        }
        Command::Ports | Command::Probe { .. } => Ok(()),
    };

    controller.transport_mut().disconnect().await;
    outcome
}

fn resolve_port<B: SerialBackend>(cli: &Cli, detector: &PortDetector<B>) -> Result<String> {
    if let Some(path) = &cli.port {
        return Ok(path.clone());
    }
    let best = detector
        .get_best_port()?
        .ok_or_else(|| anyhow!("no cabinet port detected; pass --port or set MEDCAB_PORT"))?;
    info!(path = %best.path, confidence = %best.confidence, "Using detected port");
    Ok(best.path)
}

fn list_ports<B: SerialBackend>(detector: &PortDetector<B>, json: bool) -> Result<()> {
    let ports = detector.list_all()?;
    if json {
        println!("{}", serde_json::to_string(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in &ports {
        println!("{}", describe_port(port));
    }
    Ok(())
}

fn describe_port(port: &DetectedPort) -> String {
    let usb = port.usb_id().unwrap_or_else(|| "-".to_string());
    format!(
        "{:<24} {:<8} {:<10} {}",
        port.path, port.confidence, usb, port.reason
    )
}

async fn status<T: CommandChannel>(
    controller: &mut DeviceController<T, InMemorySlotRepository>,
    events: &mut EventStream,
    json: bool,
) -> Result<()> {
    let slots = controller.check_state().await?;
    events.drain();
    if json {
        println!("{}", serde_json::to_string(&slots)?);
    } else {
        for line in slot_table(&slots) {
            println!("{line}");
        }
    }
    Ok(())
}

fn slot_table(slots: &[SlotState]) -> Vec<String> {
    slots
        .iter()
        .map(|s| {
            let status = if s.is_open { "open" } else { "closed" };
            format!("slot {:>2}  {status}", s.slot_number)
        })
        .collect()
}

async fn operate<T: CommandChannel>(
    controller: &mut DeviceController<T, InMemorySlotRepository>,
    events: &mut EventStream,
    args: &OperationArgs,
    operation: OperationKind,
    json: bool,
) -> Result<()> {
    let request = OperationRequest::new(args.slot, &args.hn, args.passkey.clone());

    let result = match operation {
        OperationKind::Unlock => controller.unlock(request).await,
        OperationKind::Dispense => {
            // No slot records outside the host application: the operator's
            // HN is taken as the slot's assignment.
            let slot = SlotId::new(args.slot, controller.kind())?;
            controller.repository().occupy(slot, Hn::new(&args.hn)?);
            controller.dispense(request).await
        }
    };
    print_events(events, json);
    result?;

    if !args.wait {
        return Ok(());
    }

    let poll = Duration::from_millis(args.poll_ms);
    while controller.phase() != DispensingPhase::Idle {
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(poll) => false,
            _ = tokio::signal::ctrl_c() => true,
        };
        if interrupted {
            warn!(slot = args.slot, "Interrupted, releasing slot without lock-back");
            controller.reset_slot(args.slot)?;
            print_events(events, json);
            break;
        }

        let polled = controller.check_state().await;
        print_events(events, json);
        polled?;
    }
    Ok(())
}

fn print_events(events: &mut EventStream, json: bool) {
    for event in events.drain() {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Cannot serialize event"),
            }
        } else if let Some(line) = describe_event(&event) {
            println!("{line}");
        }
    }
}

fn describe_event(event: &CabinetEvent) -> Option<String> {
    match event {
        CabinetEvent::CheckStateResult(_) => None,
        CabinetEvent::Unlocking {
            slot_id,
            hn,
            unlocking: true,
        } => Some(format!("slot {slot_id} ({hn}): open, waiting for lock-back")),
        CabinetEvent::Unlocking {
            slot_id,
            hn,
            unlocking: false,
        } => Some(format!("slot {slot_id} ({hn}): locked")),
        CabinetEvent::Dispensing {
            slot_id,
            reset: true,
            ..
        } => Some(format!("slot {slot_id}: reset")),
        CabinetEvent::Dispensing {
            slot_id,
            hn,
            dispensing,
            ..
        } => {
            let hn = hn.as_deref().unwrap_or("-");
            let state = if *dispensing {
                "open for dispensing, waiting for lock-back"
            } else {
                "dispensed and locked"
            };
            Some(format!("slot {slot_id} ({hn}): {state}"))
        }
        CabinetEvent::Error {
            kind,
            slot_id,
            message,
        } => {
            let slot = slot_id.map(|s| format!(" slot {s}")).unwrap_or_default();
            Some(format!("error{slot} [{kind:?}]: {message}"))
        }
    }
}
