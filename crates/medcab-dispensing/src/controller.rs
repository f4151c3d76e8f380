//! Facade binding transport, state machine and slot records.

use chrono::{DateTime, Utc};
use medcab_core::{
    DeviceConfig, DeviceKind, DispensingContext, Error, Hn, Passkey, Result, SlotId, SlotState,
};
use medcab_hardware::CommandChannel;
use medcab_protocol::{Packet, ParsedResponse};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::events::{CabinetEvent, EVENT_CHANNEL_CAPACITY, EventSink, EventStream, event_channel};
use crate::repository::SlotRepository;
use crate::state_machine::{DispensingPhase, DispensingStateMachine, StateTransition};

/// Caller input for [`DeviceController::unlock`] and
/// [`DeviceController::dispense`].
///
/// The passkey has already been checked by the caller; it is carried for
/// the record only.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub slot_id: u8,
    pub hn: String,
    pub passkey: Passkey,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl OperationRequest {
    pub fn new(slot_id: u8, hn: impl Into<String>, passkey: Passkey) -> Self {
        Self {
            slot_id,
            hn: hn.into(),
            passkey,
            timestamp: None,
        }
    }
}

/// High-level operations on one cabinet.
///
/// Events for every step go to the [`EventStream`] returned by
/// [`new`](Self::new). Errors are also returned directly; failures that
/// reach the hardware additionally release the active slot and emit an
/// `error` event.
///
/// # Examples
///
/// ```
/// use medcab_core::{DeviceConfig, DeviceKind, Passkey};
/// use medcab_dispensing::{CabinetEvent, DeviceController, InMemorySlotRepository, OperationRequest};
/// use medcab_hardware::{MockCabinet, SerialTransport};
/// use medcab_protocol::ResponseParser;
///
/// # #[tokio::main]
/// # async fn main() -> medcab_core::Result<()> {
/// let config = DeviceConfig::new(DeviceKind::Ds12, "mock");
/// let (cabinet, handle) = MockCabinet::new(config.kind);
/// let transport = SerialTransport::from_port(
///     config.connection.clone(),
///     ResponseParser::new(config.kind),
///     cabinet.connect(),
/// );
///
/// let (mut controller, mut events) =
///     DeviceController::new(config, transport, InMemorySlotRepository::new());
///
/// controller
///     .unlock(OperationRequest::new(3, "HN-1001", Passkey::new("1234")))
///     .await?;
/// assert!(handle.is_open(3));
///
/// handle.close_slot(3);
/// controller.check_state().await?;
///
/// let last = events.drain().pop();
/// assert!(matches!(last, Some(CabinetEvent::Unlocking { unlocking: false, .. })));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DeviceController<T, R> {
    config: DeviceConfig,
    transport: T,
    repository: R,
    machine: DispensingStateMachine,
    events: EventSink,
}

impl<T, R> DeviceController<T, R>
where
    T: CommandChannel,
    R: SlotRepository,
{
    pub fn new(config: DeviceConfig, transport: T, repository: R) -> (Self, EventStream) {
        let (events, stream) = event_channel(EVENT_CHANNEL_CAPACITY);
        let machine = DispensingStateMachine::new(config.kind, config.address);
        let controller = Self {
            config,
            transport,
            repository,
            machine,
            events,
        };
        (controller, stream)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn kind(&self) -> DeviceKind {
        self.config.kind
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn phase(&self) -> DispensingPhase {
        self.machine.phase()
    }

    pub fn active_context(&self) -> Option<&DispensingContext> {
        self.machine.active_context()
    }

    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.machine.history().iter()
    }

    /// Poll the drawer states.
    ///
    /// Emits `checkStateResult`, then any lifecycle event the reply caused
    /// for the active slot. Call repeatedly to detect lock-back.
    ///
    /// # Errors
    /// Any transport or protocol error. The active slot is released.
    pub async fn check_state(&mut self) -> Result<Vec<SlotState>> {
        let packet = Packet::status_request(self.config.address);
        let slots = self
            .exchange(&packet)
            .await
            .and_then(ParsedResponse::into_slot_states)
            .map_err(|e| self.fail(e))?;

        debug!(
            open = slots.iter().filter(|s| s.is_open).count(),
            "Slot states"
        );
        self.events.emit(CabinetEvent::CheckStateResult(slots.clone()));

        match self.machine.on_status(&slots) {
            Ok(Some(event)) => self.events.emit(event),
            Ok(None) => {}
            Err(e) => return Err(self.fail(e)),
        }
        Ok(slots)
    }

    /// Unlock a slot and poll once for the drawer opening.
    ///
    /// # Errors
    ///
    /// Rejected without I/O or events:
    /// - `Error::SlotOutOfRange`, `Error::DeviceBusy`, `Error::NotConnected`
    /// - `Error::Config` for an empty HN
    ///
    /// Any hardware failure releases the slot and emits an `error` event.
    pub async fn unlock(&mut self, request: OperationRequest) -> Result<()> {
        let context = self.context_for(request)?;
        let slot = context.slot_id;
        let packet = self
            .machine
            .request_unlock(context, self.transport.is_connected())?;

        self.send_unlock(slot, &packet).await?;
        info!(slot = slot.as_u8(), "Slot unlocked");
        self.check_state().await?;
        Ok(())
    }

    /// Dispense from an occupied slot and poll once for the drawer opening.
    ///
    /// Checks, in order: slot range, an active operation, occupancy in the
    /// slot repository, then that the request's HN is the slot's patient.
    ///
    /// # Errors
    ///
    /// Rejected without I/O or events:
    /// - `Error::SlotOutOfRange`, `Error::DeviceBusy`, `Error::NotConnected`
    /// - `Error::SlotNotOccupied` if no patient is assigned to the slot
    /// - `Error::PatientMismatch` if the slot belongs to another patient
    /// - `Error::Repository` if the slot records could not be read
    ///
    /// Any hardware failure releases the slot and emits an `error` event.
    pub async fn dispense(&mut self, request: OperationRequest) -> Result<()> {
        let slot = SlotId::new(request.slot_id, self.kind()).inspect_err(|e| {
            warn!(slot = request.slot_id, error = %e, "Rejected dispense");
        })?;
        self.machine
            .ensure_ready(slot, self.transport.is_connected())?;

        if !self.repository.is_slot_occupied(slot).await? {
            warn!(slot = slot.as_u8(), "Dispense from empty slot");
            return Err(Error::SlotNotOccupied { slot: slot.as_u8() });
        }
        let assigned = self
            .repository
            .get_patient_for_slot(slot)
            .await?
            .ok_or(Error::SlotNotOccupied { slot: slot.as_u8() })?;

        let context = self.context_for(request)?;
        if context.hn != assigned {
            warn!(slot = slot.as_u8(), "Dispense requested for a different patient");
            return Err(Error::PatientMismatch { slot: slot.as_u8() });
        }

        let packet = self
            .machine
            .request_dispense(context, self.transport.is_connected())?;

        self.send_unlock(slot, &packet).await?;
        info!(slot = slot.as_u8(), hn = %assigned, "Dispensing");
        self.check_state().await?;
        Ok(())
    }

    /// Release `slot` without waiting for lock-back. Emits a `dispensing`
    /// event with `reset: true`. No command is sent.
    ///
    /// # Errors
    /// `Error::SlotOutOfRange` if the slot does not exist on this device.
    pub fn reset_slot(&mut self, slot: u8) -> Result<()> {
        let slot = SlotId::new(slot, self.kind())?;
        let event = self.machine.force_reset(slot);
        self.events.emit(event);
        Ok(())
    }

    /// Query the controller firmware version.
    pub async fn firmware_version(&mut self) -> Result<String> {
        let packet = Packet::version_request(self.config.address);
        self.exchange(&packet)
            .await
            .and_then(ParsedResponse::into_version)
            .map_err(|e| self.fail(e))
    }

    fn context_for(&self, request: OperationRequest) -> Result<DispensingContext> {
        let slot = SlotId::new(request.slot_id, self.kind()).inspect_err(|e| {
            warn!(slot = request.slot_id, error = %e, "Rejected request");
        })?;
        let hn = Hn::new(&request.hn)?;
        let context = DispensingContext::new(slot, hn, request.passkey);
        Ok(match request.timestamp {
            Some(timestamp) => context.with_timestamp(timestamp),
            None => context,
        })
    }

    async fn send_unlock(&mut self, slot: SlotId, packet: &Packet) -> Result<()> {
        match self.exchange(packet).await {
            Ok(ParsedResponse::UnlockAck) => Ok(()),
            Ok(other) => Err(self.fail(Error::invalid_response(format!(
                "expected an unlock ack for slot {slot}, got {}",
                other.command()
            )))),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn exchange(&self, packet: &Packet) -> Result<ParsedResponse> {
        if !self.transport.is_connected() {
            return Err(Error::NotConnected);
        }
        self.transport.send_command(packet).await
    }

    /// Release the active slot and report `error` to consumers.
    fn fail(&mut self, error: Error) -> Error {
        let slot = self.machine.abort().map(|ctx| ctx.slot_id.as_u8());
        warn!(?slot, error = %error, "Cabinet operation failed");
        self.events.emit(CabinetEvent::error(&error, slot));
        error
    }
}
