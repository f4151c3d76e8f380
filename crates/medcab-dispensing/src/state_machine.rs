//! Per-cabinet unlock/dispense sequencing.
//!
//! At most one slot is mid-operation at a time. The machine holds the
//! [`DispensingContext`] of that slot from the request until the drawer is
//! seen closed again in a status reply (lock-back).
//!
//! # States
//!
//! - `Idle`: no slot active
//! - `Unlocking`: unlock command acknowledged, drawer not yet seen open
//! - `WaitingLockBack`: drawer open after an unlock
//! - `WaitingDispenseLockBack`: drawer open after a dispense
//!
//! # Valid Transitions
//!
//! - Idle → Unlocking → WaitingLockBack → Idle
//! - Idle → Unlocking → WaitingDispenseLockBack → Idle
//! - Unlocking → Idle (communication failure)
//!
//! Forced resets and aborts return to `Idle` from any state.
//!
//! There is no internal timer. Lock-back is detected only when the caller
//! polls status and feeds the reply to [`DispensingStateMachine::on_status`].
//!
//! # Examples
//!
//! ```
//! use medcab_core::{DeviceKind, DispensingContext, Hn, Passkey, SlotId, SlotState};
//! use medcab_dispensing::{DispensingPhase, DispensingStateMachine};
//!
//! let kind = DeviceKind::Ds12;
//! let mut machine = DispensingStateMachine::new(kind, 0x00);
//! let slot = SlotId::new(2, kind).unwrap();
//! let ctx = DispensingContext::new(slot, Hn::new("HN-7").unwrap(), Passkey::new("1234"));
//!
//! let packet = machine.request_unlock(ctx, true).unwrap();
//! assert_eq!(packet.data, vec![1]);
//! assert_eq!(machine.phase(), DispensingPhase::Unlocking);
//!
//! machine.on_status(&[SlotState::new(1, false), SlotState::new(2, true)]).unwrap();
//! assert_eq!(machine.phase(), DispensingPhase::WaitingLockBack);
//!
//! machine.on_status(&[SlotState::new(1, false), SlotState::new(2, false)]).unwrap();
//! assert_eq!(machine.phase(), DispensingPhase::Idle);
//! ```

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use medcab_core::{DeviceKind, DispensingContext, Error, Result, SlotId, SlotState};
use medcab_protocol::Packet;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::events::CabinetEvent;

/// Maximum number of state transitions to keep in history.
const MAX_HISTORY_SIZE: usize = 100;

/// What the active slot was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Unlock,
    Dispense,
}

/// Current state together with the context it owns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DispensingState {
    #[default]
    Idle,
    Unlocking {
        context: DispensingContext,
        operation: OperationKind,
    },
    WaitingLockBack {
        context: DispensingContext,
    },
    WaitingDispenseLockBack {
        context: DispensingContext,
    },
}

impl DispensingState {
    pub fn phase(&self) -> DispensingPhase {
        match self {
            DispensingState::Idle => DispensingPhase::Idle,
            DispensingState::Unlocking { .. } => DispensingPhase::Unlocking,
            DispensingState::WaitingLockBack { .. } => DispensingPhase::WaitingLockBack,
            DispensingState::WaitingDispenseLockBack { .. } => {
                DispensingPhase::WaitingDispenseLockBack
            }
        }
    }

    pub fn context(&self) -> Option<&DispensingContext> {
        match self {
            DispensingState::Idle => None,
            DispensingState::Unlocking { context, .. }
            | DispensingState::WaitingLockBack { context }
            | DispensingState::WaitingDispenseLockBack { context } => Some(context),
        }
    }
}

/// Data-free view of [`DispensingState`], used for transition rules and
/// history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispensingPhase {
    Idle,
    Unlocking,
    WaitingLockBack,
    WaitingDispenseLockBack,
}

impl fmt::Display for DispensingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispensingPhase::Idle => "Idle",
            DispensingPhase::Unlocking => "Unlocking",
            DispensingPhase::WaitingLockBack => "WaitingLockBack",
            DispensingPhase::WaitingDispenseLockBack => "WaitingDispenseLockBack",
        };
        f.write_str(s)
    }
}

impl DispensingPhase {
    /// Check if a regular transition to `target` is allowed.
    ///
    /// ```
    /// use medcab_dispensing::DispensingPhase;
    ///
    /// assert!(DispensingPhase::Idle.can_transition_to(&DispensingPhase::Unlocking));
    /// assert!(!DispensingPhase::Idle.can_transition_to(&DispensingPhase::WaitingLockBack));
    /// ```
    pub fn can_transition_to(&self, target: &DispensingPhase) -> bool {
        matches!(
            (self, target),
            (DispensingPhase::Idle, DispensingPhase::Unlocking)
                | (
                    DispensingPhase::Unlocking,
                    DispensingPhase::WaitingLockBack
                        | DispensingPhase::WaitingDispenseLockBack
                        | DispensingPhase::Idle
                )
                | (DispensingPhase::WaitingLockBack, DispensingPhase::Idle)
                | (DispensingPhase::WaitingDispenseLockBack, DispensingPhase::Idle)
        )
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub from: DispensingPhase,
    pub to: DispensingPhase,
    /// Slot whose context was active across the change
    pub slot_id: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Sequencer for one cabinet.
///
/// Not thread-safe on its own; the controller owns it behind `&mut self`.
#[derive(Debug)]
pub struct DispensingStateMachine {
    kind: DeviceKind,
    address: u8,
    state: DispensingState,
    history: VecDeque<StateTransition>,
}

impl DispensingStateMachine {
    pub fn new(kind: DeviceKind, address: u8) -> Self {
        Self {
            kind,
            address,
            state: DispensingState::Idle,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn state(&self) -> &DispensingState {
        &self.state
    }

    pub fn phase(&self) -> DispensingPhase {
        self.state.phase()
    }

    pub fn active_context(&self) -> Option<&DispensingContext> {
        self.state.context()
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// Fail unless a new operation on `slot` could start right now.
    ///
    /// # Errors
    ///
    /// - `Error::SlotOutOfRange` if `slot` is not usable on this device
    /// - `Error::DeviceBusy` if another context is active
    /// - `Error::NotConnected` if the transport is closed
    pub fn ensure_ready(&self, slot: SlotId, connected: bool) -> Result<()> {
        let max = self.kind.usable_slots();
        if slot.as_u8() > max {
            warn!(slot = slot.as_u8(), max, "Rejected request for unusable slot");
            return Err(Error::SlotOutOfRange {
                slot: slot.as_u8(),
                max,
            });
        }
        if let Some(active) = self.active_context() {
            warn!(
                slot = slot.as_u8(),
                active_slot = active.slot_id.as_u8(),
                phase = %self.phase(),
                "Rejected request while another slot is active"
            );
            return Err(Error::DeviceBusy {
                active_slot: active.slot_id.as_u8(),
            });
        }
        if !connected {
            warn!(slot = slot.as_u8(), "Rejected request while disconnected");
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Start an unlock and return the `0x81` packet to send.
    ///
    /// # Errors
    /// See [`ensure_ready`](Self::ensure_ready). The machine is unchanged on error.
    pub fn request_unlock(&mut self, context: DispensingContext, connected: bool) -> Result<Packet> {
        self.begin(context, OperationKind::Unlock, connected)
    }

    /// Start a dispense and return the `0x81` packet to send.
    ///
    /// Occupancy must already have been checked by the caller.
    pub fn request_dispense(
        &mut self,
        context: DispensingContext,
        connected: bool,
    ) -> Result<Packet> {
        self.begin(context, OperationKind::Dispense, connected)
    }

    fn begin(
        &mut self,
        context: DispensingContext,
        operation: OperationKind,
        connected: bool,
    ) -> Result<Packet> {
        let slot = context.slot_id;
        self.ensure_ready(slot, connected)?;

        info!(slot = slot.as_u8(), hn = %context.hn, ?operation, "Unlocking slot");
        self.transition_to(DispensingState::Unlocking { context, operation })?;
        Ok(Packet::unlock_request(self.address, slot))
    }

    /// Feed a status reply. Returns the lifecycle event it produced, if any.
    ///
    /// While waiting for lock-back an open drawer re-emits the in-progress
    /// event on every poll.
    pub fn on_status(&mut self, slots: &[SlotState]) -> Result<Option<CabinetEvent>> {
        let Some(context) = self.active_context() else {
            return Ok(None);
        };
        let slot = context.slot_id;
        let is_open = slots
            .iter()
            .find(|s| s.slot_number == slot.as_u8())
            .is_some_and(|s| s.is_open);

        match (&self.state, is_open) {
            (DispensingState::Unlocking { context, operation }, true) => {
                let context = context.clone();
                let (next, event) = match operation {
                    OperationKind::Unlock => (
                        DispensingState::WaitingLockBack {
                            context: context.clone(),
                        },
                        unlocking_event(&context, true),
                    ),
                    OperationKind::Dispense => (
                        DispensingState::WaitingDispenseLockBack {
                            context: context.clone(),
                        },
                        dispensing_event(&context, true),
                    ),
                };
                info!(slot = slot.as_u8(), "Drawer open");
                self.transition_to(next)?;
                Ok(Some(event))
            }
            (DispensingState::Unlocking { .. }, false) => {
                debug!(slot = slot.as_u8(), "Drawer not open yet");
                Ok(None)
            }
            (DispensingState::WaitingLockBack { context }, true) => {
                Ok(Some(unlocking_event(context, true)))
            }
            (DispensingState::WaitingDispenseLockBack { context }, true) => {
                Ok(Some(dispensing_event(context, true)))
            }
            (DispensingState::WaitingLockBack { context }, false) => {
                let event = unlocking_event(context, false);
                info!(slot = slot.as_u8(), "Lock-back detected");
                self.transition_to(DispensingState::Idle)?;
                Ok(Some(event))
            }
            (DispensingState::WaitingDispenseLockBack { context }, false) => {
                let event = dispensing_event(context, false);
                info!(slot = slot.as_u8(), "Dispense lock-back detected");
                self.transition_to(DispensingState::Idle)?;
                Ok(Some(event))
            }
            (DispensingState::Idle, _) => Ok(None),
        }
    }

    /// Drop the active context after a failed hardware exchange.
    pub fn abort(&mut self) -> Option<DispensingContext> {
        let context = self.active_context()?.clone();
        warn!(
            slot = context.slot_id.as_u8(),
            phase = %self.phase(),
            "Aborting operation"
        );
        self.reset();
        Some(context)
    }

    /// Clear the context for `slot` without waiting for lock-back.
    ///
    /// Always returns a `dispensing` event with `reset: true`, whether or not
    /// the slot was active. Another slot's context is left untouched.
    pub fn force_reset(&mut self, slot: SlotId) -> CabinetEvent {
        let hn = match self.active_context() {
            Some(context) if context.slot_id == slot => {
                let hn = context.hn.to_string();
                info!(slot = slot.as_u8(), phase = %self.phase(), "Force reset");
                self.reset();
                Some(hn)
            }
            Some(context) => {
                debug!(
                    slot = slot.as_u8(),
                    active_slot = context.slot_id.as_u8(),
                    "Force reset of an inactive slot"
                );
                None
            }
            None => None,
        };

        CabinetEvent::Dispensing {
            slot_id: slot.as_u8(),
            hn,
            dispensing: false,
            reset: true,
        }
    }

    fn transition_to(&mut self, next: DispensingState) -> Result<()> {
        let from = self.phase();
        let to = next.phase();
        if !from.can_transition_to(&to) {
            return Err(Error::invalid_transition(from, to));
        }
        self.perform_state_change(next);
        Ok(())
    }

    fn reset(&mut self) {
        self.perform_state_change(DispensingState::Idle);
    }

    fn perform_state_change(&mut self, next: DispensingState) {
        let slot_id = self
            .active_context()
            .or_else(|| next.context())
            .map(|c| c.slot_id.as_u8());
        let transition = StateTransition {
            from: self.phase(),
            to: next.phase(),
            slot_id,
            timestamp: Utc::now(),
        };
        self.state = next;

        self.history.push_back(transition);
        if self.history.len() > MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
    }
}

fn unlocking_event(context: &DispensingContext, unlocking: bool) -> CabinetEvent {
    CabinetEvent::Unlocking {
        slot_id: context.slot_id.as_u8(),
        hn: context.hn.to_string(),
        unlocking,
    }
}

fn dispensing_event(context: &DispensingContext, dispensing: bool) -> CabinetEvent {
    CabinetEvent::Dispensing {
        slot_id: context.slot_id.as_u8(),
        hn: Some(context.hn.to_string()),
        dispensing,
        reset: false,
    }
}
