//! Events reported by a [`DeviceController`](crate::DeviceController).
//!
//! Events serialize to single-key objects so consumers can dispatch on the
//! key:
//!
//! ```text
//! {"checkStateResult":[{"slotNumber":1,"isOpen":false,"status":"closed"}, ...]}
//! {"unlocking":{"slotId":3,"hn":"HN-1001","unlocking":true}}
//! {"dispensing":{"slotId":3,"hn":"HN-1001","dispensing":false,"reset":true}}
//! {"error":{"kind":"COMMUNICATION_TIMEOUT","slotId":3,"message":"..."}}
//! ```

use medcab_core::{Error, ErrorKind, SlotState};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{trace, warn};

/// Events buffered before new ones are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CabinetEvent {
    /// Result of every status poll, slot 1 first.
    CheckStateResult(Vec<SlotState>),

    /// Unlock progress. `unlocking` stays true until the drawer is closed.
    Unlocking {
        slot_id: u8,
        hn: String,
        unlocking: bool,
    },

    /// Dispense progress. `reset` marks a forced clear without lock-back.
    Dispensing {
        slot_id: u8,
        hn: Option<String>,
        dispensing: bool,
        reset: bool,
    },

    /// A hardware operation failed and the slot was released.
    Error {
        kind: ErrorKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        slot_id: Option<u8>,
        message: String,
    },
}

impl CabinetEvent {
    pub fn error(error: &Error, slot_id: Option<u8>) -> Self {
        CabinetEvent::Error {
            kind: error.kind(),
            slot_id,
            message: error.to_string(),
        }
    }

    /// Slot the event refers to, if any.
    pub fn slot_id(&self) -> Option<u8> {
        match self {
            CabinetEvent::CheckStateResult(_) => None,
            CabinetEvent::Unlocking { slot_id, .. } | CabinetEvent::Dispensing { slot_id, .. } => {
                Some(*slot_id)
            }
            CabinetEvent::Error { slot_id, .. } => *slot_id,
        }
    }
}

/// Create a bounded event channel.
pub fn event_channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSink { tx }, EventStream { rx })
}

/// Sending half, held by the controller. Never blocks.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<CabinetEvent>,
}

impl EventSink {
    /// Queue an event. Dropped with a warning if the consumer has fallen
    /// behind or gone away.
    pub fn emit(&self, event: CabinetEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "Event channel full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                trace!(?event, "No event consumer");
            }
        }
    }
}

/// Receiving half, drained by the caller.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<CabinetEvent>,
}

impl EventStream {
    /// Wait for the next event. `None` once the controller is dropped and
    /// the queue is empty.
    pub async fn recv(&mut self) -> Option<CabinetEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CabinetEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Everything queued so far, oldest first.
    pub fn drain(&mut self) -> Vec<CabinetEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
