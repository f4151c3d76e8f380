//! Dispensing workflow for DS12/DS16 cabinets.
//!
//! [`DeviceController`] drives one cabinet through a [`CommandChannel`]
//! (usually a [`SerialTransport`](medcab_hardware::SerialTransport)). Each
//! unlock or dispense request is tracked by the [`DispensingStateMachine`]
//! until the drawer is pushed shut again, and every step is reported as a
//! [`CabinetEvent`] on the controller's [`EventStream`].
//!
//! ```text
//!  caller ──► DeviceController ──► CommandChannel ──► cabinet
//!                 │      ▲
//!                 ▼      │ status replies
//!        DispensingStateMachine
//!                 │
//!                 ▼
//!            EventStream ──► caller
//! ```
//!
//! [`CommandChannel`]: medcab_hardware::CommandChannel

pub mod controller;
pub mod events;
pub mod repository;
pub mod state_machine;

pub use controller::{DeviceController, OperationRequest};
pub use events::{CabinetEvent, EVENT_CHANNEL_CAPACITY, EventSink, EventStream, event_channel};
pub use repository::{InMemorySlotRepository, SlotRepository};
pub use state_machine::{
    DispensingPhase, DispensingState, DispensingStateMachine, OperationKind, StateTransition,
};
