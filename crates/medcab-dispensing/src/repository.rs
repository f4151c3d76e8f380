#![allow(async_fn_in_trait)]

use medcab_core::{Hn, Result, SlotId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Slot assignment records consulted before a dispense.
///
/// The persistence layer lives outside the hardware core; implementations
/// map their storage errors to `Error::Repository`.
///
/// # Implementation Note
///
/// This trait uses native async trait methods (Edition 2024 feature).
pub trait SlotRepository: Send + Sync {
    /// Whether a patient's medication is loaded in `slot`.
    async fn is_slot_occupied(&self, slot: SlotId) -> Result<bool>;

    /// Hospital number of the patient assigned to `slot`.
    async fn get_patient_for_slot(&self, slot: SlotId) -> Result<Option<Hn>>;
}

/// Process-local assignments for simulators and tests.
#[derive(Debug, Default)]
pub struct InMemorySlotRepository {
    slots: Mutex<HashMap<SlotId, Hn>>,
}

impl InMemorySlotRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `slot` to a patient, replacing any previous assignment.
    pub fn occupy(&self, slot: SlotId, hn: Hn) {
        self.lock().insert(slot, hn);
    }

    /// Clear the assignment for `slot`. Returns the previous patient.
    pub fn vacate(&self, slot: SlotId) -> Option<Hn> {
        self.lock().remove(&slot)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SlotId, Hn>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SlotRepository for InMemorySlotRepository {
    async fn is_slot_occupied(&self, slot: SlotId) -> Result<bool> {
        Ok(self.lock().contains_key(&slot))
    }

    async fn get_patient_for_slot(&self, slot: SlotId) -> Result<Option<Hn>> {
        Ok(self.lock().get(&slot).cloned())
    }
}
