use crate::state::StateStore;
use crate::StoreError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use strata_schema::{MachineId, MachineState, StorageData};

#[derive(Debug, Default, Clone)]
struct Entry {
    state: MachineState,
    history: Vec<MachineState>,
    data: Vec<StorageData>,
}

/// In-memory [`StateStore`] that remembers every write it receives.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<MachineId, Entry>>,
    fail_data_updates: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a machine's state without recording it as a write.
    pub fn seed(&self, machine_id: &MachineId, state: MachineState) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.entry(machine_id.clone()).or_default().state = state;
        }
    }

    /// Make every subsequent `update` fail.
    pub fn fail_data_updates(&self, fail: bool) {
        self.fail_data_updates.store(fail, Ordering::SeqCst);
    }

    /// Every state written for the machine, in order.
    pub fn state_history(&self, machine_id: &MachineId) -> Vec<MachineState> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.get(machine_id).map(|entry| entry.history.clone()))
            .unwrap_or_default()
    }

    /// Every data bundle written for the machine, in order.
    pub fn data_updates(&self, machine_id: &MachineId) -> Vec<StorageData> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.get(machine_id).map(|entry| entry.data.clone()))
            .unwrap_or_default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<MachineId, Entry>) -> T,
    ) -> Result<T, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {e}")))?;
        Ok(f(&mut entries))
    }
}

impl StateStore for MemoryStore {
    fn state(&self, machine_id: &MachineId) -> Result<MachineState, StoreError> {
        self.with_entries(|entries| {
            entries
                .get(machine_id)
                .map_or(MachineState::NotInitialized, |e| e.state)
        })
    }

    fn update_state(
        &self,
        machine_id: &MachineId,
        state: MachineState,
    ) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            let entry = entries.entry(machine_id.clone()).or_default();
            entry.state = state;
            entry.history.push(state);
        })
    }

    fn update(&self, machine_id: &MachineId, data: &StorageData) -> Result<(), StoreError> {
        if self.fail_data_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("data updates disabled".to_owned()));
        }
        self.with_entries(|entries| {
            entries
                .entry(machine_id.clone())
                .or_default()
                .data
                .push(data.clone());
        })
    }
}
