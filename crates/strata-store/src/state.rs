use crate::StoreError;
use strata_schema::{MachineId, MachineState, StorageData};

/// Persistence capability consumed by the orchestrator.
///
/// Only the orchestrator writes through this interface: `update_state` when a
/// build is accepted and when it finishes, `update` for the result data of a
/// successful build.
pub trait StateStore: Send + Sync {
    /// Current state of a machine. Machines the store has never seen are
    /// `NotInitialized`.
    fn state(&self, machine_id: &MachineId) -> Result<MachineState, StoreError>;

    fn update_state(&self, machine_id: &MachineId, state: MachineState)
        -> Result<(), StoreError>;

    fn update(&self, machine_id: &MachineId, data: &StorageData) -> Result<(), StoreError>;
}
