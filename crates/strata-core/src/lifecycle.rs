use crate::CoreError;
use strata_schema::{MachineId, MachineState};

/// Admission guard for a build: only machines that never existed or were
/// terminated may be built.
pub fn validate_build(machine_id: &MachineId, state: MachineState) -> Result<(), CoreError> {
    match state {
        MachineState::Building => Err(CoreError::AlreadyBuilding(machine_id.to_string())),
        MachineState::Unknown => Err(CoreError::UnknownState(machine_id.to_string())),
        s if s.is_buildable() => Ok(()),
        s => Err(CoreError::AlreadyInitialized {
            machine_id: machine_id.to_string(),
            state: s,
        }),
    }
}
