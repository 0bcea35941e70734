use crate::layout::StoreLayout;
use crate::machines::MachineStore;
use crate::StoreError;

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

#[derive(Debug)]
pub struct IntegrityFailure {
    pub machine_id: String,
    pub reason: String,
}

/// Verify the embedded checksum of every machine record in the store.
pub fn verify_store_integrity(layout: &StoreLayout) -> Result<IntegrityReport, StoreError> {
    let machines = MachineStore::new(layout.clone());
    let mut report = IntegrityReport::default();

    for entry in machines.list_with_errors()? {
        report.checked += 1;
        match entry {
            Ok(_) => report.passed += 1,
            Err((name, StoreError::IntegrityFailure { actual, .. })) => {
                report.failed.push(IntegrityFailure {
                    machine_id: name,
                    reason: format!("checksum mismatch: got {actual}"),
                });
            }
            Err((name, e)) => {
                report.failed.push(IntegrityFailure {
                    machine_id: name,
                    reason: format!("record read error: {e}"),
                });
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use std::fs;
    use strata_schema::{MachineId, MachineState};

    #[test]
    fn clean_store_passes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let store = MachineStore::new(layout.clone());
        store
            .update_state(&MachineId::new("a"), MachineState::Running)
            .unwrap();
        store
            .update_state(&MachineId::new("b"), MachineState::Stopped)
            .unwrap();

        let report = verify_store_integrity(&layout).unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.passed, 2);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn tampered_and_garbage_records_fail() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let store = MachineStore::new(layout.clone());
        let id = MachineId::new("a");
        store.update_state(&id, MachineState::Running).unwrap();

        let path = layout.machine_path(&id);
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("Running", "Building")).unwrap();
        fs::write(layout.machines_dir().join("b"), "GARBAGE").unwrap();

        let report = verify_store_integrity(&layout).unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.passed, 0);
        assert_eq!(report.failed.len(), 2);
        assert!(report
            .failed
            .iter()
            .any(|f| f.machine_id == "a" && f.reason.contains("checksum")));
    }
}
