//! Persistence and progress channels for strata.
//!
//! This crate provides the storage layer behind the orchestrator: the narrow
//! `StateStore` capability with a file-backed, checksummed `MachineStore` and
//! an in-memory `MemoryStore`, `StoreLayout` for directory structure
//! management, the `RunJournal` used for crash recovery of interrupted builds,
//! and the `Eventer`/`EventHub` progress channels addressed by run id.

pub mod events;
pub mod integrity;
pub mod journal;
pub mod layout;
pub mod machines;
pub mod memory;
pub mod state;

pub use events::{read_event_log, EventHub, EventStream, Eventer, ProgressReporter};
pub use integrity::{verify_store_integrity, IntegrityFailure, IntegrityReport};
pub use journal::{JournalEntry, RunJournal};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use machines::{MachineRecord, MachineStore};
pub use memory::MemoryStore;
pub use state::StateStore;

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for machine '{machine_id}': expected {expected}, got {actual}")]
    IntegrityFailure {
        machine_id: String,
        expected: String,
        actual: String,
    },
    #[error("machine not found: {0}")]
    MachineNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("invalid machine id: '{0}'")]
    InvalidId(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_machine_not_found() {
        let e = StoreError::MachineNotFound("m-1".to_owned());
        assert!(e.to_string().contains("m-1"));
    }

    #[test]
    fn store_error_display_invalid_id() {
        let e = StoreError::InvalidId("../x".to_owned());
        assert!(e.to_string().contains("../x"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        let msg = e.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            machine_id: "m".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }
}
