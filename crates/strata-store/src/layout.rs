use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use strata_schema::{MachineId, RunId};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a strata store.
///
/// Manages paths for machine records, the run journal, distributed lease
/// files and persisted event logs. All subdirectories are created lazily on
/// [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn machines_dir(&self) -> PathBuf {
        self.root.join("store").join("machines")
    }

    #[inline]
    pub fn machine_path(&self, machine_id: &MachineId) -> PathBuf {
        self.machines_dir().join(machine_id.as_str())
    }

    #[inline]
    pub fn journal_dir(&self) -> PathBuf {
        self.root.join("store").join("journal")
    }

    #[inline]
    pub fn leases_dir(&self) -> PathBuf {
        self.root.join("store").join("leases")
    }

    #[inline]
    pub fn lease_path(&self, machine_id: &MachineId) -> PathBuf {
        self.leases_dir().join(format!("{machine_id}.lock"))
    }

    #[inline]
    pub fn events_dir(&self) -> PathBuf {
        self.root.join("store").join("events")
    }

    #[inline]
    pub fn event_log_path(&self, run_id: &RunId) -> PathBuf {
        self.events_dir().join(format!("{run_id}.jsonl"))
    }

    /// Default location of the orchestrator configuration file.
    #[inline]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("strata.toml")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.machines_dir())?;
        fs::create_dir_all(self.journal_dir())?;
        fs::create_dir_all(self.leases_dir())?;
        fs::create_dir_all(self.events_dir())?;

        let version_path = self.root.join("store").join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let store_dir = self.root.join("store");
            let mut tmp = NamedTempFile::new_in(&store_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&store_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join("store").join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = StoreLayout::new("/tmp/strata-test");
        assert_eq!(
            layout.machines_dir(),
            PathBuf::from("/tmp/strata-test/store/machines")
        );
        assert_eq!(
            layout.machine_path(&MachineId::new("m1")),
            PathBuf::from("/tmp/strata-test/store/machines/m1")
        );
        assert_eq!(
            layout.lease_path(&MachineId::new("m1")),
            PathBuf::from("/tmp/strata-test/store/leases/m1.lock")
        );
        assert_eq!(
            layout.event_log_path(&RunId::new("build-m1")),
            PathBuf::from("/tmp/strata-test/store/events/build-m1.jsonl")
        );
        assert_eq!(
            layout.journal_dir(),
            PathBuf::from("/tmp/strata-test/store/journal")
        );
        assert_eq!(
            layout.config_file(),
            PathBuf::from("/tmp/strata-test/strata.toml")
        );
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();

        assert!(layout.machines_dir().is_dir());
        assert!(layout.journal_dir().is_dir());
        assert!(layout.leases_dir().is_dir());
        assert!(layout.events_dir().is_dir());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn version_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        fs::write(
            dir.path().join("store").join(VERSION_FILE),
            r#"{"format_version": 99}"#,
        )
        .unwrap();
        assert!(matches!(
            layout.verify_version(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
