use crate::layout::StoreLayout;
use crate::state::StateStore;
use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use strata_schema::{BuildData, MachineId, MachineState, StorageData};
use tempfile::NamedTempFile;

/// Persisted record of one machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineRecord {
    pub machine_id: MachineId,
    pub state: MachineState,
    /// Operation tag of the last data update, e.g. `build`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BuildData>,
    pub created_at: String,
    pub updated_at: String,
    /// blake3 checksum for integrity verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl MachineRecord {
    pub fn new(machine_id: MachineId) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            machine_id,
            state: MachineState::NotInitialized,
            kind: None,
            data: None,
            created_at: now.clone(),
            updated_at: now,
            checksum: None,
        }
    }

    /// Compute the checksum over the record content (excluding the checksum field itself).
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// File-backed [`StateStore`]: one checksummed JSON record per machine,
/// written atomically.
pub struct MachineStore {
    layout: StoreLayout,
}

impl MachineStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn check_id(machine_id: &MachineId) -> Result<(), StoreError> {
        if machine_id.is_path_safe() {
            Ok(())
        } else {
            Err(StoreError::InvalidId(machine_id.to_string()))
        }
    }

    pub fn put(&self, record: &MachineRecord) -> Result<(), StoreError> {
        Self::check_id(&record.machine_id)?;
        let dir = self.layout.machines_dir();
        fs::create_dir_all(&dir)?;
        let dest = self.layout.machine_path(&record.machine_id);

        let mut with_checksum = record.clone();
        with_checksum.checksum = Some(with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;

        Ok(())
    }

    pub fn get(&self, machine_id: &MachineId) -> Result<MachineRecord, StoreError> {
        Self::check_id(machine_id)?;
        let path = self.layout.machine_path(machine_id);
        if !path.exists() {
            return Err(StoreError::MachineNotFound(machine_id.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        let record: MachineRecord = serde_json::from_str(&content)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    machine_id: machine_id.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(record)
    }

    fn get_or_new(&self, machine_id: &MachineId) -> Result<MachineRecord, StoreError> {
        match self.get(machine_id) {
            Ok(record) => Ok(record),
            Err(StoreError::MachineNotFound(_)) => Ok(MachineRecord::new(machine_id.clone())),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, machine_id: &MachineId) -> bool {
        machine_id.is_path_safe() && self.layout.machine_path(machine_id).exists()
    }

    pub fn remove(&self, machine_id: &MachineId) -> Result<(), StoreError> {
        Self::check_id(machine_id)?;
        let path = self.layout.machine_path(machine_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<MachineRecord>, StoreError> {
        let mut results = Vec::new();
        for entry in self.list_with_errors()? {
            match entry {
                Ok(record) => results.push(record),
                Err((name, e)) => {
                    tracing::warn!("skipping corrupted machine record '{name}': {e}");
                }
            }
        }
        results.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        Ok(results)
    }

    /// Like `list()`, but returns per-entry `Result`s so callers (e.g.
    /// `verify-store`) can surface individual corruption errors.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(
        &self,
    ) -> Result<Vec<Result<MachineRecord, (String, StoreError)>>, StoreError> {
        let dir = self.layout.machines_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let name = entry.file_name();
                let name_str = name.to_str().unwrap_or("").to_owned();
                if !name_str.is_empty() && !name_str.starts_with('.') {
                    match self.get(&MachineId::new(name_str.as_str())) {
                        Ok(record) => results.push(Ok(record)),
                        Err(e) => results.push(Err((name_str, e))),
                    }
                }
            }
        }
        Ok(results)
    }
}

impl StateStore for MachineStore {
    fn state(&self, machine_id: &MachineId) -> Result<MachineState, StoreError> {
        match self.get(machine_id) {
            Ok(record) => Ok(record.state),
            Err(StoreError::MachineNotFound(_)) => Ok(MachineState::NotInitialized),
            Err(e) => Err(e),
        }
    }

    fn update_state(
        &self,
        machine_id: &MachineId,
        state: MachineState,
    ) -> Result<(), StoreError> {
        let mut record = self.get_or_new(machine_id)?;
        record.state = state;
        record.updated_at = chrono::Utc::now().to_rfc3339();
        self.put(&record)
    }

    fn update(&self, machine_id: &MachineId, data: &StorageData) -> Result<(), StoreError> {
        let mut record = self.get_or_new(machine_id)?;
        record.kind = Some(data.kind.clone());
        record.data = Some(data.data.clone());
        record.updated_at = chrono::Utc::now().to_rfc3339();
        self.put(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_machine_store() -> (tempfile::TempDir, MachineStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, MachineStore::new(layout))
    }

    fn sample_data() -> StorageData {
        StorageData::build(BuildData {
            ip_address: "10.1.2.3".to_owned(),
            domain_name: "vm.example.net".to_owned(),
            instance_id: "i-42".to_owned(),
            instance_name: "alice-1".to_owned(),
            query_string: "/alice/vm".to_owned(),
            username: "alice".to_owned(),
        })
    }

    #[test]
    fn unknown_machine_is_not_initialized() {
        let (_dir, store) = test_machine_store();
        let state = store.state(&MachineId::new("fresh")).unwrap();
        assert_eq!(state, MachineState::NotInitialized);
    }

    #[test]
    fn update_state_creates_and_updates_record() {
        let (_dir, store) = test_machine_store();
        let id = MachineId::new("m1");
        store.update_state(&id, MachineState::Building).unwrap();
        assert_eq!(store.state(&id).unwrap(), MachineState::Building);
        store.update_state(&id, MachineState::Running).unwrap();
        assert_eq!(store.state(&id).unwrap(), MachineState::Running);
        assert!(store.get(&id).unwrap().checksum.is_some());
    }

    #[test]
    fn update_keeps_state_and_stores_tagged_data() {
        let (_dir, store) = test_machine_store();
        let id = MachineId::new("m1");
        store.update_state(&id, MachineState::Running).unwrap();
        store.update(&id, &sample_data()).unwrap();

        let record = store.get(&id).unwrap();
        assert_eq!(record.state, MachineState::Running);
        assert_eq!(record.kind.as_deref(), Some("build"));
        assert_eq!(record.data.unwrap().instance_id, "i-42");
    }

    #[test]
    fn tampered_record_fails_checksum() {
        let (dir, store) = test_machine_store();
        let id = MachineId::new("m1");
        store.update_state(&id, MachineState::Running).unwrap();

        let path = StoreLayout::new(dir.path()).machine_path(&id);
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("Running", "Stopped")).unwrap();

        assert!(matches!(
            store.get(&id),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn unsafe_ids_are_rejected() {
        let (_dir, store) = test_machine_store();
        let id = MachineId::new("../escape");
        assert!(matches!(
            store.update_state(&id, MachineState::Building),
            Err(StoreError::InvalidId(_))
        ));
        assert!(!store.exists(&id));
    }

    #[test]
    fn list_skips_corrupt_entries() {
        let (dir, store) = test_machine_store();
        store
            .update_state(&MachineId::new("good"), MachineState::Running)
            .unwrap();
        fs::write(
            StoreLayout::new(dir.path()).machines_dir().join("bad"),
            "NOT JSON",
        )
        .unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].machine_id, "good");

        let with_errors = store.list_with_errors().unwrap();
        assert_eq!(with_errors.len(), 2);
        assert_eq!(with_errors.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[test]
    fn remove_deletes_record() {
        let (_dir, store) = test_machine_store();
        let id = MachineId::new("m1");
        store.update_state(&id, MachineState::Stopped).unwrap();
        assert!(store.exists(&id));
        store.remove(&id).unwrap();
        assert!(!store.exists(&id));
        assert_eq!(store.state(&id).unwrap(), MachineState::NotInitialized);
    }

    #[test]
    fn list_empty_store() {
        let (_dir, store) = test_machine_store();
        assert!(store.list().unwrap().is_empty());
    }
}
