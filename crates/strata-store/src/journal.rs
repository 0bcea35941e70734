use crate::layout::StoreLayout;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use strata_schema::{MachineId, MachineState, RunId};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// A build that has been accepted but whose finalizer has not run yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub run_id: RunId,
    pub machine_id: MachineId,
    /// State to restore if the run never finishes.
    pub prior_state: MachineState,
    pub started_at: String,
    pub pid: u32,
}

impl JournalEntry {
    pub fn new(run_id: RunId, machine_id: MachineId, prior_state: MachineState) -> Self {
        Self {
            run_id,
            machine_id,
            prior_state,
            started_at: chrono::Utc::now().to_rfc3339(),
            pid: std::process::id(),
        }
    }

    /// Seconds since the entry was written. Unparseable timestamps count as old.
    pub fn age_secs(&self) -> u64 {
        chrono::DateTime::parse_from_rfc3339(&self.started_at).map_or(u64::MAX, |t| {
            let age = chrono::Utc::now().signed_duration_since(t);
            u64::try_from(age.num_seconds()).unwrap_or(0)
        })
    }
}

/// Journal of in-flight build runs.
///
/// An entry is written when a build is accepted and removed once its
/// finalizer has persisted the terminal state. Entries left behind by a
/// crashed process let the next process restore the machine's prior state.
pub struct RunJournal {
    dir: PathBuf,
}

impl RunJournal {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            dir: layout.journal_dir(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn entry_path(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    pub fn begin(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        if !entry.run_id.is_path_safe() {
            return Err(StoreError::InvalidId(entry.run_id.to_string()));
        }
        fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(entry)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.entry_path(&entry.run_id))
            .map_err(|e| StoreError::Io(e.error))?;
        crate::fsync_dir(&self.dir)?;
        debug!(
            "journal begin: {} for {} (prior state {})",
            entry.run_id, entry.machine_id, entry.prior_state
        );
        Ok(())
    }

    /// Remove the entry of a finished run.
    pub fn commit(&self, run_id: &RunId) -> Result<(), StoreError> {
        let path = self.entry_path(run_id);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("journal commit: {run_id}");
        }
        Ok(())
    }

    pub fn get(&self, run_id: &RunId) -> Result<Option<JournalEntry>, StoreError> {
        let path = self.entry_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// All entries, oldest first. Corrupt entries are removed.
    pub fn list(&self) -> Result<Vec<JournalEntry>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str::<JournalEntry>(&content) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            warn!("corrupt journal entry {}: {e}", path.display());
                            let _ = fs::remove_file(&path);
                        }
                    },
                    Err(e) => {
                        warn!("unreadable journal entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(entries)
    }
}
