use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_FAILURE_MESSAGE: &str = "Building failed. Please contact support.";

/// Tunables of an orchestrator, read from `strata.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How long a run waits for the distributed lease before failing.
    pub lock_wait_ms: u64,
    pub lock_poll_ms: u64,
    /// Deadline attached to each run's cancel token.
    pub build_timeout_secs: Option<u64>,
    /// Mirror progress events into `store/events/<run-id>.jsonl`.
    pub persist_events: bool,
    /// Journal entries younger than this are left alone by recovery.
    pub recovery_grace_secs: u64,
    /// Error text exposed to subscribers when a run fails.
    pub failure_message: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: 5000,
            lock_poll_ms: 50,
            build_timeout_secs: None,
            persist_events: true,
            recovery_grace_secs: 30,
            failure_message: DEFAULT_FAILURE_MESSAGE.to_owned(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, CoreError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let content = toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_secs.map(Duration::from_secs)
    }
}
