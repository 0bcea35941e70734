use crate::state::MachineState;
use crate::types::RunId;
use serde::{Deserialize, Serialize};

/// Percentage carried by the last event of a run, and only by it.
pub const TERMINAL_PERCENTAGE: u8 = 100;

/// One progress record of a build run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    pub message: String,
    pub status: MachineState,
    pub percentage: u8,
    /// Empty when the event does not report a failure.
    #[serde(default)]
    pub error: String,
}

impl ProgressEvent {
    pub fn progress(message: impl Into<String>, status: MachineState, percentage: u8) -> Self {
        Self {
            message: message.into(),
            status,
            percentage: percentage.min(TERMINAL_PERCENTAGE - 1),
            error: String::new(),
        }
    }

    pub fn terminal(status: MachineState, error: impl Into<String>) -> Self {
        Self {
            message: String::new(),
            status,
            percentage: TERMINAL_PERCENTAGE,
            error: error.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.percentage == TERMINAL_PERCENTAGE
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Returned synchronously when a build has been accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlResult {
    #[serde(rename = "eventId")]
    pub run_id: RunId,
    pub state: MachineState,
}
