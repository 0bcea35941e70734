use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle state of a machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum MachineState {
    #[default]
    NotInitialized,
    Building,
    Starting,
    Running,
    Stopping,
    Stopped,
    Rebooting,
    Terminating,
    Terminated,
    Unknown,
}

impl MachineState {
    pub const ALL: [MachineState; 10] = [
        MachineState::NotInitialized,
        MachineState::Building,
        MachineState::Starting,
        MachineState::Running,
        MachineState::Stopping,
        MachineState::Stopped,
        MachineState::Rebooting,
        MachineState::Terminating,
        MachineState::Terminated,
        MachineState::Unknown,
    ];

    pub fn is_in(self, states: &[MachineState]) -> bool {
        states.contains(&self)
    }

    /// States a build may start from.
    pub fn is_buildable(self) -> bool {
        self.is_in(&[MachineState::Terminated, MachineState::NotInitialized])
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::NotInitialized => "NotInitialized",
            MachineState::Building => "Building",
            MachineState::Starting => "Starting",
            MachineState::Running => "Running",
            MachineState::Stopping => "Stopping",
            MachineState::Stopped => "Stopped",
            MachineState::Rebooting => "Rebooting",
            MachineState::Terminating => "Terminating",
            MachineState::Terminated => "Terminated",
            MachineState::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineState {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MachineState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SchemaError::UnknownState(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_terminated_and_not_initialized_are_buildable() {
        for state in MachineState::ALL {
            let expected = matches!(
                state,
                MachineState::Terminated | MachineState::NotInitialized
            );
            assert_eq!(state.is_buildable(), expected, "{state}");
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(
            "running".parse::<MachineState>().unwrap(),
            MachineState::Running
        );
        assert_eq!(
            "NotInitialized".parse::<MachineState>().unwrap(),
            MachineState::NotInitialized
        );
        assert!("exploded".parse::<MachineState>().is_err());
    }

    #[test]
    fn display_matches_serde_name() {
        for state in MachineState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[test]
    fn default_is_not_initialized() {
        assert_eq!(MachineState::default(), MachineState::NotInitialized);
    }
}
