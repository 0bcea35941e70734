//! Data model for the strata build orchestrator.
//!
//! This crate defines the schema layer shared by every other strata crate:
//! string newtypes for machine and run identifiers (`MachineId`, `RunId`),
//! the `MachineState` lifecycle enum, the typed builder configuration
//! (`BuilderConfig`) with its single decode-and-validate boundary, TOML build
//! request files (`BuildRequest`), provider results (`Artifact`,
//! `DeployArtifact`, `StorageData`) and progress records (`ProgressEvent`,
//! `ControlResult`).

pub mod artifact;
pub mod config;
pub mod event;
pub mod request;
pub mod state;
pub mod types;

pub use artifact::{Artifact, BuildData, DeployArtifact, StorageData, BUILD_DATA_KIND};
pub use config::{BuilderConfig, INSTANCE_NAME_KEY};
pub use event::{ControlResult, ProgressEvent, TERMINAL_PERCENTAGE};
pub use request::BuildRequest;
pub use state::MachineState;
pub use types::{MachineId, RunId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read build request: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse build request: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("instanceName is malformed: {0}")]
    MalformedInstanceName(String),
    #[error("builder configuration must be a table, got {0}")]
    MalformedBuilder(String),
    #[error("machine_id must not be empty")]
    EmptyMachineId,
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("provider must not be empty")]
    EmptyProvider,
    #[error("unknown machine state: {0}")]
    UnknownState(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
