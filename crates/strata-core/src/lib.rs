//! Build orchestration for strata machines.
//!
//! This crate ties the schema, store, and provider crates together into the
//! `Orchestrator`: it accepts build requests synchronously, guards them
//! against the machine lifecycle, and drives each accepted build on its own
//! background task through the provider, the deploy step, and a finalizer
//! that always restores a consistent machine state. It also provides the
//! two-layer `LockManager`, the orchestrator configuration, and the crash
//! recovery sweep over the run journal.

pub mod concurrency;
pub mod config;
pub mod lifecycle;
pub mod orchestrator;
pub mod task;

pub use concurrency::{
    install_signal_handler, shutdown_requested, FileLocker, Lease, LocalLocks, LockManager,
    Locker, MachineLock, MemoryLocker,
};
pub use config::OrchestratorConfig;
pub use lifecycle::validate_build;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RecoveryReport};
pub use task::{run_guarded, BuildTask};

use strata_provider::ProviderError;
use strata_schema::{MachineState, SchemaError};
use strata_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("machine '{0}' is already being built")]
    AlreadyBuilding(String),
    #[error("machine '{0}' is in an unknown state")]
    UnknownState(String),
    #[error("machine '{machine_id}' is already initialized (state {state})")]
    AlreadyInitialized {
        machine_id: String,
        state: MachineState,
    },
    #[error("malformed builder configuration: {0}")]
    MalformedConfiguration(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("invalid machine id: '{0}'")]
    InvalidMachineId(String),
    #[error("invalid build request: {0}")]
    InvalidRequest(#[from] SchemaError),
    #[error("provider '{0}' returned neither an artifact nor an error")]
    BadResponse(String),
    #[error("provider failure: {0}")]
    ProviderFailure(#[source] ProviderError),
    #[error("deploy failure: {0}")]
    DeployFailure(#[source] ProviderError),
    #[error("distributed lease for machine '{0}' is busy")]
    LockBusy(String),
    #[error("build of machine '{0}' was cancelled")]
    Cancelled(String),
    #[error("build task panicked: {0}")]
    Panicked(String),
    #[error("store error: {0}")]
    StoreFailure(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Stable snake_case identifier of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyBuilding(_) => "already_building",
            Self::UnknownState(_) => "unknown_state",
            Self::AlreadyInitialized { .. } => "already_initialized",
            Self::MalformedConfiguration(_) => "malformed_configuration",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::InvalidMachineId(_) => "invalid_machine_id",
            Self::InvalidRequest(_) => "invalid_request",
            Self::BadResponse(_) => "bad_response",
            Self::ProviderFailure(_) => "provider_failure",
            Self::DeployFailure(_) => "deploy_failure",
            Self::LockBusy(_) => "lock_busy",
            Self::Cancelled(_) => "cancelled",
            Self::Panicked(_) => "panicked",
            Self::StoreFailure(_) => "store_failure",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }

    /// Whether the error is a request rejection the caller can act on, as
    /// opposed to an internal failure.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::AlreadyBuilding(_)
                | Self::UnknownState(_)
                | Self::AlreadyInitialized { .. }
                | Self::MalformedConfiguration(_)
                | Self::UnknownProvider(_)
                | Self::InvalidMachineId(_)
                | Self::InvalidRequest(_)
        )
    }
}
