//! Pluggable provider capabilities for strata builds.
//!
//! This crate defines the seams the orchestrator drives: the `Builder` trait
//! that provisions a machine and returns an `Artifact`, the optional
//! `Canceller` that undoes a failed build on a best-effort basis, and the
//! `Deployer` that runs after a successful build. Providers are looked up by
//! name in a `ProviderRegistry`. A deterministic `MockProvider` and
//! `MockDeployer` are included for tests and local runs.

pub mod cancel;
pub mod deploy;
pub mod mock;
pub mod provider;

pub use cancel::CancelToken;
pub use deploy::Deployer;
pub use mock::{CancelCall, MockDeployer, MockOutcome, MockProvider};
pub use provider::{Builder, Canceller, MachineOptions, ProviderHandle, ProviderRegistry};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("provider '{0}' is not available")]
    Unavailable(String),
    #[error("build failed: {0}")]
    BuildFailed(String),
    #[error("deploy failed: {0}")]
    DeployFailed(String),
    #[error("cancel failed: {0}")]
    CancelFailed(String),
    #[error("build was cancelled")]
    Cancelled,
    #[error("build deadline exceeded")]
    DeadlineExceeded,
}
