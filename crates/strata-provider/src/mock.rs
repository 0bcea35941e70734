//! Deterministic in-process provider for tests and local runs.
//!
//! Behaviour can be fixed when constructing the mock, or chosen per request
//! through builder options: `mockOutcome` (`"succeed"`, `"empty"`,
//! `"fail"`), `mockUsername` and `mockRename`. The deploy step reads
//! `mockDeploy = "fail"` from the raw request.

use crate::deploy::Deployer;
use crate::provider::{Builder, Canceller, MachineOptions};
use crate::ProviderError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use strata_schema::{Artifact, BuildRequest, DeployArtifact, MachineId, MachineState};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Succeed,
    /// Return neither an artifact nor an error.
    Empty,
    Fail(String),
}

impl MockOutcome {
    fn from_option(value: &str) -> Option<Self> {
        match value {
            "succeed" => Some(Self::Succeed),
            "empty" => Some(Self::Empty),
            "fail" => Some(Self::Fail("mock provider failure".to_owned())),
            _ => None,
        }
    }
}

/// A cancel call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelCall {
    pub machine_id: MachineId,
    pub artifact: Option<Artifact>,
}

pub struct MockProvider {
    outcome: MockOutcome,
    username: Option<String>,
    rename: Option<String>,
    step_delay: Duration,
    steps: u8,
    fail_cancel: bool,
    instances: Mutex<HashMap<MachineId, Artifact>>,
    seen: Mutex<Vec<MachineOptions>>,
    cancels: Mutex<Vec<CancelCall>>,
    builds: AtomicUsize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            outcome: MockOutcome::Succeed,
            username: None,
            rename: None,
            step_delay: Duration::ZERO,
            steps: 2,
            fail_cancel: false,
            instances: Mutex::new(HashMap::new()),
            seen: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            builds: AtomicUsize::new(0),
        }
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: MockOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Set the username the provider reports in its artifact.
    #[must_use]
    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_owned());
        self
    }

    /// Create the instance under a different name than the one requested.
    #[must_use]
    pub fn with_rename(mut self, name: &str) -> Self {
        self.rename = Some(name.to_owned());
        self
    }

    /// Sleep this long before each progress step.
    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    #[must_use]
    pub fn with_failing_cancel(mut self) -> Self {
        self.fail_cancel = true;
        self
    }

    /// Number of times `build` was called.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Options of every `build` call, in order.
    pub fn seen_options(&self) -> Vec<MachineOptions> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn cancel_calls(&self) -> Vec<CancelCall> {
        self.cancels.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Whether an instance created for `machine_id` still exists.
    pub fn is_provisioned(&self, machine_id: &MachineId) -> bool {
        self.instances
            .lock()
            .map(|i| i.contains_key(machine_id))
            .unwrap_or(false)
    }

    fn outcome_for(&self, options: &MachineOptions) -> MockOutcome {
        options
            .builder
            .get_str("mockOutcome")
            .and_then(MockOutcome::from_option)
            .unwrap_or_else(|| self.outcome.clone())
    }

    fn artifact_for(&self, options: &MachineOptions) -> Artifact {
        let instance_name = options
            .builder
            .get_str("mockRename")
            .map(str::to_owned)
            .or_else(|| self.rename.clone())
            .or_else(|| options.builder.instance_name().map(str::to_owned))
            .unwrap_or_else(|| options.machine_id.to_string());
        let username = options
            .builder
            .get_str("mockUsername")
            .map(str::to_owned)
            .or_else(|| self.username.clone())
            .unwrap_or_default();

        let digest = blake3::hash(format!("{}:{instance_name}", options.machine_id).as_bytes());
        let bytes = digest.as_bytes();
        Artifact {
            instance_id: format!("mock-{}", &digest.to_hex()[..12]),
            ip_address: format!("10.{}.{}.{}", bytes[0], bytes[1], bytes[2].max(1)),
            domain_name: format!("{instance_name}.mock.strata.local"),
            instance_name,
            username,
            query_handle: String::new(),
        }
    }
}

impl Builder for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn build(&self, options: &MachineOptions) -> Result<Option<Artifact>, ProviderError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(options.clone());
        }

        let steps = self.steps.max(1);
        for step in 1..=steps {
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
            options.cancel.check()?;
            let percentage = 10 + (80 * u32::from(step) / u32::from(steps)) as u8;
            options.eventer.push(
                format!("mock provisioning step {step}/{steps}"),
                MachineState::Building,
                percentage,
            );
        }

        match self.outcome_for(options) {
            MockOutcome::Succeed => {
                let artifact = self.artifact_for(options);
                debug!(
                    "[{}] mock instance {} created",
                    options.machine_id, artifact.instance_id
                );
                self.instances
                    .lock()
                    .map_err(|e| ProviderError::BuildFailed(format!("mutex poisoned: {e}")))?
                    .insert(options.machine_id.clone(), artifact.clone());
                Ok(Some(artifact))
            }
            MockOutcome::Empty => Ok(None),
            MockOutcome::Fail(msg) => Err(ProviderError::BuildFailed(msg)),
        }
    }
}

impl Canceller for MockProvider {
    fn cancel(
        &self,
        options: &MachineOptions,
        artifact: Option<&Artifact>,
    ) -> Result<(), ProviderError> {
        self.cancels
            .lock()
            .map_err(|e| ProviderError::CancelFailed(format!("mutex poisoned: {e}")))?
            .push(CancelCall {
                machine_id: options.machine_id.clone(),
                artifact: artifact.cloned(),
            });
        if self.fail_cancel {
            return Err(ProviderError::CancelFailed(
                "mock canceller refused".to_owned(),
            ));
        }
        self.instances
            .lock()
            .map_err(|e| ProviderError::CancelFailed(format!("mutex poisoned: {e}")))?
            .remove(&options.machine_id);
        Ok(())
    }
}

/// Deploy step that derives a query handle from the artifact.
#[derive(Default)]
pub struct MockDeployer {
    failure: Option<String>,
    calls: AtomicUsize,
}

impl MockDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(msg: &str) -> Self {
        Self {
            failure: Some(msg.to_owned()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Deployer for MockDeployer {
    fn deploy(
        &self,
        request: &BuildRequest,
        artifact: &Artifact,
    ) -> Result<DeployArtifact, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref msg) = self.failure {
            return Err(ProviderError::DeployFailed(msg.clone()));
        }
        if request.builder.get("mockDeploy").and_then(|v| v.as_str()) == Some("fail") {
            return Err(ProviderError::DeployFailed(
                "mock deploy requested to fail".to_owned(),
            ));
        }
        Ok(DeployArtifact {
            query_handle: format!(
                "/{}/{}/{}",
                artifact.username, artifact.instance_name, artifact.instance_id
            ),
        })
    }
}
