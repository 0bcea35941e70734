use crate::cancel::CancelToken;
use crate::ProviderError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_schema::{Artifact, BuilderConfig, MachineId};
use strata_store::ProgressReporter;

/// Normalized input handed to a provider.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub machine_id: MachineId,
    pub eventer: ProgressReporter,
    pub credential: Option<String>,
    pub builder: BuilderConfig,
    /// Result data carried over from earlier runs, if any.
    pub current_data: Option<Value>,
    pub cancel: CancelToken,
}

pub trait Builder: Send + Sync {
    fn name(&self) -> &str;

    /// Provision the machine described by `options`.
    ///
    /// Called at most once per run and never retried. `Ok(None)` is a
    /// protocol violation that the orchestrator reports as a bad response.
    fn build(&self, options: &MachineOptions) -> Result<Option<Artifact>, ProviderError>;
}

pub trait Canceller: Send + Sync {
    /// Undo whatever a failed run created. `artifact` is `None` when the
    /// builder itself failed.
    fn cancel(
        &self,
        options: &MachineOptions,
        artifact: Option<&Artifact>,
    ) -> Result<(), ProviderError>;
}

/// A builder together with its optional compensation.
#[derive(Clone)]
pub struct ProviderHandle {
    pub builder: Arc<dyn Builder>,
    pub canceller: Option<Arc<dyn Canceller>>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("name", &self.builder.name())
            .field("canceller", &self.canceller.is_some())
            .finish()
    }
}

impl ProviderHandle {
    pub fn new(builder: Arc<dyn Builder>) -> Self {
        Self {
            builder,
            canceller: None,
        }
    }

    #[must_use]
    pub fn with_canceller(mut self, canceller: Arc<dyn Canceller>) -> Self {
        self.canceller = Some(canceller);
        self
    }

    pub fn name(&self) -> &str {
        self.builder.name()
    }
}

/// Providers available to an orchestrator, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderHandle>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers (`mock`).
    pub fn builtin() -> Self {
        let mock = Arc::new(crate::mock::MockProvider::new());
        let mut registry = Self::new();
        registry.register(ProviderHandle::new(mock.clone()).with_canceller(mock));
        registry
    }

    pub fn register(&mut self, handle: ProviderHandle) {
        self.providers.insert(handle.name().to_owned(), handle);
    }

    #[must_use]
    pub fn with(mut self, handle: ProviderHandle) -> Self {
        self.register(handle);
        self
    }

    pub fn select(&self, name: &str) -> Result<ProviderHandle, ProviderError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::Unavailable(name.to_owned()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}
