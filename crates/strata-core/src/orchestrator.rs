use crate::concurrency::{FileLocker, LockManager, Locker, MachineLock, MemoryLocker};
use crate::config::OrchestratorConfig;
use crate::lifecycle::validate_build;
use crate::task::{run_guarded, BuildTask};
use crate::CoreError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strata_provider::{
    CancelToken, Deployer, MachineOptions, MockDeployer, ProviderHandle, ProviderRegistry,
};
use strata_schema::{
    Artifact, BuildData, BuildRequest, BuilderConfig, ControlResult, MachineId, MachineState,
    ProgressEvent, RunId, StorageData,
};
use strata_store::{
    EventHub, EventStream, Eventer, JournalEntry, MachineStore, RunJournal, StateStore,
    StoreError, StoreLayout,
};
use tracing::{debug, error, info, warn};

const BUILD_OPERATION: &str = "build";

/// Outcome of a recovery sweep over the run journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Machines whose `Building` state was rolled back.
    pub reverted: Vec<MachineId>,
    /// Entries dropped from the journal.
    pub removed: usize,
    /// Entries left in place because their run may still be alive.
    pub skipped: usize,
}

/// Source of unique, strictly increasing nanosecond stamps for generated
/// instance names.
#[derive(Debug, Default)]
struct NameClock {
    last: AtomicU64,
}

impl NameClock {
    fn next(&self) -> u64 {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0);
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Everything one accepted build carries from prepare to its finalizer.
struct RunContext {
    run_id: RunId,
    machine_id: MachineId,
    prior_state: MachineState,
    instance_name: String,
    request: BuildRequest,
    config: BuilderConfig,
    provider: ProviderHandle,
    eventer: Eventer,
    cancel: CancelToken,
}

impl RunContext {
    fn options(&self, config: BuilderConfig) -> MachineOptions {
        MachineOptions {
            machine_id: self.machine_id.clone(),
            eventer: self.eventer.reporter(),
            credential: self.request.credential.clone(),
            builder: config,
            current_data: self.request.current_data.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// What the pipeline got as far as producing, for the finalizer.
#[derive(Default)]
struct Progress {
    builder_invoked: bool,
    artifact: Option<Artifact>,
    config: Option<BuilderConfig>,
}

/// Task handles owned by this process. A handle moves to `retired` when a
/// later run of the same machine is accepted before anyone joined it.
#[derive(Default)]
struct Tasks {
    current: HashMap<RunId, BuildTask>,
    retired: Vec<BuildTask>,
}

impl Tasks {
    fn adopt(&mut self, task: BuildTask) {
        if let Some(previous) = self.current.insert(task.run_id().clone(), task) {
            self.retired.push(previous);
        }
    }

    fn is_live(&self, run_id: &RunId) -> bool {
        self.current
            .values()
            .chain(&self.retired)
            .any(|t| t.run_id() == run_id && !t.is_finished())
    }

    fn take_finished(&mut self) -> Vec<BuildTask> {
        let done: Vec<RunId> = self
            .current
            .iter()
            .filter(|(_, t)| t.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        let mut finished: Vec<BuildTask> =
            done.iter().filter_map(|id| self.current.remove(id)).collect();
        let (ended, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired)
            .into_iter()
            .partition(BuildTask::is_finished);
        self.retired = alive;
        finished.extend(ended);
        finished
    }

    fn drain(&mut self) -> Vec<BuildTask> {
        self.current
            .drain()
            .map(|(_, t)| t)
            .chain(self.retired.drain(..))
            .collect()
    }
}

struct Shared {
    store: Arc<dyn StateStore>,
    locks: LockManager,
    events: EventHub,
    journal: Option<RunJournal>,
    deployer: Arc<dyn Deployer>,
    providers: ProviderRegistry,
    config: OrchestratorConfig,
    gate: Mutex<()>,
    clock: NameClock,
    tasks: Mutex<Tasks>,
}

/// Accepts build requests and drives each accepted build to completion on a
/// background task.
///
/// `build` returns as soon as the machine is marked `Building`; the outcome
/// is observable only through the run's eventer and the state store.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Shared>,
}

/// Wires the capabilities an [`Orchestrator`] runs against.
pub struct OrchestratorBuilder {
    store: Arc<dyn StateStore>,
    layout: Option<StoreLayout>,
    locker: Option<Arc<dyn Locker>>,
    events: Option<EventHub>,
    journal: Option<RunJournal>,
    deployer: Arc<dyn Deployer>,
    providers: ProviderRegistry,
    config: OrchestratorConfig,
    recover_on_build: bool,
}

impl OrchestratorBuilder {
    /// Start from an arbitrary state store. Locks, events and runs stay in
    /// this process unless configured otherwise.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            layout: None,
            locker: None,
            events: None,
            journal: None,
            deployer: Arc::new(MockDeployer::new()),
            providers: ProviderRegistry::builtin(),
            config: OrchestratorConfig::default(),
            recover_on_build: true,
        }
    }

    /// Use a store directory for machine records, leases, event logs and the
    /// run journal.
    pub fn persistent(layout: StoreLayout) -> Result<Self, CoreError> {
        layout.initialize()?;
        let journal = RunJournal::new(&layout);
        journal.initialize()?;
        let mut builder = Self::new(Arc::new(MachineStore::new(layout.clone())));
        builder.locker = Some(Arc::new(FileLocker::new(layout.leases_dir())));
        builder.journal = Some(journal);
        builder.layout = Some(layout);
        Ok(builder)
    }

    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    #[must_use]
    pub fn with_deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployer = deployer;
        self
    }

    #[must_use]
    pub fn with_locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = Some(locker);
        self
    }

    #[must_use]
    pub fn with_event_hub(mut self, events: EventHub) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: RunJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Leave the journal alone in [`build`](Self::build); the caller runs
    /// [`Orchestrator::recover`] itself.
    #[must_use]
    pub fn skip_recovery(mut self) -> Self {
        self.recover_on_build = false;
        self
    }

    /// Assemble the orchestrator. When a journal is configured, runs left
    /// unfinished by a previous process are recovered first.
    pub fn build(self) -> Orchestrator {
        let events = match (self.events, self.layout) {
            (Some(events), _) => events,
            (None, Some(layout)) if self.config.persist_events => EventHub::persistent(layout),
            (None, _) => EventHub::in_memory(),
        };
        let locker = self
            .locker
            .unwrap_or_else(|| Arc::new(MemoryLocker::new()));
        let locks = LockManager::new(locker, self.config.lock_wait(), self.config.lock_poll());

        let orchestrator = Orchestrator {
            inner: Arc::new(Shared {
                store: self.store,
                locks,
                events,
                journal: self.journal,
                deployer: self.deployer,
                providers: self.providers,
                config: self.config,
                gate: Mutex::new(()),
                clock: NameClock::default(),
                tasks: Mutex::new(Tasks::default()),
            }),
        };

        if self.recover_on_build && orchestrator.inner.journal.is_some() {
            match orchestrator.recover() {
                Ok(report) if !report.reverted.is_empty() => {
                    info!("recovered {} interrupted build(s)", report.reverted.len());
                }
                Ok(_) => {}
                Err(e) => warn!("run journal recovery failed: {e}"),
            }
        }
        orchestrator
    }
}

impl Orchestrator {
    /// Orchestrator over the store directory at `root` with the built-in
    /// providers.
    pub fn open(root: impl Into<PathBuf>, config: OrchestratorConfig) -> Result<Self, CoreError> {
        Ok(OrchestratorBuilder::persistent(StoreLayout::new(root))?
            .with_config(config)
            .build())
    }

    pub fn builder(store: Arc<dyn StateStore>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    /// Accept a build request.
    ///
    /// Every check runs before the machine state is touched; a rejected
    /// request leaves the machine as it was and starts no task. On success
    /// the machine is `Building` by the time this returns.
    ///
    /// A machine whose previous run in this process has not pushed its
    /// terminal event yet is still building, whatever the stored state says.
    pub fn build(&self, request: BuildRequest) -> Result<ControlResult, CoreError> {
        request.validate()?;
        let machine_id = request.machine_id.clone();
        if !machine_id.is_path_safe() {
            return Err(CoreError::InvalidMachineId(machine_id.into_inner()));
        }
        let mut config = BuilderConfig::from_value(request.builder.clone())
            .map_err(|e| CoreError::MalformedConfiguration(e.to_string()))?;
        let provider = self
            .inner
            .providers
            .select(&request.provider)
            .map_err(|_| CoreError::UnknownProvider(request.provider.clone()))?;

        self.inner.reap();
        let run_id = RunId::derive(BUILD_OPERATION, &machine_id);
        let gate = self.inner.gate();
        if self
            .inner
            .events
            .get(&run_id)
            .is_some_and(|e| !e.is_finished())
        {
            debug!("[{machine_id}] previous run {run_id} is still finalizing");
            return Err(CoreError::AlreadyBuilding(machine_id.into_inner()));
        }

        let state_guard = self.inner.locks.guard(&machine_id)?;
        let prior_state = self.inner.store.state(&machine_id)?;
        validate_build(&machine_id, prior_state)?;

        let eventer = self.inner.events.create(run_id.clone())?;
        if let Some(ref journal) = self.inner.journal {
            let entry = JournalEntry::new(run_id.clone(), machine_id.clone(), prior_state);
            if let Err(e) = journal.begin(&entry) {
                eventer.finish(prior_state, self.inner.config.failure_message.clone());
                return Err(e.into());
            }
        }
        if let Err(e) = self.inner.store.update_state(&machine_id, MachineState::Building) {
            self.inner.commit_journal(&run_id);
            eventer.finish(prior_state, self.inner.config.failure_message.clone());
            return Err(e.into());
        }
        drop(state_guard);
        drop(gate);
        debug!("[{machine_id}] accepted build {run_id} (prior state {prior_state})");

        let instance_name = match config.instance_name() {
            Some(name) => name.to_owned(),
            None => {
                let name = format!("{}-{}", request.username, self.inner.clock.next());
                config.set_instance_name(name.clone());
                name
            }
        };

        let cancel = self
            .inner
            .config
            .build_timeout()
            .map_or_else(CancelToken::new, CancelToken::with_timeout);
        let ctx = RunContext {
            run_id: run_id.clone(),
            machine_id: machine_id.clone(),
            prior_state,
            instance_name,
            request,
            config,
            provider,
            eventer: eventer.clone(),
            cancel: cancel.clone(),
        };

        let shared = Arc::clone(&self.inner);
        let task = match BuildTask::spawn(run_id.clone(), machine_id.clone(), cancel, move || {
            shared.execute(ctx);
        }) {
            Ok(task) => task,
            Err(e) => {
                error!("[{machine_id}] failed to start build task: {e}");
                if let Err(e) = self.inner.restore_state(&machine_id, prior_state) {
                    error!("[{machine_id}] failed to restore state {prior_state}: {e}");
                }
                self.inner.commit_journal(&run_id);
                eventer.finish(prior_state, self.inner.config.failure_message.clone());
                return Err(e);
            }
        };

        self.inner.tasks().adopt(task);

        Ok(ControlResult {
            run_id,
            state: MachineState::Building,
        })
    }

    /// Block until the run's task has ended and return its terminal event.
    pub fn wait(&self, run_id: &RunId) -> Result<ProgressEvent, CoreError> {
        let task = self.inner.tasks().current.remove(run_id);
        if let Some(task) = task {
            task.join();
        }
        let eventer = self
            .inner
            .events
            .get(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        eventer
            .last()
            .filter(ProgressEvent::is_terminal)
            .ok_or_else(|| {
                CoreError::Panicked(format!("run {run_id} ended without a terminal event"))
            })
    }

    /// Wait at most `timeout` for the run to finish.
    pub fn wait_timeout(&self, run_id: &RunId, timeout: Duration) -> Option<ProgressEvent> {
        self.inner.events.get(run_id)?.wait_finished(timeout)
    }

    /// Live stream of a run that belongs to this process.
    pub fn subscribe(&self, run_id: &RunId) -> Option<EventStream> {
        self.inner.events.get(run_id).map(|e| e.subscribe())
    }

    /// Recorded events of a run, from this process or from its event log.
    pub fn events(&self, run_id: &RunId) -> Result<Vec<ProgressEvent>, CoreError> {
        Ok(self.inner.events.history(run_id)?)
    }

    pub fn state(&self, machine_id: &MachineId) -> Result<MachineState, CoreError> {
        Ok(self.inner.store.state(machine_id)?)
    }

    /// Runs whose task has not ended yet.
    pub fn in_flight(&self) -> Vec<RunId> {
        self.inner.reap();
        let tasks = self.inner.tasks();
        let mut runs: Vec<RunId> = tasks
            .current
            .values()
            .chain(&tasks.retired)
            .filter(|t| !t.is_finished())
            .map(|t| t.run_id().clone())
            .collect();
        runs.sort();
        runs.dedup();
        runs
    }

    /// Cancel every in-flight run and wait for all tasks to finalize.
    pub fn shutdown(&self) {
        let tasks = self.inner.tasks().drain();
        if !tasks.is_empty() {
            info!("shutting down: cancelling {} build task(s)", tasks.len());
        }
        for task in &tasks {
            task.cancel();
        }
        for task in tasks {
            task.join();
        }
    }

    /// Restore machines left `Building` by runs that never finished.
    ///
    /// An entry is only acted on when it is older than the grace period, its
    /// run is not alive in this process, and its machine's lease is free.
    pub fn recover(&self) -> Result<RecoveryReport, CoreError> {
        let mut report = RecoveryReport::default();
        let Some(ref journal) = self.inner.journal else {
            return Ok(report);
        };

        for entry in journal.list()? {
            let live = self.inner.tasks().is_live(&entry.run_id);
            if live
                || self.inner.locks.is_locally_held(&entry.machine_id)
                || entry.age_secs() < self.inner.config.recovery_grace_secs
            {
                report.skipped += 1;
                continue;
            }
            let Some(lease) = self.inner.locks.try_lease(&entry.machine_id)? else {
                debug!(
                    "[{}] lease held elsewhere, leaving {} in journal",
                    entry.machine_id, entry.run_id
                );
                report.skipped += 1;
                continue;
            };

            let state_guard = self.inner.locks.guard(&entry.machine_id)?;
            if self.inner.store.state(&entry.machine_id)? == MachineState::Building {
                warn!(
                    "[{}] reverting interrupted build {} to {}",
                    entry.machine_id, entry.run_id, entry.prior_state
                );
                self.inner
                    .store
                    .update_state(&entry.machine_id, entry.prior_state)?;
                report.reverted.push(entry.machine_id.clone());
            }
            state_guard.release()?;
            journal.commit(&entry.run_id)?;
            report.removed += 1;
            lease.release()?;
        }
        Ok(report)
    }
}

impl Shared {
    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join and forget tasks that have ended.
    fn reap(&self) {
        let finished = self.tasks().take_finished();
        for task in finished {
            task.join();
        }
    }

    fn restore_state(&self, machine_id: &MachineId, state: MachineState) -> Result<(), CoreError> {
        let state_guard = self.locks.guard(machine_id)?;
        self.store.update_state(machine_id, state)?;
        state_guard.release()
    }

    /// Write the run's final state. A run that never held the lease only
    /// rolls back its own `Building` and leaves any other state alone.
    fn persist_final_state(
        &self,
        ctx: &RunContext,
        lock: &MachineLock,
        state: MachineState,
    ) -> Result<(), CoreError> {
        let state_guard = self.locks.guard(&ctx.machine_id)?;
        if !lock.has_lease() {
            let current = self.store.state(&ctx.machine_id)?;
            if current != MachineState::Building {
                warn!(
                    "[{}] lease never held and state is {current}, not reverting",
                    ctx.machine_id
                );
                return state_guard.release();
            }
        }
        self.store.update_state(&ctx.machine_id, state)?;
        state_guard.release()
    }

    fn commit_journal(&self, run_id: &RunId) {
        if let Some(ref journal) = self.journal {
            if let Err(e) = journal.commit(run_id) {
                warn!("failed to clear journal entry {run_id}: {e}");
            }
        }
    }

    fn execute(&self, ctx: RunContext) {
        let mut lock = self.locks.lock(&ctx.machine_id);
        let mut progress = Progress::default();
        let outcome = run_guarded(|| self.pipeline(&ctx, &mut lock, &mut progress));
        self.finalize(&ctx, &mut lock, outcome, &progress);
        drop(lock);
    }

    fn pipeline(
        &self,
        ctx: &RunContext,
        lock: &mut MachineLock,
        progress: &mut Progress,
    ) -> Result<StorageData, CoreError> {
        lock.acquire_lease(&ctx.cancel)?;

        ctx.eventer.push(ProgressEvent::progress(
            format!(
                "Building process started. Provider '{}'. MachineId: {}",
                ctx.provider.name(),
                ctx.machine_id
            ),
            MachineState::Building,
            0,
        ));
        info!("[{}] ========== BUILD started ==========", ctx.machine_id);
        info!("[{}] provider      : {}", ctx.machine_id, ctx.provider.name());
        info!("[{}] username      : {}", ctx.machine_id, ctx.request.username);
        info!("[{}] instance name : {}", ctx.machine_id, ctx.instance_name);

        let options = ctx.options(ctx.config.clone());
        progress.builder_invoked = true;
        let mut artifact = ctx
            .provider
            .builder
            .build(&options)
            .map_err(CoreError::ProviderFailure)?
            .ok_or_else(|| CoreError::BadResponse(ctx.provider.name().to_owned()))?;

        artifact.default_username(&ctx.request.username);
        if artifact.instance_name.is_empty() {
            artifact.instance_name.clone_from(&ctx.instance_name);
        }
        let mut config = ctx.config.clone();
        config.set_instance_name(artifact.instance_name.clone());
        progress.artifact = Some(artifact.clone());
        progress.config = Some(config.clone());

        let mut request = ctx.request.clone();
        request.builder = config.to_value();
        let deployed = self
            .deployer
            .deploy(&request, &artifact)
            .map_err(CoreError::DeployFailure)?;

        info!("[{}] username : {}", ctx.machine_id, artifact.username);
        info!("[{}] domain   : {}", ctx.machine_id, artifact.domain_name);
        info!("[{}] ip       : {}", ctx.machine_id, artifact.ip_address);
        info!(
            "[{}] instance : {} ({})",
            ctx.machine_id, artifact.instance_name, artifact.instance_id
        );
        info!("[{}] query    : {}", ctx.machine_id, deployed.query_handle);

        let data = StorageData::build(BuildData::from_artifacts(&artifact, &deployed));
        self.store.update(&ctx.machine_id, &data)?;
        Ok(data)
    }

    /// Runs exactly once per accepted build, whatever the pipeline did.
    fn finalize(
        &self,
        ctx: &RunContext,
        lock: &mut MachineLock,
        outcome: Result<StorageData, CoreError>,
        progress: &Progress,
    ) {
        let final_state = match outcome {
            Ok(_) => MachineState::Running,
            Err(_) => ctx.prior_state,
        };
        if let Err(e) = self.persist_final_state(ctx, lock, final_state) {
            error!(
                "[{}] failed to persist final state {final_state}: {e}",
                ctx.machine_id
            );
        }

        if let Err(ref err) = outcome {
            error!("[{}] building failed: {err}", ctx.machine_id);
            if let Some(ref canceller) = ctx.provider.canceller {
                if progress.builder_invoked {
                    info!("[{}] cancelling build", ctx.machine_id);
                    let config = progress.config.clone().unwrap_or_else(|| ctx.config.clone());
                    let options = ctx.options(config);
                    let cancelled = run_guarded(|| {
                        canceller
                            .cancel(&options, progress.artifact.as_ref())
                            .map_err(CoreError::ProviderFailure)
                    });
                    if let Err(e) = cancelled {
                        warn!("[{}] cancel failed: {e}", ctx.machine_id);
                    }
                }
            }
        }

        if let Err(e) = lock.release_lease() {
            warn!("[{}] failed to release distributed lease: {e}", ctx.machine_id);
        }

        let error = if outcome.is_ok() {
            String::new()
        } else {
            self.config.failure_message.clone()
        };
        self.commit_journal(&ctx.run_id);
        ctx.eventer.finish(final_state, error);
        info!("[{}] ========== BUILD finished ==========", ctx.machine_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::MemoryStore;

    #[test]
    fn name_clock_is_strictly_increasing() {
        let clock = NameClock::default();
        let mut last = 0;
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn in_memory_orchestrator_builds() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::builder(store.clone()).build();
        let result = orchestrator
            .build(BuildRequest::new("m1", "alice", "mock"))
            .unwrap();
        assert_eq!(result.run_id.as_str(), "build-m1");
        assert_eq!(result.state, MachineState::Building);

        let terminal = orchestrator.wait(&result.run_id).unwrap();
        assert_eq!(terminal.status, MachineState::Running);
        assert_eq!(
            store.state_history(&MachineId::new("m1")),
            vec![MachineState::Building, MachineState::Running]
        );
        assert!(orchestrator.in_flight().is_empty());
    }

    #[test]
    fn finished_tasks_are_reaped_without_wait() {
        let orchestrator = Orchestrator::builder(Arc::new(MemoryStore::new())).build();
        for machine in ["m1", "m2", "m3"] {
            let result = orchestrator
                .build(BuildRequest::new(machine, "alice", "mock"))
                .unwrap();
            orchestrator
                .wait_timeout(&result.run_id, Duration::from_secs(5))
                .unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !orchestrator.in_flight().is_empty() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(2));
        }
        orchestrator.in_flight();
        let tasks = orchestrator.inner.tasks();
        assert!(tasks.current.is_empty());
        assert!(tasks.retired.is_empty());
    }

    #[test]
    fn recover_without_journal_is_noop() {
        let orchestrator = Orchestrator::builder(Arc::new(MemoryStore::new())).build();
        assert_eq!(orchestrator.recover().unwrap(), RecoveryReport::default());
    }
}
