use crate::CoreError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use strata_provider::CancelToken;
use strata_schema::{MachineId, RunId};
use tracing::error;

/// Run `f`, turning a panic into [`CoreError::Panicked`].
pub fn run_guarded<T>(f: impl FnOnce() -> Result<T, CoreError>) -> Result<T, CoreError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(CoreError::Panicked(panic_message(payload.as_ref())))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Background unit of work executing one accepted build.
///
/// The task has no return value: its outcome is only observable through the
/// run's eventer and the state store.
pub struct BuildTask {
    run_id: RunId,
    machine_id: MachineId,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

impl BuildTask {
    pub fn spawn(
        run_id: RunId,
        machine_id: MachineId,
        cancel: CancelToken,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<Self, CoreError> {
        let handle = thread::Builder::new()
            .name(run_id.to_string())
            .spawn(work)?;
        Ok(Self {
            run_id,
            machine_id,
            cancel,
            handle,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    /// Ask the provider to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("[{}] build task {} panicked", self.machine_id, self.run_id);
        }
    }
}
