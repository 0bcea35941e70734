use crate::CoreError;
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use strata_provider::CancelToken;
use strata_schema::MachineId;
use tracing::{debug, warn};

/// Process-local mutual exclusion keyed by machine id.
#[derive(Debug, Default)]
pub struct LocalLocks {
    held: Mutex<HashSet<MachineId>>,
    released: Condvar,
}

impl LocalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<MachineId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the lock for `machine_id` is free, then take it.
    pub fn acquire(self: &Arc<Self>, machine_id: &MachineId) -> LocalGuard {
        let mut held = self.held();
        while held.contains(machine_id) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(machine_id.clone());
        LocalGuard {
            locks: Arc::clone(self),
            machine_id: machine_id.clone(),
        }
    }

    pub fn is_held(&self, machine_id: &MachineId) -> bool {
        self.held().contains(machine_id)
    }
}

pub struct LocalGuard {
    locks: Arc<LocalLocks>,
    machine_id: MachineId,
}

impl Lease for LocalGuard {
    fn release(self: Box<Self>) -> Result<(), CoreError> {
        Ok(())
    }
}

impl Drop for LocalGuard {
    fn drop(&mut self) {
        self.locks.held().remove(&self.machine_id);
        self.locks.released.notify_all();
    }
}

/// A held distributed lease. Dropping it releases the lease as well.
pub trait Lease: Send {
    fn release(self: Box<Self>) -> Result<(), CoreError>;
}

/// Cross-process lease authority.
pub trait Locker: Send + Sync {
    /// Take the lease for `machine_id` if nobody holds it.
    fn try_lock(&self, machine_id: &MachineId) -> Result<Option<Box<dyn Lease>>, CoreError>;

    /// Block until the state guard for `machine_id` is free and take it.
    ///
    /// The guard is separate from the lease and only held around short
    /// read-check-write sequences on the machine state, so every holder of
    /// the same locker sees those sequences as atomic.
    fn guard(&self, machine_id: &MachineId) -> Result<Box<dyn Lease>, CoreError>;
}

/// Leases backed by exclusive advisory locks on `<dir>/<machine-id>.lock`.
///
/// The kernel drops the lock when the holding process exits, so a crashed
/// orchestrator never leaves a lease behind.
#[derive(Debug, Clone)]
pub struct FileLocker {
    dir: PathBuf,
}

impl FileLocker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn lock_path(&self, machine_id: &MachineId) -> PathBuf {
        self.dir.join(format!("{machine_id}.lock"))
    }

    fn guard_path(&self, machine_id: &MachineId) -> PathBuf {
        self.dir.join(format!("{machine_id}.guard"))
    }

    fn open(&self, machine_id: &MachineId, path: PathBuf) -> Result<File, CoreError> {
        if !machine_id.is_path_safe() {
            return Err(CoreError::InvalidMachineId(machine_id.to_string()));
        }
        std::fs::create_dir_all(&self.dir)?;
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    }
}

impl Locker for FileLocker {
    fn try_lock(&self, machine_id: &MachineId) -> Result<Option<Box<dyn Lease>>, CoreError> {
        let file = self.open(machine_id, self.lock_path(machine_id))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Box::new(FileLease {
                file: Some(file),
                machine_id: machine_id.clone(),
            }))),
            Err(_) => Ok(None),
        }
    }

    fn guard(&self, machine_id: &MachineId) -> Result<Box<dyn Lease>, CoreError> {
        let file = self.open(machine_id, self.guard_path(machine_id))?;
        file.lock_exclusive()?;
        Ok(Box::new(FileLease {
            file: Some(file),
            machine_id: machine_id.clone(),
        }))
    }
}

struct FileLease {
    file: Option<File>,
    machine_id: MachineId,
}

impl Lease for FileLease {
    fn release(mut self: Box<Self>) -> Result<(), CoreError> {
        if let Some(file) = self.file.take() {
            file.unlock()?;
        }
        Ok(())
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                warn!("[{}] failed to unlock lease file: {e}", self.machine_id);
            }
        }
    }
}

/// Leases that only exclude holders within this process.
#[derive(Debug, Clone, Default)]
pub struct MemoryLocker {
    held: Arc<Mutex<HashSet<MachineId>>>,
    guards: Arc<LocalLocks>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, machine_id: &MachineId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(machine_id)
    }
}

impl Locker for MemoryLocker {
    fn try_lock(&self, machine_id: &MachineId) -> Result<Option<Box<dyn Lease>>, CoreError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(machine_id.clone()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLease {
            held: Arc::clone(&self.held),
            machine_id: Some(machine_id.clone()),
        })))
    }

    fn guard(&self, machine_id: &MachineId) -> Result<Box<dyn Lease>, CoreError> {
        Ok(Box::new(self.guards.acquire(machine_id)))
    }
}

struct MemoryLease {
    held: Arc<Mutex<HashSet<MachineId>>>,
    machine_id: Option<MachineId>,
}

impl MemoryLease {
    fn unlock(&mut self) {
        if let Some(id) = self.machine_id.take() {
            self.held
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        }
    }
}

impl Lease for MemoryLease {
    fn release(mut self: Box<Self>) -> Result<(), CoreError> {
        self.unlock();
        Ok(())
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Two-layer lock for one machine: a process-local mutex and a distributed
/// lease.
pub struct LockManager {
    local: Arc<LocalLocks>,
    distributed: Arc<dyn Locker>,
    wait: Duration,
    poll: Duration,
}

impl LockManager {
    pub fn new(distributed: Arc<dyn Locker>, wait: Duration, poll: Duration) -> Self {
        Self {
            local: Arc::new(LocalLocks::new()),
            distributed,
            wait,
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    /// Take the local layer, blocking while another run of the same machine
    /// holds it. The lease is acquired separately through
    /// [`MachineLock::acquire_lease`].
    pub fn lock(&self, machine_id: &MachineId) -> MachineLock {
        let local = self.local.acquire(machine_id);
        debug!("[{machine_id}] local lock acquired");
        MachineLock {
            lease: None,
            machine_id: machine_id.clone(),
            distributed: Arc::clone(&self.distributed),
            wait: self.wait,
            poll: self.poll,
            _local: local,
        }
    }

    /// One non-blocking attempt at the distributed layer only.
    pub fn try_lease(&self, machine_id: &MachineId) -> Result<Option<Box<dyn Lease>>, CoreError> {
        self.distributed.try_lock(machine_id)
    }

    /// Take the cross-process state guard for `machine_id`.
    pub fn guard(&self, machine_id: &MachineId) -> Result<Box<dyn Lease>, CoreError> {
        self.distributed.guard(machine_id)
    }

    pub fn is_locally_held(&self, machine_id: &MachineId) -> bool {
        self.local.is_held(machine_id)
    }
}

/// Both lock layers for one run. The lease is released at most once, either
/// through [`release_lease`](Self::release_lease) or on drop; the local layer
/// is released on drop.
pub struct MachineLock {
    lease: Option<Box<dyn Lease>>,
    machine_id: MachineId,
    distributed: Arc<dyn Locker>,
    wait: Duration,
    poll: Duration,
    _local: LocalGuard,
}

impl MachineLock {
    /// Poll the distributed layer until the lease is taken, the configured
    /// wait elapses, or `cancel` fires.
    pub fn acquire_lease(&mut self, cancel: &CancelToken) -> Result<(), CoreError> {
        if self.lease.is_some() {
            return Ok(());
        }
        let deadline = Instant::now() + self.wait;
        loop {
            if let Some(lease) = self.distributed.try_lock(&self.machine_id)? {
                debug!("[{}] distributed lease acquired", self.machine_id);
                self.lease = Some(lease);
                return Ok(());
            }
            if cancel.check().is_err() {
                return Err(CoreError::Cancelled(self.machine_id.to_string()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CoreError::LockBusy(self.machine_id.to_string()));
            }
            std::thread::sleep(self.poll.min(deadline - now));
        }
    }

    pub fn has_lease(&self) -> bool {
        self.lease.is_some()
    }

    pub fn release_lease(&mut self) -> Result<(), CoreError> {
        match self.lease.take() {
            Some(lease) => {
                debug!("[{}] distributed lease released", self.machine_id);
                lease.release()
            }
            None => Ok(()),
        }
    }
}

impl Drop for MachineLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_lease() {
            warn!("[{}] failed to release distributed lease: {e}", self.machine_id);
        }
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, cancelling running builds...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
