//! Progress channels for build runs.
//!
//! An [`Eventer`] is the append-only, ordered and finite stream of
//! [`ProgressEvent`]s belonging to one run. Any number of non-terminal events
//! may be pushed; [`Eventer::finish`] appends the single terminal record
//! (percentage 100) and closes the stream. Subscribers read it lazily through
//! [`EventStream`], which blocks until the next record or the end of the run.

use crate::layout::StoreLayout;
use crate::StoreError;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use strata_schema::{MachineState, ProgressEvent, RunId, TERMINAL_PERCENTAGE};
use tracing::{debug, warn};

struct Log {
    events: Vec<ProgressEvent>,
    finished: bool,
    file: Option<File>,
}

struct Shared {
    id: RunId,
    log: Mutex<Log>,
    changed: Condvar,
}

/// Handle to the progress stream of one run. Clones share the same stream.
#[derive(Clone)]
pub struct Eventer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Eventer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eventer")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl Eventer {
    /// An eventer that keeps its records in memory only.
    pub fn new(id: RunId) -> Self {
        Self::build(id, None)
    }

    /// An eventer that also appends every record to `path` as JSON lines.
    /// An existing log at `path` is unlinked first, so a writer still holding
    /// it keeps writing to the old file and never into the new one.
    pub fn with_log_file(id: RunId, path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::build(id, Some(file)))
    }

    fn build(id: RunId, file: Option<File>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                log: Mutex::new(Log {
                    events: Vec::new(),
                    finished: false,
                    file,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> &RunId {
        &self.shared.id
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.shared.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, log: &mut Log, event: ProgressEvent) {
        if let Some(file) = log.file.as_mut() {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!("[{}] failed to append to event log: {e}", self.shared.id);
                    }
                }
                Err(e) => warn!("[{}] failed to encode progress event: {e}", self.shared.id),
            }
        }
        log.events.push(event);
    }

    /// Append a non-terminal event. Percentages are clamped below 100.
    /// Returns `false` when the run has already finished.
    pub fn push(&self, mut event: ProgressEvent) -> bool {
        event.percentage = event.percentage.min(TERMINAL_PERCENTAGE - 1);
        let mut log = self.lock();
        if log.finished {
            warn!(
                "[{}] dropping progress event pushed after the run finished",
                self.shared.id
            );
            return false;
        }
        debug!(
            "[{}] progress {}% {}: {}",
            self.shared.id, event.percentage, event.status, event.message
        );
        self.append(&mut log, event);
        drop(log);
        self.shared.changed.notify_all();
        true
    }

    /// Append the terminal event and close the stream. Only the first call
    /// has an effect; it returns `true`.
    pub fn finish(&self, status: MachineState, error: impl Into<String>) -> bool {
        let mut log = self.lock();
        if log.finished {
            warn!("[{}] run already finished, ignoring second terminal event", self.shared.id);
            return false;
        }
        self.append(&mut log, ProgressEvent::terminal(status, error));
        log.finished = true;
        if let Some(file) = log.file.take() {
            if let Err(e) = file.sync_all() {
                warn!("[{}] failed to sync event log: {e}", self.shared.id);
            }
        }
        drop(log);
        self.shared.changed.notify_all();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.lock().events.clone()
    }

    /// Records from position `offset` onwards, for polling consumers.
    pub fn events_since(&self, offset: usize) -> Vec<ProgressEvent> {
        self.lock().events.iter().skip(offset).cloned().collect()
    }

    pub fn last(&self) -> Option<ProgressEvent> {
        self.lock().events.last().cloned()
    }

    /// Block until the run finishes or `timeout` elapses. Returns the
    /// terminal event when the run finished in time.
    pub fn wait_finished(&self, timeout: Duration) -> Option<ProgressEvent> {
        let deadline = Instant::now() + timeout;
        let mut log = self.lock();
        while !log.finished {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            log = self
                .shared
                .changed
                .wait_timeout(log, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        log.events.last().cloned()
    }

    /// A lazy stream over all records of the run, starting from the first.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            eventer: self.clone(),
            offset: 0,
        }
    }

    /// A push-only view handed to providers, which must not end the run.
    pub fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            eventer: self.clone(),
        }
    }
}

/// Ordered, finite iterator over the records of one run.
pub struct EventStream {
    eventer: Eventer,
    offset: usize,
}

impl EventStream {
    /// Like `next()`, but gives up after `timeout`.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<ProgressEvent> {
        let deadline = Instant::now() + timeout;
        let mut log = self.eventer.lock();
        loop {
            if let Some(event) = log.events.get(self.offset) {
                self.offset += 1;
                return Some(event.clone());
            }
            if log.finished {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            log = self
                .eventer
                .shared
                .changed
                .wait_timeout(log, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Iterator for EventStream {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        let mut log = self.eventer.lock();
        loop {
            if let Some(event) = log.events.get(self.offset) {
                self.offset += 1;
                return Some(event.clone());
            }
            if log.finished {
                return None;
            }
            log = self
                .eventer
                .shared
                .changed
                .wait(log)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Push-only handle on a run's [`Eventer`].
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    eventer: Eventer,
}

impl ProgressReporter {
    pub fn id(&self) -> &RunId {
        self.eventer.id()
    }

    pub fn push(&self, message: impl Into<String>, status: MachineState, percentage: u8) -> bool {
        self.eventer
            .push(ProgressEvent::progress(message, status, percentage))
    }
}

/// Read a persisted event log written by [`Eventer::with_log_file`].
pub fn read_event_log(path: &Path) -> Result<Vec<ProgressEvent>, StoreError> {
    let file = File::open(path)?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}

/// Registry of the eventers of all runs known to this process.
pub struct EventHub {
    layout: Option<StoreLayout>,
    eventers: Mutex<HashMap<RunId, Eventer>>,
}

impl EventHub {
    pub fn in_memory() -> Self {
        Self {
            layout: None,
            eventers: Mutex::new(HashMap::new()),
        }
    }

    /// A hub that mirrors every run into `store/events/<run-id>.jsonl`.
    pub fn persistent(layout: StoreLayout) -> Self {
        Self {
            layout: Some(layout),
            eventers: Mutex::new(HashMap::new()),
        }
    }

    fn eventers(&self) -> MutexGuard<'_, HashMap<RunId, Eventer>> {
        self.eventers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a fresh eventer for `run_id`, replacing any earlier run that
    /// used the same id.
    pub fn create(&self, run_id: RunId) -> Result<Eventer, StoreError> {
        let eventer = match self.layout {
            Some(ref layout) => {
                if !run_id.is_path_safe() {
                    return Err(StoreError::InvalidId(run_id.into_inner()));
                }
                let path = layout.event_log_path(&run_id);
                Eventer::with_log_file(run_id.clone(), &path)?
            }
            None => Eventer::new(run_id.clone()),
        };
        self.eventers().insert(run_id, eventer.clone());
        Ok(eventer)
    }

    pub fn get(&self, run_id: &RunId) -> Option<Eventer> {
        self.eventers().get(run_id).cloned()
    }

    /// All records of a run: from memory when the run belongs to this
    /// process, otherwise from its persisted log.
    pub fn history(&self, run_id: &RunId) -> Result<Vec<ProgressEvent>, StoreError> {
        if let Some(eventer) = self.get(run_id) {
            return Ok(eventer.events());
        }
        match self.layout {
            Some(ref layout) if run_id.is_path_safe() => {
                let path = layout.event_log_path(run_id);
                if path.exists() {
                    read_event_log(&path)
                } else {
                    Err(StoreError::RunNotFound(run_id.to_string()))
                }
            }
            _ => Err(StoreError::RunNotFound(run_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_id() -> RunId {
        RunId::new("build-m1")
    }

    #[test]
    fn stream_ends_after_terminal_event() {
        let eventer = Eventer::new(run_id());
        eventer.push(ProgressEvent::progress("start", MachineState::Building, 0));
        eventer.push(ProgressEvent::progress("half", MachineState::Building, 50));
        assert!(eventer.finish(MachineState::Running, ""));

        let events: Vec<_> = eventer.subscribe().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].percentage, 50);
        assert!(events[2].is_terminal());
        assert_eq!(events[2].status, MachineState::Running);
    }

    #[test]
    fn only_one_terminal_event() {
        let eventer = Eventer::new(run_id());
        assert!(eventer.finish(MachineState::Running, ""));
        assert!(!eventer.finish(MachineState::Terminated, "late"));
        assert!(!eventer.push(ProgressEvent::progress("late", MachineState::Building, 10)));

        let events = eventer.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn push_cannot_forge_terminal_event() {
        let eventer = Eventer::new(run_id());
        eventer.push(ProgressEvent::terminal(MachineState::Running, ""));
        assert!(!eventer.is_finished());
        assert_eq!(eventer.events()[0].percentage, 99);
    }

    #[test]
    fn subscriber_blocks_until_records_arrive() {
        let eventer = Eventer::new(run_id());
        let consumer = {
            let eventer = eventer.clone();
            thread::spawn(move || eventer.subscribe().collect::<Vec<_>>())
        };

        let reporter = eventer.reporter();
        reporter.push("provisioning", MachineState::Building, 30);
        thread::sleep(Duration::from_millis(20));
        eventer.finish(MachineState::Terminated, "Building failed.");

        let events = consumer.join().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "provisioning");
        assert!(events[1].is_error());
    }

    #[test]
    fn wait_finished_times_out_on_open_run() {
        let eventer = Eventer::new(run_id());
        assert!(eventer.wait_finished(Duration::from_millis(10)).is_none());
        eventer.finish(MachineState::Running, "");
        let last = eventer.wait_finished(Duration::from_millis(10)).unwrap();
        assert!(last.is_terminal());
    }

    #[test]
    fn next_timeout_returns_none_while_idle() {
        let eventer = Eventer::new(run_id());
        let mut stream = eventer.subscribe();
        assert!(stream.next_timeout(Duration::from_millis(10)).is_none());
        eventer.push(ProgressEvent::progress("one", MachineState::Building, 1));
        assert_eq!(
            stream.next_timeout(Duration::from_millis(10)).unwrap().message,
            "one"
        );
    }

    #[test]
    fn events_since_supports_polling() {
        let eventer = Eventer::new(run_id());
        eventer.push(ProgressEvent::progress("a", MachineState::Building, 1));
        eventer.push(ProgressEvent::progress("b", MachineState::Building, 2));
        let tail = eventer.events_since(1);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message, "b");
        assert!(eventer.events_since(5).is_empty());
    }

    #[test]
    fn persistent_hub_writes_and_reads_logs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();

        let hub = EventHub::persistent(layout.clone());
        let eventer = hub.create(run_id()).unwrap();
        eventer.push(ProgressEvent::progress("start", MachineState::Building, 0));
        eventer.finish(MachineState::Running, "");

        let from_disk = read_event_log(&layout.event_log_path(&run_id())).unwrap();
        assert_eq!(from_disk, eventer.events());

        // A second hub (another process) only sees the log on disk.
        let other = EventHub::persistent(layout);
        assert_eq!(other.history(&run_id()).unwrap().len(), 2);
    }

    #[test]
    fn create_replaces_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let hub = EventHub::persistent(layout.clone());

        let first = hub.create(run_id()).unwrap();
        first.push(ProgressEvent::progress("old", MachineState::Building, 0));
        first.finish(MachineState::Terminated, "failed");

        let second = hub.create(run_id()).unwrap();
        assert!(second.events().is_empty());
        assert!(hub.history(&run_id()).unwrap().is_empty());
        assert!(read_event_log(&layout.event_log_path(&run_id()))
            .unwrap()
            .is_empty());
        // Holders of the old handle still see the old run.
        assert_eq!(first.events().len(), 2);
    }

    #[test]
    fn late_writes_of_replaced_run_leave_new_log_intact() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let hub = EventHub::persistent(layout.clone());

        let first = hub.create(run_id()).unwrap();
        for i in 0..20 {
            first.push(ProgressEvent::progress(format!("old {i}"), MachineState::Building, 5));
        }
        let second = hub.create(run_id()).unwrap();
        first.finish(MachineState::NotInitialized, "failed");
        second.push(ProgressEvent::progress("new", MachineState::Building, 0));
        second.finish(MachineState::Running, "");

        let path = layout.event_log_path(&run_id());
        assert!(!fs::read(&path).unwrap().contains(&0));
        let from_disk = read_event_log(&path).unwrap();
        assert_eq!(from_disk, second.events());
        assert_eq!(from_disk.len(), 2);

        let other = EventHub::persistent(layout);
        assert_eq!(other.history(&run_id()).unwrap(), second.events());
    }

    #[test]
    fn unknown_run_is_not_found() {
        let hub = EventHub::in_memory();
        assert!(matches!(
            hub.history(&RunId::new("build-nope")),
            Err(StoreError::RunNotFound(_))
        ));
    }
}
