//! Execution registry.
//!
//! Owns every [`ExecutionRecord`] and drives it through
//! `Pending -> Running -> {Completed | Failed | Killed}`. Each spawned
//! execution gets two tasks: a reader that feeds stdout through a
//! [`LineStreamParser`] and appends the resulting events, and a monitor that
//! owns the child process and applies the terminal transition.
//!
//! All state lives behind one mutex. The concurrency ceiling is checked and
//! the new record inserted under the same guard, and every terminal
//! transition re-checks the current status so that a natural exit racing a
//! kill or timeout produces exactly one winner.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use corral_core::config::{RegistryConfig, StreamConfig};
use corral_core::{EventSink, LineStreamParser, StreamError, StreamEvent};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout};
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::process::{spawn_child, spawn_stderr_logger, terminate_group, terminate_process};
use super::record::{
    ExecutionParams, ExecutionRecord, ExecutionStatus, ProcessInfo, RegistryChange,
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Concurrency limit reached ({running}/{max} executions running)")]
    ConcurrencyLimitExceeded { running: usize, max: usize },

    #[error("Execution not found: {session_id}")]
    ExecutionNotFound { session_id: String },

    #[error("Execution {session_id} is {status}; kill it before cleanup")]
    InvalidLifecycleTransition {
        session_id: String,
        status: ExecutionStatus,
    },

    #[error("Execution already exists: {session_id}")]
    SessionExists { session_id: String },

    #[error("Failed to spawn execution {session_id}: {reason}")]
    SpawnFailed { session_id: String, reason: String },

    #[error("Invalid registry configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Tracks every execution and enforces the concurrency ceiling.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ExecutionRegistry {
    shared: Arc<Shared>,
}

struct Shared {
    executions: Mutex<HashMap<String, Entry>>,
    max_concurrent: AtomicUsize,
    max_history: usize,
    default_timeout: Option<Duration>,
    terminate_grace: Duration,
    max_buffer_bytes: usize,
    next_seq: AtomicU64,
    changes_tx: broadcast::Sender<RegistryChange>,
}

struct Entry {
    record: ExecutionRecord,
    /// Creation order, used to pick the oldest records when trimming.
    seq: u64,
    /// Wakes the monitor task to terminate the child. Taken on first kill.
    kill_tx: Option<oneshot::Sender<()>>,
    events_tx: broadcast::Sender<StreamEvent>,
}

impl ExecutionRegistry {
    /// Create a registry from resolved configuration.
    pub fn new(registry: &RegistryConfig, stream: &StreamConfig) -> Result<Self, RegistryError> {
        if registry.max_concurrent == 0 {
            return Err(RegistryError::InvalidConfig {
                reason: "max_concurrent must be at least 1".to_string(),
            });
        }
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                executions: Mutex::new(HashMap::new()),
                max_concurrent: AtomicUsize::new(registry.max_concurrent),
                max_history: registry.max_history,
                default_timeout: registry.timeout_secs.map(Duration::from_secs),
                terminate_grace: Duration::from_secs(registry.terminate_grace_secs),
                max_buffer_bytes: stream.max_buffer_bytes,
                next_seq: AtomicU64::new(0),
                changes_tx,
            }),
        })
    }

    /// Create a registry with default settings and the given ceiling.
    pub fn with_max_concurrent(max_concurrent: usize) -> Result<Self, RegistryError> {
        let registry = RegistryConfig {
            max_concurrent,
            ..RegistryConfig::default()
        };
        Self::new(&registry, &StreamConfig::default())
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent.load(Ordering::SeqCst)
    }

    /// Change the ceiling. Already-running executions are never affected.
    pub fn set_max_concurrent(&self, max_concurrent: usize) -> Result<(), RegistryError> {
        if max_concurrent == 0 {
            return Err(RegistryError::InvalidConfig {
                reason: "max_concurrent must be at least 1".to_string(),
            });
        }
        self.shared
            .max_concurrent
            .store(max_concurrent, Ordering::SeqCst);
        info!(max_concurrent, "Updated concurrency limit");
        Ok(())
    }

    /// Start tracking an execution and spawn its subprocess.
    ///
    /// Fails immediately when the ceiling is reached; nothing is queued and no
    /// record is created. When `params.command` is `None` the record is
    /// attached without a subprocess and stays `Pending`.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn start_execution(&self, params: ExecutionParams) -> Result<String, RegistryError> {
        let session_id = params
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut executions = self.shared.executions.lock().await;

        let running = count_running(&executions);
        let max = self.max_concurrent();
        if running >= max {
            warn!(session_id = %session_id, running, max, "Rejecting execution, concurrency limit reached");
            return Err(RegistryError::ConcurrencyLimitExceeded { running, max });
        }
        if executions.contains_key(&session_id) {
            return Err(RegistryError::SessionExists { session_id });
        }

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut entry = Entry {
            record: ExecutionRecord::pending(
                session_id.clone(),
                params.working_directory.clone(),
                params.query,
            ),
            seq: self.shared.next_seq.fetch_add(1, Ordering::SeqCst),
            kill_tx: None,
            events_tx,
        };
        self.shared.notify(RegistryChange::Created {
            session_id: session_id.clone(),
        });

        let Some(command) = params.command else {
            info!(session_id = %session_id, "Attached execution without subprocess");
            executions.insert(session_id.clone(), entry);
            return Ok(session_id);
        };

        let mut child = match spawn_child(&command, &params.working_directory) {
            Ok(child) => child,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Failed to spawn subprocess");
                let reason = e.to_string();
                entry.record.error = Some(reason.clone());
                self.shared.transition(&mut entry, ExecutionStatus::Failed);
                executions.insert(session_id.clone(), entry);
                return Err(RegistryError::SpawnFailed { session_id, reason });
            }
        };

        let pid = child.id();
        let reader = child.stdout.take().map(|stdout| {
            tokio::spawn(read_stdout(
                Arc::clone(&self.shared),
                session_id.clone(),
                stdout,
            ))
        });
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(session_id.clone(), stderr);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        entry.kill_tx = Some(kill_tx);
        entry.record.process = pid.map(|pid| ProcessInfo { pid });
        self.shared.transition(&mut entry, ExecutionStatus::Running);
        executions.insert(session_id.clone(), entry);

        let timeout = params.timeout.or(self.shared.default_timeout);
        tokio::spawn(monitor(
            Arc::clone(&self.shared),
            session_id.clone(),
            child,
            reader,
            kill_rx,
            timeout,
        ));

        info!(session_id = %session_id, ?pid, ?timeout, "Execution started");
        Ok(session_id)
    }

    /// Snapshot of one record.
    pub async fn get_execution(&self, session_id: &str) -> Option<ExecutionRecord> {
        let executions = self.shared.executions.lock().await;
        executions.get(session_id).map(|entry| entry.record.clone())
    }

    /// Snapshots of every record, oldest first.
    pub async fn list_executions(&self) -> Vec<ExecutionRecord> {
        let executions = self.shared.executions.lock().await;
        let mut entries: Vec<&Entry> = executions.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.record.clone()).collect()
    }

    /// Number of records currently `Running`.
    pub async fn running_count(&self) -> usize {
        count_running(&*self.shared.executions.lock().await)
    }

    /// Kill an execution.
    ///
    /// The record becomes `Killed` immediately; the subprocess is signalled in
    /// the background. Killing a terminal record is a no-op.
    pub async fn kill_execution(&self, session_id: &str) -> Result<(), RegistryError> {
        match self.shared.mark_killed(session_id, None).await {
            Some(_) => Ok(()),
            None => Err(RegistryError::ExecutionNotFound {
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Kill every non-terminal execution. Returns how many were killed.
    pub async fn kill_all(&self) -> usize {
        let live: Vec<String> = {
            let executions = self.shared.executions.lock().await;
            executions
                .iter()
                .filter(|(_, entry)| !entry.record.status.is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut killed = 0;
        for session_id in live {
            if self.shared.mark_killed(&session_id, None).await == Some(true) {
                killed += 1;
            }
        }
        info!(killed, "Killed all live executions");
        killed
    }

    /// Remove a terminal record. Unknown ids are ignored.
    pub async fn cleanup_execution(&self, session_id: &str) -> Result<(), RegistryError> {
        let mut executions = self.shared.executions.lock().await;
        let Some(entry) = executions.get(session_id) else {
            warn!(session_id, "Cleanup requested for unknown execution");
            return Ok(());
        };

        let status = entry.record.status;
        if !status.is_terminal() {
            return Err(RegistryError::InvalidLifecycleTransition {
                session_id: session_id.to_string(),
                status,
            });
        }

        executions.remove(session_id);
        drop(executions);
        debug!(session_id, %status, "Execution cleaned up");
        self.shared.notify(RegistryChange::Removed {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Remove every terminal record. Returns how many were removed.
    pub async fn cleanup_all_completed(&self) -> usize {
        let mut executions = self.shared.executions.lock().await;
        let terminal: Vec<String> = executions
            .iter()
            .filter(|(_, entry)| entry.record.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in &terminal {
            executions.remove(session_id);
        }
        drop(executions);

        for session_id in &terminal {
            self.shared.notify(RegistryChange::Removed {
                session_id: session_id.clone(),
            });
        }
        debug!(removed = terminal.len(), "Cleaned up terminal executions");
        terminal.len()
    }

    /// Drop the oldest terminal records until the registry fits `max_history`.
    ///
    /// Live records are never removed, so the registry may stay above the
    /// limit while many executions are running.
    pub async fn trim_history(&self) -> usize {
        let mut executions = self.shared.executions.lock().await;
        let excess = executions.len().saturating_sub(self.shared.max_history);
        if excess == 0 {
            return 0;
        }

        let mut terminal: Vec<(u64, String)> = executions
            .iter()
            .filter(|(_, entry)| entry.record.status.is_terminal())
            .map(|(id, entry)| (entry.seq, id.clone()))
            .collect();
        terminal.sort_unstable();

        let removed: Vec<String> = terminal
            .into_iter()
            .take(excess)
            .map(|(_, id)| id)
            .collect();
        for session_id in &removed {
            executions.remove(session_id);
        }
        drop(executions);

        for session_id in &removed {
            self.shared.notify(RegistryChange::Removed {
                session_id: session_id.clone(),
            });
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), "Trimmed execution history");
        }
        removed.len()
    }

    /// Run [`Self::trim_history`] every `interval` until `shutdown` changes.
    pub fn spawn_retention_sweep(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        registry.trim_history().await;
                    }
                    _ = shutdown.changed() => {
                        info!("Retention sweep shutting down");
                        return;
                    }
                }
            }
        })
    }

    /// Subscribe to record creation, transitions, and removal.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<RegistryChange> {
        self.shared.changes_tx.subscribe()
    }

    /// Subscribe to events parsed for one execution from now on.
    pub async fn subscribe_events(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<StreamEvent>, RegistryError> {
        let executions = self.shared.executions.lock().await;
        executions
            .get(session_id)
            .map(|entry| entry.events_tx.subscribe())
            .ok_or_else(|| RegistryError::ExecutionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Wait until an execution is terminal and return its final snapshot.
    ///
    /// Returns `None` if the record is unknown or removed while waiting.
    pub async fn wait_for_completion(&self, session_id: &str) -> Option<ExecutionRecord> {
        let mut changes = self.subscribe_changes();
        loop {
            let record = self.get_execution(session_id).await?;
            if record.status.is_terminal() {
                return Some(record);
            }
            match changes.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Shared {
    fn notify(&self, change: RegistryChange) {
        // No subscribers is fine.
        let _ = self.changes_tx.send(change);
    }

    /// Move `entry` to `to`, stamping times and publishing the change.
    fn transition(&self, entry: &mut Entry, to: ExecutionStatus) {
        let record = &mut entry.record;
        let from = record.status;
        record.status = to;
        match to {
            ExecutionStatus::Running => record.started_at = Some(SystemTime::now()),
            status if status.is_terminal() => {
                record.process = None;
                record.completed_at = Some(SystemTime::now());
            }
            _ => {}
        }
        info!(session_id = %record.session_id, %from, %to, "Execution transitioned");
        self.notify(RegistryChange::Transitioned {
            session_id: record.session_id.clone(),
            from,
            to,
        });
    }

    /// Move a live record to `Killed` and wake its monitor.
    ///
    /// `None` if unknown, `Some(false)` if already terminal.
    #[allow(clippy::significant_drop_tightening)]
    async fn mark_killed(&self, session_id: &str, reason: Option<String>) -> Option<bool> {
        let mut executions = self.executions.lock().await;
        let entry = executions.get_mut(session_id)?;
        if entry.record.status.is_terminal() {
            debug!(session_id, status = %entry.record.status, "Kill ignored, execution already terminal");
            return Some(false);
        }

        if reason.is_some() {
            entry.record.error = reason;
        }
        self.transition(entry, ExecutionStatus::Killed);
        if let Some(kill_tx) = entry.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        Some(true)
    }

    /// Apply a natural-exit transition unless something else settled first.
    #[allow(clippy::significant_drop_tightening)]
    async fn settle(
        &self,
        session_id: &str,
        to: ExecutionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) {
        let mut executions = self.executions.lock().await;
        let Some(entry) = executions.get_mut(session_id) else {
            return;
        };
        if entry.record.status != ExecutionStatus::Running {
            debug!(session_id, status = %entry.record.status, "Exit observed after execution settled");
            entry.record.exit_code = entry.record.exit_code.or(exit_code);
            return;
        }
        entry.record.exit_code = exit_code;
        entry.record.error = error;
        self.transition(entry, to);
    }

    async fn time_out(&self, session_id: &str, limit: Duration) {
        warn!(session_id, ?limit, "Execution timed out, killing");
        self.mark_killed(session_id, Some(format!("Timed out after {limit:?}")))
            .await;
    }

    async fn record_exit(&self, session_id: &str, status: Option<ExitStatus>) {
        let Some(code) = status.and_then(|s| s.code()) else {
            return;
        };
        let mut executions = self.executions.lock().await;
        if let Some(entry) = executions.get_mut(session_id) {
            entry.record.exit_code.get_or_insert(code);
        }
    }

    /// Append parsed events to a `Running` record and fan them out.
    #[allow(clippy::significant_drop_tightening)]
    async fn append_events(&self, session_id: &str, events: Vec<StreamEvent>) {
        if events.is_empty() {
            return;
        }
        let mut executions = self.executions.lock().await;
        let Some(entry) = executions.get_mut(session_id) else {
            return;
        };
        if entry.record.status != ExecutionStatus::Running {
            debug!(session_id, dropped = events.len(), "Dropping events for settled execution");
            return;
        }

        for event in events {
            if let StreamEvent::SystemInit(init) = &event
                && entry.record.reported_session_id.is_none()
            {
                debug!(session_id, reported = %init.session_id, "Subprocess reported session id");
                entry.record.reported_session_id = Some(init.session_id.clone());
            }
            let _ = entry.events_tx.send(event.clone());
            entry.record.events.push(event);
        }
    }
}

fn count_running(executions: &HashMap<String, Entry>) -> usize {
    executions
        .values()
        .filter(|entry| entry.record.status == ExecutionStatus::Running)
        .count()
}

/// Sink for one reader pass: keeps events, counts failures.
#[derive(Default)]
struct ReaderSink {
    events: Vec<StreamEvent>,
    errors: usize,
    overflows: usize,
}

impl EventSink for ReaderSink {
    fn on_event(&mut self, event: StreamEvent) {
        self.events.push(event);
    }

    fn on_error(&mut self, _error: StreamError) {
        self.errors += 1;
    }

    fn on_overflow(&mut self, _size: usize) {
        self.overflows += 1;
    }
}

async fn read_stdout(shared: Arc<Shared>, session_id: String, mut stdout: ChildStdout) {
    let mut parser = LineStreamParser::new(shared.max_buffer_bytes);
    let mut sink = ReaderSink::default();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => parser.process_chunk(&buf[..n], &mut sink),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to read stdout");
                break;
            }
        }
        let events = std::mem::take(&mut sink.events);
        shared.append_events(&session_id, events).await;
    }

    parser.flush(&mut sink);
    let events = std::mem::take(&mut sink.events);
    shared.append_events(&session_id, events).await;

    debug!(
        session_id = %session_id,
        errors = sink.errors,
        overflows = sink.overflows,
        "stdout reader finished"
    );
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Own the child until it exits, is killed, or times out.
///
/// After the child exits the reader may still be draining output held open
/// by something the child forked. Kill and timeout stay armed until the
/// reader finishes.
async fn monitor(
    shared: Arc<Shared>,
    session_id: String,
    mut child: Child,
    reader: Option<JoinHandle<()>>,
    mut kill_rx: oneshot::Receiver<()>,
    timeout: Option<Duration>,
) {
    let pid = child.id();
    let limit = timeout.unwrap_or_default();
    let deadline = sleep_or_pending(timeout);
    tokio::pin!(deadline);

    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            info!(session_id = %session_id, "Terminating killed execution");
            let status = terminate_process(&mut child, shared.terminate_grace).await;
            shared.record_exit(&session_id, status).await;
            return;
        }
        () = &mut deadline => {
            shared.time_out(&session_id, limit).await;
            let status = terminate_process(&mut child, shared.terminate_grace).await;
            shared.record_exit(&session_id, status).await;
            return;
        }
    };

    // The event log must be complete before the record turns terminal.
    if let Some(mut reader) = reader {
        tokio::select! {
            result = &mut reader => {
                if let Err(e) = result {
                    error!(session_id = %session_id, error = %e, "stdout reader task failed");
                }
            }
            _ = &mut kill_rx => {
                info!(session_id = %session_id, "Killed while output still open, stopping process group");
                terminate_group(pid, &mut reader, shared.terminate_grace).await;
                shared.record_exit(&session_id, status.as_ref().ok().copied()).await;
                return;
            }
            () = &mut deadline => {
                shared.time_out(&session_id, limit).await;
                terminate_group(pid, &mut reader, shared.terminate_grace).await;
                shared.record_exit(&session_id, status.as_ref().ok().copied()).await;
                return;
            }
        }
    }

    let (to, exit_code, error) = match status {
        Ok(status) => match status.code() {
            Some(0) => (ExecutionStatus::Completed, Some(0), None),
            Some(code) => (
                ExecutionStatus::Failed,
                Some(code),
                Some(format!("Exited with code {code}")),
            ),
            None => (
                ExecutionStatus::Failed,
                None,
                Some("Terminated by signal".to_string()),
            ),
        },
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Subprocess wait error");
            (ExecutionStatus::Failed, None, Some(format!("Process error: {e}")))
        }
    };
    shared.settle(&session_id, to, exit_code, error).await;
}
