//! # Cleanup Coordinator
//!
//! Process-wide ledger of live managed resources (containers and background processes)
//! and the single entry point that tears them down.
//!
//! ## Guarantees
//!
//! - Teardown runs at most once per coordinator, however many callers trigger it and
//!   however concurrently. Later callers observe the in-flight or completed teardown.
//! - Resources are released in reverse registration order.
//! - Teardown is best-effort and exhaustive: a failing step is logged and recorded in the
//!   [`CleanupReport`], and the remaining steps and resources are still processed.
//! - "Not found" at any step means the resource is already gone and counts as success.
//!
//! One coordinator is created by the process entry point and shared by reference with
//! the scheduler and runner. Tests create fresh instances for isolation.

use crate::container::{ContainerApi, ContainerError};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Container,
    Process,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Process => write!(f, "process"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Registered,
    Released,
}

/// A managed resource awaiting teardown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    /// Container id, or process id for processes
    pub id: String,
    /// Human-readable name for logs
    pub name: String,
    pub state: HandleState,
}

impl ResourceHandle {
    pub fn container(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Container,
            id: id.into(),
            name: name.into(),
            state: HandleState::Registered,
        }
    }

    pub fn process(pid: u32, name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Process,
            id: pid.to_string(),
            name: name.into(),
            state: HandleState::Registered,
        }
    }
}

/// Outcome of a registration attempt
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Accepted,
    /// Teardown already began; the caller must release the resource itself
    Rejected(ResourceHandle),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub resource_id: String,
    pub resource_name: String,
    pub step: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub reason: String,
    /// In teardown order
    pub released: Vec<ResourceHandle>,
    pub failures: Vec<CleanupFailure>,
    pub duration: Duration,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessSignalError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("signalling process {pid} failed: {source}")]
    Os {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("process signalling is not supported on this platform")]
    Unsupported,
}

/// Non-destructive existence probe plus termination, abstracted for tests
pub trait ProcessControl: Send + Sync {
    fn exists(&self, pid: u32) -> Result<bool, ProcessSignalError>;

    /// Ask the process (and its process group, when it leads one) to terminate
    fn terminate(&self, pid: u32) -> Result<(), ProcessSignalError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessControl;

#[cfg(unix)]
impl SystemProcessControl {
    fn kill(pid: libc::pid_t, signal: libc::c_int) -> std::io::Result<()> {
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(unix)]
impl ProcessControl for SystemProcessControl {
    fn exists(&self, pid: u32) -> Result<bool, ProcessSignalError> {
        match Self::kill(pid as libc::pid_t, 0) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(false),
            // Exists but owned by someone else
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(true),
            Err(source) => Err(ProcessSignalError::Os { pid, source }),
        }
    }

    fn terminate(&self, pid: u32) -> Result<(), ProcessSignalError> {
        let target = pid as libc::pid_t;
        match Self::kill(-target, libc::SIGTERM) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
            Err(source) => return Err(ProcessSignalError::Os { pid, source }),
        }
        match Self::kill(target, libc::SIGTERM) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Err(ProcessSignalError::NotFound(pid)),
            Err(source) => Err(ProcessSignalError::Os { pid, source }),
        }
    }
}

#[cfg(not(unix))]
impl ProcessControl for SystemProcessControl {
    fn exists(&self, _pid: u32) -> Result<bool, ProcessSignalError> {
        Err(ProcessSignalError::Unsupported)
    }

    fn terminate(&self, _pid: u32) -> Result<(), ProcessSignalError> {
        Err(ProcessSignalError::Unsupported)
    }
}

pub struct CleanupCoordinator {
    containers: Arc<dyn ContainerApi>,
    processes: Arc<dyn ProcessControl>,
    /// Registration order; released entries stay for reporting
    ledger: Mutex<Vec<ResourceHandle>>,
    /// Set under the ledger lock when teardown begins
    triggered: Mutex<Option<String>>,
    teardown: OnceCell<CleanupReport>,
}

impl fmt::Debug for CleanupCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupCoordinator")
            .field("ledger", &*self.ledger.lock())
            .field("triggered", &*self.triggered.lock())
            .finish()
    }
}

impl CleanupCoordinator {
    pub fn new(containers: Arc<dyn ContainerApi>, processes: Arc<dyn ProcessControl>) -> Self {
        Self {
            containers,
            processes,
            ledger: Mutex::new(Vec::new()),
            triggered: Mutex::new(None),
            teardown: OnceCell::new(),
        }
    }

    pub fn with_system_processes(containers: Arc<dyn ContainerApi>) -> Self {
        Self::new(containers, Arc::new(SystemProcessControl))
    }

    /// Record a confirmed-started resource
    pub fn register(&self, handle: ResourceHandle) -> Registration {
        let mut ledger = self.ledger.lock();
        if self.triggered.lock().is_some() {
            warn!(
                resource_id = %handle.id,
                resource = %handle.name,
                "Registration rejected: cleanup already triggered"
            );
            return Registration::Rejected(handle);
        }

        let duplicate = ledger
            .iter()
            .any(|h| h.id == handle.id && h.kind == handle.kind && h.state == HandleState::Registered);
        if duplicate {
            debug!(resource_id = %handle.id, "Resource already registered");
            return Registration::Accepted;
        }

        debug!(
            kind = %handle.kind,
            resource_id = %handle.id,
            resource = %handle.name,
            "Registered managed resource"
        );
        ledger.push(ResourceHandle {
            state: HandleState::Registered,
            ..handle
        });
        Registration::Accepted
    }

    /// Register every container carrying `label`, such as leftovers of earlier runs.
    /// Returns how many were taken over.
    pub async fn adopt_managed(&self, label: &str) -> Result<usize, ContainerError> {
        let managed = self.containers.list_managed(label).await?;
        let mut adopted = 0;
        for summary in managed {
            let handle = ResourceHandle::container(summary.id, summary.name);
            if let Registration::Accepted = self.register(handle) {
                adopted += 1;
            }
        }
        info!(label, adopted, "Adopted managed containers");
        Ok(adopted)
    }

    /// Forget a resource that went away on its own
    pub fn unregister(&self, id: &str) -> Option<ResourceHandle> {
        let mut ledger = self.ledger.lock();
        let index = ledger
            .iter()
            .position(|h| h.id == id && h.state == HandleState::Registered)?;
        let handle = ledger.remove(index);
        debug!(resource_id = %id, resource = %handle.name, "Unregistered managed resource");
        Some(handle)
    }

    /// Snapshot of the ledger in registration order
    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.ledger.lock().clone()
    }

    pub fn live_count(&self) -> usize {
        self.ledger
            .lock()
            .iter()
            .filter(|h| h.state == HandleState::Registered)
            .count()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.lock().is_some()
    }

    /// The completed teardown, if any
    pub fn report(&self) -> Option<CleanupReport> {
        self.teardown.get().cloned()
    }

    /// Tear down every registered resource, at most once.
    ///
    /// Concurrent and later callers wait for and receive the same report.
    pub async fn trigger(&self, reason: &str) -> CleanupReport {
        if let Some(first) = self.triggered.lock().as_deref() {
            if first != reason {
                debug!(reason, first_reason = first, "Cleanup already triggered");
            }
        }
        self.teardown
            .get_or_init(|| self.run_teardown(reason.to_string()))
            .await
            .clone()
    }

    async fn run_teardown(&self, reason: String) -> CleanupReport {
        let started = Instant::now();
        let pending: Vec<ResourceHandle> = {
            let ledger = self.ledger.lock();
            *self.triggered.lock() = Some(reason.clone());
            ledger
                .iter()
                .filter(|h| h.state == HandleState::Registered)
                .cloned()
                .collect()
        };

        info!(
            reason = %reason,
            resource_count = pending.len(),
            "🧹 Cleanup triggered"
        );

        let mut released = Vec::with_capacity(pending.len());
        let mut failures = Vec::new();

        for handle in pending.into_iter().rev() {
            failures.extend(self.release(&handle).await);
            self.mark_released(&handle);
            released.push(ResourceHandle {
                state: HandleState::Released,
                ..handle
            });
        }

        let report = CleanupReport {
            reason,
            released,
            failures,
            duration: started.elapsed(),
        };

        if report.is_clean() {
            info!(
                released = report.released.len(),
                duration_ms = report.duration.as_millis() as u64,
                "✅ Cleanup complete"
            );
        } else {
            warn!(
                released = report.released.len(),
                failures = report.failures.len(),
                "Cleanup finished with failures"
            );
        }
        report
    }

    fn mark_released(&self, handle: &ResourceHandle) {
        let mut ledger = self.ledger.lock();
        if let Some(entry) = ledger
            .iter_mut()
            .find(|h| h.id == handle.id && h.kind == handle.kind && h.state == HandleState::Registered)
        {
            entry.state = HandleState::Released;
        }
    }

    /// Best-effort teardown of one resource, outside the ledger.
    ///
    /// Returns the steps that failed; "not found" is never a failure.
    pub async fn release(&self, handle: &ResourceHandle) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();

        match handle.kind {
            ResourceKind::Container => {
                let running = match self.containers.inspect(&handle.id).await {
                    Ok(info) => info.running,
                    Err(e) if e.is_not_found() => {
                        debug!(resource_id = %handle.id, "Container already gone");
                        return failures;
                    }
                    Err(e) => {
                        record_failure(&mut failures, handle, "inspect", e.to_string());
                        // State unknown: try to stop anyway
                        true
                    }
                };

                if running {
                    match self.containers.stop(&handle.id).await {
                        Ok(()) => debug!(resource_id = %handle.id, "Container stopped"),
                        Err(e) if e.is_not_found() => return failures,
                        Err(e) => record_failure(&mut failures, handle, "stop", e.to_string()),
                    }
                }

                match self.containers.remove(&handle.id).await {
                    Ok(()) => {
                        info!(resource = %handle.name, resource_id = %handle.id, "Container removed")
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => record_failure(&mut failures, handle, "remove", e.to_string()),
                }
            }
            ResourceKind::Process => {
                let Ok(pid) = handle.id.parse::<u32>() else {
                    let error = format!("invalid process id '{}'", handle.id);
                    record_failure(&mut failures, handle, "parse_pid", error);
                    return failures;
                };

                match self.processes.exists(pid) {
                    Ok(true) => {}
                    Ok(false) | Err(ProcessSignalError::NotFound(_)) => {
                        debug!(pid, "Process already exited");
                        return failures;
                    }
                    Err(e) => record_failure(&mut failures, handle, "probe", e.to_string()),
                }

                match self.processes.terminate(pid) {
                    Ok(()) => info!(resource = %handle.name, pid, "Process terminated"),
                    Err(ProcessSignalError::NotFound(_)) => {}
                    Err(e) => record_failure(&mut failures, handle, "terminate", e.to_string()),
                }
            }
        }
        failures
    }
}

fn record_failure(
    failures: &mut Vec<CleanupFailure>,
    handle: &ResourceHandle,
    step: &'static str,
    error: String,
) {
    error!(
        resource_id = %handle.id,
        resource = %handle.name,
        step,
        error = %error,
        "Cleanup step failed"
    );
    failures.push(CleanupFailure {
        resource_id: handle.id.clone(),
        resource_name: handle.name.clone(),
        step,
        error,
    });
}
