//! In-memory stand-ins for the container runtime, the process table and the task runner.

use async_trait::async_trait;
use bytes::Bytes;
use envflow::cleanup::{ProcessControl, ProcessSignalError};
use envflow::container::{
    ContainerApi, ContainerError, ContainerInspect, ContainerSummary, CreateContainerRequest,
    LogByteStream, LogOptions,
};
use envflow::error::EngineResult;
use envflow::runner::{TaskExecutor, TaskFailure, TaskOutcome};
use envflow::workflow::{ExecutionContext, Task};
use futures::stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: Option<String>,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
}

/// Container runtime that keeps containers in a map and records every call as
/// `"<operation>:<argument>"`
#[derive(Default)]
pub struct MockContainerApi {
    calls: Mutex<Vec<String>>,
    containers: Mutex<BTreeMap<String, MockContainer>>,
    pull_failures: AtomicU32,
    start_failures: AtomicU32,
    next_id: AtomicU32,
    log_frames: Mutex<Vec<Bytes>>,
    start_delay: Duration,
}

impl MockContainerApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` pulls fail
    pub fn failing_pulls(self, n: u32) -> Self {
        self.pull_failures.store(n, Ordering::SeqCst);
        self
    }

    /// The next `n` starts fail
    pub fn failing_starts(self, n: u32) -> Self {
        self.start_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Every start takes this long before the container reports running
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_existing(self, id: &str, name: &str, labels: &[(&str, &str)]) -> Self {
        self.containers.lock().insert(
            id.to_string(),
            MockContainer {
                id: id.to_string(),
                name: Some(name.to_string()),
                running: true,
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
        self
    }

    pub fn with_log_frames(self, frames: Vec<Bytes>) -> Self {
        *self.log_frames.lock() = frames;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.calls.lock().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    /// Looks up by id or name
    pub fn container(&self, key: &str) -> Option<MockContainer> {
        let containers = self.containers.lock();
        Self::lookup(&containers, key).and_then(|id| containers.get(&id).cloned())
    }

    fn record(&self, operation: &str, argument: &str) {
        self.calls.lock().push(format!("{operation}:{argument}"));
    }

    fn lookup(containers: &BTreeMap<String, MockContainer>, key: &str) -> Option<String> {
        containers
            .values()
            .find(|c| c.id == key || c.name.as_deref() == Some(key))
            .map(|c| c.id.clone())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn transient(operation: &str) -> ContainerError {
        ContainerError::CommandFailed {
            command: format!("docker {operation}"),
            exit_code: Some(1),
            stderr: "connection reset by peer".to_string(),
        }
    }
}

#[async_trait]
impl ContainerApi for MockContainerApi {
    async fn pull(&self, image: &str) -> Result<(), ContainerError> {
        self.record("pull", image);
        if Self::take_failure(&self.pull_failures) {
            return Err(Self::transient("pull"));
        }
        Ok(())
    }

    async fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> Result<String, ContainerError> {
        self.record("create", request.name.as_deref().unwrap_or(&request.image));
        let mut containers = self.containers.lock();
        if let Some(name) = &request.name {
            if Self::lookup(&containers, name).is_some() {
                return Err(ContainerError::CommandFailed {
                    command: "docker create".to_string(),
                    exit_code: Some(125),
                    stderr: format!("Conflict. The container name \"/{name}\" is already in use"),
                });
            }
        }

        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: request.name.clone(),
                running: false,
                labels: request.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.record("start", id);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if Self::take_failure(&self.start_failures) {
            return Err(Self::transient("start"));
        }
        match self.containers.lock().get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(ContainerError::NotFound(id.to_string())),
        }
    }

    async fn stop(&self, id: &str) -> Result<(), ContainerError> {
        self.record("stop", id);
        let mut containers = self.containers.lock();
        let key = Self::lookup(&containers, id).ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        if let Some(container) = containers.get_mut(&key) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        self.record("remove", id);
        let mut containers = self.containers.lock();
        let key = Self::lookup(&containers, id).ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        containers.remove(&key);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspect, ContainerError> {
        self.record("inspect", id);
        let container = self
            .container(id)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        Ok(ContainerInspect {
            id: container.id,
            name: container.name.unwrap_or_default(),
            running: container.running,
            labels: container.labels,
        })
    }

    async fn logs(&self, id: &str, _options: &LogOptions) -> Result<LogByteStream, ContainerError> {
        self.record("logs", id);
        if self.container(id).is_none() {
            return Err(ContainerError::NotFound(id.to_string()));
        }
        let frames = self.log_frames.lock().clone();
        Ok(Box::pin(stream::iter(frames.into_iter().map(Ok))))
    }

    async fn list_managed(&self, label: &str) -> Result<Vec<ContainerSummary>, ContainerError> {
        self.record("list_managed", label);
        Ok(self
            .containers
            .lock()
            .values()
            .filter(|c| c.labels.get(label).is_some_and(|v| v == "true"))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone().unwrap_or_default(),
            })
            .collect())
    }
}

/// Process table with a configurable set of live pids
#[derive(Default)]
pub struct MockProcessControl {
    alive: Mutex<HashSet<u32>>,
    terminated: Mutex<Vec<u32>>,
}

impl MockProcessControl {
    pub fn with_alive(pids: &[u32]) -> Self {
        Self {
            alive: Mutex::new(pids.iter().copied().collect()),
            ..Default::default()
        }
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().clone()
    }
}

impl ProcessControl for MockProcessControl {
    fn exists(&self, pid: u32) -> Result<bool, ProcessSignalError> {
        Ok(self.alive.lock().contains(&pid))
    }

    fn terminate(&self, pid: u32) -> Result<(), ProcessSignalError> {
        if !self.alive.lock().remove(&pid) {
            return Err(ProcessSignalError::NotFound(pid));
        }
        self.terminated.lock().push(pid);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Started(String),
    Finished(String),
}

/// Executor that sleeps for a per-task duration and records starts and finishes
#[derive(Default)]
pub struct RecordingExecutor {
    events: Mutex<Vec<ExecEvent>>,
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, task: &str, delay: Duration) -> Self {
        self.delays.insert(task.to_string(), delay);
        self
    }

    pub fn failing(mut self, task: &str) -> Self {
        self.failing.insert(task.to_string());
        self
    }

    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Started(name) => Some(name.clone()),
                ExecEvent::Finished(_) => None,
            })
            .collect()
    }

    pub fn position(&self, event: &ExecEvent) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, task: &Task, _ctx: &ExecutionContext) -> EngineResult<TaskOutcome> {
        self.events.lock().push(ExecEvent::Started(task.name.clone()));
        let delay = self.delays.get(&task.name).copied().unwrap_or(Duration::ZERO);
        tokio::time::sleep(delay).await;
        self.events.lock().push(ExecEvent::Finished(task.name.clone()));

        if self.failing.contains(&task.name) {
            return Ok(TaskOutcome::Failed(TaskFailure::NonZeroExit {
                code: Some(1),
                stderr_tail: vec![format!("{} failed", task.name)],
            }));
        }
        Ok(TaskOutcome::Succeeded)
    }
}
