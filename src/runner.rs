//! # Task Runner
//!
//! Executes one task to completion. Shell commands run exactly once; container tasks
//! pull and start with retry. Anything left running afterwards (a container, or a
//! background process) is registered with the [`CleanupCoordinator`] the moment it is
//! confirmed started, and then has to pass its health gate.
//!
//! A task that ran and failed comes back as [`TaskOutcome::Failed`]. Engine-level
//! problems (invalid configuration, rejected input, exhausted retries, an unreachable
//! runtime) are returned as `Err`.

use crate::cleanup::{CleanupCoordinator, Registration, ResourceHandle};
use crate::config::EngineConfig;
use crate::container::{ContainerApi, ContainerError, CreateContainerRequest};
use crate::error::{EngineError, EngineResult};
use crate::health::HealthGate;
use crate::retry::RetryPolicy;
use crate::sanitize::{BasicSanitizer, Sanitizer};
use crate::workflow::{CommandTask, ContainerTask, ExecutionContext, Task, TaskKind};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Lines of stderr kept for the failure message of a command
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The task definition is unusable for its kind
    InvalidDefinition(String),
    NonZeroExit {
        code: Option<i32>,
        stderr_tail: Vec<String>,
    },
    HealthCheck { attempts: u32, last_error: String },
    /// A container with the requested name exists and is not ours
    NameConflict(String),
    /// The process could not be launched at all
    SpawnFailed(String),
    /// Cleanup began while the task was starting its resource
    Interrupted,
}

impl TaskFailure {
    pub fn into_error(self, task: &str) -> EngineError {
        match self {
            Self::InvalidDefinition(reason) => EngineError::task(task, reason),
            Self::NonZeroExit { code, stderr_tail } => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                let reason = match stderr_tail.last() {
                    Some(last) => format!("exited with status {code}: {last}"),
                    None => format!("exited with status {code}"),
                };
                EngineError::task(task, reason)
            }
            Self::HealthCheck {
                attempts,
                last_error,
            } => EngineError::HealthCheck {
                task: task.to_string(),
                attempts,
                last_error,
            },
            Self::NameConflict(name) => EngineError::task(
                task,
                format!("container name '{name}' is taken by a container this tool does not manage"),
            ),
            Self::SpawnFailed(reason) => {
                EngineError::task(task, format!("could not start process: {reason}"))
            }
            Self::Interrupted => EngineError::task(task, "cleanup started before the task finished"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(TaskFailure),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// The seam between the scheduler and whatever actually runs a task
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> EngineResult<TaskOutcome>;
}

pub struct TaskRunner {
    containers: Arc<dyn ContainerApi>,
    cleanup: Arc<CleanupCoordinator>,
    health: HealthGate,
    sanitizer: Arc<dyn Sanitizer>,
    pull_policy: RetryPolicy,
    start_policy: RetryPolicy,
    managed_label: String,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("pull_policy", &self.pull_policy)
            .field("start_policy", &self.start_policy)
            .field("managed_label", &self.managed_label)
            .finish()
    }
}

impl TaskRunner {
    pub fn new(containers: Arc<dyn ContainerApi>, cleanup: Arc<CleanupCoordinator>) -> Self {
        let config = EngineConfig::default();
        Self::from_config(&config, containers, cleanup)
    }

    pub fn from_config(
        config: &EngineConfig,
        containers: Arc<dyn ContainerApi>,
        cleanup: Arc<CleanupCoordinator>,
    ) -> Self {
        Self {
            containers,
            cleanup,
            health: HealthGate::default(),
            sanitizer: Arc::new(BasicSanitizer),
            pull_policy: RetryPolicy::from(&config.retry.pull),
            start_policy: RetryPolicy::from(&config.retry.start),
            managed_label: config.container.managed_label.clone(),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn with_health_gate(mut self, health: HealthGate) -> Self {
        self.health = health;
        self
    }

    pub fn with_pull_policy(mut self, policy: RetryPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    pub fn with_start_policy(mut self, policy: RetryPolicy) -> Self {
        self.start_policy = policy;
        self
    }

    pub fn with_managed_label(mut self, label: impl Into<String>) -> Self {
        self.managed_label = label.into();
        self
    }

    pub fn cleanup(&self) -> &Arc<CleanupCoordinator> {
        &self.cleanup
    }

    async fn run_command(
        &self,
        task: &Task,
        spec: &CommandTask,
        ctx: &ExecutionContext,
    ) -> EngineResult<TaskOutcome> {
        if spec.command.trim().is_empty() {
            return Ok(TaskOutcome::Failed(TaskFailure::InvalidDefinition(
                "command task requires a non-empty 'command'".to_string(),
            )));
        }

        self.sanitizer.check_command(&spec.command)?;
        for (key, value) in ctx.env.iter().chain(spec.env.iter()) {
            self.sanitizer.check_env(key, value)?;
        }
        let cwd = match &spec.cwd {
            Some(cwd) => self.sanitizer.resolve_path(cwd, &ctx.working_dir)?,
            None => ctx.working_dir.clone(),
        };

        if ctx.dry_run {
            info!(
                task = %task.name,
                command = %spec.command,
                cwd = %cwd.display(),
                background = spec.background,
                "[dry-run] Would run command"
            );
            return Ok(TaskOutcome::Succeeded);
        }

        let env = merge_env(std::env::vars(), &ctx.env, &spec.env);
        let mut command = shell_command(&spec.command);
        command
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if spec.background {
            return self.spawn_background(task, command).await;
        }
        match run_to_completion(task, command).await? {
            TaskOutcome::Succeeded => self.pass_health_gate(task).await,
            failed => Ok(failed),
        }
    }

    async fn spawn_background(&self, task: &Task, mut command: Command) -> EngineResult<TaskOutcome> {
        // Own process group, so teardown can signal the whole tree
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Ok(TaskOutcome::Failed(TaskFailure::SpawnFailed(e.to_string()))),
        };
        let Some(pid) = child.id() else {
            return Ok(TaskOutcome::Failed(TaskFailure::NonZeroExit {
                code: None,
                stderr_tail: vec!["process exited before it could be tracked".to_string()],
            }));
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let name = task.name.clone();
        tokio::spawn(async move {
            tokio::join!(
                drain_lines(stdout, &name, false),
                drain_lines(stderr, &name, true)
            );
            match child.wait().await {
                Ok(status) => debug!(task = %name, status = %status, "Background process exited"),
                Err(e) => warn!(task = %name, error = %e, "Failed to reap background process"),
            }
        });

        info!(task = %task.name, pid, "🚀 Background process started");
        if let Some(outcome) = self.track(ResourceHandle::process(pid, &task.name)).await {
            return Ok(outcome);
        }
        self.pass_health_gate(task).await
    }

    async fn run_container(
        &self,
        task: &Task,
        spec: &ContainerTask,
        ctx: &ExecutionContext,
    ) -> EngineResult<TaskOutcome> {
        if spec.image.trim().is_empty() {
            return Ok(TaskOutcome::Failed(TaskFailure::InvalidDefinition(
                "docker task requires a non-empty 'image'".to_string(),
            )));
        }
        for (key, value) in &spec.env {
            self.sanitizer.check_env(key, value)?;
        }

        if ctx.dry_run {
            info!(
                task = %task.name,
                image = %spec.image,
                container_name = ?spec.container_name,
                ports = ?spec.ports.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "[dry-run] Would pull, create and start container"
            );
            return Ok(TaskOutcome::Succeeded);
        }

        if let Some(name) = &spec.container_name {
            if let Some(failure) = self.clear_stale_container(name).await? {
                return Ok(TaskOutcome::Failed(failure));
            }
        }

        self.pull_policy
            .run_if(
                &format!("pull image '{}'", spec.image),
                is_transient,
                |_| self.containers.pull(&spec.image),
            )
            .await?;

        let request = CreateContainerRequest {
            image: spec.image.clone(),
            name: spec.container_name.clone(),
            env: spec.env.clone(),
            ports: spec.ports.clone(),
            labels: BTreeMap::from([(self.managed_label.clone(), "true".to_string())]),
            command: spec.command.clone(),
        };
        let id = self.containers.create_container(&request).await?;
        let display_name = spec.container_name.clone().unwrap_or_else(|| task.name.clone());
        let handle = ResourceHandle::container(&id, display_name);

        let started = self
            .start_policy
            .run_if(
                &format!("start container '{}'", handle.name),
                is_transient,
                |_| self.containers.start(&id),
            )
            .await;
        if let Err(err) = started {
            // Created but never running: nobody else knows about it
            let _ = self.cleanup.release(&handle).await;
            return Err(err.into());
        }

        info!(task = %task.name, container_id = %id, image = %spec.image, "🐳 Container started");
        if let Some(outcome) = self.track(handle).await {
            return Ok(outcome);
        }

        // A failed gate leaves the container in place for inspection and cleanup
        self.pass_health_gate(task).await
    }

    /// Deal with an existing container holding the requested name
    async fn clear_stale_container(&self, name: &str) -> EngineResult<Option<TaskFailure>> {
        match self.containers.inspect(name).await {
            Ok(existing) if existing.has_label(&self.managed_label) => {
                warn!(
                    container = %name,
                    container_id = %existing.id,
                    "Removing stale managed container from an earlier run"
                );
                let handle = ResourceHandle::container(existing.id, name);
                if let Some(failure) = self.cleanup.release(&handle).await.into_iter().next() {
                    return Err(EngineError::task(
                        name,
                        format!("could not remove stale container: {}", failure.error),
                    ));
                }
                Ok(None)
            }
            Ok(_) => Ok(Some(TaskFailure::NameConflict(name.to_string()))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Register a started resource. Returns a failure when teardown already began,
    /// after releasing the resource here.
    async fn track(&self, handle: ResourceHandle) -> Option<TaskOutcome> {
        match self.cleanup.register(handle) {
            Registration::Accepted => None,
            Registration::Rejected(handle) => {
                let _ = self.cleanup.release(&handle).await;
                Some(TaskOutcome::Failed(TaskFailure::Interrupted))
            }
        }
    }

    async fn pass_health_gate(&self, task: &Task) -> EngineResult<TaskOutcome> {
        let Some(spec) = &task.health_check else {
            return Ok(TaskOutcome::Succeeded);
        };
        match self.health.wait_until_healthy(&task.name, spec).await {
            Ok(()) => Ok(TaskOutcome::Succeeded),
            Err(EngineError::HealthCheck {
                attempts,
                last_error,
                ..
            }) => Ok(TaskOutcome::Failed(TaskFailure::HealthCheck {
                attempts,
                last_error,
            })),
            Err(other) => Err(other),
        }
    }
}

#[async_trait]
impl TaskExecutor for TaskRunner {
    #[instrument(skip_all, fields(task = %task.name, kind = task.kind_name()))]
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> EngineResult<TaskOutcome> {
        let started = Instant::now();
        debug!("Task starting");

        if self.cleanup.is_triggered() && !ctx.dry_run {
            warn!("Cleanup already started; not starting task");
            return Ok(TaskOutcome::Failed(TaskFailure::Interrupted));
        }

        let outcome = match &task.kind {
            TaskKind::Command(spec) => self.run_command(task, spec, ctx).await,
            TaskKind::Container(spec) => self.run_container(task, spec, ctx).await,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(TaskOutcome::Succeeded) => debug!(duration_ms, "Task finished"),
            Ok(TaskOutcome::Failed(failure)) => warn!(duration_ms, failure = ?failure, "Task failed"),
            Err(e) => warn!(duration_ms, error = %e, "Task errored"),
        }
        outcome
    }
}

fn is_transient(err: &ContainerError) -> bool {
    !err.is_not_found()
}

/// Process environment, then context, then task; later layers win
pub fn merge_env(
    process: impl IntoIterator<Item = (String, String)>,
    context: &BTreeMap<String, String>,
    task: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = process.into_iter().collect();
    env.extend(context.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(task.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn shell_command(line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(line);
        command
    }
    #[cfg(not(windows))]
    {
        let mut command = Command::new("sh");
        command.arg("-c").arg(line);
        command
    }
}

async fn run_to_completion(task: &Task, mut command: Command) -> EngineResult<TaskOutcome> {
    let mut child = match command.kill_on_drop(true).spawn() {
        Ok(child) => child,
        Err(e) => return Ok(TaskOutcome::Failed(TaskFailure::SpawnFailed(e.to_string()))),
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (status, _, stderr_tail) = tokio::join!(
        child.wait(),
        drain_lines(stdout, &task.name, false),
        drain_lines(stderr, &task.name, true)
    );
    let status = status?;

    if status.success() {
        Ok(TaskOutcome::Succeeded)
    } else {
        Ok(TaskOutcome::Failed(TaskFailure::NonZeroExit {
            code: status.code(),
            stderr_tail: stderr_tail.into(),
        }))
    }
}

/// Forward child output to tracing, keeping the last few lines
async fn drain_lines<R>(reader: Option<R>, task: &str, is_stderr: bool) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let Some(reader) = reader else {
        return tail;
    };

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if is_stderr {
                    warn!(task, stream = "stderr", "{line}");
                } else {
                    debug!(task, stream = "stdout", "{line}");
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(task, error = %e, "Stopped reading task output");
                break;
            }
        }
    }
    tail
}
