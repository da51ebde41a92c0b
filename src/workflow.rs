//! # Workflow Model
//!
//! Typed representation of a validated workflow: ordered tasks, each either a shell
//! command or a managed container, with optional dependencies, parallelism flags and
//! readiness checks.
//!
//! Task and health-check dispatch are sum types ([`TaskKind`], [`HealthProbe`]) so every
//! consumer matches exhaustively instead of probing for optional fields.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// An ordered set of tasks. Declaration order is significant for sequential grouping.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    /// Default parallel flag applied to tasks that do not set their own
    pub parallel: bool,
    pub tasks: Vec<Task>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parallel: false,
            tasks: Vec::new(),
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Effective parallel flag of a task: its own flag, else the workflow default
    pub fn is_parallel(&self, task: &Task) -> bool {
        task.parallel.unwrap_or(self.parallel)
    }

    /// Structural checks that must hold before anything executes.
    ///
    /// Dependency references are deliberately not resolved here; unknown names surface
    /// from the scheduler as a deadlock naming the unmet dependency.
    pub fn validate(&self) -> EngineResult<()> {
        if self.tasks.is_empty() {
            return Err(EngineError::configuration(format!(
                "workflow '{}' has no tasks",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(EngineError::configuration(format!(
                    "workflow '{}' contains a task without a name",
                    self.name
                )));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(EngineError::configuration(format!(
                    "duplicate task name '{}' in workflow '{}'",
                    task.name, self.name
                )));
            }
            if let Some(health) = &task.health_check {
                health.validate().map_err(|e| match e {
                    EngineError::Configuration(msg) => {
                        EngineError::configuration(format!("task '{}': {msg}", task.name))
                    }
                    other => other,
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub kind: TaskKind,
    pub depends_on: Vec<String>,
    /// Overrides the workflow default when set
    pub parallel: Option<bool>,
    pub health_check: Option<HealthCheckSpec>,
}

impl Task {
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, TaskKind::Command(CommandTask::new(command)))
    }

    pub fn container(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self::new(name, TaskKind::Container(ContainerTask::new(image)))
    }

    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            depends_on: Vec::new(),
            parallel: None,
            health_check: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = Some(parallel);
        self
    }

    pub fn with_health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = Some(spec);
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TaskKind::Command(_) => "command",
            TaskKind::Container(_) => "docker",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    Command(CommandTask),
    Container(ContainerTask),
}

#[derive(Debug, Clone, Default)]
pub struct CommandTask {
    /// Shell command line, run through the platform shell
    pub command: String,
    pub env: BTreeMap<String, String>,
    /// Relative paths resolve against the context working directory
    pub cwd: Option<PathBuf>,
    /// Spawn and keep running instead of waiting for exit
    pub background: bool,
}

impl CommandTask {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerTask {
    pub image: String,
    pub container_name: Option<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    /// Overrides the image's default command
    pub command: Option<Vec<String>>,
}

impl ContainerTask {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

/// Host port published to a container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
    pub protocol: PortProtocol,
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            PortProtocol::Tcp => write!(f, "{}:{}", self.host, self.container),
            PortProtocol::Udp => write!(f, "{}:{}/udp", self.host, self.container),
        }
    }
}

impl FromStr for PortBinding {
    type Err = String;

    /// Parses `host:container`, optionally suffixed with `/tcp` or `/udp`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, "tcp")) => (ports, PortProtocol::Tcp),
            Some((ports, "udp")) => (ports, PortProtocol::Udp),
            Some((_, other)) => return Err(format!("Invalid port protocol '{other}' in '{s}'")),
            None => (s, PortProtocol::Tcp),
        };
        let (host, container) = ports
            .split_once(':')
            .ok_or_else(|| format!("Invalid port binding '{s}', expected host:container"))?;
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("Invalid port number '{p}' in '{s}'"))
        };
        Ok(Self {
            host: parse(host)?,
            container: parse(container)?,
            protocol,
        })
    }
}

/// Readiness check gating a task's success
#[derive(Debug, Clone)]
pub struct HealthCheckSpec {
    pub probe: HealthProbe,
    pub retries: u32,
    pub interval: Duration,
    /// Per-probe timeout
    pub timeout: Duration,
}

impl HealthCheckSpec {
    pub const DEFAULT_RETRIES: u32 = 10;
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

    pub fn new(probe: HealthProbe) -> Self {
        Self {
            probe,
            retries: Self::DEFAULT_RETRIES,
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(HealthProbe::Tcp {
            host: host.into(),
            port,
        })
    }

    pub fn http(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self::new(HealthProbe::Http {
            host: host.into(),
            port,
            path: path.into(),
        })
    }

    pub fn custom(predicate: Option<Arc<dyn HealthPredicate>>) -> Self {
        Self::new(HealthProbe::Custom { predicate })
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if let HealthProbe::Custom { predicate: None } = self.probe {
            return Err(EngineError::configuration(
                "custom health check has no predicate",
            ));
        }
        if self.retries == 0 {
            return Err(EngineError::configuration(
                "health check retries must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub enum HealthProbe {
    Tcp {
        host: String,
        port: u16,
    },
    Http {
        host: String,
        port: u16,
        path: String,
    },
    /// A caller-supplied predicate; `None` is a configuration error
    Custom {
        predicate: Option<Arc<dyn HealthPredicate>>,
    },
}

impl HealthProbe {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Http { .. } => "http",
            Self::Custom { .. } => "custom",
        }
    }
}

impl fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => f
                .debug_struct("Tcp")
                .field("host", host)
                .field("port", port)
                .finish(),
            Self::Http { host, port, path } => f
                .debug_struct("Http")
                .field("host", host)
                .field("port", port)
                .field("path", path)
                .finish(),
            Self::Custom { predicate } => f
                .debug_struct("Custom")
                .field("predicate", &predicate.as_ref().map(|_| "<predicate>"))
                .finish(),
        }
    }
}

/// Custom readiness predicate. Its result is trusted as-is.
#[async_trait]
pub trait HealthPredicate: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

type PredicateFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Adapts an async closure into a [`HealthPredicate`]
pub struct FnPredicate {
    check: Box<dyn Fn() -> PredicateFuture + Send + Sync>,
}

impl FnPredicate {
    pub fn new<F, Fut>(check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            check: Box::new(move || Box::pin(check())),
        }
    }
}

#[async_trait]
impl HealthPredicate for FnPredicate {
    async fn is_healthy(&self) -> bool {
        (self.check)().await
    }
}

/// Per-run environment shared by every task. Never mutated by tasks.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub dry_run: bool,
}

impl ExecutionContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            env: BTreeMap::new(),
            working_dir: working_dir.into(),
            dry_run: false,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_binding_parsing() {
        let tcp: PortBinding = "5432:5433".parse().unwrap();
        assert_eq!(tcp.host, 5432);
        assert_eq!(tcp.container, 5433);
        assert_eq!(tcp.protocol, PortProtocol::Tcp);

        let udp: PortBinding = "53:53/udp".parse().unwrap();
        assert_eq!(udp.protocol, PortProtocol::Udp);
        assert_eq!(udp.to_string(), "53:53/udp");

        assert!("5432".parse::<PortBinding>().is_err());
        assert!("70000:1".parse::<PortBinding>().is_err());
        assert!("1:1/sctp".parse::<PortBinding>().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let workflow = Workflow::new("dev")
            .with_task(Task::command("build", "make"))
            .with_task(Task::command("build", "make test"));

        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate task name 'build'"));
    }

    #[test]
    fn test_validate_rejects_custom_check_without_predicate() {
        let workflow = Workflow::new("dev").with_task(
            Task::container("db", "postgres:16").with_health_check(HealthCheckSpec::custom(None)),
        );

        let err = workflow.validate().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(ref msg) if msg.contains("task 'db'")));
    }

    #[test]
    fn test_validate_leaves_unknown_dependencies_to_scheduler() {
        let workflow =
            Workflow::new("dev").with_task(Task::command("test", "cargo test").depends_on(["bulid"]));
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn test_effective_parallel_flag() {
        let workflow = Workflow::new("dev").with_parallel(true);
        let plain = Task::command("a", "true");
        let sequential = Task::command("b", "true").with_parallel(false);
        assert!(workflow.is_parallel(&plain));
        assert!(!workflow.is_parallel(&sequential));
    }

    #[tokio::test]
    async fn test_fn_predicate() {
        let predicate = FnPredicate::new(|| async { true });
        assert!(predicate.is_healthy().await);
    }
}
