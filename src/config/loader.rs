//! Workflow Loader
//!
//! Turns a YAML workflow document into a validated [`Workflow`] plus the
//! [`ExecutionContext`] it runs in. Custom health checks reference predicates by name,
//! resolved through a [`PredicateRegistry`] supplied by the embedding program.

use crate::error::{EngineError, EngineResult};
use crate::scheduler::{ExecutionPlan, WorkflowScheduler};
use crate::workflow::{
    CommandTask, ContainerTask, ExecutionContext, HealthCheckSpec, HealthPredicate, HealthProbe,
    PortBinding, Task, TaskKind, Workflow,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MAX_WORKFLOW_FILE_SIZE: u64 = 1024 * 1024;

/// Named predicates available to `kind: custom` health checks
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: HashMap<String, Arc<dyn HealthPredicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, predicate: Arc<dyn HealthPredicate>) {
        self.predicates.insert(name.into(), predicate);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HealthPredicate>> {
        self.predicates.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.predicates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateRegistry")
            .field("predicates", &self.names())
            .finish()
    }
}

/// A workflow together with its run context
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub workflow: Workflow,
    pub context: ExecutionContext,
}

impl LoadedWorkflow {
    /// Dry scheduling pass: validates the workflow and detects deadlocks
    pub fn plan(&self) -> EngineResult<ExecutionPlan> {
        WorkflowScheduler::plan(&self.workflow)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowDocument {
    name: String,
    #[serde(default)]
    parallel: bool,
    #[serde(default)]
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    tasks: Vec<TaskDocument>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaskKindTag {
    Command,
    Docker,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Line(String),
    Args(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskDocument {
    name: String,
    kind: TaskKindTag,
    command: Option<CommandLine>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    background: bool,
    image: Option<String>,
    container_name: Option<String>,
    #[serde(default)]
    ports: Vec<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    parallel: Option<bool>,
    health_check: Option<HealthCheckDocument>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum HealthKindTag {
    Tcp,
    Http,
    Custom,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HealthCheckDocument {
    kind: HealthKindTag,
    #[serde(default = "default_host")]
    host: String,
    port: Option<u16>,
    path: Option<String>,
    predicate: Option<String>,
    retries: Option<u32>,
    /// Milliseconds between probes
    interval: Option<u64>,
    /// Milliseconds per probe
    timeout: Option<u64>,
}

fn default_host() -> String {
    "localhost".to_string()
}

/// Builds workflows from YAML documents
#[derive(Debug, Clone, Default)]
pub struct WorkflowLoader {
    predicates: PredicateRegistry,
}

impl WorkflowLoader {
    pub fn new(predicates: PredicateRegistry) -> Self {
        Self { predicates }
    }

    /// Load a workflow file. Relative working directories resolve against the file's directory.
    pub fn load_file(&self, path: &Path) -> EngineResult<LoadedWorkflow> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            EngineError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(EngineError::configuration(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if metadata.len() > MAX_WORKFLOW_FILE_SIZE {
            return Err(EngineError::configuration(format!(
                "{} is too large ({} bytes)",
                path.display(),
                metadata.len()
            )));
        }

        let text = std::fs::read_to_string(path)?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        debug!(path = %path.display(), "Loading workflow file");
        self.load_str(&text, &base_dir)
    }

    pub fn load_str(&self, text: &str, base_dir: &Path) -> EngineResult<LoadedWorkflow> {
        let document: WorkflowDocument = serde_yaml::from_str(text)?;

        let tasks = document
            .tasks
            .into_iter()
            .map(|doc| self.build_task(doc))
            .collect::<EngineResult<Vec<_>>>()?;

        let workflow = Workflow {
            name: document.name,
            parallel: document.parallel,
            tasks,
        };
        workflow.validate()?;

        let working_dir = match document.working_dir {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => base_dir.join(dir),
            None => base_dir.to_path_buf(),
        };

        let context = ExecutionContext {
            env: document.env,
            working_dir,
            dry_run: false,
        };

        debug!(
            workflow = %workflow.name,
            task_count = workflow.tasks.len(),
            "Workflow loaded"
        );

        Ok(LoadedWorkflow { workflow, context })
    }

    fn build_task(&self, doc: TaskDocument) -> EngineResult<Task> {
        let name = doc.name;
        let missing = |field: &str, kind: &str| {
            EngineError::configuration(format!(
                "task '{name}' of kind '{kind}' requires field '{field}'"
            ))
        };

        let kind = match doc.kind {
            TaskKindTag::Command => {
                let command = match doc.command {
                    Some(CommandLine::Line(line)) if !line.trim().is_empty() => line,
                    Some(CommandLine::Args(args)) if !args.is_empty() => shell_join(&args),
                    _ => return Err(missing("command", "command")),
                };
                if doc.image.is_some() || doc.container_name.is_some() || !doc.ports.is_empty() {
                    return Err(EngineError::configuration(format!(
                        "task '{name}' of kind 'command' cannot declare image, container_name or ports"
                    )));
                }
                TaskKind::Command(CommandTask {
                    command,
                    env: doc.env,
                    cwd: doc.cwd,
                    background: doc.background,
                })
            }
            TaskKindTag::Docker => {
                let image = doc
                    .image
                    .filter(|i| !i.trim().is_empty())
                    .ok_or_else(|| missing("image", "docker"))?;
                if doc.background || doc.cwd.is_some() {
                    return Err(EngineError::configuration(format!(
                        "task '{name}' of kind 'docker' cannot declare background or cwd"
                    )));
                }
                let ports = doc
                    .ports
                    .iter()
                    .map(|p| p.parse::<PortBinding>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| EngineError::configuration(format!("task '{name}': {e}")))?;
                // No shell runs inside the container, so a single line has no safe argv split
                let command = match doc.command {
                    Some(CommandLine::Line(_)) => {
                        return Err(EngineError::configuration(format!(
                            "task '{name}' of kind 'docker' must give 'command' as a list of arguments"
                        )))
                    }
                    Some(CommandLine::Args(args)) => Some(args),
                    None => None,
                };
                TaskKind::Container(ContainerTask {
                    image,
                    container_name: doc.container_name,
                    env: doc.env,
                    ports,
                    command,
                })
            }
        };

        let health_check = doc
            .health_check
            .map(|hc| self.build_health_check(&name, hc))
            .transpose()?;

        Ok(Task {
            name,
            kind,
            depends_on: doc.depends_on,
            parallel: doc.parallel,
            health_check,
        })
    }

    fn build_health_check(
        &self,
        task: &str,
        doc: HealthCheckDocument,
    ) -> EngineResult<HealthCheckSpec> {
        let require_port = || {
            doc.port.ok_or_else(|| {
                EngineError::configuration(format!("task '{task}': health check requires 'port'"))
            })
        };

        let probe = match doc.kind {
            HealthKindTag::Tcp => HealthProbe::Tcp {
                host: doc.host.clone(),
                port: require_port()?,
            },
            HealthKindTag::Http => {
                let path = doc.path.clone().unwrap_or_else(|| "/".to_string());
                HealthProbe::Http {
                    host: doc.host.clone(),
                    port: require_port()?,
                    path: if path.starts_with('/') {
                        path
                    } else {
                        format!("/{path}")
                    },
                }
            }
            HealthKindTag::Custom => {
                let name = doc.predicate.as_deref().ok_or_else(|| {
                    EngineError::configuration(format!(
                        "task '{task}': custom health check requires 'predicate'"
                    ))
                })?;
                let predicate = self.predicates.get(name).ok_or_else(|| {
                    EngineError::configuration(format!(
                        "task '{task}': unknown health predicate '{name}' (registered: {})",
                        self.predicates.names().join(", ")
                    ))
                })?;
                HealthProbe::Custom {
                    predicate: Some(predicate),
                }
            }
        };

        if doc.path.is_some() && !matches!(doc.kind, HealthKindTag::Http) {
            return Err(EngineError::configuration(format!(
                "task '{task}': 'path' is only valid for http health checks"
            )));
        }

        Ok(HealthCheckSpec {
            probe,
            retries: doc.retries.unwrap_or(HealthCheckSpec::DEFAULT_RETRIES),
            interval: doc
                .interval
                .map(Duration::from_millis)
                .unwrap_or(HealthCheckSpec::DEFAULT_INTERVAL),
            timeout: doc
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(HealthCheckSpec::DEFAULT_TIMEOUT),
        })
    }
}

/// Render an argument list as one line for the platform shell, quoting each element
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(not(windows))]
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(windows)]
fn shell_quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"', '&', '|', '<', '>', '^']) {
        arg.to_string()
    } else {
        format!("\"{}\"", arg.replace('"', "\"\""))
    }
}
