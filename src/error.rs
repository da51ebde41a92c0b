//! # Engine Errors
//!
//! Error taxonomy shared by every component of the execution engine.
//!
//! - **Configuration**: malformed task or health-check definitions, never retried
//! - **Deadlock**: no task is runnable although some remain unresolved
//! - **Task**: a task ran and failed (non-zero exit, missing field for its kind)
//! - **HealthCheck**: a started service never reported ready
//! - **Retry**: attempts exhausted around pull, start or another retried operation
//! - **WaveFailed**: several tasks of one wave failed; carries every cause

use crate::container::ContainerError;
use std::fmt;
use thiserror::Error;

/// A task the scheduler could not make runnable, with the dependencies it still waits on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedTask {
    pub task: String,
    pub unmet: Vec<String>,
}

impl fmt::Display for UnresolvedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (waiting on: {})", self.task, self.unmet.join(", "))
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Deadlock in workflow '{workflow}': no runnable task among {}", format_unresolved(.unresolved))]
    Deadlock {
        workflow: String,
        unresolved: Vec<UnresolvedTask>,
    },

    #[error("Task '{task}' failed: {reason}")]
    Task { task: String, reason: String },

    /// An engine-level error raised while running a specific task
    #[error("Task '{task}' failed: {source}")]
    InTask {
        task: String,
        source: Box<EngineError>,
    },

    #[error("Health check for task '{task}' failed after {attempts} attempts: {last_error}")]
    HealthCheck {
        task: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{operation} failed after {attempts} attempts: {cause}")]
    Retry {
        operation: String,
        attempts: u32,
        cause: Box<EngineError>,
    },

    #[error("Workflow '{workflow}' failed: {} tasks failed in the same wave", .causes.len())]
    WaveFailed {
        workflow: String,
        causes: Vec<EngineError>,
    },

    #[error("Rejected unsafe input: {0}")]
    Sanitization(String),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_unresolved(unresolved: &[UnresolvedTask]) -> String {
    unresolved
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn task(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Task {
            task: task.into(),
            reason: reason.into(),
        }
    }

    /// Attach the owning task's name unless the error already carries one
    pub fn in_task(self, task: &str) -> Self {
        match self {
            Self::Task { .. } | Self::HealthCheck { .. } | Self::InTask { .. } => self,
            other => Self::InTask {
                task: task.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Name of the task this error belongs to, if any
    pub fn task_name(&self) -> Option<&str> {
        match self {
            Self::Task { task, .. } | Self::HealthCheck { task, .. } | Self::InTask { task, .. } => {
                Some(task)
            }
            _ => None,
        }
    }

    /// Whether wrapping the failing operation in a retry could ever help
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration(_) | Self::Deadlock { .. } | Self::Sanitization(_) => false,
            Self::Container(err) => !err.is_not_found(),
            Self::InTask { source, .. } => source.is_retryable(),
            _ => true,
        }
    }

    /// Process exit code for the CLI boundary. Every engine failure collapses to 1.
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Human hints printed below the error by the CLI
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Self::Configuration(_) => {
                vec!["Run `envflow validate <file>` to check the workflow definition".to_string()]
            }
            Self::Deadlock { unresolved, .. } => {
                let mut hints = vec![
                    "Check `depends_on` entries for typos and circular references".to_string(),
                ];
                hints.extend(
                    unresolved
                        .iter()
                        .map(|u| format!("'{}' waits on: {}", u.task, u.unmet.join(", "))),
                );
                hints
            }
            Self::HealthCheck { .. } => vec![
                "Increase `retries` or `interval` on the health check".to_string(),
                "Inspect the service output with `envflow logs <container>`".to_string(),
            ],
            Self::Container(_) => {
                vec!["Make sure the container daemon is running and reachable".to_string()]
            }
            Self::Retry { cause, .. } | Self::InTask { source: cause, .. } => cause.suggestions(),
            Self::WaveFailed { causes, .. } => {
                causes.iter().flat_map(EngineError::suggestions).collect()
            }
            Self::Task { .. } | Self::Sanitization(_) | Self::Io(_) => Vec::new(),
        }
    }

    /// Collapse the failures of one wave: a single failure is reported as itself
    pub fn aggregate(workflow: &str, mut causes: Vec<EngineError>) -> Self {
        if causes.len() == 1 {
            causes.remove(0)
        } else {
            Self::WaveFailed {
                workflow: workflow.to_string(),
                causes,
            }
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(format!("Invalid workflow document: {err}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
