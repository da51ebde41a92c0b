#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # envflow
//!
//! Dependency-aware execution engine for local development and test environments.
//!
//! ## Overview
//!
//! A workflow is an ordered set of tasks. Each task either runs a shell command or
//! manages a container, may depend on other tasks, may run in parallel with its
//! neighbours, and may be gated on a readiness check. The engine runs the workflow
//! in waves and guarantees that every container or background process it started is
//! torn down on success, failure or interruption.
//!
//! ## Module Organization
//!
//! - [`scheduler`] - Wave computation, deadlock detection and dispatch
//! - [`runner`] - Executes one command or container task
//! - [`retry`] - Bounded exponential backoff
//! - [`health`] - TCP, HTTP and custom readiness probes
//! - [`cleanup`] - Ledger of live resources and at-most-once teardown
//! - [`logs`] - Decoder for multiplexed container log streams
//! - [`container`] - Container runtime abstraction and the `docker` CLI client
//! - [`config`] - Engine configuration and the YAML workflow loader
//! - [`signals`] - SIGINT/SIGTERM routed into cleanup
//! - [`events`] - Broadcast of task state transitions
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use envflow::cleanup::CleanupCoordinator;
//! use envflow::container::DockerCli;
//! use envflow::runner::TaskRunner;
//! use envflow::scheduler::WorkflowScheduler;
//! use envflow::workflow::{ExecutionContext, Task, Workflow};
//! use std::sync::Arc;
//!
//! # async fn example() -> envflow::error::EngineResult<()> {
//! let containers = Arc::new(DockerCli::default());
//! let cleanup = Arc::new(CleanupCoordinator::with_system_processes(containers.clone()));
//! let runner = TaskRunner::new(containers, cleanup.clone());
//! let scheduler = WorkflowScheduler::new(Arc::new(runner));
//!
//! let workflow = Workflow::new("dev")
//!     .with_task(Task::container("db", "postgres:16"))
//!     .with_task(Task::command("migrate", "make migrate").depends_on(["db"]));
//!
//! let result = scheduler.run(&workflow, &ExecutionContext::new(".")).await;
//! cleanup.trigger("done").await;
//! result.map(|_| ())
//! # }
//! ```

pub mod cleanup;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod logs;
pub mod retry;
pub mod runner;
pub mod sanitize;
pub mod scheduler;
pub mod signals;
pub mod workflow;

pub use crate::cleanup::{CleanupCoordinator, CleanupReport, Registration, ResourceHandle, ResourceKind};
pub use crate::config::{EngineConfig, WorkflowLoader};
pub use crate::error::{EngineError, EngineResult};
pub use crate::retry::{RetryError, RetryPolicy};
pub use crate::runner::{TaskExecutor, TaskOutcome, TaskRunner};
pub use crate::scheduler::{ExecutionPlan, TaskState, WorkflowReport, WorkflowScheduler};
pub use crate::workflow::{ExecutionContext, Task, TaskKind, Workflow};
