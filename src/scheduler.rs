//! # Workflow Scheduler
//!
//! Dependency-aware execution of a workflow in **waves**.
//!
//! ## Algorithm
//!
//! Each task starts with the set of dependencies it still waits on. Every round the
//! scheduler computes the ready set: tasks not yet started whose unmet set is empty.
//!
//! Tasks are grouped by declaration order. A maximal run of consecutive parallel tasks
//! forms one group; every sequential task is a group of its own. A round's wave is the
//! part of the ready set that shares a group with the earliest-declared ready task, so
//! a sequential task always runs alone and blocks the next wave until it resolves.
//!
//! An empty ready set while tasks remain unresolved is a deadlock. The error names
//! each stuck task with the dependencies it still waits on, which covers true cycles
//! and misspelled `depends_on` entries alike.
//!
//! ## Failure
//!
//! A failing task fails the workflow once its wave has drained: siblings already in
//! flight finish, no further wave starts. A single failure is reported as itself,
//! several as `WaveFailed`.

use crate::error::{EngineError, EngineResult, UnresolvedTask};
use crate::events::{EventPublisher, TaskTransition};
use crate::runner::{TaskExecutor, TaskOutcome};
use crate::workflow::{ExecutionContext, Workflow};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

/// Scheduler-side view of one task during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub name: String,
    pub unmet: BTreeSet<String>,
    pub state: TaskState,
    group: usize,
}

/// Waves in execution order, computed without running anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub workflow: String,
    pub waves: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn task_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub waves: Vec<Vec<String>>,
    pub task_durations: BTreeMap<String, Duration>,
    pub elapsed: Duration,
}

/// Node table for one run. Owned by a single control flow; never shared.
#[derive(Debug, Clone)]
struct RunState {
    workflow: String,
    nodes: Vec<TaskNode>,
}

impl RunState {
    fn new(workflow: &Workflow) -> Self {
        let mut group = 0;
        let mut previous_parallel = false;
        let nodes = workflow
            .tasks
            .iter()
            .enumerate()
            .map(|(position, task)| {
                let parallel = workflow.is_parallel(task);
                if position > 0 && !(parallel && previous_parallel) {
                    group += 1;
                }
                previous_parallel = parallel;
                TaskNode {
                    name: task.name.clone(),
                    unmet: task.depends_on.iter().cloned().collect(),
                    state: TaskState::Pending,
                    group,
                }
            })
            .collect();

        Self {
            workflow: workflow.name.clone(),
            nodes,
        }
    }

    fn is_resolved(&self) -> bool {
        self.nodes.iter().all(|n| n.state.is_terminal())
    }

    /// Indices of the next wave, `None` once every task is resolved.
    ///
    /// Newly ready tasks move Pending -> Ready; the transitions are appended to `moved`.
    fn next_wave(&mut self, moved: &mut Vec<(usize, TaskState, TaskState)>) -> EngineResult<Option<Vec<usize>>> {
        if self.is_resolved() {
            return Ok(None);
        }

        let ready: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.state, TaskState::Pending | TaskState::Ready) && n.unmet.is_empty())
            .map(|(i, _)| i)
            .collect();

        if ready.is_empty() {
            return Err(self.deadlock());
        }

        for &i in &ready {
            if self.nodes[i].state == TaskState::Pending {
                self.nodes[i].state = TaskState::Ready;
                moved.push((i, TaskState::Pending, TaskState::Ready));
            }
        }

        let group = self.nodes[ready[0]].group;
        Ok(Some(
            ready
                .into_iter()
                .filter(|&i| self.nodes[i].group == group)
                .collect(),
        ))
    }

    fn start(&mut self, index: usize) -> (TaskState, TaskState) {
        let from = self.nodes[index].state;
        self.nodes[index].state = TaskState::Running;
        (from, TaskState::Running)
    }

    fn complete(&mut self, index: usize, succeeded: bool) -> (TaskState, TaskState) {
        let from = self.nodes[index].state;
        let to = if succeeded {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        self.nodes[index].state = to;

        if succeeded {
            let name = self.nodes[index].name.clone();
            for node in &mut self.nodes {
                node.unmet.remove(&name);
            }
        }
        (from, to)
    }

    fn deadlock(&self) -> EngineError {
        let unresolved = self
            .nodes
            .iter()
            .filter(|n| !n.state.is_terminal())
            .map(|n| UnresolvedTask {
                task: n.name.clone(),
                unmet: n.unmet.iter().cloned().collect(),
            })
            .collect();
        EngineError::Deadlock {
            workflow: self.workflow.clone(),
            unresolved,
        }
    }
}

pub struct WorkflowScheduler {
    executor: Arc<dyn TaskExecutor>,
    events: EventPublisher,
}

impl fmt::Debug for WorkflowScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowScheduler")
            .field("subscribers", &self.events.subscriber_count())
            .finish()
    }
}

impl WorkflowScheduler {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor,
            events: EventPublisher::default(),
        }
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Compute the waves of `workflow` as if every task succeeded
    pub fn plan(workflow: &Workflow) -> EngineResult<ExecutionPlan> {
        workflow.validate()?;

        let mut state = RunState::new(workflow);
        let mut waves = Vec::new();
        let mut moved = Vec::new();
        while let Some(wave) = state.next_wave(&mut moved)? {
            for &i in &wave {
                state.start(i);
                state.complete(i, true);
            }
            waves.push(wave.into_iter().map(|i| state.nodes[i].name.clone()).collect());
        }

        Ok(ExecutionPlan {
            workflow: workflow.name.clone(),
            waves,
        })
    }

    /// Run `workflow` to completion, or abort after the first wave containing a failure.
    ///
    /// Structural problems and deadlocks are detected before any task executes.
    #[instrument(skip_all, fields(workflow = %workflow.name))]
    pub async fn run(&self, workflow: &Workflow, ctx: &ExecutionContext) -> EngineResult<WorkflowReport> {
        let plan = Self::plan(workflow)?;
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        info!(
            run_id = %run_id,
            tasks = workflow.tasks.len(),
            planned_waves = plan.waves.len(),
            dry_run = ctx.dry_run,
            "▶️  Starting workflow"
        );

        let mut state = RunState::new(workflow);
        let mut waves = Vec::new();
        let mut task_durations = BTreeMap::new();
        let mut moved = Vec::new();

        while let Some(wave) = state.next_wave(&mut moved)? {
            for (i, from, to) in moved.drain(..) {
                self.emit(&state, i, from, to);
            }

            let names: Vec<String> = wave.iter().map(|&i| state.nodes[i].name.clone()).collect();
            debug!(wave = waves.len() + 1, tasks = ?names, "Dispatching wave");

            for &i in &wave {
                let (from, to) = state.start(i);
                self.emit(&state, i, from, to);
            }

            let results = join_all(wave.iter().map(|&i| {
                let task = &workflow.tasks[i];
                async move {
                    let task_started = Instant::now();
                    let result = self.executor.execute(task, ctx).await;
                    (i, result, task_started.elapsed())
                }
            }))
            .await;

            let mut failures = Vec::new();
            for (i, result, elapsed) in results {
                let name = state.nodes[i].name.clone();
                task_durations.insert(name.clone(), elapsed);

                let succeeded = matches!(result, Ok(TaskOutcome::Succeeded));
                let (from, to) = state.complete(i, succeeded);
                self.emit(&state, i, from, to);

                match result {
                    Ok(TaskOutcome::Succeeded) => {
                        info!(task = %name, duration_ms = elapsed.as_millis() as u64, "✅ Task succeeded");
                    }
                    Ok(TaskOutcome::Failed(failure)) => failures.push(failure.into_error(&name)),
                    Err(err) => failures.push(err.in_task(&name)),
                }
            }
            waves.push(names);

            if !failures.is_empty() {
                for failure in &failures {
                    error!(error = %failure, "❌ Task failed");
                }
                return Err(EngineError::aggregate(&workflow.name, failures));
            }
        }

        let elapsed = started.elapsed();
        info!(
            run_id = %run_id,
            waves = waves.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "🎉 Workflow completed"
        );

        Ok(WorkflowReport {
            run_id,
            workflow: workflow.name.clone(),
            waves,
            task_durations,
            elapsed,
        })
    }

    fn emit(&self, state: &RunState, index: usize, from: TaskState, to: TaskState) {
        let node = &state.nodes[index];
        debug!(task = %node.name, from = %from, to = %to, "Task transition");
        self.events
            .publish(TaskTransition::new(&state.workflow, &node.name, from, to));
    }
}
