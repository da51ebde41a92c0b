mod common;

use common::*;
use envflow::error::EngineError;
use envflow::scheduler::{TaskState, WorkflowScheduler};
use envflow::workflow::{ExecutionContext, Task, Workflow};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn ctx() -> ExecutionContext {
    ExecutionContext::new(std::env::temp_dir())
}

#[tokio::test(start_paused = true)]
async fn test_parallel_tasks_start_before_either_finishes() {
    let executor = Arc::new(
        RecordingExecutor::new()
            .with_delay("slow", Duration::from_secs(5))
            .with_delay("fast", Duration::from_millis(10)),
    );
    let scheduler = WorkflowScheduler::new(executor.clone());
    let workflow = Workflow::new("services")
        .with_parallel(true)
        .with_task(Task::command("slow", "true"))
        .with_task(Task::command("fast", "true"));

    scheduler.run(&workflow, &ctx()).await.unwrap();

    let first_finish = executor
        .events()
        .iter()
        .position(|e| matches!(e, ExecEvent::Finished(_)))
        .unwrap();
    let slow_start = executor.position(&ExecEvent::Started("slow".into())).unwrap();
    let fast_start = executor.position(&ExecEvent::Started("fast".into())).unwrap();
    assert!(slow_start < first_finish);
    assert!(fast_start < first_finish);
}

#[tokio::test(start_paused = true)]
async fn test_dependent_never_runs_before_dependency_succeeds() {
    let executor = Arc::new(RecordingExecutor::new().with_delay("a", Duration::from_secs(1)));
    let scheduler = WorkflowScheduler::new(executor.clone());
    let mut transitions = scheduler.events().subscribe();
    let workflow = Workflow::new("chain")
        .with_parallel(true)
        .with_task(Task::command("a", "true"))
        .with_task(Task::command("b", "true").depends_on(["a"]));

    scheduler.run(&workflow, &ctx()).await.unwrap();

    let mut a_succeeded = None;
    let mut b_running = None;
    let mut index = 0;
    while let Ok(event) = transitions.try_recv() {
        if event.task == "a" && event.to == TaskState::Succeeded {
            a_succeeded = Some(index);
        }
        if event.task == "b" && event.to == TaskState::Running {
            b_running = Some(index);
        }
        index += 1;
    }
    assert!(a_succeeded.unwrap() < b_running.unwrap());

    let a_finished = executor.position(&ExecEvent::Finished("a".into())).unwrap();
    let b_started = executor.position(&ExecEvent::Started("b".into())).unwrap();
    assert!(a_finished < b_started);
}

#[tokio::test]
async fn test_true_cycle_is_reported_before_anything_runs() {
    let executor = Arc::new(RecordingExecutor::new());
    let scheduler = WorkflowScheduler::new(executor.clone());
    let workflow = Workflow::new("cycle")
        .with_task(Task::command("A", "true").depends_on(["C"]))
        .with_task(Task::command("B", "true").depends_on(["A"]))
        .with_task(Task::command("C", "true").depends_on(["B"]));

    let err = scheduler.run(&workflow, &ctx()).await.unwrap_err();

    match &err {
        EngineError::Deadlock { unresolved, .. } => {
            let mut names: Vec<_> = unresolved.iter().map(|u| u.task.clone()).collect();
            names.sort();
            assert_eq!(names, vec!["A", "B", "C"]);
        }
        other => panic!("expected deadlock, got {other}"),
    }
    assert!(executor.events().is_empty());
}

#[tokio::test]
async fn test_sequential_workflow_runs_one_task_per_wave() {
    let executor = Arc::new(RecordingExecutor::new());
    let scheduler = WorkflowScheduler::new(executor.clone());
    let workflow = Workflow::new("seq")
        .with_task(Task::command("one", "true"))
        .with_task(Task::command("two", "true"))
        .with_task(Task::command("three", "true"));

    let report = scheduler.run(&workflow, &ctx()).await.unwrap();

    assert_eq!(report.waves, vec![vec!["one"], vec!["two"], vec!["three"]]);
    assert_eq!(executor.started(), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_failed_task_blocks_dependents() {
    let executor = Arc::new(RecordingExecutor::new().failing("build"));
    let scheduler = WorkflowScheduler::new(executor.clone());
    let workflow = Workflow::new("ci")
        .with_task(Task::command("build", "make"))
        .with_task(Task::command("test", "make test").depends_on(["build"]));

    let err = scheduler.run(&workflow, &ctx()).await.unwrap_err();

    assert!(matches!(err, EngineError::Task { ref task, .. } if task == "build"));
    assert_eq!(executor.started(), vec!["build"]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_workflow_error_names_the_task_that_could_not_start() {
    use envflow::cleanup::CleanupCoordinator;
    use envflow::container::ContainerApi;
    use envflow::runner::TaskRunner;
    use envflow::workflow::{CommandTask, TaskKind};

    let containers: Arc<dyn ContainerApi> = Arc::new(MockContainerApi::new());
    let cleanup = Arc::new(CleanupCoordinator::new(
        containers.clone(),
        Arc::new(MockProcessControl::default()),
    ));
    let scheduler = WorkflowScheduler::new(Arc::new(TaskRunner::new(containers, cleanup)));
    let (_dir, ctx) = temp_context();

    let mut missing_cwd = CommandTask::new("true");
    missing_cwd.cwd = Some("does-not-exist".into());
    let mut escaping_cwd = CommandTask::new("true");
    escaping_cwd.cwd = Some("../../etc".into());
    let workflow = Workflow::new("ci")
        .with_parallel(true)
        .with_task(Task::new("Migrate", TaskKind::Command(missing_cwd)))
        .with_task(Task::new("Seed", TaskKind::Command(escaping_cwd)));

    let err = scheduler.run(&workflow, &ctx).await.unwrap_err();

    match err {
        EngineError::WaveFailed { causes, .. } => {
            let mut named: Vec<_> = causes.iter().filter_map(|c| c.task_name()).collect();
            named.sort();
            assert_eq!(named, vec!["Migrate", "Seed"]);
            assert!(causes.iter().any(|c| matches!(
                c,
                EngineError::InTask { source, .. } if matches!(**source, EngineError::Sanitization(_))
            )));
        }
        other => panic!("expected both tasks to fail, got {other}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every acyclic workflow runs each task exactly once, after all of its dependencies
    #[test]
    fn acyclic_workflows_run_every_task_once_in_dependency_order(spec in dag_strategy()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let executor = Arc::new(RecordingExecutor::new());
        let scheduler = WorkflowScheduler::new(executor.clone());
        let workflow = spec.workflow();

        let report = runtime.block_on(scheduler.run(&workflow, &ctx()));
        prop_assert!(report.is_ok(), "run failed: {:?}", report.err());

        let started = executor.started();
        prop_assert_eq!(started.len(), spec.deps.len());

        for (index, deps) in spec.deps.iter().enumerate() {
            let name = DagSpec::task_name(index);
            prop_assert_eq!(started.iter().filter(|s| **s == name).count(), 1);

            let start = executor.position(&ExecEvent::Started(name.clone())).unwrap();
            for &dep in deps {
                let finished = executor
                    .position(&ExecEvent::Finished(DagSpec::task_name(dep)))
                    .unwrap();
                prop_assert!(finished < start, "{} started before {} finished", name, dep);
            }
        }
    }

    /// The plan of an acyclic workflow lists every task exactly once
    #[test]
    fn plan_covers_every_task(spec in dag_strategy()) {
        let plan = WorkflowScheduler::plan(&spec.workflow()).unwrap();
        prop_assert_eq!(plan.task_count(), spec.deps.len());
    }
}
