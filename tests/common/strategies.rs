use envflow::workflow::{Task, Workflow};
use proptest::prelude::*;

/// A generated acyclic workflow: tasks may only depend on tasks with a lower index,
/// while declaration order is an arbitrary permutation of those indices
#[derive(Debug, Clone)]
pub struct DagSpec {
    pub deps: Vec<Vec<usize>>,
    pub parallel: Vec<bool>,
    pub declaration_order: Vec<usize>,
    pub workflow_parallel: bool,
}

impl DagSpec {
    pub fn task_name(index: usize) -> String {
        format!("t{index}")
    }

    pub fn workflow(&self) -> Workflow {
        let mut workflow = Workflow::new("generated").with_parallel(self.workflow_parallel);
        for &index in &self.declaration_order {
            let mut task = Task::command(Self::task_name(index), "true")
                .depends_on(self.deps[index].iter().map(|&d| Self::task_name(d)));
            if self.parallel[index] != self.workflow_parallel {
                task = task.with_parallel(self.parallel[index]);
            }
            workflow = workflow.with_task(task);
        }
        workflow
    }
}

pub fn dag_strategy() -> impl Strategy<Value = DagSpec> {
    (1usize..9)
        .prop_flat_map(|n| {
            let deps = (0..n)
                .map(|i| {
                    if i == 0 {
                        Just(Vec::new()).boxed()
                    } else {
                        prop::collection::btree_set(0..i, 0..=i.min(3))
                            .prop_map(|set| set.into_iter().collect::<Vec<_>>())
                            .boxed()
                    }
                })
                .collect::<Vec<_>>();
            (
                deps,
                prop::collection::vec(any::<bool>(), n),
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
                any::<bool>(),
            )
        })
        .prop_map(|(deps, parallel, declaration_order, workflow_parallel)| DagSpec {
            deps,
            parallel,
            declaration_order,
            workflow_parallel,
        })
}
