// tests/property/scheduler.rs

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use proptest::prelude::*;

use dagflow::dag::{FailureCause, Graph, RunStatus, TaskNode, TaskState};
use dagflow::engine::{
    AttemptOutcome, CoreCommand, CoreRuntime, RunQueue, RunTrigger, RuntimeEvent, RuntimeOptions,
};
use dagflow::types::{QueuedRunBehaviour, TriggerRule};

/// A random acyclic graph: task N may only depend on tasks 0..N-1.
#[derive(Debug, Clone)]
struct GraphSpec {
    deps: Vec<BTreeSet<usize>>,
    rules: Vec<TriggerRule>,
}

fn name(i: usize) -> String {
    format!("task_{i}")
}

fn rule_strategy() -> impl Strategy<Value = TriggerRule> {
    prop_oneof![
        Just(TriggerRule::AllSuccess),
        Just(TriggerRule::NoneFailed),
        Just(TriggerRule::AllDone),
    ]
}

fn graph_strategy(max_tasks: usize) -> impl Strategy<Value = GraphSpec> {
    (1..=max_tasks).prop_flat_map(|n| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n),
            proptest::collection::vec(rule_strategy(), n),
        )
            .prop_map(|(raw, rules)| {
                let deps = raw
                    .into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        if i == 0 {
                            BTreeSet::new()
                        } else {
                            picks.into_iter().map(|p| p % i).collect()
                        }
                    })
                    .collect();
                GraphSpec { deps, rules }
            })
    })
}

impl GraphSpec {
    fn build(&self) -> Graph {
        let nodes = self
            .deps
            .iter()
            .enumerate()
            .map(|(i, deps)| {
                deps.iter().fold(
                    TaskNode::new(name(i)).with_trigger_rule(self.rules[i]),
                    |node, d| node.after(name(*d)),
                )
            })
            .collect();
        Graph::new("prop", nodes).expect("generated graph is acyclic")
    }
}

/// Drive one run to completion, failing the given tasks. Returns the final
/// states, the dispatch order and the highest number of running tasks.
fn drive(
    graph: Graph,
    failing: &BTreeSet<String>,
    cap: usize,
) -> (HashMap<String, TaskState>, Vec<String>, RunStatus, usize) {
    let options = RuntimeOptions {
        max_parallel_tasks: cap,
        ..RuntimeOptions::default()
    };
    let mut core = CoreRuntime::new(
        Arc::new(graph),
        RunQueue::new(QueuedRunBehaviour::Queue, None),
        options,
    );

    let mut pending = VecDeque::new();
    let mut dispatched = Vec::new();
    let mut peak = 0;
    let mut finished = None;

    let mut step = core.step(RuntimeEvent::RunTriggered(RunTrigger::manual("r1")));
    for _ in 0..1_000 {
        peak = peak.max(core.running_count());
        for command in step.commands {
            match command {
                CoreCommand::DispatchTasks(tasks) => {
                    for t in tasks {
                        dispatched.push(t.name.clone());
                        pending.push_back(t);
                    }
                }
                CoreCommand::RunFinished(summary) => finished = Some(summary),
                _ => {}
            }
        }

        let Some(task) = pending.pop_front() else {
            break;
        };
        let outcome = if failing.contains(&task.name) {
            AttemptOutcome::Failed(FailureCause::fatal("injected"))
        } else {
            AttemptOutcome::success(1)
        };
        step = core.step(RuntimeEvent::AttemptFinished {
            run_id: task.run_id,
            task: task.name,
            attempt: task.attempt,
            outcome,
        });
    }

    let summary = finished.expect("run finished");
    let states = summary
        .states
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    (states, dispatched, summary.status, peak)
}

proptest! {
    #[test]
    fn topological_order_respects_every_edge(spec in graph_strategy(12)) {
        let graph = spec.build();
        let order: Vec<String> = graph.topological_order().map(str::to_string).collect();
        prop_assert_eq!(order.len(), graph.len());

        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
        for node in graph.nodes() {
            for up in &node.upstream {
                prop_assert!(position[up.as_str()] < position[node.name.as_str()]);
            }
        }
    }

    #[test]
    fn every_run_terminates_consistently(
        spec in graph_strategy(10),
        failing_idx in proptest::collection::btree_set(0..10usize, 0..4),
        cap in 1..4usize,
    ) {
        let graph = spec.build();
        let failing: BTreeSet<String> = failing_idx.into_iter().map(name).collect();
        let (states, dispatched, status, peak) = drive(graph, &failing, cap);

        prop_assert!(peak <= cap);
        prop_assert!(states.values().all(|s| s.is_terminal()));

        // Without retries every task runs at most once.
        let unique: BTreeSet<_> = dispatched.iter().collect();
        prop_assert_eq!(unique.len(), dispatched.len());

        for (i, deps) in spec.deps.iter().enumerate() {
            let state = states[&name(i)];
            let upstream: Vec<TaskState> = deps.iter().map(|d| states[&name(*d)]).collect();
            if state == TaskState::Success || (failing.contains(&name(i)) && state == TaskState::Failed) {
                // It ran, so its trigger rule held.
                match spec.rules[i] {
                    TriggerRule::AllSuccess => {
                        prop_assert!(upstream.iter().all(|s| *s == TaskState::Success));
                    }
                    TriggerRule::NoneFailed => {
                        prop_assert!(upstream.iter().all(|s| matches!(
                            s,
                            TaskState::Success | TaskState::Skipped
                        )));
                    }
                    TriggerRule::AllDone => {}
                }
            }
            if state == TaskState::Failed {
                prop_assert!(failing.contains(&name(i)));
            }
        }

        let any_failed = states.values().any(|s| s.is_failed());
        prop_assert_eq!(status == RunStatus::Failed, any_failed);
    }
}
