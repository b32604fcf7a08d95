use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use petgraph::unionfind::UnionFind;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::{Fingerprint, FingerprintCache};
use crate::engine::{ExecutionResult, ExecutorOptions, Failure, Outcome, SkipReason};
use crate::error::TaskExecutionError;
use crate::graph::{Edge, TaskGraph};
use crate::task::{Task, TaskContext};

/// This function executes the scheduled part of the task graph on a thread
/// pool, dispatching each task as soon as everything it waits for has reached
/// a terminal state.
///
/// The algorithm works as follows:
/// 1. The number of scheduled prerequisites is counted for every scheduled
///    task. Both dependency and ordering edges count, but only when their
///    source is scheduled too.
/// 2. Tasks with no prerequisites are dispatched to the pool.
/// 3. The calling thread blocks on a channel, waiting for results from the
///    workers.
/// 4. When a result arrives, the counts of its dependents are decremented.
///    Dependents reaching zero are dispatched, unless a dependency failed or
///    their group was halted, in which case their result is decided on the
///    spot without running them.
/// 5. The loop continues until every scheduled task has a result.
///
/// A group is a set of scheduled tasks connected through dependency edges,
/// in either direction. Under fail-fast a failing action halts its own group:
/// tasks of that group not yet dispatched are cancelled. Other groups have no
/// relation to the failure and keep running. Setting `cancelled` halts every
/// group. A task that was dispatched always runs.
pub(crate) fn run_tasks_parallel(
    pool: &rayon::ThreadPool,
    graph: &TaskGraph,
    cache: &FingerprintCache,
    options: &ExecutorOptions,
    cancelled: &AtomicBool,
    scheduled: &[NodeIndex],
) -> HashMap<NodeIndex, ExecutionResult> {
    let mut results = HashMap::new();
    let total_tasks = scheduled.len() as u64;

    if total_tasks == 0 {
        return results;
    }

    let selected: HashSet<NodeIndex> = scheduled.iter().copied().collect();

    // Build a map from a prerequisite to the scheduled nodes waiting for it.
    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    let mut dependency_counts: HashMap<NodeIndex, usize> = HashMap::new();
    for &index in scheduled {
        let prerequisites: Vec<_> = graph
            .prerequisites(index, None)
            .into_iter()
            .filter(|dep| selected.contains(dep))
            .collect();

        for &dep in &prerequisites {
            dependents.entry(dep).or_default().push(index);
        }
        dependency_counts.insert(index, prerequisites.len());
    }

    let mut groups = UnionFind::<usize>::new(graph.graph.node_count());
    for &index in scheduled {
        for dep in graph.prerequisites(index, Some(Edge::Dependency)) {
            if selected.contains(&dep) {
                groups.union(dep.index(), index.index());
            }
        }
    }
    let mut halted: HashSet<usize> = HashSet::new();

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(total_tasks);
    root_span.pb_set_style(&crate::utils::style_root());
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let pb_style = crate::utils::style_task();
    let mut completed_tasks = 0;

    pool.in_place_scope(|s| {
        let (result_sender, result_receiver) = channel::<(NodeIndex, ExecutionResult)>();

        // A helper closure to dispatch a task, or to settle it right away when
        // it can't run.
        let spawn_task = |results: &HashMap<NodeIndex, ExecutionResult>,
                          halted: &HashSet<usize>,
                          index: NodeIndex| {
            let task = &graph.graph[index];

            let failed = graph
                .prerequisites(index, Some(Edge::Dependency))
                .into_iter()
                .find(|dep| results.get(dep).is_some_and(ExecutionResult::is_failed));

            let settled = if let Some(dep) = failed {
                Some(Outcome::Failed(Failure::Dependency(graph.graph[dep].name.clone())))
            } else if cancelled.load(Ordering::SeqCst)
                || halted.contains(&groups.find(index.index()))
            {
                Some(Outcome::Skipped(SkipReason::Cancelled))
            } else if !task.enabled {
                Some(Outcome::Skipped(SkipReason::Disabled))
            } else {
                None
            };

            if let Some(outcome) = settled {
                let result = ExecutionResult::new(task.name.clone(), outcome, Duration::ZERO, String::new());
                let _ = result_sender.send((index, result));
                return;
            }

            let sender = result_sender.clone();
            let pb_style = pb_style.clone();

            s.spawn(move |_| {
                let span = tracing::span!(Level::INFO, "task", name = %task.name);
                span.pb_set_style(&pb_style);
                span.pb_set_message(&format!("Running {}", task.name));
                let _enter = span.enter();

                let result = execute_task(task, cache, options, span.clone());
                let _ = sender.send((index, result));
            });
        };

        // Seed initial tasks
        for &index in scheduled {
            if dependency_counts.get(&index).copied().unwrap_or(0) == 0 {
                spawn_task(&results, &halted, index);
            }
        }

        // Scheduler loop
        // The calling thread sits here while pool workers execute tasks.
        while completed_tasks < total_tasks {
            let Ok((completed_index, result)) = result_receiver.recv() else {
                break;
            };

            log_result(&result);

            if options.fail_fast && matches!(result.outcome, Outcome::Failed(Failure::Action(_))) {
                halted.insert(groups.find(completed_index.index()));
            }

            results.insert(completed_index, result);
            completed_tasks += 1;
            root_span.pb_inc(1);

            // Unlock dependents
            if let Some(waiting) = dependents.get(&completed_index) {
                for &index in waiting {
                    if let Some(count) = dependency_counts.get_mut(&index) {
                        *count -= 1;
                        if *count == 0 {
                            spawn_task(&results, &halted, index);
                        }
                    }
                }
            }
        }
    });

    results
}

/// Run a single task on the current worker, consulting the cache before and
/// updating it after.
fn execute_task(
    task: &Task,
    cache: &FingerprintCache,
    options: &ExecutorOptions,
    span: tracing::Span,
) -> ExecutionResult {
    let start = Instant::now();
    let trackable = task.is_trackable();

    if options.incremental && trackable {
        match Fingerprint::of(task, &options.root) {
            Ok(current) if cache.is_up_to_date(&task.name, &current) => {
                let outcome = Outcome::Skipped(SkipReason::UpToDate);
                return ExecutionResult::new(task.name.clone(), outcome, start.elapsed(), String::new());
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(task = %task.name, "couldn't fingerprint task: {err}"),
        }
    }

    let mut context = TaskContext::new(&task.name, &options.root, span);

    // Panics are contained to the task that raised them; the task only
    // touches its own context and the files it declares.
    let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        task.execute(&mut context)
    })) {
        Ok(Ok(())) => Outcome::Succeeded,
        Ok(Err(err)) => Outcome::Failed(Failure::Action(TaskExecutionError::from(err))),
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Outcome::Failed(Failure::Action(TaskExecutionError::new(anyhow::anyhow!(msg))))
        }
    };

    let result = ExecutionResult::new(
        task.name.clone(),
        outcome,
        start.elapsed(),
        context.into_output(),
    );

    if trackable {
        match Fingerprint::of(task, &options.root) {
            Ok(fingerprint) => {
                cache.record(&result, fingerprint);
            }
            Err(err) => tracing::warn!(task = %task.name, "couldn't fingerprint task: {err}"),
        }
    }

    result
}

fn log_result(result: &ExecutionResult) {
    match &result.outcome {
        Outcome::Failed(Failure::Action(err)) => {
            tracing::error!(task = %result.name, "task failed: {err}");
        }
        Outcome::Failed(Failure::Dependency(dep)) => {
            tracing::warn!(task = %result.name, "not run, dependency '{dep}' failed");
        }
        outcome => {
            tracing::info!(task = %result.name, duration = ?result.duration, "{outcome}");
        }
    }
}
