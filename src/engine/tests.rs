use std::fs;
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;

use super::*;
use crate::task::{Input, Task};

type Log = Arc<Mutex<Vec<String>>>;

fn recording(name: &str, log: &Log) -> Task {
    let log = log.clone();
    let label = name.to_string();
    Task::new(name, move |_| {
        log.lock().unwrap().push(label.clone());
        Ok(())
    })
}

fn failing(name: &str, log: &Log) -> Task {
    let log = log.clone();
    let label = name.to_string();
    Task::new(name, move |_| {
        log.lock().unwrap().push(label.clone());
        anyhow::bail!("{label} exploded")
    })
}

fn executor(parallelism: usize, fail_fast: bool) -> Executor {
    Executor::new(ExecutorOptions {
        fail_fast,
        parallelism: NonZeroUsize::new(parallelism).unwrap(),
        ..Default::default()
    })
}

fn build(tasks: Vec<Task>) -> TaskGraph {
    let mut graph = TaskGraph::new();
    for task in tasks {
        graph.add_task(task).unwrap();
    }
    graph.link_declared().unwrap();
    graph
}

fn names(report: &Report) -> Vec<&str> {
    report.results.iter().map(|r| &*r.name).collect()
}

#[test]
fn test_chain_runs_in_dependency_order() {
    let log = Log::default();
    let graph = build(vec![
        recording("A", &log).depends_on("B"),
        recording("B", &log).depends_on("C"),
        recording("C", &log),
    ]);

    let report = executor(4, true)
        .run(&graph, &FingerprintCache::in_memory(), &["A"])
        .unwrap();

    assert_eq!(*log.lock().unwrap(), ["C", "B", "A"]);
    assert_eq!(names(&report), ["C", "B", "A"]);
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn test_only_closure_of_request_runs() {
    let log = Log::default();
    let graph = build(vec![
        recording("compile", &log),
        recording("lint", &log).depends_on("compile"),
        recording("unrelated", &log),
    ]);

    let report = executor(2, true)
        .run(&graph, &FingerprintCache::in_memory(), &["lint"])
        .unwrap();

    assert_eq!(names(&report), ["compile", "lint"]);
    assert!(!log.lock().unwrap().contains(&"unrelated".to_string()));
}

#[test]
fn test_empty_request_runs_everything() {
    let log = Log::default();
    let graph = build(vec![recording("a", &log), recording("b", &log)]);

    let report = executor(2, true)
        .run::<&str>(&graph, &FingerprintCache::in_memory(), &[])
        .unwrap();

    assert_eq!(report.results.len(), 2);
}

#[test]
fn test_unknown_request_is_an_error() {
    let graph = build(vec![]);
    let err = executor(1, true)
        .run(&graph, &FingerprintCache::in_memory(), &["ghost"])
        .unwrap_err();

    assert!(matches!(
        err,
        ShikumiError::Graph(crate::GraphError::UnknownTask(_))
    ));
}

#[test]
fn test_results_are_reported_in_topological_order() {
    let log = Log::default();
    let slow = {
        let log = log.clone();
        Task::new("slow", move |_| {
            std::thread::sleep(Duration::from_millis(50));
            log.lock().unwrap().push("slow".into());
            Ok(())
        })
    };
    let graph = build(vec![
        slow,
        recording("fast", &log),
        recording("last", &log).depends_on("slow").depends_on("fast"),
    ]);

    let report = executor(4, true)
        .run(&graph, &FingerprintCache::in_memory(), &["last"])
        .unwrap();

    // "fast" finishes first, yet reporting follows registration order.
    assert_eq!(log.lock().unwrap()[0], "fast");
    assert_eq!(names(&report), ["slow", "fast", "last"]);
}

#[test]
fn test_second_run_is_skipped() {
    let log = Log::default();
    let graph = build(vec![
        recording("compile", &log).input(Input::Value("-Werror".into())),
        recording("lint", &log)
            .depends_on("compile")
            .input(Input::Value("pmd".into())),
    ]);
    let cache = FingerprintCache::in_memory();
    let executor = executor(2, true);

    let first = executor.run(&graph, &cache, &["lint"]).unwrap();
    assert_eq!(first.succeeded(), 2);

    let second = executor.run(&graph, &cache, &["lint"]).unwrap();
    assert_eq!(second.skipped(), 2);
    for result in &second.results {
        assert!(matches!(result.outcome, Outcome::Skipped(SkipReason::UpToDate)));
    }
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[test]
fn test_undeclared_task_always_runs() {
    let log = Log::default();
    let graph = build(vec![recording("check", &log)]);
    let cache = FingerprintCache::in_memory();
    let executor = executor(1, true);

    executor.run(&graph, &cache, &["check"]).unwrap();
    let second = executor.run(&graph, &cache, &["check"]).unwrap();

    assert_eq!(second.succeeded(), 1);
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[test]
fn test_changed_input_reruns_only_that_task() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    fs::write(root.join("left.txt"), "left").unwrap();
    fs::write(root.join("right.txt"), "right").unwrap();

    let log = Log::default();
    let graph = build(vec![
        recording("left", &log).input(Input::Path("left.txt".into())),
        recording("right", &log).input(Input::Path("right.txt".into())),
    ]);
    let cache = FingerprintCache::in_memory();
    let executor = Executor::new(ExecutorOptions {
        root: root.clone(),
        ..Default::default()
    });

    executor.run(&graph, &cache, &["left", "right"]).unwrap();
    fs::write(root.join("left.txt"), "left, edited").unwrap();
    let report = executor.run(&graph, &cache, &["left", "right"]).unwrap();

    assert_eq!(report.get("left").unwrap().status(), Status::Succeeded);
    assert_eq!(report.get("right").unwrap().status(), Status::Skipped);
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[test]
fn test_no_incremental_bypasses_cache() {
    let log = Log::default();
    let graph = build(vec![recording("a", &log).input(Input::Value("x".into()))]);
    let cache = FingerprintCache::in_memory();

    let incremental = executor(1, true);
    incremental.run(&graph, &cache, &["a"]).unwrap();

    let forced = Executor::new(ExecutorOptions {
        incremental: false,
        ..Default::default()
    });
    let report = forced.run(&graph, &cache, &["a"]).unwrap();
    assert_eq!(report.succeeded(), 1);

    // the forced run still refreshed the fingerprint
    let report = incremental.run(&graph, &cache, &["a"]).unwrap();
    assert_eq!(report.skipped(), 1);
}

#[test]
fn test_failure_is_not_recorded() {
    let log = Log::default();
    let graph = build(vec![failing("a", &log).input(Input::Value("x".into()))]);
    let cache = FingerprintCache::in_memory();
    let executor = executor(1, true);

    executor.run(&graph, &cache, &["a"]).unwrap();
    let report = executor.run(&graph, &cache, &["a"]).unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(log.lock().unwrap().len(), 2);
    assert!(cache.get("a").is_none());
}

#[test]
fn test_fail_fast_spares_unrelated_task() {
    // One worker runs B before D, so the failure is always seen first.
    for _ in 0..20 {
        let log = Log::default();
        let graph = build(vec![
            failing("B", &log),
            recording("A", &log).depends_on("B"),
            recording("D", &log),
        ]);

        let report = executor(1, true)
            .run(&graph, &FingerprintCache::in_memory(), &["A", "D"])
            .unwrap();

        assert!(matches!(
            &report.get("A").unwrap().outcome,
            Outcome::Failed(Failure::Dependency(dep)) if &**dep == "B"
        ));
        assert!(matches!(
            report.get("B").unwrap().outcome,
            Outcome::Failed(Failure::Action(_))
        ));
        assert_eq!(report.get("D").unwrap().status(), Status::Succeeded);
        assert_eq!(*log.lock().unwrap(), ["B", "D"]);
        assert_eq!(report.exit_code(), 1);
    }
}

#[test]
fn test_fail_fast_spares_unrelated_chain() {
    let log = Log::default();
    let slow = {
        let log = log.clone();
        Task::new("C", move |_| {
            std::thread::sleep(Duration::from_millis(50));
            log.lock().unwrap().push("C".into());
            Ok(())
        })
    };

    let graph = build(vec![
        failing("B", &log),
        recording("A", &log).depends_on("B"),
        slow,
        recording("D", &log).depends_on("C"),
    ]);

    let report = executor(4, true)
        .run(&graph, &FingerprintCache::in_memory(), &["A", "D"])
        .unwrap();

    assert_eq!(report.get("C").unwrap().status(), Status::Succeeded);
    assert_eq!(report.get("D").unwrap().status(), Status::Succeeded);
    assert!(report.get("A").unwrap().is_failed());
}

/// `top` joins the failing `B` with the `E -> F` chain. With a single worker
/// B and E are dispatched together and B finishes first.
fn related_graph(log: &Log) -> TaskGraph {
    build(vec![
        failing("B", log),
        recording("E", log),
        recording("F", log).depends_on("E"),
        recording("top", log).depends_on("B").depends_on("F"),
    ])
}

#[test]
fn test_fail_fast_withholds_related_tasks() {
    let log = Log::default();
    let graph = related_graph(&log);

    let report = executor(1, true)
        .run(&graph, &FingerprintCache::in_memory(), &["top"])
        .unwrap();

    assert_eq!(report.get("E").unwrap().status(), Status::Succeeded);
    assert!(matches!(
        report.get("F").unwrap().outcome,
        Outcome::Skipped(SkipReason::Cancelled)
    ));
    assert!(matches!(
        &report.get("top").unwrap().outcome,
        Outcome::Failed(Failure::Dependency(dep)) if &**dep == "B"
    ));
    assert_eq!(*log.lock().unwrap(), ["B", "E"]);
}

#[test]
fn test_without_fail_fast_related_tasks_run() {
    let log = Log::default();
    let graph = related_graph(&log);

    let report = executor(1, false)
        .run(&graph, &FingerprintCache::in_memory(), &["top"])
        .unwrap();

    assert_eq!(report.get("F").unwrap().status(), Status::Succeeded);
    assert!(report.get("top").unwrap().is_failed());
}

#[test]
fn test_cancellation_before_run() {
    let log = Log::default();
    let graph = build(vec![recording("a", &log), recording("b", &log).depends_on("a")]);
    let executor = executor(2, true);

    executor.cancellation().store(true, Ordering::SeqCst);
    let report = executor
        .run(&graph, &FingerprintCache::in_memory(), &["b"])
        .unwrap();

    assert_eq!(report.skipped(), 2);
    assert!(matches!(
        report.get("a").unwrap().outcome,
        Outcome::Skipped(SkipReason::Cancelled)
    ));
    assert!(log.lock().unwrap().is_empty());
    assert!(!executor.cancellation().load(Ordering::SeqCst));

    let report = executor
        .run(&graph, &FingerprintCache::in_memory(), &["b"])
        .unwrap();
    assert_eq!(report.succeeded(), 2);
}

#[test]
fn test_without_fail_fast_independent_branches_continue() {
    let log = Log::default();
    let graph = build(vec![
        failing("B", &log),
        recording("A", &log).depends_on("B"),
        recording("top", &log).depends_on("A"),
        recording("E", &log),
        recording("F", &log).depends_on("E"),
    ]);

    let report = executor(1, false)
        .run(&graph, &FingerprintCache::in_memory(), &["top", "F"])
        .unwrap();

    assert_eq!(report.get("F").unwrap().status(), Status::Succeeded);
    assert!(matches!(
        &report.get("A").unwrap().outcome,
        Outcome::Failed(Failure::Dependency(dep)) if &**dep == "B"
    ));
    assert!(matches!(
        &report.get("top").unwrap().outcome,
        Outcome::Failed(Failure::Dependency(dep)) if &**dep == "A"
    ));
    assert_eq!(report.failed(), 3);
    assert_eq!(report.succeeded(), 2);
}

#[test]
fn test_corrupted_cache_runs_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::try_from(dir.path().join("fingerprints.cbor")).unwrap();

    let log = Log::default();
    let graph = build(vec![
        recording("a", &log).input(Input::Value("1".into())),
        recording("b", &log)
            .depends_on("a")
            .input(Input::Value("2".into())),
    ]);

    let cache = FingerprintCache::load(path.clone());
    executor(2, true).run(&graph, &cache, &["b"]).unwrap();
    cache.flush().unwrap();

    fs::write(&path, b"garbage").unwrap();

    let cache = FingerprintCache::load(path.clone());
    let report = executor(2, true).run(&graph, &cache, &["b"]).unwrap();

    assert_eq!(report.skipped(), 0);
    assert_eq!(report.succeeded(), 2);
    assert!(report.is_success());
    assert_eq!(report.warnings.len(), 1);
}

#[test]
fn test_panicking_task_fails() {
    let graph = build(vec![Task::new("boom", |_| panic!("kaboom"))]);

    let report = executor(1, true)
        .run(&graph, &FingerprintCache::in_memory(), &["boom"])
        .unwrap();

    let result = report.get("boom").unwrap();
    assert!(result.is_failed());
    assert!(result.outcome.to_string().contains("Task panicked: kaboom"));
}

#[test]
fn test_disabled_task_is_skipped_and_dependents_run() {
    let log = Log::default();
    let graph = build(vec![
        recording("refaster", &log).enabled(false),
        recording("compile", &log).depends_on("refaster"),
    ]);

    let report = executor(1, true)
        .run(&graph, &FingerprintCache::in_memory(), &["compile"])
        .unwrap();

    assert!(matches!(
        report.get("refaster").unwrap().outcome,
        Outcome::Skipped(SkipReason::Disabled)
    ));
    assert_eq!(report.get("compile").unwrap().status(), Status::Succeeded);
    assert_eq!(*log.lock().unwrap(), ["compile"]);
}

#[test]
fn test_ordering_edge_orders_without_pulling_in() {
    let log = Log::default();
    let graph = build(vec![
        recording("formatApply", &log).must_run_after("refasterApply"),
        recording("refasterApply", &log),
    ]);
    let executor = executor(4, true);

    let report = executor
        .run(&graph, &FingerprintCache::in_memory(), &["formatApply", "refasterApply"])
        .unwrap();
    assert_eq!(*log.lock().unwrap(), ["refasterApply", "formatApply"]);
    assert_eq!(names(&report), ["refasterApply", "formatApply"]);

    log.lock().unwrap().clear();
    let report = executor
        .run(&graph, &FingerprintCache::in_memory(), &["formatApply"])
        .unwrap();
    assert_eq!(names(&report), ["formatApply"]);
}

#[test]
fn test_ordering_edge_does_not_propagate_failure() {
    let log = Log::default();
    let graph = build(vec![
        failing("refasterApply", &log),
        recording("formatApply", &log).must_run_after("refasterApply"),
    ]);

    let report = executor(1, false)
        .run(&graph, &FingerprintCache::in_memory(), &["refasterApply", "formatApply"])
        .unwrap();

    assert_eq!(report.get("formatApply").unwrap().status(), Status::Succeeded);
}

#[test]
fn test_captured_output() {
    let graph = build(vec![Task::new("talk", |ctx| {
        ctx.emit(format!("hello from {}", ctx.name()));
        Ok(())
    })]);

    let report = executor(1, true)
        .run(&graph, &FingerprintCache::in_memory(), &["talk"])
        .unwrap();

    assert_eq!(report.get("talk").unwrap().output, "hello from talk\n");
}
