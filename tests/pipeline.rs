use fuzzyflow::core::clock::ManualClock;
use fuzzyflow::core::error::FuzzyflowError;
use fuzzyflow::core::exec::{BOOLEAN_TIMEOUT, CommandOutput, CommandRunner};
use fuzzyflow::core::output::Console;
use fuzzyflow::core::sink::{EventSink, FileSink, MemorySink};
use fuzzyflow::core::testcase::TestCase;
use fuzzyflow::plugins::metrics::MetricRegistry;
use fuzzyflow::plugins::pipeline::{Disposition, PipelineRunner, PipelineSummary, prevalidate};
use fuzzyflow::plugins::report;
use fuzzyflow::core::safety::SafetyPolicy;
use serde_json::Value;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

/// Commands starting with `pass` exit 0, anything else exits 1.
/// Commands starting with `missing` do not resolve.
#[derive(Default)]
struct FakeShell {
    calls: Mutex<Vec<(String, Option<Duration>)>>,
}

impl FakeShell {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    fn timeout_of(&self, command: &str) -> Option<Option<Duration>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c == command)
            .map(|(_, t)| *t)
    }
}

impl CommandRunner for FakeShell {
    fn run(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput, FuzzyflowError> {
        self.calls.lock().unwrap().push((command.to_string(), timeout));
        let ok = command.starts_with("pass");
        Ok(CommandOutput {
            stdout: format!("ran {}\n", command),
            stderr: String::new(),
            exit_code: Some(if ok { 0 } else { 1 }),
        })
    }

    fn resolves(&self, command: &str) -> bool {
        !command.starts_with("missing")
    }
}

fn run_with(
    shell: Arc<FakeShell>,
    registry: &MetricRegistry,
    json: &str,
    sink: &mut dyn EventSink,
) -> Result<PipelineSummary, FuzzyflowError> {
    let testcase = TestCase::from_json(json)?;
    let clock = ManualClock::new();
    PipelineRunner::new(shell, registry, &clock)
        .with_console(Console::quiet())
        .with_host_info(false)
        .run(&testcase, Duration::from_secs(1), sink)
}

fn run(json: &str) -> (PipelineSummary, MemorySink, Arc<FakeShell>) {
    let shell = Arc::new(FakeShell::default());
    let registry = MetricRegistry::empty();
    let mut sink = MemorySink::new();
    let summary = run_with(Arc::clone(&shell), &registry, json, &mut sink).unwrap();
    (summary, sink, shell)
}

const ONE_OF_TWO: &str = r#"[
    {"description": "ok", "type": "boolean", "command": "pass-check"},
    {"description": "bad", "type": "boolean", "command": "fail-check"}
]"#;

#[test]
fn min_passed_allows_partial_success() {
    let (summary, _, _) = run(&format!(r#"{{"name": "p", "min_passed": 1, "steps": {}}}"#, ONE_OF_TWO));
    assert_eq!(summary.total_required, 2);
    assert_eq!(summary.num_passed, 1);
    assert!(summary.global_pass);
}

#[test]
fn without_min_passed_all_required_must_pass() {
    let (summary, sink, _) = run(&format!(r#"{{"name": "p", "steps": {}}}"#, ONE_OF_TWO));
    assert_eq!(summary.total_required, 2);
    assert_eq!(summary.num_passed, 1);
    assert!(!summary.global_pass);

    let end = sink.events("end_pipeline");
    assert_eq!(end.len(), 1);
    assert_eq!(end[0]["global_pass"], Value::from(false));
}

#[test]
fn optional_steps_do_not_count() {
    let (summary, _, _) = run(
        r#"{"name": "p", "steps": [
            {"description": "ok", "type": "boolean", "command": "pass"},
            {"description": "nice to have", "type": "boolean", "command": "fail", "required": false}
        ]}"#,
    );
    assert_eq!(summary.total_required, 1);
    assert_eq!(summary.num_passed, 1);
    assert!(summary.global_pass);
    assert_eq!(summary.records.len(), 2);
}

#[test]
fn skipped_steps_are_excluded_from_the_verdict() {
    let (summary, sink, shell) = run(
        r#"{"name": "p", "steps": [
            {"description": "ok", "type": "shell", "command": "pass --version", "eval_contains": "ran"},
            {"description": "no command", "type": "shell"},
            {"description": "unknown tool", "type": "boolean", "command": "missing-tool --check"}
        ]}"#,
    );
    assert_eq!(summary.total_required, 1);
    assert_eq!(summary.num_passed, 1);
    assert!(summary.global_pass);
    assert_eq!(summary.skipped, vec!["no command", "unknown tool"]);
    assert_eq!(summary.records.len(), 1);
    assert_eq!(shell.calls(), vec!["pass --version"]);

    for step in ["no command", "unknown tool"] {
        let skip = sink
            .for_step(step)
            .into_iter()
            .find(|r| r.get("reason").is_some())
            .unwrap();
        assert_eq!(skip["eval"], Value::from("[EVAL][SKIPPED]"));
    }
    assert_eq!(sink.events("prevalidation").len(), 2);
}

#[test]
fn prevalidation_does_not_mutate_steps() {
    let testcase = TestCase::from_json(
        r#"{"steps": [
            {"description": "a", "command": "pass"},
            {"description": "b", "command": "missing"},
            {"description": "c", "type": "fuzzy", "metric_func": "custom_shell", "custom_command": "missing-sensor"}
        ]}"#,
    )
    .unwrap();
    let before = testcase.clone();
    let plan = prevalidate(
        &testcase,
        &MetricRegistry::empty(),
        &FakeShell::default(),
        &SafetyPolicy::default(),
    )
    .unwrap();
    assert_eq!(plan[0].disposition, Disposition::Run);
    assert!(plan[1].is_skipped());
    assert!(plan[2].is_skipped());
    assert_eq!(testcase, before);
}

#[test]
fn unknown_metric_fails_before_anything_runs() {
    let shell = Arc::new(FakeShell::default());
    let registry = MetricRegistry::empty();
    let mut sink = MemorySink::new();
    let err = run_with(
        Arc::clone(&shell),
        &registry,
        r#"{"name": "p", "steps": [
            {"description": "first", "type": "boolean", "command": "pass"},
            {"description": "gpu", "type": "fuzzy", "metric_func": "gpu_temp", "eval_label": "LOW"}
        ]}"#,
        &mut sink,
    )
    .unwrap_err();

    assert!(matches!(err, FuzzyflowError::UnknownMetric { ref name, .. } if name == "gpu_temp"));
    assert!(sink.records.is_empty());
    assert!(shell.calls().is_empty());
}

#[test]
fn on_fail_runs_only_for_failed_steps() {
    let (summary, sink, shell) = run(
        r#"{"name": "p", "steps": [
            {"description": "ok", "type": "boolean", "command": "pass", "on_fail": {"command": "pass collect-a"}},
            {"description": "bad", "type": "boolean", "command": "fail", "retries": 2, "on_fail": {"command": "pass collect-b"}}
        ]}"#,
    );
    assert!(!summary.global_pass);
    assert_eq!(shell.calls(), vec!["pass", "fail", "fail", "pass collect-b"]);
    assert_eq!(shell.timeout_of("fail"), Some(Some(BOOLEAN_TIMEOUT)));
    assert_eq!(shell.timeout_of("pass collect-b"), Some(None));

    let hook = sink
        .for_step("bad")
        .into_iter()
        .find(|r| r.get("on_fail_output").is_some())
        .unwrap();
    assert_eq!(hook["on_fail_output"], Value::from("ran pass collect-b"));
    assert!(
        sink.for_step("ok")
            .iter()
            .all(|r| r.get("on_fail_output").is_none())
    );
    // on_fail never rescues the step
    assert!(!summary.records[1].passed);
}

#[test]
fn records_are_framed_by_run_start_and_end() {
    let (summary, sink, _) = run(
        r#"{"name": "framed", "metadata": {"owner": "qa"}, "steps": [
            {"description": "ok", "type": "boolean", "command": "pass"}
        ]}"#,
    );
    let first = &sink.records[0];
    assert_eq!(first["event"], Value::from("run_id"));
    assert_eq!(first["run_id"], Value::from(summary.fingerprint.clone()));
    assert_eq!(summary.fingerprint.len(), 10);

    let start = &sink.records[1];
    assert_eq!(start["event"], Value::from("start_pipeline"));
    assert_eq!(start["test_case"], Value::from("framed"));
    assert_eq!(start["metadata"]["owner"], Value::from("qa"));

    let last = sink.records.last().unwrap();
    assert_eq!(last["event"], Value::from("end_pipeline"));
    assert_eq!(last["global_pass"], Value::from(true));

    let step_start = sink
        .for_step("ok")
        .into_iter()
        .find(|r| r.get("type").is_some())
        .unwrap();
    assert_eq!(step_start["type"], Value::from("boolean"));
    assert_eq!(step_start["required"], Value::from(true));
}

#[test]
fn dangerous_commands_are_flagged_but_still_run() {
    let (summary, sink, shell) = run(
        r#"{"name": "p", "steps": [
            {"description": "cleanup", "type": "boolean", "command": "pass; rm -rf /tmp/scratch"}
        ]}"#,
    );
    assert!(summary.global_pass);
    assert_eq!(shell.calls().len(), 1);
    let flagged = sink.events("safety");
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0]["safety"]["verdict"], Value::from("dangerous"));
    assert_eq!(flagged[0]["safety"]["word"], Value::from("rm"));
}

#[test]
fn file_sink_log_feeds_reports() {
    let dir = tempdir().unwrap();
    let shell = Arc::new(FakeShell::default());
    let registry = MetricRegistry::empty();
    let mut sink = FileSink::create(dir.path(), "20261018_101500").unwrap();

    let summary = run_with(
        shell,
        &registry,
        r#"{"name": "disk", "steps": [
            {"description": "ok", "type": "boolean", "command": "pass"},
            {"description": "gone", "type": "boolean", "command": "missing"}
        ]}"#,
        &mut sink,
    )
    .unwrap();
    assert!(summary.global_pass);

    let log_path = sink.log_path().to_path_buf();
    assert_eq!(
        log_path,
        dir.path().join("run_20261018_101500").join("run_20261018_101500.log")
    );
    let content = fs::read_to_string(&log_path).unwrap();
    for line in content.lines() {
        let (ts, payload) = line.split_once(" | ").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok(), "bad timestamp {ts}");
        assert!(serde_json::from_str::<Value>(payload).unwrap().is_object());
    }

    let (csv, html) = report::export_reports(&log_path, sink.run_dir()).unwrap();
    assert!(csv.exists());
    assert!(html.exists());
    assert!(fs::read_to_string(html).unwrap().contains("[EVAL][SKIPPED]"));
}
