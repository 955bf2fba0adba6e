use fuzzyflow::core::config::FuzzyflowConfig;
use fuzzyflow::core::testcase::TestCase;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn fuzzyflow(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fuzzyflow"))
        .current_dir(dir)
        .env_remove("FUZZYFLOW_CONFIG")
        .args(args)
        .output()
        .expect("failed to execute fuzzyflow")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn run_dirs(logdir: &Path) -> Vec<std::path::PathBuf> {
    match fs::read_dir(logdir) {
        Ok(entries) => entries.filter_map(Result::ok).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn version_matches_package() {
    let dir = tempdir().unwrap();
    let out = fuzzyflow(dir.path(), &["version"]);
    assert!(out.status.success());
    assert_eq!(stdout(&out).trim(), format!("v{}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn help_lists_every_mode() {
    let dir = tempdir().unwrap();
    let help = stdout(&fuzzyflow(dir.path(), &["--help"]));
    for command in ["run", "metrics", "example", "version"] {
        assert!(help.contains(command), "--help missing {}", command);
    }
    let run_help = stdout(&fuzzyflow(dir.path(), &["run", "--help"]));
    for flag in ["--testcase", "--logdir", "--interval", "--step", "--dry-run", "--no-report", "--seed"] {
        assert!(run_help.contains(flag), "run --help missing {}", flag);
    }
}

#[test]
fn example_writes_a_loadable_testcase() {
    let dir = tempdir().unwrap();
    let out = fuzzyflow(dir.path(), &["example", "--output", "cases/example.json"]);
    assert!(out.status.success());
    let testcase = TestCase::load(&dir.path().join("cases/example.json")).unwrap();
    assert_eq!(testcase.min_passed, Some(1));
    assert_eq!(testcase.steps[1].type_name(), "fuzzy");
}

#[test]
fn dry_run_lists_steps_without_logging() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("t.json"),
        r#"{"name": "dry", "steps": [
            {"description": "say hi", "type": "shell", "command": "echo hi"},
            {"description": "cpu", "type": "fuzzy", "metric_func": "cpu_percent"}
        ]}"#,
    )
    .unwrap();
    let out = fuzzyflow(
        dir.path(),
        &["run", "--testcase", "t.json", "--dry-run", "--logdir", "logs"],
    );
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.contains("[1] say hi (type: shell)"));
    assert!(text.contains("[2] cpu (type: fuzzy)"));
    assert!(!dir.path().join("logs").exists());
}

#[test]
fn passing_run_exits_zero_and_writes_reports() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("t.json"),
        r#"{"name": "live", "steps": [
            {"description": "echo", "type": "shell", "command": "echo fuzzyflow-ok", "eval_contains": "fuzzyflow-ok"},
            {"description": "gate", "type": "boolean", "command": "true"}
        ]}"#,
    )
    .unwrap();
    let out = fuzzyflow(dir.path(), &["run", "--testcase", "t.json", "--logdir", "logs"]);
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(stdout(&out).contains("[PIPELINE] PASSED"));

    let runs = run_dirs(&dir.path().join("logs"));
    assert_eq!(runs.len(), 1);
    assert!(runs[0].join("report.csv").exists());
    assert!(runs[0].join("report.html").exists());
}

#[test]
fn failing_verdict_exits_two() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("t.json"),
        r#"{"name": "red", "steps": [{"description": "gate", "type": "boolean", "command": "false", "retries": 2}]}"#,
    )
    .unwrap();
    let out = fuzzyflow(
        dir.path(),
        &["run", "--testcase", "t.json", "--logdir", "logs", "--no-report"],
    );
    assert_eq!(out.status.code(), Some(2));
    let runs = run_dirs(&dir.path().join("logs"));
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].join("report.csv").exists());
}

#[test]
fn step_selection_validates_index() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("t.json"),
        r#"{"name": "one", "steps": [{"description": "gate", "type": "boolean", "command": "true"}]}"#,
    )
    .unwrap();
    let out = fuzzyflow(dir.path(), &["run", "--testcase", "t.json", "--step", "3"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Invalid --step 3, there are only 1 steps."));
}

#[test]
fn unknown_metric_is_reported_before_running() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("t.json"),
        r#"{"name": "gpu", "steps": [{"description": "gpu", "type": "fuzzy", "metric_func": "gpu_temp"}]}"#,
    )
    .unwrap();
    let out = fuzzyflow(dir.path(), &["run", "--testcase", "t.json", "--logdir", "logs"]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Error:"));
    assert!(stderr.contains("gpu_temp"));
    assert!(!dir.path().join("logs").exists());
}

#[test]
fn metrics_add_persists_and_lists() {
    let dir = tempdir().unwrap();
    let out = fuzzyflow(
        dir.path(),
        &["metrics", "add", "answer", "echo 42", "--config", "conf/fuzzyflow.toml"],
    );
    assert!(out.status.success());

    let config = FuzzyflowConfig::load(&dir.path().join("conf/fuzzyflow.toml")).unwrap();
    assert_eq!(config.metrics.len(), 1);
    assert_eq!(config.metrics[0].command, "echo 42");

    let listed = stdout(&fuzzyflow(
        dir.path(),
        &["metrics", "list", "--config", "conf/fuzzyflow.toml"],
    ));
    assert!(listed.contains("  - answer"));
    assert!(listed.contains("  - cpu_percent"));
}

#[test]
fn registered_metric_is_usable_in_a_run() {
    let dir = tempdir().unwrap();
    let add = fuzzyflow(dir.path(), &["metrics", "add", "answer", "echo 5"]);
    assert!(add.status.success());
    fs::write(
        dir.path().join("t.json"),
        r#"{"name": "custom", "steps": [
            {"description": "answer", "type": "fuzzy", "metric_func": "answer", "duration": 1, "eval_label": "LOW"}
        ]}"#,
    )
    .unwrap();
    let out = fuzzyflow(
        dir.path(),
        &["run", "--testcase", "t.json", "--logdir", "logs", "--interval", "0.1", "--no-report"],
    );
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn invalid_metric_name_is_rejected() {
    let dir = tempdir().unwrap();
    let out = fuzzyflow(dir.path(), &["metrics", "add", "custom_shell", "echo 1"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!dir.path().join("fuzzyflow.toml").exists());
}
