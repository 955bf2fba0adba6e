//! Per-step execution: attempts, retries and pass/fail evaluation.
//!
//! Retry behaviour differs by step kind:
//!
//! - `shell`: the first attempt that produces output ends the step, whatever
//!   the verdict; only faulted attempts (timeout, spawn failure) are retried.
//! - `boolean`: attempts repeat until the command exits 0 or the budget runs out.
//! - `fuzzy` / `neuro_fuzzy`: one sampling session for `duration` seconds;
//!   a faulted session is retried like `shell`.
//! - unknown types fail once, without retry.

use crate::core::clock::Clock;
use crate::core::error::FuzzyflowError;
use crate::core::exec::{BOOLEAN_TIMEOUT, CommandRunner, SHELL_TIMEOUT};
use crate::core::output::{Console, compact_line};
use crate::core::sink::EventSink;
use crate::core::testcase::{FuzzySpec, Step, StepKind};
use crate::plugins::fuzzy::{FuzzyValidator, build_classifier};
use crate::plugins::metrics::{METRIC_UNAVAILABLE, MetricRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of evaluating one completed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
    /// No criterion configured (`eval_contains` / `eval_label` missing).
    Indeterminate,
}

impl Verdict {
    pub fn passed(self) -> bool {
        self == Verdict::Passed
    }

    pub fn tag(self) -> &'static str {
        match self {
            Verdict::Passed => "[EVAL][PASSED]",
            Verdict::Failed => "[EVAL][FAILED]",
            Verdict::Indeterminate => "[EVAL][SKIPPED]",
        }
    }
}

/// Result of a single attempt. Infrastructure failures (the sink) travel in
/// the outer `Result` instead.
#[derive(Debug)]
pub enum Attempt {
    Completed(Verdict),
    Faulted(FuzzyflowError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Any completed attempt is final; faults are retried. Shell steps do
    /// not retry a completed evaluation, even a failed one.
    StopOnVerdict,
    /// Retry until an attempt passes.
    UntilPassed,
    /// Single attempt.
    Never,
}

impl RetryPolicy {
    pub fn for_kind(kind: &StepKind) -> Self {
        match kind {
            StepKind::Shell { .. } | StepKind::Fuzzy(_) => RetryPolicy::StopOnVerdict,
            StepKind::Boolean { .. } => RetryPolicy::UntilPassed,
            StepKind::Unsupported { .. } => RetryPolicy::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub verdict: Verdict,
    pub attempts: u32,
}

impl StepOutcome {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

/// Substring containment; `None` when no criterion is configured.
pub fn evaluate_contains(output: &str, eval_contains: Option<&str>) -> Verdict {
    match eval_contains {
        Some(needle) if !needle.is_empty() => {
            if output.contains(needle) {
                Verdict::Passed
            } else {
                Verdict::Failed
            }
        }
        _ => Verdict::Indeterminate,
    }
}

/// Label membership; `None` or an empty label means no criterion.
pub fn evaluate_labels(labels: &[String], eval_label: Option<&str>) -> Verdict {
    match eval_label {
        Some(wanted) if !wanted.is_empty() => {
            if labels.iter().any(|l| l == wanted) {
                Verdict::Passed
            } else {
                Verdict::Failed
            }
        }
        _ => Verdict::Indeterminate,
    }
}

pub struct StepDispatcher<'a> {
    runner: Arc<dyn CommandRunner>,
    registry: &'a MetricRegistry,
    clock: &'a dyn Clock,
    console: Console,
    seed: Option<u64>,
}

impl<'a> StepDispatcher<'a> {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        registry: &'a MetricRegistry,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            runner,
            registry,
            clock,
            console: Console::default(),
            seed: None,
        }
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    /// Fix the randomness of stochastic classifiers.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Run `step` under its retry policy. `interval` paces fuzzy sampling.
    pub fn execute(
        &self,
        step: &Step,
        interval: Duration,
        sink: &mut dyn EventSink,
    ) -> Result<StepOutcome, FuzzyflowError> {
        let policy = RetryPolicy::for_kind(&step.kind);
        let budget = match policy {
            RetryPolicy::Never => 1,
            _ => step.retries.max(1),
        };
        let mut verdict = Verdict::Failed;
        let mut attempts = 0;

        while attempts < budget {
            attempts += 1;
            sink.log(json!({
                "step": step.description,
                "attempt": attempts,
                "retries": budget,
            }))?;
            debug!(step = %step.description, attempt = attempts, "dispatching attempt");

            match self.attempt(step, interval, sink)? {
                Attempt::Completed(v) => {
                    verdict = v;
                    let done = match policy {
                        RetryPolicy::StopOnVerdict | RetryPolicy::Never => true,
                        RetryPolicy::UntilPassed => v.passed(),
                    };
                    if done {
                        break;
                    }
                }
                Attempt::Faulted(err) => {
                    verdict = Verdict::Failed;
                    warn!(step = %step.description, attempt = attempts, error = %err, "attempt faulted");
                    self.console
                        .eval(Verdict::Failed.tag(), &format!("Exception: {}", err));
                    sink.log(json!({
                        "step": step.description,
                        "attempt": attempts,
                        "error": err.to_string(),
                    }))?;
                    if policy == RetryPolicy::Never {
                        break;
                    }
                }
            }
        }

        Ok(StepOutcome { verdict, attempts })
    }

    fn attempt(
        &self,
        step: &Step,
        interval: Duration,
        sink: &mut dyn EventSink,
    ) -> Result<Attempt, FuzzyflowError> {
        match &step.kind {
            StepKind::Shell {
                command,
                eval_contains,
            } => self.shell_attempt(step, command.as_deref(), eval_contains.as_deref(), sink),
            StepKind::Boolean { command } => self.boolean_attempt(step, command.as_deref(), sink),
            StepKind::Fuzzy(spec) => self.fuzzy_session(step, spec, interval, sink),
            StepKind::Unsupported { type_name } => Ok(Attempt::Faulted(
                FuzzyflowError::ValidationError(format!("Unknown step type: {}", type_name)),
            )),
        }
    }

    fn shell_attempt(
        &self,
        step: &Step,
        command: Option<&str>,
        eval_contains: Option<&str>,
        sink: &mut dyn EventSink,
    ) -> Result<Attempt, FuzzyflowError> {
        let Some(command) = command else {
            return Ok(Attempt::Faulted(FuzzyflowError::NotFound(
                "shell step has no command".to_string(),
            )));
        };
        let out = match self.runner.run(command, Some(SHELL_TIMEOUT)) {
            Ok(out) => out,
            Err(err) => return Ok(Attempt::Faulted(err)),
        };
        sink.log(json!({
            "step": step.description,
            "command": command,
            "stdout": out.stdout,
            "stderr": out.stderr,
            "returncode": out.exit_code,
        }))?;
        let combined = out.combined();
        self.console.line(&combined);

        let verdict = evaluate_contains(&combined, eval_contains);
        let needle = eval_contains.unwrap_or_default();
        let message = match verdict {
            Verdict::Passed => format!("'{}' found in output.", needle),
            Verdict::Failed => format!("'{}' NOT found in output.", needle),
            Verdict::Indeterminate => String::new(),
        };
        self.console.eval(verdict.tag(), &message);
        sink.log(json!({"step": step.description, "eval": verdict.tag()}))?;
        Ok(Attempt::Completed(verdict))
    }

    fn boolean_attempt(
        &self,
        step: &Step,
        command: Option<&str>,
        sink: &mut dyn EventSink,
    ) -> Result<Attempt, FuzzyflowError> {
        let Some(command) = command else {
            return Ok(Attempt::Faulted(FuzzyflowError::NotFound(
                "boolean step has no command".to_string(),
            )));
        };
        let out = match self.runner.run(command, Some(BOOLEAN_TIMEOUT)) {
            Ok(out) => out,
            Err(err) => return Ok(Attempt::Faulted(err)),
        };
        let verdict = if out.success() {
            Verdict::Passed
        } else {
            Verdict::Failed
        };
        let code = out
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        self.console
            .eval(verdict.tag(), &format!("Command returned code {}", code));
        sink.log(json!({
            "step": step.description,
            "command": command,
            "returncode": out.exit_code,
            "eval": verdict.tag(),
        }))?;
        Ok(Attempt::Completed(verdict))
    }

    fn fuzzy_session(
        &self,
        step: &Step,
        spec: &FuzzySpec,
        interval: Duration,
        sink: &mut dyn EventSink,
    ) -> Result<Attempt, FuzzyflowError> {
        let metric = match self
            .registry
            .resolve_source(&spec.metric, Arc::clone(&self.runner))
        {
            Ok(metric) => metric,
            Err(err) => return Ok(Attempt::Faulted(err)),
        };
        let seed = self.seed.map(|s| s.wrapping_add(step.index as u64));
        let mut validator =
            FuzzyValidator::new(metric, &spec.settings, build_classifier(spec.mode, seed));
        let metric_name = spec.metric.label();

        self.console.line(&format!(
            "Fuzzy validation on {} for {}s (mode: {})",
            metric_name,
            spec.duration.as_secs(),
            spec.mode.as_str()
        ));
        if !validator.is_deterministic() {
            self.console.info(&format!(
                "{} inference is experimental: labels are random{}",
                spec.mode.as_str(),
                if seed.is_some() { " (seeded)" } else { " (unseeded, nondeterministic)" }
            ));
        }

        let mut labels = Vec::new();
        let end = self.clock.now() + spec.duration;
        while self.clock.now() < end {
            let sample = validator.validate();
            sink.log(json!({
                "step": step.description,
                "metric": metric_name,
                "value": sample.value,
                "label": sample.label,
                "fuzzy": sample.membership,
                "thresholds": sample.thresholds,
            }))?;
            self.console.line(&compact_line(
                &format!(
                    "{}: {:.1} | {} | {:?}",
                    metric_name, sample.value, sample.label, sample.membership
                ),
                160,
            ));
            labels.push(sample.label);
            self.clock.sleep(interval);
            if sample.value == METRIC_UNAVAILABLE {
                warn!(step = %step.description, metric = %metric_name, "metric unavailable");
                self.console.warn(&format!(
                    "{} metric could not be evaluated. Is the device and command present?",
                    step.description
                ));
            }
        }

        let verdict = evaluate_labels(&labels, spec.eval_label.as_deref());
        let wanted = spec.eval_label.as_deref().unwrap_or("<none>");
        self.console.eval(
            verdict.tag(),
            &format!(
                "Label '{}' {} found during validation",
                wanted,
                if verdict.passed() { "was" } else { "was NOT" }
            ),
        );
        sink.log(json!({
            "step": step.description,
            "eval": verdict.tag(),
            "labels": labels,
        }))?;
        Ok(Attempt::Completed(verdict))
    }
}
