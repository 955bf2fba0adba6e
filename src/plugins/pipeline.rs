//! Pipeline runner: pre-validation, sequential dispatch, on-fail hooks and
//! the global verdict.

use crate::core::clock::Clock;
use crate::core::error::FuzzyflowError;
use crate::core::exec::CommandRunner;
use crate::core::output::Console;
use crate::core::safety::{SafetyPolicy, SafetyVerdict};
use crate::core::sink::EventSink;
use crate::core::testcase::{FuzzySpec, MetricSource, Step, StepKind, TestCase};
use crate::core::time;
use crate::plugins::dispatch::{StepDispatcher, Verdict};
use crate::plugins::host;
use crate::plugins::metrics::MetricRegistry;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const SKIP_REASON_MISSING: &str = "missing command";
pub const SKIP_REASON_NOT_FOUND: &str = "command not found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Run,
    Skip { reason: &'static str },
}

/// A step after pre-validation. The step itself is never mutated.
#[derive(Debug, Clone)]
pub struct PlannedStep<'a> {
    pub step: &'a Step,
    pub disposition: Disposition,
    /// Advisory verdict for the resolved command, if the step has one.
    pub safety: Option<SafetyVerdict>,
}

impl PlannedStep<'_> {
    pub fn is_skipped(&self) -> bool {
        matches!(self.disposition, Disposition::Skip { .. })
    }
}

/// One per executed (non-skipped) step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationRecord {
    pub step: String,
    pub passed: bool,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    pub fingerprint: String,
    pub total_required: usize,
    pub num_passed: usize,
    pub global_pass: bool,
    pub records: Vec<EvaluationRecord>,
    pub skipped: Vec<String>,
}

/// `(total_required, num_passed, global_pass)`; optional steps count on neither side.
pub fn compute_verdict(records: &[EvaluationRecord], min_passed: Option<usize>) -> (usize, usize, bool) {
    let total_required = records.iter().filter(|r| r.required).count();
    let num_passed = records.iter().filter(|r| r.required && r.passed).count();
    let global_pass = match min_passed {
        Some(min) => num_passed >= min,
        None => num_passed == total_required,
    };
    (total_required, num_passed, global_pass)
}

/// Resolve commands and metric names before anything runs.
///
/// Unresolvable commands turn into skips; unknown metric names are fatal.
pub fn prevalidate<'a>(
    testcase: &'a TestCase,
    registry: &MetricRegistry,
    runner: &dyn CommandRunner,
    policy: &SafetyPolicy,
) -> Result<Vec<PlannedStep<'a>>, FuzzyflowError> {
    let mut plan = Vec::with_capacity(testcase.steps.len());
    for step in &testcase.steps {
        if let StepKind::Fuzzy(FuzzySpec {
            metric: MetricSource::Named(name),
            ..
        }) = &step.kind
            && !registry.contains(name)
        {
            return Err(FuzzyflowError::UnknownMetric {
                name: name.clone(),
                available: registry.names(),
            });
        }

        let planned = match step.command_to_resolve() {
            None => PlannedStep {
                step,
                disposition: Disposition::Run,
                safety: None,
            },
            Some(None) => PlannedStep {
                step,
                disposition: Disposition::Skip {
                    reason: SKIP_REASON_MISSING,
                },
                safety: None,
            },
            Some(Some(command)) if !runner.resolves(command) => PlannedStep {
                step,
                disposition: Disposition::Skip {
                    reason: SKIP_REASON_NOT_FOUND,
                },
                safety: None,
            },
            Some(Some(command)) => PlannedStep {
                step,
                disposition: Disposition::Run,
                safety: Some(policy.check(command)),
            },
        };
        plan.push(planned);
    }
    Ok(plan)
}

pub struct PipelineRunner<'a> {
    runner: Arc<dyn CommandRunner>,
    registry: &'a MetricRegistry,
    clock: &'a dyn Clock,
    safety: SafetyPolicy,
    console: Console,
    seed: Option<u64>,
    include_host_info: bool,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        registry: &'a MetricRegistry,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            runner,
            registry,
            clock,
            safety: SafetyPolicy::default(),
            console: Console::default(),
            seed: None,
            include_host_info: true,
        }
    }

    pub fn with_safety(mut self, policy: SafetyPolicy) -> Self {
        self.safety = policy;
        self
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_host_info(mut self, include: bool) -> Self {
        self.include_host_info = include;
        self
    }

    pub fn plan<'t>(&self, testcase: &'t TestCase) -> Result<Vec<PlannedStep<'t>>, FuzzyflowError> {
        prevalidate(testcase, self.registry, self.runner.as_ref(), &self.safety)
    }

    pub fn run(
        &self,
        testcase: &TestCase,
        interval: Duration,
        sink: &mut dyn EventSink,
    ) -> Result<PipelineSummary, FuzzyflowError> {
        let plan = self.plan(testcase)?;
        self.execute_plan(testcase, &plan, interval, sink)
    }

    pub fn execute_plan(
        &self,
        testcase: &TestCase,
        plan: &[PlannedStep<'_>],
        interval: Duration,
        sink: &mut dyn EventSink,
    ) -> Result<PipelineSummary, FuzzyflowError> {
        let dispatcher = StepDispatcher::new(Arc::clone(&self.runner), self.registry, self.clock)
            .with_console(self.console)
            .with_seed(self.seed);

        self.console
            .banner(&format!("=== Running Pipeline: {} ===", testcase.name));
        let started_at = time::now_iso();
        let fingerprint = time::run_fingerprint(&testcase.name, &started_at);
        info!(test_case = %testcase.name, run = %fingerprint, "pipeline started");

        sink.log(json!({"event": "run_id", "run_id": fingerprint}))?;
        let system_info = if self.include_host_info {
            serde_json::to_value(host::host_info())?
        } else {
            Value::Null
        };
        sink.log(json!({
            "event": "start_pipeline",
            "event_id": time::new_event_id(),
            "test_case": testcase.name,
            "start_time": started_at,
            "system_info": system_info,
            "metadata": testcase.metadata,
        }))?;

        self.log_prevalidation(plan, sink)?;

        let mut records = Vec::new();
        let mut skipped = Vec::new();
        for planned in plan {
            let step = planned.step;
            if let Disposition::Skip { reason } = planned.disposition {
                self.console.eval(
                    Verdict::Indeterminate.tag(),
                    &format!("Step '{}' skipped due to {}.", step.description, reason),
                );
                sink.log(json!({
                    "step": step.description,
                    "eval": Verdict::Indeterminate.tag(),
                    "reason": reason,
                }))?;
                skipped.push(step.description.clone());
                continue;
            }

            sink.log(json!({
                "step": step.description,
                "type": step.type_name(),
                "timestamp": time::now_iso(),
                "required": step.required,
            }))?;
            self.console.step(step.index, &step.description);

            let outcome = dispatcher.execute(step, interval, sink)?;
            let passed = outcome.passed();
            info!(step = %step.description, passed, attempts = outcome.attempts, "step finished");

            if !passed && let Some(command) = &step.on_fail {
                self.run_on_fail(step, command, sink)?;
            }

            records.push(EvaluationRecord {
                step: step.description.clone(),
                passed,
                required: step.required,
            });
        }

        let (total_required, num_passed, global_pass) = compute_verdict(&records, testcase.min_passed);
        self.report_verdict(testcase.min_passed, total_required, num_passed, global_pass);
        sink.log(json!({
            "event": "end_pipeline",
            "end_time": time::now_iso(),
            "global_pass": global_pass,
            "num_passed": num_passed,
            "total_required": total_required,
        }))?;

        Ok(PipelineSummary {
            fingerprint,
            total_required,
            num_passed,
            global_pass,
            records,
            skipped,
        })
    }

    fn log_prevalidation(
        &self,
        plan: &[PlannedStep<'_>],
        sink: &mut dyn EventSink,
    ) -> Result<(), FuzzyflowError> {
        for planned in plan {
            let step = planned.step;
            if let Disposition::Skip { reason } = planned.disposition {
                let command = step.command_to_resolve().flatten().unwrap_or_default();
                let message = format!(
                    "Command '{}' not found for step '{}'. Step will be skipped.",
                    command, step.description
                );
                warn!(step = %step.description, reason, "step will be skipped");
                self.console.warn(&message);
                sink.log(json!({
                    "event": "prevalidation",
                    "step": step.description,
                    "warning": message,
                }))?;
            }
            if let Some(verdict) = &planned.safety
                && let Some(command) = step.command_to_resolve().flatten()
                && let Some(message) = verdict.message(command)
            {
                warn!(step = %step.description, command, "command flagged by safety policy");
                self.console.warn(&message);
                sink.log(json!({
                    "event": "safety",
                    "step": step.description,
                    "command": command,
                    "safety": verdict,
                }))?;
            }
        }
        Ok(())
    }

    fn run_on_fail(
        &self,
        step: &Step,
        command: &str,
        sink: &mut dyn EventSink,
    ) -> Result<(), FuzzyflowError> {
        if let Some(message) = self.safety.check(command).message(command) {
            self.console.warn(&message);
        }
        match self.runner.run(command, None) {
            Ok(out) => {
                let output = out.stdout.trim().to_string();
                self.console.line(&format!("[ON-FAIL] Output: {}", output));
                sink.log(json!({"step": step.description, "on_fail_output": output}))
            }
            Err(err) => {
                warn!(step = %step.description, error = %err, "on_fail hook failed");
                self.console.warn(&format!("on_fail hook failed: {}", err));
                sink.log(json!({"step": step.description, "on_fail_error": err.to_string()}))
            }
        }
    }

    fn report_verdict(
        &self,
        min_passed: Option<usize>,
        total_required: usize,
        num_passed: usize,
        global_pass: bool,
    ) {
        let tag = if global_pass {
            "[PIPELINE][EVAL][PASSED]"
        } else {
            "[PIPELINE][EVAL][FAILED]"
        };
        let message = match (min_passed, global_pass) {
            (Some(min), true) => format!(
                "Minimum {} required steps passed ({}/{}).",
                min, num_passed, total_required
            ),
            (Some(min), false) => format!(
                "Only {} of {} required steps passed.",
                num_passed, min
            ),
            (None, true) => format!(
                "All required steps passed ({}/{}).",
                num_passed, total_required
            ),
            (None, false) => format!(
                "Not all required steps passed ({}/{}).",
                num_passed, total_required
            ),
        };
        self.console.line("");
        self.console.eval(tag, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(passed: bool, required: bool) -> EvaluationRecord {
        EvaluationRecord {
            step: "s".to_string(),
            passed,
            required,
        }
    }

    #[test]
    fn test_verdict_min_passed() {
        let records = vec![record(true, true), record(false, true)];
        assert_eq!(compute_verdict(&records, Some(1)), (2, 1, true));
        assert_eq!(compute_verdict(&records, None), (2, 1, false));
        assert_eq!(compute_verdict(&records, Some(2)), (2, 1, false));
    }

    #[test]
    fn test_optional_steps_count_nowhere() {
        let records = vec![record(true, true), record(false, false), record(true, false)];
        assert_eq!(compute_verdict(&records, None), (1, 1, true));
        assert_eq!(compute_verdict(&records, Some(2)), (1, 1, false));
    }

    #[test]
    fn test_empty_pipeline_passes_without_min() {
        assert_eq!(compute_verdict(&[], None), (0, 0, true));
        assert_eq!(compute_verdict(&[], Some(0)), (0, 0, true));
    }
}
