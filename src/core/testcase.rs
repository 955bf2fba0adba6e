//! Test case documents and their validated step model.
//!
//! The JSON document shape (`TestCaseDoc` / `StepDoc`) is the stable on-disk
//! format. `TestCase::from_doc` validates it once and produces typed `Step`s
//! where each kind carries only the fields it uses.

use crate::core::error::FuzzyflowError;
use crate::core::formula::Formula;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_THRESHOLDS: [f64; 3] = [10.0, 30.0, 70.0];
pub const DEFAULT_HISTORY_SIZE: usize = 10;
pub const DEFAULT_UPDATE_EVERY: usize = 2;
pub const DEFAULT_DURATION_SECS: u64 = 5;
pub const CUSTOM_SHELL_METRIC: &str = "custom_shell";

pub fn default_label_names() -> Vec<String> {
    vec!["LOW".to_string(), "MED".to_string(), "HIGH".to_string()]
}

// ===== On-disk document =====

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCaseDoc {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_passed: Option<i64>,
    #[serde(default)]
    pub steps: Vec<StepDoc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnFailDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_func: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_thresholds: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_every: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<OnFailDoc>,
}

// ===== Validated model =====

/// Classification algorithm used by fuzzy steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClassifierMode {
    /// Deterministic trapezoidal membership.
    #[serde(rename = "classic")]
    Classic,
    /// Experimental stochastic stand-in; nondeterministic unless seeded.
    #[serde(rename = "neuro-fuzzy")]
    NeuroFuzzy,
}

impl ClassifierMode {
    pub fn parse(raw: &str) -> Result<Self, FuzzyflowError> {
        match raw {
            "classic" => Ok(ClassifierMode::Classic),
            "neuro-fuzzy" => Ok(ClassifierMode::NeuroFuzzy),
            other => Err(FuzzyflowError::UnknownMode(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClassifierMode::Classic => "classic",
            ClassifierMode::NeuroFuzzy => "neuro-fuzzy",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierSettings {
    pub thresholds: [f64; 3],
    pub min_thresholds: [f64; 3],
    pub history_size: usize,
    pub update_every: usize,
    pub label_names: Vec<String>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            thresholds: DEFAULT_THRESHOLDS,
            min_thresholds: DEFAULT_THRESHOLDS,
            history_size: DEFAULT_HISTORY_SIZE,
            update_every: DEFAULT_UPDATE_EVERY,
            label_names: default_label_names(),
        }
    }
}

/// Where a fuzzy step's samples come from.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricSource {
    /// Built-in or registered metric, resolved against the registry.
    Named(String),
    /// Ad-hoc shell command whose stdout is parsed into a number.
    CustomShell {
        command: String,
        parse_regex: Option<String>,
        formula: Formula,
    },
}

impl MetricSource {
    pub fn label(&self) -> &str {
        match self {
            MetricSource::Named(name) => name,
            MetricSource::CustomShell { .. } => CUSTOM_SHELL_METRIC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzyFlavor {
    Fuzzy,
    NeuroFuzzy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuzzySpec {
    pub flavor: FuzzyFlavor,
    pub metric: MetricSource,
    pub eval_label: Option<String>,
    pub mode: ClassifierMode,
    pub settings: ClassifierSettings,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Shell {
        command: Option<String>,
        eval_contains: Option<String>,
    },
    Boolean {
        command: Option<String>,
    },
    Fuzzy(FuzzySpec),
    /// A `type` this tool does not know; fails at dispatch without retry.
    Unsupported {
        type_name: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// 1-based position in the document.
    pub index: usize,
    pub description: String,
    pub required: bool,
    pub retries: u32,
    pub on_fail: Option<String>,
    pub kind: StepKind,
}

impl Step {
    pub fn type_name(&self) -> &str {
        match &self.kind {
            StepKind::Shell { .. } => "shell",
            StepKind::Boolean { .. } => "boolean",
            StepKind::Fuzzy(spec) => match spec.flavor {
                FuzzyFlavor::Fuzzy => "fuzzy",
                FuzzyFlavor::NeuroFuzzy => "neuro_fuzzy",
            },
            StepKind::Unsupported { type_name } => type_name,
        }
    }

    /// The shell command pre-validation must resolve, if any.
    pub fn command_to_resolve(&self) -> Option<Option<&str>> {
        match &self.kind {
            StepKind::Shell { command, .. } | StepKind::Boolean { command } => {
                Some(command.as_deref())
            }
            StepKind::Fuzzy(FuzzySpec {
                metric: MetricSource::CustomShell { command, .. },
                ..
            }) => Some(Some(command.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub metadata: BTreeMap<String, String>,
    pub min_passed: Option<usize>,
    pub steps: Vec<Step>,
}

impl TestCase {
    pub fn load(path: &Path) -> Result<Self, FuzzyflowError> {
        let content = fs::read_to_string(path).map_err(|e| {
            FuzzyflowError::NotFound(format!("test case {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, FuzzyflowError> {
        let doc: TestCaseDoc = serde_json::from_str(content)?;
        Self::from_doc(doc)
    }

    pub fn from_doc(doc: TestCaseDoc) -> Result<Self, FuzzyflowError> {
        let min_passed = match doc.min_passed {
            Some(n) if n < 0 => {
                return Err(FuzzyflowError::ValidationError(format!(
                    "min_passed must be >= 0, got {}",
                    n
                )));
            }
            Some(n) => Some(n as usize),
            None => None,
        };
        let steps = doc
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, s)| validate_step(i + 1, s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: doc.name,
            metadata: doc.metadata,
            min_passed,
            steps,
        })
    }

    /// Keep only step `n` (1-based).
    pub fn select_step(&mut self, n: usize) -> Result<(), FuzzyflowError> {
        if n == 0 || n > self.steps.len() {
            return Err(FuzzyflowError::ValidationError(format!(
                "Invalid --step {}, there are only {} steps.",
                n,
                self.steps.len()
            )));
        }
        let step = self.steps.remove(n - 1);
        self.steps = vec![step];
        Ok(())
    }
}

fn invalid(index: usize, description: &str, msg: impl std::fmt::Display) -> FuzzyflowError {
    FuzzyflowError::ValidationError(format!("step {} ('{}'): {}", index, description, msg))
}

fn triple(
    index: usize,
    description: &str,
    field: &str,
    raw: Option<Vec<f64>>,
) -> Result<[f64; 3], FuzzyflowError> {
    let Some(values) = raw else {
        return Ok(DEFAULT_THRESHOLDS);
    };
    if values.len() != 3 || values.iter().any(|v| !v.is_finite()) {
        return Err(invalid(
            index,
            description,
            format!("{} must be three finite numbers", field),
        ));
    }
    Ok([values[0], values[1], values[2]])
}

fn positive(
    index: usize,
    description: &str,
    field: &str,
    raw: Option<i64>,
    default: usize,
) -> Result<usize, FuzzyflowError> {
    match raw {
        None => Ok(default),
        Some(n) if n >= 1 => Ok(n as usize),
        Some(n) => Err(invalid(
            index,
            description,
            format!("{} must be >= 1, got {}", field, n),
        )),
    }
}

fn validate_step(index: usize, mut doc: StepDoc) -> Result<Step, FuzzyflowError> {
    let description = doc
        .description
        .clone()
        .unwrap_or_else(|| format!("Step {}", index));
    let retries = u32::try_from(positive(index, &description, "retries", doc.retries, 1)?)
        .map_err(|_| {
            invalid(
                index,
                &description,
                format!("retries must be <= {}", u32::MAX),
            )
        })?;
    let required = doc.required.unwrap_or(true);
    let on_fail = doc
        .on_fail
        .take()
        .and_then(|o| o.command)
        .filter(|c| !c.trim().is_empty());
    let type_name = doc.step_type.clone().unwrap_or_else(|| "shell".to_string());

    let kind = match type_name.as_str() {
        "shell" => StepKind::Shell {
            command: doc.command,
            eval_contains: doc.eval_contains,
        },
        "boolean" => StepKind::Boolean {
            command: doc.command,
        },
        "fuzzy" | "neuro_fuzzy" => {
            let flavor = if type_name == "fuzzy" {
                FuzzyFlavor::Fuzzy
            } else {
                FuzzyFlavor::NeuroFuzzy
            };
            StepKind::Fuzzy(validate_fuzzy(index, &description, flavor, doc)?)
        }
        _ => StepKind::Unsupported { type_name },
    };

    Ok(Step {
        index,
        description,
        required,
        retries,
        on_fail,
        kind,
    })
}

fn validate_fuzzy(
    index: usize,
    description: &str,
    flavor: FuzzyFlavor,
    doc: StepDoc,
) -> Result<FuzzySpec, FuzzyflowError> {
    let metric_func = doc
        .metric_func
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| invalid(index, description, "fuzzy steps need 'metric_func'"))?;

    let metric = if metric_func == CUSTOM_SHELL_METRIC {
        let command = doc
            .custom_command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| invalid(index, description, "custom_shell needs 'custom_command'"))?;
        let formula = match doc.parse_formula.as_deref() {
            Some(src) => Formula::parse(src).map_err(|e| invalid(index, description, e))?,
            None => Formula::default(),
        };
        if let Some(pattern) = doc.parse_regex.as_deref() {
            let re = Regex::new(pattern).map_err(|e| invalid(index, description, e))?;
            if formula.max_group() >= re.captures_len() {
                return Err(invalid(
                    index,
                    description,
                    format!(
                        "parse_formula references group {} but parse_regex has {} group(s)",
                        formula.max_group(),
                        re.captures_len() - 1
                    ),
                ));
            }
        }
        MetricSource::CustomShell {
            command,
            parse_regex: doc.parse_regex,
            formula,
        }
    } else {
        MetricSource::Named(metric_func)
    };

    let mode = match doc.mode.as_deref() {
        Some(raw) => ClassifierMode::parse(raw)?,
        None => match flavor {
            FuzzyFlavor::Fuzzy => ClassifierMode::Classic,
            FuzzyFlavor::NeuroFuzzy => ClassifierMode::NeuroFuzzy,
        },
    };

    let label_names = doc.label_names.unwrap_or_else(default_label_names);
    match mode {
        ClassifierMode::Classic if label_names.len() != 3 => {
            return Err(invalid(
                index,
                description,
                format!(
                    "classic mode needs exactly 3 label_names, got {}",
                    label_names.len()
                ),
            ));
        }
        ClassifierMode::NeuroFuzzy if label_names.is_empty() => {
            return Err(invalid(index, description, "label_names must not be empty"));
        }
        _ => {}
    }

    let settings = ClassifierSettings {
        thresholds: triple(index, description, "thresholds", doc.thresholds)?,
        min_thresholds: triple(index, description, "min_thresholds", doc.min_thresholds)?,
        history_size: positive(
            index,
            description,
            "history_size",
            doc.history_size,
            DEFAULT_HISTORY_SIZE,
        )?,
        update_every: positive(
            index,
            description,
            "update_every",
            doc.update_every,
            DEFAULT_UPDATE_EVERY,
        )?,
        label_names,
    };

    // Fractional durations truncate to whole seconds.
    let duration = match doc.duration {
        None => Duration::from_secs(DEFAULT_DURATION_SECS),
        Some(d) if d.is_finite() && d >= 0.0 => Duration::from_secs(d.trunc() as u64),
        Some(d) => {
            return Err(invalid(
                index,
                description,
                format!("duration must be >= 0, got {}", d),
            ));
        }
    };

    Ok(FuzzySpec {
        flavor,
        metric,
        eval_label: doc.eval_label,
        mode,
        settings,
        duration,
    })
}

/// The example document written by `fuzzyflow example`.
pub fn example_testcase() -> TestCaseDoc {
    TestCaseDoc {
        name: "Example Pipeline".to_string(),
        metadata: BTreeMap::new(),
        min_passed: Some(1),
        steps: vec![
            StepDoc {
                description: Some("Check Python version".to_string()),
                step_type: Some("shell".to_string()),
                command: Some("python3 --version".to_string()),
                eval_contains: Some("Python".to_string()),
                required: Some(true),
                retries: Some(1),
                ..StepDoc::default()
            },
            StepDoc {
                description: Some("Fuzzy CPU load".to_string()),
                step_type: Some("fuzzy".to_string()),
                metric_func: Some("cpu_percent".to_string()),
                thresholds: Some(vec![10.0, 50.0, 80.0]),
                eval_label: Some("LOW".to_string()),
                duration: Some(3.0),
                required: Some(true),
                retries: Some(1),
                ..StepDoc::default()
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let tc = TestCase::from_json(
            r#"{"name": "t", "steps": [
                {"description": "cpu", "type": "fuzzy", "metric_func": "cpu_percent"},
                {"command": "echo hi"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(tc.min_passed, None);
        let StepKind::Fuzzy(spec) = &tc.steps[0].kind else {
            panic!("expected fuzzy step");
        };
        assert_eq!(spec.settings, ClassifierSettings::default());
        assert_eq!(spec.mode, ClassifierMode::Classic);
        assert_eq!(spec.duration, Duration::from_secs(5));
        assert!(tc.steps[0].required);
        assert_eq!(tc.steps[0].retries, 1);

        assert_eq!(tc.steps[1].description, "Step 2");
        assert_eq!(tc.steps[1].type_name(), "shell");
    }

    #[test]
    fn test_neuro_fuzzy_infers_mode() {
        let tc = TestCase::from_json(
            r#"{"steps": [{"type": "neuro_fuzzy", "metric_func": "ram_percent", "label_names": ["A", "B"]}]}"#,
        )
        .unwrap();
        let StepKind::Fuzzy(spec) = &tc.steps[0].kind else {
            panic!("expected fuzzy step");
        };
        assert_eq!(spec.mode, ClassifierMode::NeuroFuzzy);
        assert_eq!(tc.steps[0].type_name(), "neuro_fuzzy");
    }

    #[test]
    fn test_rejects_fuzzy_without_metric() {
        let err = TestCase::from_json(r#"{"steps": [{"type": "fuzzy"}]}"#).unwrap_err();
        assert!(err.to_string().contains("metric_func"));
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let err = TestCase::from_json(
            r#"{"steps": [{"type": "fuzzy", "metric_func": "cpu_percent", "mode": "quantum"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, FuzzyflowError::UnknownMode(m) if m == "quantum"));
    }

    #[test]
    fn test_rejects_bad_shapes() {
        for bad in [
            r#"{"steps": [{"command": "ls", "retries": 0}]}"#,
            r#"{"steps": [{"type": "fuzzy", "metric_func": "cpu_percent", "thresholds": [1, 2]}]}"#,
            r#"{"steps": [{"type": "fuzzy", "metric_func": "cpu_percent", "history_size": 0}]}"#,
            r#"{"steps": [{"type": "fuzzy", "metric_func": "cpu_percent", "label_names": ["A"]}]}"#,
            r#"{"steps": [{"type": "fuzzy", "metric_func": "custom_shell"}]}"#,
            r#"{"steps": [{"type": "fuzzy", "metric_func": "custom_shell", "custom_command": "echo 1", "parse_regex": "("}]}"#,
            r#"{"steps": [{"type": "fuzzy", "metric_func": "custom_shell", "custom_command": "echo 1", "parse_regex": "(\\d+)", "parse_formula": "$2"}]}"#,
            r#"{"min_passed": -1, "steps": []}"#,
        ] {
            assert!(TestCase::from_json(bad).is_err(), "accepted: {}", bad);
        }
    }

    #[test]
    fn test_rejects_retries_beyond_u32() {
        let err = TestCase::from_json(r#"{"steps": [{"command": "ls", "retries": 4294967296}]}"#)
            .unwrap_err();
        assert!(matches!(err, FuzzyflowError::ValidationError(_)), "{err}");
        assert!(err.to_string().contains("retries"));

        let tc = TestCase::from_json(r#"{"steps": [{"command": "ls", "retries": 4294967295}]}"#)
            .unwrap();
        assert_eq!(tc.steps[0].retries, u32::MAX);
    }

    #[test]
    fn test_unknown_type_loads_as_unsupported() {
        let tc = TestCase::from_json(r#"{"steps": [{"type": "http", "command": "curl x"}]}"#)
            .unwrap();
        assert_eq!(
            tc.steps[0].kind,
            StepKind::Unsupported {
                type_name: "http".to_string()
            }
        );
    }

    #[test]
    fn test_missing_shell_command_is_not_a_load_error() {
        let tc = TestCase::from_json(r#"{"steps": [{"type": "boolean"}]}"#).unwrap();
        assert_eq!(tc.steps[0].command_to_resolve(), Some(None));
    }

    #[test]
    fn test_select_step() {
        let mut tc = TestCase::from_json(
            r#"{"steps": [{"command": "echo a"}, {"command": "echo b"}]}"#,
        )
        .unwrap();
        assert!(tc.select_step(3).is_err());
        assert!(tc.select_step(0).is_err());
        tc.select_step(2).unwrap();
        assert_eq!(tc.steps.len(), 1);
        assert_eq!(tc.steps[0].index, 2);
    }

    #[test]
    fn test_example_is_valid() {
        let doc = example_testcase();
        let json = serde_json::to_string(&doc).unwrap();
        let tc = TestCase::from_json(&json).unwrap();
        assert_eq!(tc.min_passed, Some(1));
        assert_eq!(tc.steps.len(), 2);
    }

    #[test]
    fn test_fractional_duration_truncates() {
        let tc = TestCase::from_json(
            r#"{"steps": [{"type": "fuzzy", "metric_func": "cpu_percent", "duration": 2.9}]}"#,
        )
        .unwrap();
        let StepKind::Fuzzy(spec) = &tc.steps[0].kind else {
            panic!("expected fuzzy step");
        };
        assert_eq!(spec.duration, Duration::from_secs(2));
    }
}
