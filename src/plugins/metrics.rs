//! Metric registry: named, zero-argument functions yielding an `f64`.
//!
//! The registry is an explicit instance handed to the pipeline. It starts with
//! the built-in host metrics and grows through `register*` calls (for example
//! from the `[[metric]]` entries of `fuzzyflow.toml`).

use crate::core::error::FuzzyflowError;
use crate::core::exec::{CommandRunner, METRIC_TIMEOUT};
use crate::core::formula::Formula;
use crate::core::testcase::MetricSource;
use crate::plugins::host;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Sentinel returned when a metric cannot be measured.
pub const METRIC_UNAVAILABLE: f64 = -1.0;

pub type MetricFn = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Clone, Default)]
pub struct MetricRegistry {
    metrics: BTreeMap<String, MetricFn>,
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("metrics", &self.names())
            .finish()
    }
}

impl MetricRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the host metrics.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        let cpu = Arc::new(host::CpuSampler::default());
        registry.register("cpu_percent", move || cpu.sample());
        registry.register("ram_percent", host::ram_percent);
        registry.register("swap_percent", host::swap_percent);
        registry.register("disk_percent", host::disk_percent);
        registry.register("uptime", host::uptime);
        registry.register("load_avg", host::load_avg);
        registry.register("processes", host::processes);
        registry
    }

    pub fn register<F>(&mut self, name: &str, metric: F)
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.metrics.insert(name.to_string(), Arc::new(metric));
    }

    /// Register a metric whose value is the first number printed by `command`.
    pub fn register_shell(&mut self, name: &str, command: &str, runner: Arc<dyn CommandRunner>) {
        let command = command.to_string();
        let metric_name = name.to_string();
        self.register(name, move || {
            match runner.run(&command, Some(METRIC_TIMEOUT)) {
                Ok(out) if out.success() => out
                    .stdout
                    .split_whitespace()
                    .next()
                    .and_then(|first| first.parse::<f64>().ok())
                    .unwrap_or(METRIC_UNAVAILABLE),
                Ok(out) => {
                    debug!(metric = %metric_name, exit_code = ?out.exit_code, "registered metric failed");
                    METRIC_UNAVAILABLE
                }
                Err(e) => {
                    debug!(metric = %metric_name, error = %e, "registered metric failed");
                    METRIC_UNAVAILABLE
                }
            }
        });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.metrics.keys().cloned().collect()
    }

    pub fn resolve(&self, name: &str) -> Result<MetricFn, FuzzyflowError> {
        self.metrics
            .get(name)
            .cloned()
            .ok_or_else(|| FuzzyflowError::UnknownMetric {
                name: name.to_string(),
                available: self.names(),
            })
    }

    /// Turn a step's metric source into a callable.
    pub fn resolve_source(
        &self,
        source: &MetricSource,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<MetricFn, FuzzyflowError> {
        match source {
            MetricSource::Named(name) => self.resolve(name),
            MetricSource::CustomShell {
                command,
                parse_regex,
                formula,
            } => {
                let regex = parse_regex.as_deref().map(Regex::new).transpose()?;
                Ok(custom_shell_metric(
                    command.clone(),
                    regex,
                    formula.clone(),
                    runner,
                ))
            }
        }
    }
}

/// Value extraction for `custom_shell` output.
///
/// With a regex, the formula is evaluated over the first match's groups;
/// without one, trimmed stdout must be a number.
pub fn extract_value(stdout: &str, regex: Option<&Regex>, formula: &Formula) -> f64 {
    match regex {
        Some(re) => {
            let Some(caps) = re.captures(stdout) else {
                return METRIC_UNAVAILABLE;
            };
            let groups: Vec<Option<&str>> =
                caps.iter().map(|m| m.map(|m| m.as_str())).collect();
            formula.eval(&groups).unwrap_or(METRIC_UNAVAILABLE)
        }
        None => stdout.trim().parse::<f64>().unwrap_or(METRIC_UNAVAILABLE),
    }
}

fn custom_shell_metric(
    command: String,
    regex: Option<Regex>,
    formula: Formula,
    runner: Arc<dyn CommandRunner>,
) -> MetricFn {
    Arc::new(move || match runner.run(&command, Some(METRIC_TIMEOUT)) {
        Ok(out) if out.success() => extract_value(&out.stdout, regex.as_ref(), &formula),
        Ok(_) => METRIC_UNAVAILABLE,
        Err(e) => {
            debug!(command = %command, error = %e, "custom_shell metric failed");
            METRIC_UNAVAILABLE
        }
    })
}
