//! Optional `fuzzyflow.toml` configuration.
//!
//! A missing file is not an error: every field has a default, and CLI flags
//! override whatever the file provides.

use crate::core::error::FuzzyflowError;
use crate::core::safety::SafetyPolicy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "fuzzyflow.toml";
pub const CONFIG_ENV_VAR: &str = "FUZZYFLOW_CONFIG";

/// A shell-backed metric registered by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredMetric {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyflowConfig {
    #[serde(default = "default_logdir")]
    pub logdir: PathBuf,
    /// Seconds between fuzzy samples.
    #[serde(default = "default_interval")]
    pub interval: f64,
    #[serde(default)]
    pub safety: SafetyPolicy,
    #[serde(default, rename = "metric")]
    pub metrics: Vec<RegisteredMetric>,
}

fn default_logdir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_interval() -> f64 {
    1.0
}

impl Default for FuzzyflowConfig {
    fn default() -> Self {
        Self {
            logdir: default_logdir(),
            interval: default_interval(),
            safety: SafetyPolicy::default(),
            metrics: Vec::new(),
        }
    }
}

/// Explicit path, then `$FUZZYFLOW_CONFIG`, then `./fuzzyflow.toml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(CONFIG_ENV_VAR) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => PathBuf::from(CONFIG_FILE_NAME),
    }
}

impl FuzzyflowConfig {
    pub fn load(path: &Path) -> Result<Self, FuzzyflowError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: FuzzyflowConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), FuzzyflowError> {
        let content =
            toml::to_string(self).map_err(|e| FuzzyflowError::ConfigError(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), FuzzyflowError> {
        if !self.interval.is_finite() || self.interval < 0.0 {
            return Err(FuzzyflowError::ConfigError(format!(
                "interval must be a non-negative number of seconds, got {}",
                self.interval
            )));
        }
        for metric in &self.metrics {
            validate_metric_name(&metric.name)?;
            if metric.command.trim().is_empty() {
                return Err(FuzzyflowError::ConfigError(format!(
                    "metric '{}' has an empty command",
                    metric.name
                )));
            }
        }
        Ok(())
    }

    /// Insert or replace a registered metric.
    pub fn register_metric(&mut self, name: &str, command: &str) -> Result<(), FuzzyflowError> {
        validate_metric_name(name)?;
        if command.trim().is_empty() {
            return Err(FuzzyflowError::ConfigError(format!(
                "metric '{}' has an empty command",
                name
            )));
        }
        let entry = RegisteredMetric {
            name: name.to_string(),
            command: command.to_string(),
        };
        match self.metrics.iter_mut().find(|m| m.name == name) {
            Some(existing) => *existing = entry,
            None => self.metrics.push(entry),
        }
        Ok(())
    }
}

fn validate_metric_name(name: &str) -> Result<(), FuzzyflowError> {
    let pattern = Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$")?;
    if !pattern.is_match(name) || name == "custom_shell" {
        return Err(FuzzyflowError::ConfigError(format!(
            "invalid metric name '{}': use letters, digits and '_' (and not 'custom_shell')",
            name
        )));
    }
    Ok(())
}
