use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FuzzyflowError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config parse error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Invalid regex: {0}")]
    RegexError(#[from] regex::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Metric '{name}' is not available (known: {})", available.join(", "))]
    UnknownMetric { name: String, available: Vec<String> },
    #[error("Unknown fuzzy mode: {0}")]
    UnknownMode(String),
    #[error("Command '{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
    #[error("Formula error: {0}")]
    FormulaError(String),
}
