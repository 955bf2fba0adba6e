//! Advisory command safety check.
//!
//! Flags commands that invoke a known-destructive program or a program outside
//! the whitelist. The verdict is reported only; execution is never blocked.

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_WHITELIST: &[&str] = &[
    "ls", "cat", "echo", "pwd", "whoami", "uname", "date", "df", "free", "python3", "pip", "ps",
    "id",
];

pub const DEFAULT_DANGEROUS: &[&str] = &[
    "rm", "sudo", "shutdown", "reboot", "mkfs", "dd", "kill", "passwd", "chown", "chmod", "init",
    "telinit",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,
    #[serde(default = "default_dangerous")]
    pub dangerous: Vec<String>,
}

fn default_whitelist() -> Vec<String> {
    DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect()
}

fn default_dangerous() -> Vec<String> {
    DEFAULT_DANGEROUS.iter().map(|s| s.to_string()).collect()
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            whitelist: default_whitelist(),
            dangerous: default_dangerous(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SafetyVerdict {
    Safe,
    NotWhitelisted { program: String },
    Dangerous { word: String },
}

impl SafetyVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, SafetyVerdict::Safe)
    }

    pub fn message(&self, command: &str) -> Option<String> {
        match self {
            SafetyVerdict::Safe => None,
            SafetyVerdict::NotWhitelisted { program } => Some(format!(
                "Command '{}' runs '{}', which is not in the safe whitelist. Use with caution.",
                command, program
            )),
            SafetyVerdict::Dangerous { word } => Some(format!(
                "Command '{}' is considered dangerous ('{}')!",
                command, word
            )),
        }
    }
}

impl SafetyPolicy {
    /// Classify `command`. Dangerous programs anywhere in the pipeline win over
    /// the whitelist check on the leading program.
    pub fn check(&self, command: &str) -> SafetyVerdict {
        let programs = command_words(command);
        for word in &programs {
            if self.dangerous.iter().any(|d| d == word) {
                return SafetyVerdict::Dangerous { word: word.clone() };
            }
        }
        match programs.first() {
            Some(first) if !self.whitelist.is_empty() && !self.whitelist.contains(first) => {
                SafetyVerdict::NotWhitelisted {
                    program: first.clone(),
                }
            }
            _ => SafetyVerdict::Safe,
        }
    }
}

/// Split a command line into shell words, reduced to their basenames.
fn command_words(command: &str) -> Vec<String> {
    command
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | '|' | '&' | '(' | ')' | '`'))
        .filter(|w| !w.is_empty())
        .map(|w| {
            Path::new(w)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| w.to_string())
        })
        .collect()
}
