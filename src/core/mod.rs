//! Shared primitives: data model, errors, configuration, execution and sinks.

pub mod clock;
pub mod config;
pub mod error;
pub mod exec;
pub mod formula;
pub mod output;
pub mod safety;
pub mod sink;
pub mod testcase;
pub mod time;
