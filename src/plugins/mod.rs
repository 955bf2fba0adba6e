//! Pipeline subsystems: metrics, classification, dispatch, reporting.

pub mod dispatch;
pub mod fuzzy;
pub mod host;
pub mod metrics;
pub mod pipeline;
pub mod report;
