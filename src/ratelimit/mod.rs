//! Admission gate, decision mapping, metrics and retention.

mod decision;
mod gate;
pub mod metrics;
mod retention;

pub use decision::{CallerResponse, Decision, DenialReason, Outcome};
pub use gate::RateLimiterGate;
pub use metrics::{MetricsSink, PrometheusSink};
pub use retention::RetentionSweeper;
