//! Decision metrics.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

use super::decision::Outcome;

pub const RATE_LIMITER_EVENT: &str = "rate_limiter_event";
pub const RATE_LIMITER_DURATION: &str = "rate_limiter_duration";
pub const USER_LABEL: &str = "user";
pub const STATUS_LABEL: &str = "status";

/// Latency buckets in seconds; decisions are a single store round-trip.
const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Receives exactly one record per gate call.
pub trait MetricsSink: Send + Sync {
    fn record(&self, user_id: &str, outcome: Outcome, elapsed: Duration);
}

/// Prometheus-backed sink.
#[derive(Clone)]
pub struct PrometheusSink {
    events: IntCounterVec,
    duration: Histogram,
}

impl PrometheusSink {
    /// Create the collectors and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sink = Self::unregistered()?;
        registry.register(Box::new(sink.events.clone()))?;
        registry.register(Box::new(sink.duration.clone()))?;
        Ok(sink)
    }

    fn unregistered() -> Result<Self, prometheus::Error> {
        let events = IntCounterVec::new(
            Opts::new(RATE_LIMITER_EVENT, "Rate limiter decisions by user and status"),
            &[USER_LABEL, STATUS_LABEL],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(RATE_LIMITER_DURATION, "Rate limiter decision latency in seconds")
                .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        Ok(Self { events, duration })
    }

    /// Sink registered with the process-wide default registry.
    pub fn global() -> PrometheusSink {
        DEFAULT_SINK.clone()
    }

    /// Number of events recorded for a user and status.
    pub fn event_count(&self, user_id: &str, status: &str) -> u64 {
        self.events.with_label_values(&[user_id, status]).get()
    }

    /// Number of latency samples observed.
    pub fn duration_samples(&self) -> u64 {
        self.duration.get_sample_count()
    }
}

impl MetricsSink for PrometheusSink {
    fn record(&self, user_id: &str, outcome: Outcome, elapsed: Duration) {
        self.events
            .with_label_values(&[user_id, outcome.status()])
            .inc();
        self.duration.observe(elapsed.as_secs_f64());
    }
}

lazy_static! {
    static ref DEFAULT_SINK: PrometheusSink =
        PrometheusSink::new(prometheus::default_registry())
            .expect("rate limiter metrics registered twice in the default registry");
}

/// Render every metric in `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
