//! Retention sweep for records past their useful life.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::error::StoreError;
use crate::store::{signed_period, RateLimitStore};

/// Periodically deletes records older than `max_age`.
///
/// Runs beside the admission path and never waits on it: stores skip records
/// that a live decision is holding.
pub struct RetentionSweeper {
    store: Arc<dyn RateLimitStore>,
    max_age: Duration,
    interval: Duration,
}

/// Shortest interval the sweeper will tick at; `tokio::time::interval` rejects zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

impl RetentionSweeper {
    pub fn new(store: Arc<dyn RateLimitStore>, max_age: Duration, interval: Duration) -> Self {
        if interval < MIN_SWEEP_INTERVAL {
            warn!(?interval, "Sweep interval too short, using {:?}", MIN_SWEEP_INTERVAL);
        }
        Self {
            store,
            max_age,
            interval: interval.max(MIN_SWEEP_INTERVAL),
        }
    }

    pub fn from_config(store: Arc<dyn RateLimitStore>, config: &RetentionConfig) -> Self {
        Self::new(store, config.max_age(), config.sweep_interval())
    }

    /// Run one sweep relative to `now`. Returns the number of records removed.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let max_age = signed_period(self.max_age)?;
        let cutoff = now
            .checked_sub_signed(max_age)
            .ok_or_else(|| StoreError::Malformed(format!("retention cutoff underflows at {now}")))?;

        let removed = self.store.delete_older_than(cutoff).await?;
        if removed > 0 {
            info!(removed = removed, cutoff = %cutoff, "Retention sweep removed records");
        } else {
            debug!(cutoff = %cutoff, "Retention sweep found nothing to remove");
        }
        Ok(removed)
    }

    /// Sweep every `interval` until `shutdown` resolves.
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            max_age_secs = self.max_age.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting retention sweeper"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Retention sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        warn!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }
    }
}
