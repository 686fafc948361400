//! Shared store holding the last permitted action per user.
//!
//! Every implementation exposes the same atomic evaluate-and-update primitive,
//! so the gate does not care whether the check-and-record step is made atomic
//! by a lock, a conditional write, or an exclusion constraint.

mod memory;
pub mod postgres;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StoreConfig;
use crate::error::StoreError;

pub use memory::{MemoryIntervalStore, MemoryLockingStore, MemoryUpsertStore};
pub use postgres::{PgIntervalStore, PgLockingStore, PgUpsertStore};

/// Where rate limit records are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local maps. Only correct for a single instance.
    #[default]
    Memory,
    /// A shared Postgres database.
    Postgres,
}

/// How the check-and-record step is made atomic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStrategy {
    /// Exclusive non-blocking lock around read, evaluate, write.
    Locking,
    /// One conditional insert-or-update.
    #[default]
    ConditionalUpsert,
    /// One half-open interval per permit, overlaps rejected by the store.
    IntervalExclusion,
}

impl fmt::Display for StoreStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreStrategy::Locking => "locking",
            StoreStrategy::ConditionalUpsert => "conditional_upsert",
            StoreStrategy::IntervalExclusion => "interval_exclusion",
        };
        f.write_str(name)
    }
}

/// Result of one evaluate-and-update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The record was created or moved forward to `now`.
    Written,
    /// Nothing was written; the allowed period has not elapsed.
    PeriodNotElapsed,
    /// Nothing was evaluated; another decision for this user holds the lock.
    Contention,
}

/// The persisted state for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub user_id: String,
    pub last_permitted_at: DateTime<Utc>,
}

/// Half-open interval `[start, end)` covered by one permitted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PermitInterval {
    pub fn new(start: DateTime<Utc>, period: chrono::Duration) -> Result<Self, StoreError> {
        let end = start
            .checked_add_signed(period)
            .ok_or_else(|| StoreError::Malformed(format!("interval end overflows at {start}")))?;
        Ok(Self { start, end })
    }

    pub fn overlaps(&self, other: &PermitInterval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for PermitInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Trait for rate limit store implementations.
///
/// `try_permit` is the only way a record changes during admission. It must be
/// atomic across every process sharing the store: for a fixed user, at most
/// one call per `allowed_period` window may return [`StoreOutcome::Written`].
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Record a permitted action at `now` if at least `allowed_period` has
    /// passed since the previous one.
    async fn try_permit(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        allowed_period: Duration,
    ) -> Result<StoreOutcome, StoreError>;

    /// Delete records whose last permitted action predates `cutoff`.
    ///
    /// Returns the number of records removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Read the last permitted action for a user without modifying it.
    async fn last_permitted_at(&self, user_id: &str)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    /// The atomicity strategy this store implements.
    fn strategy(&self) -> StoreStrategy;

    /// Read the record for a user, if one exists.
    async fn record(&self, user_id: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        Ok(self
            .last_permitted_at(user_id)
            .await?
            .map(|last_permitted_at| RateLimitRecord {
                user_id: user_id.to_string(),
                last_permitted_at,
            }))
    }
}

/// Convert the configured period into a signed duration for timestamp math.
pub(crate) fn signed_period(period: Duration) -> Result<chrono::Duration, StoreError> {
    chrono::Duration::from_std(period)
        .map_err(|_| StoreError::Malformed(format!("allowed period {period:?} is out of range")))
}

/// Eligibility rule shared by every strategy.
pub(crate) fn period_elapsed(
    last_permitted_at: DateTime<Utc>,
    now: DateTime<Utc>,
    period: chrono::Duration,
) -> bool {
    now.signed_duration_since(last_permitted_at) >= period
}

/// Build the store selected by configuration.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn RateLimitStore>, StoreError> {
    info!(
        backend = ?config.backend,
        strategy = %config.strategy,
        "Initializing rate limit store"
    );

    let store: Arc<dyn RateLimitStore> = match config.backend {
        StoreBackend::Memory => match config.strategy {
            StoreStrategy::Locking => Arc::new(MemoryLockingStore::new()),
            StoreStrategy::ConditionalUpsert => Arc::new(MemoryUpsertStore::new()),
            StoreStrategy::IntervalExclusion => Arc::new(MemoryIntervalStore::new()),
        },
        StoreBackend::Postgres => {
            let pool = postgres::connect_pool(config).await?;
            match config.strategy {
                StoreStrategy::Locking => Arc::new(PgLockingStore::new(pool)),
                StoreStrategy::ConditionalUpsert => Arc::new(PgUpsertStore::new(pool)),
                StoreStrategy::IntervalExclusion => Arc::new(PgIntervalStore::new(pool)),
            }
        }
    };

    Ok(store)
}
