//! Process-local store implementations.
//!
//! These give a single instance the same semantics as the Postgres stores and
//! back the strategy property tests. They do not coordinate across processes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::{
    period_elapsed, signed_period, PermitInterval, RateLimitStore, StoreOutcome, StoreStrategy,
};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Slot {
    last_permitted_at: Option<DateTime<Utc>>,
    /// Set by the retention sweep just before the slot leaves the map.
    retired: bool,
}

/// Pessimistic strategy: a per-user mutex taken with `try_lock`.
#[derive(Debug, Default)]
pub struct MemoryLockingStore {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
}

impl MemoryLockingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, user_id: &str) -> Arc<Mutex<Slot>> {
        self.slots
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .clone()
    }
}

#[async_trait]
impl RateLimitStore for MemoryLockingStore {
    async fn try_permit(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        allowed_period: Duration,
    ) -> Result<StoreOutcome, StoreError> {
        let period = signed_period(allowed_period)?;

        loop {
            let slot = self.slot(user_id);
            let Some(mut guard) = slot.try_lock() else {
                trace!(user = %user_id, "Slot locked by a concurrent decision");
                return Ok(StoreOutcome::Contention);
            };

            // The sweep removed this slot between lookup and lock; a fresh
            // lookup creates a new one.
            if guard.retired {
                continue;
            }

            let outcome = match guard.last_permitted_at {
                Some(last) if !period_elapsed(last, now, period) => StoreOutcome::PeriodNotElapsed,
                _ => {
                    guard.last_permitted_at = Some(now);
                    StoreOutcome::Written
                }
            };
            return Ok(outcome);
        }
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = 0;
        self.slots.retain(|_, slot| {
            // A locked slot belongs to a live decision and is skipped.
            let Some(mut guard) = slot.try_lock() else {
                return true;
            };
            match guard.last_permitted_at {
                Some(last) if last < cutoff => {
                    guard.retired = true;
                    removed += 1;
                    false
                }
                _ => true,
            }
        });
        Ok(removed)
    }

    async fn last_permitted_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .slots
            .get(user_id)
            .and_then(|slot| slot.lock().last_permitted_at))
    }

    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::Locking
    }
}

/// Conditional upsert strategy: the map entry lock covers check and write.
#[derive(Debug, Default)]
pub struct MemoryUpsertStore {
    records: DashMap<String, DateTime<Utc>>,
}

impl MemoryUpsertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryUpsertStore {
    async fn try_permit(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        allowed_period: Duration,
    ) -> Result<StoreOutcome, StoreError> {
        let period = signed_period(allowed_period)?;

        let outcome = match self.records.entry(user_id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(now);
                StoreOutcome::Written
            }
            Entry::Occupied(mut entry) => {
                if period_elapsed(*entry.get(), now, period) {
                    entry.insert(now);
                    StoreOutcome::Written
                } else {
                    StoreOutcome::PeriodNotElapsed
                }
            }
        };
        Ok(outcome)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = 0;
        self.records.retain(|_, last| {
            let keep = *last >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn last_permitted_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.records.get(user_id).map(|last| *last))
    }

    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::ConditionalUpsert
    }
}

/// Interval ledger strategy: one `[start, end)` entry per permit, overlapping
/// inserts rejected.
#[derive(Debug, Default)]
pub struct MemoryIntervalStore {
    ledger: DashMap<String, Vec<PermitInterval>>,
}

impl MemoryIntervalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryIntervalStore {
    async fn try_permit(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        allowed_period: Duration,
    ) -> Result<StoreOutcome, StoreError> {
        let interval = PermitInterval::new(now, signed_period(allowed_period)?)?;

        let outcome = match self.ledger.entry(user_id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(vec![interval]);
                StoreOutcome::Written
            }
            Entry::Occupied(mut entry) => {
                let intervals = entry.get_mut();
                if intervals.iter().any(|existing| existing.overlaps(&interval)) {
                    trace!(user = %user_id, interval = %interval, "Interval overlaps ledger");
                    StoreOutcome::PeriodNotElapsed
                } else {
                    intervals.push(interval);
                    StoreOutcome::Written
                }
            }
        };
        Ok(outcome)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = 0;
        self.ledger.retain(|_, intervals| {
            let before = intervals.len();
            intervals.retain(|interval| interval.start >= cutoff);
            removed += (before - intervals.len()) as u64;
            !intervals.is_empty()
        });
        Ok(removed)
    }

    async fn last_permitted_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .ledger
            .get(user_id)
            .and_then(|intervals| intervals.iter().map(|interval| interval.start).max()))
    }

    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::IntervalExclusion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::at;

    const PERIOD: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_locked_slot_reports_contention() {
        let store = MemoryLockingStore::new();
        let slot = store.slot("alex");
        let _held = slot.lock();

        let outcome = store.try_permit("alex", at(0), PERIOD).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Contention);

        // Other users are unaffected.
        let outcome = store.try_permit("sam", at(0), PERIOD).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Written);
    }

    #[tokio::test]
    async fn test_sweep_skips_locked_slot() {
        let store = MemoryLockingStore::new();
        store.try_permit("alex", at(0), PERIOD).await.unwrap();

        let slot = store.slot("alex");
        {
            let _held = slot.lock();
            assert_eq!(store.delete_older_than(at(60_000)).await.unwrap(), 0);
        }
        assert_eq!(store.delete_older_than(at(60_000)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retired_slot_is_replaced() {
        let store = MemoryLockingStore::new();
        store.try_permit("alex", at(0), PERIOD).await.unwrap();

        // A decision that looked the slot up before the sweep removed it.
        let stale = store.slot("alex");
        store.delete_older_than(at(60_000)).await.unwrap();
        assert!(stale.lock().retired);

        let outcome = store.try_permit("alex", at(60_000), PERIOD).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Written);
        assert_eq!(store.last_permitted_at("alex").await.unwrap(), Some(at(60_000)));
    }

    #[tokio::test]
    async fn test_upsert_never_reports_contention() {
        let store = MemoryUpsertStore::new();
        for i in 0..10 {
            let outcome = store.try_permit("alex", at(i * 100), PERIOD).await.unwrap();
            assert_ne!(outcome, StoreOutcome::Contention);
        }
    }

    #[tokio::test]
    async fn test_interval_ledger_grows_per_permit() {
        let store = MemoryIntervalStore::new();
        store.try_permit("alex", at(0), PERIOD).await.unwrap();
        store.try_permit("alex", at(2000), PERIOD).await.unwrap();
        store.try_permit("alex", at(4000), PERIOD).await.unwrap();

        assert_eq!(store.ledger.get("alex").unwrap().len(), 3);
        assert_eq!(store.delete_older_than(at(4000)).await.unwrap(), 2);
        assert_eq!(store.ledger.get("alex").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_interval_rejects_earlier_overlap() {
        let store = MemoryIntervalStore::new();
        store.try_permit("alex", at(5000), PERIOD).await.unwrap();

        // An earlier reading that still overlaps is denied.
        let outcome = store.try_permit("alex", at(4000), PERIOD).await.unwrap();
        assert_eq!(outcome, StoreOutcome::PeriodNotElapsed);
    }
}
