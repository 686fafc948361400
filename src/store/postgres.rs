//! Postgres-backed stores shared by every service instance.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use tracing::{debug, info, trace};

use super::{
    period_elapsed, signed_period, PermitInterval, RateLimitStore, StoreOutcome, StoreStrategy,
};
use crate::config::StoreConfig;
use crate::error::StoreError;

const SCHEMA: &str = include_str!("../../migrations/0001_user_rate_limiter.sql");

/// SQLSTATE raised by `FOR UPDATE NOWAIT` when the row is locked.
const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";
const EXCLUSION_VIOLATION: &str = "23P01";

/// Open a connection pool for the configured database.
pub async fn connect_pool(config: &StoreConfig) -> Result<PgPool, StoreError> {
    let url = config
        .database_url
        .as_deref()
        .filter(|url| !url.is_empty())
        .ok_or_else(|| StoreError::Unavailable("no database_url configured".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET application_name = 'turnstile';").await?;
                Ok(())
            })
        })
        .connect(url)
        .await?;

    info!(max_connections = config.max_connections, "Connected to Postgres");
    Ok(pool)
}

/// Create the rate limiter tables if they do not exist.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("Rate limiter schema is up to date");
    Ok(())
}

fn has_sqlstate(err: &sqlx::Error, code: &str) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|c| c == code)
}

async fn delete_records_older_than(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM user_rate_limiter WHERE last_permitted_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

async fn fetch_last_permitted_at(
    pool: &PgPool,
    user_id: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    let last = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT last_permitted_at FROM user_rate_limiter WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(last)
}

/// Pessimistic strategy: transaction-scoped, non-blocking locks.
///
/// The advisory lock covers a user with no row yet; `FOR UPDATE NOWAIT`
/// covers the row itself. Both are released when the transaction ends.
#[derive(Debug, Clone)]
pub struct PgLockingStore {
    pool: PgPool,
}

impl PgLockingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgLockingStore {
    async fn try_permit(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        allowed_period: Duration,
    ) -> Result<StoreOutcome, StoreError> {
        let period = signed_period(allowed_period)?;
        let mut tx = self.pool.begin().await?;

        let locked: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;
        if !locked {
            trace!(user = %user_id, "Advisory lock held by a concurrent decision");
            tx.rollback().await?;
            return Ok(StoreOutcome::Contention);
        }

        let last = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_permitted_at FROM user_rate_limiter WHERE user_id = $1 FOR UPDATE NOWAIT",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await;

        let last = match last {
            Ok(last) => last,
            Err(e) if has_sqlstate(&e, LOCK_NOT_AVAILABLE) => {
                trace!(user = %user_id, "Row lock not available");
                tx.rollback().await?;
                return Ok(StoreOutcome::Contention);
            }
            Err(e) => return Err(e.into()),
        };

        match last {
            Some(last) if !period_elapsed(last, now, period) => {
                tx.rollback().await?;
                Ok(StoreOutcome::PeriodNotElapsed)
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE user_rate_limiter SET last_permitted_at = $2 WHERE user_id = $1",
                )
                .bind(user_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(StoreOutcome::Written)
            }
            None => {
                let inserted = sqlx::query(
                    "INSERT INTO user_rate_limiter (user_id, last_permitted_at) VALUES ($1, $2)",
                )
                .bind(user_id)
                .bind(now)
                .execute(&mut *tx)
                .await;

                match inserted {
                    Ok(_) => {
                        tx.commit().await?;
                        Ok(StoreOutcome::Written)
                    }
                    // Only a writer outside this strategy can get here first.
                    Err(e) if has_sqlstate(&e, UNIQUE_VIOLATION) => {
                        debug!(user = %user_id, "Concurrent first insert");
                        tx.rollback().await?;
                        Ok(StoreOutcome::Contention)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        delete_records_older_than(&self.pool, cutoff).await
    }

    async fn last_permitted_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        fetch_last_permitted_at(&self.pool, user_id).await
    }

    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::Locking
    }
}

/// Conditional upsert strategy: one statement, no explicit transaction.
#[derive(Debug, Clone)]
pub struct PgUpsertStore {
    pool: PgPool,
}

impl PgUpsertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgUpsertStore {
    async fn try_permit(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        allowed_period: Duration,
    ) -> Result<StoreOutcome, StoreError> {
        let period = signed_period(allowed_period)?;
        let eligible_before = now
            .checked_sub_signed(period)
            .ok_or_else(|| StoreError::Malformed(format!("period underflows at {now}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO user_rate_limiter (user_id, last_permitted_at)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
                SET last_permitted_at = EXCLUDED.last_permitted_at
                WHERE user_rate_limiter.last_permitted_at <= $3
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(eligible_before)
        .execute(&self.pool)
        .await?;

        match result.rows_affected() {
            1 => Ok(StoreOutcome::Written),
            0 => Ok(StoreOutcome::PeriodNotElapsed),
            n => Err(StoreError::Malformed(format!(
                "conditional upsert for one user affected {n} rows"
            ))),
        }
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        delete_records_older_than(&self.pool, cutoff).await
    }

    async fn last_permitted_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        fetch_last_permitted_at(&self.pool, user_id).await
    }

    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::ConditionalUpsert
    }
}

/// Interval ledger strategy: the exclusion constraint rejects overlapping
/// ranges for the same user.
#[derive(Debug, Clone)]
pub struct PgIntervalStore {
    pool: PgPool,
}

impl PgIntervalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgIntervalStore {
    async fn try_permit(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        allowed_period: Duration,
    ) -> Result<StoreOutcome, StoreError> {
        let interval = PermitInterval::new(now, signed_period(allowed_period)?)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO user_rate_limiter_interval (user_id, permitted_range, created_at)
            VALUES ($1, tstzrange($2, $3, '[)'), $2)
            "#,
        )
        .bind(user_id)
        .bind(interval.start)
        .bind(interval.end)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(StoreOutcome::Written),
            Err(e) if has_sqlstate(&e, EXCLUSION_VIOLATION) => {
                trace!(user = %user_id, interval = %interval, "Interval overlaps ledger");
                Ok(StoreOutcome::PeriodNotElapsed)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM user_rate_limiter_interval WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn last_permitted_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let last = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT max(created_at) FROM user_rate_limiter_interval WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::IntervalExclusion
    }
}
