//! # Rate Limiter
//!
//! Fixed-window request counter keyed by `(client identity, endpoint)`. Each
//! check increments the key's counter; once the stored window expires the next
//! check starts a fresh window at one.
//!
//! Counters live behind the [`CounterStore`] trait: [`SqlCounterStore`] shares
//! them across replicas through the `rate_limit_counters` table, and
//! [`InMemoryCounterStore`] keeps them in process. Races between replicas may
//! miscount by one inside a window.
//!
//! When the store fails, [`RateLimitFailureMode`] decides the result: `Open`
//! admits the request (and logs it), `Closed` rejects it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use sea_orm::prelude::*;
use sea_orm::{DatabaseConnection, Set};
use thiserror::Error;
use tracing::warn;

pub use crate::config::RateLimitFailureMode;
use crate::error::is_unique_violation;
use crate::models::rate_limit_counter::{self, Entity as RateLimitCounter};

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("counter store error: {0}")]
    Database(#[from] DbErr),

    #[error("counter store error: {0}")]
    Store(String),
}

/// Counter value after an increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub count: u32,
    pub expires_at_ms: i64,
}

/// Shared counter storage
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, restarting its window at `now_ms` if the stored one has expired
    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: i64,
    ) -> Result<CounterState, RateLimitError>;
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the window resets; zero when allowed
    pub retry_after_seconds: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    failure_mode: RateLimitFailureMode,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, failure_mode: RateLimitFailureMode) -> Self {
        Self {
            store,
            failure_mode,
        }
    }

    pub fn failure_mode(&self) -> RateLimitFailureMode {
        self.failure_mode
    }

    pub async fn check(&self, key: &str, max_requests: u32, window_ms: u64) -> RateLimitDecision {
        self.check_at(key, max_requests, window_ms, Utc::now().timestamp_millis())
            .await
    }

    pub async fn check_at(
        &self,
        key: &str,
        max_requests: u32,
        window_ms: u64,
        now_ms: i64,
    ) -> RateLimitDecision {
        match self.store.increment(key, window_ms, now_ms).await {
            Ok(state) if state.count <= max_requests => RateLimitDecision {
                allowed: true,
                limit: max_requests,
                remaining: max_requests - state.count,
                retry_after_seconds: 0,
            },
            Ok(state) => {
                counter!("rate_limit_rejections_total").increment(1);
                RateLimitDecision {
                    allowed: false,
                    limit: max_requests,
                    remaining: 0,
                    retry_after_seconds: ceil_seconds(state.expires_at_ms - now_ms),
                }
            }
            Err(e) => match self.failure_mode {
                RateLimitFailureMode::Open => {
                    warn!(key, error = %e, "Rate limit store unavailable; admitting request (fail-open)");
                    counter!("rate_limit_store_errors_total", "mode" => "open").increment(1);
                    RateLimitDecision {
                        allowed: true,
                        limit: max_requests,
                        remaining: max_requests,
                        retry_after_seconds: 0,
                    }
                }
                RateLimitFailureMode::Closed => {
                    warn!(key, error = %e, "Rate limit store unavailable; rejecting request (fail-closed)");
                    counter!("rate_limit_store_errors_total", "mode" => "closed").increment(1);
                    RateLimitDecision {
                        allowed: false,
                        limit: max_requests,
                        remaining: 0,
                        retry_after_seconds: ceil_seconds(window_ms as i64),
                    }
                }
            },
        }
    }
}

/// Rate-limit key for balance reads of an account
pub fn balance_key(account_id: i32) -> String {
    format!("credits:balance:{account_id}")
}

fn ceil_seconds(ms: i64) -> u64 {
    let ms = ms.max(1) as u64;
    ms.div_ceil(1000)
}

/// Counter store backed by the `rate_limit_counters` table
#[derive(Clone)]
pub struct SqlCounterStore {
    db: DatabaseConnection,
}

impl SqlCounterStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn bump_live(&self, key: &str, now_ms: i64) -> Result<bool, DbErr> {
        let result = RateLimitCounter::update_many()
            .col_expr(
                rate_limit_counter::Column::Count,
                Expr::col(rate_limit_counter::Column::Count).add(1),
            )
            .filter(rate_limit_counter::Column::Key.eq(key))
            .filter(rate_limit_counter::Column::ExpiresAtMs.gt(now_ms))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn restart_expired(&self, key: &str, window_ms: i64, now_ms: i64) -> Result<bool, DbErr> {
        let result = RateLimitCounter::update_many()
            .col_expr(rate_limit_counter::Column::Count, Expr::value(1))
            .col_expr(
                rate_limit_counter::Column::WindowStartedAtMs,
                Expr::value(now_ms),
            )
            .col_expr(
                rate_limit_counter::Column::ExpiresAtMs,
                Expr::value(now_ms + window_ms),
            )
            .filter(rate_limit_counter::Column::Key.eq(key))
            .filter(rate_limit_counter::Column::ExpiresAtMs.lte(now_ms))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn read(&self, key: &str) -> Result<CounterState, RateLimitError> {
        let row = RateLimitCounter::find_by_id(key.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| RateLimitError::Store(format!("counter '{key}' vanished")))?;

        Ok(CounterState {
            count: u32::try_from(row.count).unwrap_or(u32::MAX),
            expires_at_ms: row.expires_at_ms,
        })
    }
}

#[async_trait]
impl CounterStore for SqlCounterStore {
    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: i64,
    ) -> Result<CounterState, RateLimitError> {
        let window_ms = i64::try_from(window_ms).unwrap_or(i64::MAX / 2);

        // A concurrent first request may insert the row between our update and insert
        for _ in 0..2 {
            if self.bump_live(key, now_ms).await?
                || self.restart_expired(key, window_ms, now_ms).await?
            {
                return self.read(key).await;
            }

            let row = rate_limit_counter::ActiveModel {
                key: Set(key.to_string()),
                count: Set(1),
                window_started_at_ms: Set(now_ms),
                expires_at_ms: Set(now_ms + window_ms),
            };
            match RateLimitCounter::insert(row)
                .exec_without_returning(&self.db)
                .await
            {
                Ok(_) => {
                    return Ok(CounterState {
                        count: 1,
                        expires_at_ms: now_ms + window_ms,
                    });
                }
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.read(key).await
    }
}

/// Single-process counter store
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, CounterState>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: i64,
    ) -> Result<CounterState, RateLimitError> {
        let window_ms = i64::try_from(window_ms).unwrap_or(i64::MAX / 2);
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());

        let state = counters.entry(key.to_string()).or_insert(CounterState {
            count: 0,
            expires_at_ms: now_ms + window_ms,
        });
        if state.expires_at_ms <= now_ms {
            *state = CounterState {
                count: 0,
                expires_at_ms: now_ms + window_ms,
            };
        }
        state.count = state.count.saturating_add(1);

        Ok(*state)
    }
}
