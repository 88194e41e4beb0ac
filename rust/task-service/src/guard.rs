/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! At-most-once guards: keyed idempotency records in the store and the
//! in-process fixed-window rate limiter.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use sqlx::PgConnection;
use tracing::{debug, warn};
use workhive_config::RateLimitsConfig;

use crate::error::TaskServiceError;

// ---------------------------------------------------------------------------
// Idempotency records
// ---------------------------------------------------------------------------

/// Look up a cached response for `key`. Returns the recorded response when
/// the key exists and is inside the TTL. No purging happens here: expired
/// keys are removed by the background GC only, so a valid key can never be
/// dropped between insertion and a replay.
pub async fn check_idempotency(
    conn: &mut PgConnection,
    key: Option<&str>,
    ttl_hours: u32,
) -> Result<Option<serde_json::Value>, TaskServiceError> {
    let Some(key) = key else {
        return Ok(None);
    };

    let row: Option<(serde_json::Value,)> = sqlx::query_as(
        "SELECT response FROM idempotency_keys
         WHERE key = $1 AND created_at > NOW() - make_interval(hours => $2)",
    )
    .bind(key)
    .bind(i32::try_from(ttl_hours).unwrap_or(24))
    .fetch_optional(conn)
    .await?;

    if row.is_some() {
        debug!(idempotency_key = %key, "idempotency hit, replaying recorded response");
    }
    Ok(row.map(|(v,)| v))
}

/// Record the response for `key` in the same transaction as the mutation it
/// guards. A concurrent insert of the same key wins silently; the recorded
/// response is whatever committed first.
pub async fn store_idempotency(
    conn: &mut PgConnection,
    key: Option<&str>,
    response: &serde_json::Value,
) -> Result<(), TaskServiceError> {
    let Some(key) = key else {
        return Ok(());
    };

    sqlx::query(
        "INSERT INTO idempotency_keys (key, response, created_at)
         VALUES ($1, $2, NOW())
         ON CONFLICT (key) DO NOTHING",
    )
    .bind(key)
    .bind(response)
    .execute(conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Fixed-window rate limiter
// ---------------------------------------------------------------------------

struct WindowCounter {
    window_start: Instant,
    count: u32,
}

/// In-process fixed-window counter keyed by caller identity. The map is the
/// only mutable state shared outside the store; it is never persisted and
/// rebuilds from empty on restart.
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    max_store_size: usize,
    store: Mutex<HashMap<String, WindowCounter>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(cfg: &RateLimitsConfig) -> Self {
        Self {
            window: Duration::from_secs(cfg.window_secs),
            max_requests: cfg.max_requests,
            max_store_size: cfg.max_store_size,
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request for `key`.
    ///
    /// # Errors
    ///
    /// Returns `rate-limited` once the key's count inside the current window
    /// exceeds the configured maximum.
    pub fn check(&self, key: &str) -> Result<(), TaskServiceError> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), TaskServiceError> {
        let mut store = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !store.contains_key(key) && store.len() >= self.max_store_size {
            let window = self.window;
            store.retain(|_, c| now.duration_since(c.window_start) < window);
            if store.len() >= self.max_store_size {
                Self::evict_oldest(&mut store);
            }
        }

        let counter = store.entry(key.to_string()).or_insert(WindowCounter {
            window_start: now,
            count: 0,
        });

        if now.duration_since(counter.window_start) >= self.window {
            counter.window_start = now;
            counter.count = 0;
        }

        counter.count += 1;
        if counter.count > self.max_requests {
            return Err(TaskServiceError::RateLimited(format!(
                "max {} requests per {}s window",
                self.max_requests,
                self.window.as_secs()
            )));
        }
        Ok(())
    }

    /// Drop the oldest half of the keyspace, by window start.
    fn evict_oldest(store: &mut HashMap<String, WindowCounter>) {
        let mut keys: Vec<(String, Instant)> = store
            .iter()
            .map(|(k, c)| (k.clone(), c.window_start))
            .collect();
        keys.sort_by_key(|(_, start)| *start);
        let to_remove = keys.len() / 2;
        for (key, _) in keys.into_iter().take(to_remove) {
            store.remove(&key);
        }
        warn!(removed = to_remove, "rate limiter keyspace over bound, evicted oldest entries");
    }

    /// Remaining admissions for `key` in the current window.
    #[must_use]
    pub fn remaining(&self, key: &str) -> u32 {
        let store = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match store.get(key) {
            Some(c) if Instant::now().duration_since(c.window_start) < self.window => {
                self.max_requests.saturating_sub(c.count)
            }
            _ => self.max_requests,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_secs: u64, max_store: usize) -> RateLimiter {
        RateLimiter::new(&RateLimitsConfig {
            window_secs,
            max_requests,
            max_store_size: max_store,
        })
    }

    #[test]
    fn test_allows_within_limit() {
        let rl = limiter(3, 60, 100);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(rl.check_at("10.0.0.1", now).is_ok());
        }
    }

    #[test]
    fn test_rejects_over_limit() {
        let rl = limiter(3, 60, 100);
        let now = Instant::now();
        for _ in 0..3 {
            rl.check_at("10.0.0.1", now).unwrap();
        }
        let err = rl.check_at("10.0.0.1", now).unwrap_err();
        assert_eq!(err.code(), "rate-limited");
    }

    #[test]
    fn test_keys_are_independent() {
        let rl = limiter(1, 60, 100);
        let now = Instant::now();
        rl.check_at("a", now).unwrap();
        assert!(rl.check_at("b", now).is_ok(), "separate key, separate window");
        assert!(rl.check_at("a", now).is_err());
    }

    #[test]
    fn test_window_rotation_resets_count() {
        let rl = limiter(1, 60, 100);
        let now = Instant::now();
        rl.check_at("a", now).unwrap();
        assert!(rl.check_at("a", now).is_err());
        let later = now + Duration::from_secs(61);
        assert!(
            rl.check_at("a", later).is_ok(),
            "count restarts once the window rotates"
        );
    }

    #[test]
    fn test_remaining_counts_down() {
        let rl = limiter(5, 60, 100);
        assert_eq!(rl.remaining("a"), 5);
        rl.check("a").unwrap();
        rl.check("a").unwrap();
        assert_eq!(rl.remaining("a"), 3);
    }

    #[test]
    fn test_store_bound_evicts_expired_first() {
        let rl = limiter(10, 60, 100);
        let start = Instant::now();
        for i in 0..100 {
            rl.check_at(&format!("key-{i}"), start).unwrap();
        }
        // All 100 windows are expired by now + 61s; a new key triggers
        // compaction rather than eviction of live entries.
        let later = start + Duration::from_secs(61);
        assert!(rl.check_at("fresh", later).is_ok());
        let store = rl.store.lock().unwrap();
        assert_eq!(store.len(), 1, "expired windows were compacted away");
    }

    #[test]
    fn test_store_bound_evicts_oldest_live_entries() {
        let rl = limiter(10, 600, 4);
        let start = Instant::now();
        for i in 0..4u64 {
            rl.check_at(&format!("key-{i}"), start + Duration::from_secs(i))
                .unwrap();
        }
        // Nothing is expired; the oldest half must go to make room.
        rl.check_at("fresh", start + Duration::from_secs(10)).unwrap();
        let store = rl.store.lock().unwrap();
        assert!(store.len() <= 3 + 1);
        assert!(!store.contains_key("key-0"), "oldest entry evicted");
        assert!(store.contains_key("fresh"));
    }
}
