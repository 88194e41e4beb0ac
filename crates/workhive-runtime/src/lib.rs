/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Shared runtime utilities for Workhive services.
//!
//! Provides common building blocks:
//! - [`ResetGate`]: failure tracking that allows one recovery action per burst
//! - [`shutdown_signal`]: graceful SIGINT/SIGTERM handler
//! - [`with_db_retries`]: bounded exponential backoff for store calls

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Reset gate
// ---------------------------------------------------------------------------

/// Thread-safe gate for expensive recovery actions (e.g. resetting a
/// connection pool).
///
/// Failures accumulate in a counter. Once `threshold` consecutive failures
/// have been recorded, [`ResetGate::try_acquire`] hands the reset to exactly
/// one caller per `cooldown_secs` window; everyone else is told to keep
/// waiting. A recorded success closes the gate again.
pub struct ResetGate {
    name: String,
    failure_count: AtomicU32,
    last_reset_epoch_ms: AtomicU64,
    reset_in_flight: AtomicBool,
    threshold: u32,
    cooldown_secs: u64,
}

impl ResetGate {
    /// Create a new reset gate.
    ///
    /// - `name`: used in log messages
    /// - `threshold`: consecutive failures before a reset is allowed
    /// - `cooldown_secs`: minimum seconds between two resets
    #[must_use]
    pub fn new(name: &str, threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            failure_count: AtomicU32::new(0),
            last_reset_epoch_ms: AtomicU64::new(0),
            reset_in_flight: AtomicBool::new(false),
            threshold,
            cooldown_secs,
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count == self.threshold {
            warn!(gate = %self.name, failures = count, "failure threshold reached");
        }
    }

    /// Record a successful operation — clears the failure counter.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    /// Returns `true` if this caller should perform the recovery action.
    ///
    /// At most one caller per cooldown window wins the compare-exchange;
    /// concurrent callers and callers inside the cooldown are refused, so a
    /// burst of failures produces a single reset.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        if self.failure_count.load(Ordering::Relaxed) < self.threshold {
            return false;
        }
        let now_ms = now_epoch_ms();
        let last_ms = self.last_reset_epoch_ms.load(Ordering::Relaxed);
        if last_ms != 0 && (now_ms.saturating_sub(last_ms)) / 1000 < self.cooldown_secs {
            return false;
        }
        if self
            .reset_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.last_reset_epoch_ms.store(now_ms, Ordering::Relaxed);
        true
    }

    /// Mark the recovery action finished, re-arming the gate for the next
    /// burst. The failure counter restarts from zero.
    pub fn release(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        self.reset_in_flight.store(false, Ordering::Release);
    }

    /// Name of this gate (for log messages).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Bounded retry with exponential backoff
// ---------------------------------------------------------------------------

/// Base delay for [`with_db_retries`] backoff: base * 2^attempt.
pub const BACKOFF_BASE_MS: u64 = 1000;

/// Compute the backoff delay for a zero-based attempt number.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt)))
}

/// Run `f` up to `max_attempts` times, sleeping an exponentially growing
/// delay between attempts. Intended for transient store errors; permanent
/// errors should not be routed through this helper.
///
/// # Errors
///
/// Returns the last error once all attempts are exhausted.
pub async fn with_db_retries<T, E, F, Fut>(
    op: &str,
    max_attempts: u32,
    mut f: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < max_attempts => {
                let delay = backoff_delay(attempt);
                warn!(
                    op = op,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(op = op, max_attempts, error = %e, "store operation failed, retries exhausted");
                return Err(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Wait for SIGINT (ctrl-c) or SIGTERM, then return.
///
/// Use with `tokio::select!` or `axum::serve(...).with_graceful_shutdown(...)`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .unwrap_or_else(|e| error!(error = %e, "ctrl-c handler failed"));
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_gate_refuses_below_threshold() {
        let gate = ResetGate::new("pool", 3, 30);
        gate.record_failure();
        gate.record_failure();
        assert!(!gate.try_acquire(), "2 failures should not open the gate");
    }

    #[test]
    fn test_reset_gate_single_winner_per_burst() {
        let gate = ResetGate::new("pool", 3, 0); // 0-second cooldown
        gate.record_failure();
        gate.record_failure();
        gate.record_failure();
        assert!(gate.try_acquire(), "threshold reached, first caller wins");
        assert!(
            !gate.try_acquire(),
            "reset in flight, second caller refused"
        );
    }

    #[test]
    fn test_reset_gate_rearms_after_release() {
        let gate = ResetGate::new("pool", 2, 0);
        gate.record_failure();
        gate.record_failure();
        assert!(gate.try_acquire());
        gate.release();
        assert!(
            !gate.try_acquire(),
            "release cleared the failure counter"
        );
        gate.record_failure();
        gate.record_failure();
        assert!(gate.try_acquire(), "new burst opens the gate again");
    }

    #[test]
    fn test_reset_gate_success_clears_failures() {
        let gate = ResetGate::new("pool", 2, 0);
        gate.record_failure();
        gate.record_success();
        gate.record_failure();
        assert!(!gate.try_acquire(), "success reset the counter");
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        // base * 2^attempt: 1000, 2000, 4000, 8000
        assert_eq!(backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3), Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_db_retries_recovers() {
        let mut calls = 0;
        let result: Result<u32, String> = with_db_retries("test_op", 3, || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3, "two failures then a success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_db_retries_exhausts() {
        let result: Result<u32, String> =
            with_db_retries("test_op", 2, || async { Err("down".to_string()) }).await;
        assert_eq!(result.unwrap_err(), "down");
    }
}
