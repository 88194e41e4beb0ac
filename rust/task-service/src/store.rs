/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Connection pool lifecycle: lazy single-shot init, explicit teardown at
//! shutdown, and a bounded single reset per burst of acquisition failures.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::sync::Mutex;
use tracing::{info, warn};
use workhive_config::PostgresConfig;
use workhive_runtime::ResetGate;

use crate::error::TaskServiceError;

const RESET_THRESHOLD: u32 = 3;
const RESET_COOLDOWN_SECS: u64 = 30;

pub struct Db {
    cfg: PostgresConfig,
    pool: Mutex<Option<PgPool>>,
    gate: ResetGate,
}

fn connect_options(cfg: &PostgresConfig, password: &str) -> PgConnectOptions {
    let mut opts = PgConnectOptions::new()
        .host(&cfg.host)
        .port(cfg.port)
        .database(&cfg.database)
        .username(&cfg.user)
        .application_name("task-service")
        .options([(
            "statement_timeout",
            format!("{}s", cfg.command_timeout_secs),
        )]);
    if !password.is_empty() {
        opts = opts.password(password);
    }
    opts
}

impl Db {
    #[must_use]
    pub fn new(cfg: PostgresConfig) -> Self {
        Self {
            cfg,
            pool: Mutex::new(None),
            gate: ResetGate::new("postgres-pool", RESET_THRESHOLD, RESET_COOLDOWN_SECS),
        }
    }

    /// Return the shared pool, creating it on first use. The mutex makes the
    /// init single-shot: concurrent callers during startup all wait for one
    /// connection attempt.
    pub async fn pool(&self) -> Result<PgPool, TaskServiceError> {
        let mut guard = self.pool.lock().await;
        if let Some(ref pool) = *guard {
            return Ok(pool.clone());
        }

        let password = std::env::var(&self.cfg.password_env).unwrap_or_default();
        let pool = PgPoolOptions::new()
            .min_connections(self.cfg.min_connections)
            .max_connections(self.cfg.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(connect_options(&self.cfg, &password))
            .await
            .map_err(|e| TaskServiceError::Transient(format!("pool connect failed: {e}")))?;
        info!(
            host = %self.cfg.host,
            database = %self.cfg.database,
            max_connections = self.cfg.max_connections,
            "postgres pool connected"
        );
        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Record a failed store operation. After repeated failures the pool is
    /// torn down so the next caller reconnects; the gate allows one reset
    /// per burst.
    pub async fn note_failure(&self) {
        self.gate.record_failure();
        if self.gate.try_acquire() {
            warn!(gate = self.gate.name(), "resetting pool after repeated store failures");
            self.teardown().await;
            self.gate.release();
        }
    }

    /// Record a successful store operation, closing the reset gate.
    pub fn note_success(&self) {
        self.gate.record_success();
    }

    /// Close the pool if one exists. Used by the failure path and at
    /// shutdown, after the control loops have drained.
    pub async fn teardown(&self) {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
            info!("postgres pool closed");
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

    fn pg_config() -> PostgresConfig {
        PostgresConfig {
            host: "127.0.0.1".into(),
            port: 5432,
            database: "workhive".into(),
            user: "workhive".into(),
            password_env: "WORKHIVE_PG_PASSWORD".into(),
            min_connections: 2,
            max_connections: 10,
            command_timeout_secs: 60,
        }
    }

    #[test]
    fn test_connect_options_carry_identity() {
        let opts = connect_options(&pg_config(), "");
        assert_eq!(opts.get_host(), "127.0.0.1");
        assert_eq!(opts.get_port(), 5432);
        assert_eq!(opts.get_database(), Some("workhive"));
        assert_eq!(opts.get_username(), "workhive");
    }

    #[tokio::test]
    async fn test_teardown_without_pool_is_noop() {
        let db = Db::new(pg_config());
        db.teardown().await; // Must not panic or block
    }
}
