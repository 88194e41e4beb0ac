/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub workhive: WorkhiveConfig,
    pub postgres: PostgresConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub sweeps: SweepsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct WorkhiveConfig {
    pub env: String,
    pub version: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Name of the environment variable holding the password.
    #[serde(default = "default_pg_password_env")]
    pub password_env: String,
    #[serde(default = "default_pg_min")]
    pub min_connections: u32,
    #[serde(default = "default_pg_max")]
    pub max_connections: u32,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_pg_password_env() -> String {
    "WORKHIVE_PG_PASSWORD".to_string()
}
fn default_pg_min() -> u32 {
    2
}
fn default_pg_max() -> u32 {
    10
}
fn default_command_timeout() -> u64 {
    60
}

#[derive(Deserialize, Clone, Debug)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Name of the environment variable holding the API key. An empty or
    /// unset value disables authentication (dev mode).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_api_port() -> u16 {
    8080
}
fn default_api_key_env() -> String {
    "WORKHIVE_API_KEY".to_string()
}
fn default_max_body_bytes() -> usize {
    1_048_576
}

#[derive(Deserialize, Clone, Debug)]
pub struct RateLimitsConfig {
    #[serde(default = "default_rl_window")]
    pub window_secs: u64,
    #[serde(default = "default_rl_max")]
    pub max_requests: u32,
    #[serde(default = "default_rl_store")]
    pub max_store_size: usize,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rl_window(),
            max_requests: default_rl_max(),
            max_store_size: default_rl_store(),
        }
    }
}

fn default_rl_window() -> u64 {
    60
}
fn default_rl_max() -> u32 {
    100
}
fn default_rl_store() -> usize {
    10_000
}

#[derive(Deserialize, Clone, Debug)]
pub struct TasksConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_agent: u32,
    #[serde(default = "default_task_timeout")]
    pub default_timeout_minutes: u32,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_agent: default_max_concurrent(),
            default_timeout_minutes: default_task_timeout(),
            default_max_retries: default_max_retries(),
        }
    }
}

fn default_max_concurrent() -> u32 {
    3
}
fn default_task_timeout() -> u32 {
    120
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Deserialize, Clone, Debug)]
pub struct SweepsConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold_minutes: u32,
    #[serde(default = "default_stuck_interval")]
    pub stuck_interval_secs: u64,
    #[serde(default = "default_idempotency_gc_interval")]
    pub idempotency_gc_interval_secs: u64,
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_hours: u32,
    #[serde(default = "default_soft_delete_gc_interval")]
    pub soft_delete_gc_interval_secs: u64,
    #[serde(default = "default_soft_delete_retention")]
    pub soft_delete_retention_days: u32,
}

impl Default for SweepsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            offline_threshold_minutes: default_offline_threshold(),
            stuck_interval_secs: default_stuck_interval(),
            idempotency_gc_interval_secs: default_idempotency_gc_interval(),
            idempotency_ttl_hours: default_idempotency_ttl(),
            soft_delete_gc_interval_secs: default_soft_delete_gc_interval(),
            soft_delete_retention_days: default_soft_delete_retention(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    60
}
fn default_offline_threshold() -> u32 {
    5
}
fn default_stuck_interval() -> u64 {
    60
}
fn default_idempotency_gc_interval() -> u64 {
    3600
}
fn default_idempotency_ttl() -> u32 {
    24
}
fn default_soft_delete_gc_interval() -> u64 {
    86_400
}
fn default_soft_delete_retention() -> u32 {
    30
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            sample_rate: default_sample_rate(),
            log_level: default_log_level(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}
fn default_sample_rate() -> f64 {
    1.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the file path in the `WORKHIVE_CONFIG` env
    /// var (default `config.toml`), with `WORKHIVE_`-prefixed environment
    /// variable overrides.
    ///
    /// # Errors
    ///
    /// Returns `config::ConfigError` if the config file is missing,
    /// malformed, or required fields are absent.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("WORKHIVE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&config_path))
            .add_source(
                config::Environment::with_prefix("WORKHIVE")
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Check invariants that serde defaults cannot express. Returns a list
    /// of human-readable errors; an empty list means the config is usable.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.postgres.min_connections > self.postgres.max_connections {
            errors.push("postgres.min_connections cannot exceed postgres.max_connections".into());
        }
        if self.postgres.command_timeout_secs == 0 {
            errors.push("postgres.command_timeout_secs must be at least 1".into());
        }
        if self.postgres.command_timeout_secs > 300 {
            errors.push("postgres.command_timeout_secs must not exceed 300".into());
        }
        if self.tasks.max_concurrent_per_agent == 0 {
            errors.push("tasks.max_concurrent_per_agent must be at least 1".into());
        }
        if self.tasks.default_timeout_minutes == 0 {
            errors.push("tasks.default_timeout_minutes must be at least 1".into());
        }
        if self.rate_limits.max_requests == 0 {
            errors.push("rate_limits.max_requests must be at least 1".into());
        }
        if self.rate_limits.max_store_size < 100 {
            errors.push("rate_limits.max_store_size must be at least 100".into());
        }
        if self.sweeps.idempotency_ttl_hours == 0 {
            errors.push("sweeps.idempotency_ttl_hours must be at least 1".into());
        }

        errors
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Helper: a minimal TOML config satisfying all required fields.
    fn valid_toml() -> &'static str {
        r#"
[workhive]
env = "test"
version = "0.3.0"

[postgres]
host = "127.0.0.1"
port = 5432
database = "workhive"
user = "workhive"

[api]
port = 8080
"#
    }

    fn parse(toml_str: &str) -> Config {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml_str, config::FileFormat::Toml))
            .build()
            .unwrap();
        settings.try_deserialize().unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = parse(valid_toml());
        assert_eq!(cfg.postgres.min_connections, 2);
        assert_eq!(cfg.postgres.max_connections, 10);
        assert_eq!(cfg.postgres.command_timeout_secs, 60);
        assert_eq!(cfg.rate_limits.window_secs, 60, "default window is 60s");
        assert_eq!(cfg.rate_limits.max_requests, 100);
        assert_eq!(cfg.rate_limits.max_store_size, 10_000);
        assert_eq!(cfg.tasks.max_concurrent_per_agent, 3);
        assert_eq!(cfg.tasks.default_timeout_minutes, 120);
        assert_eq!(cfg.tasks.default_max_retries, 3);
        assert_eq!(cfg.sweeps.heartbeat_interval_secs, 60);
        assert_eq!(cfg.sweeps.offline_threshold_minutes, 5);
        assert_eq!(cfg.sweeps.stuck_interval_secs, 60);
        assert_eq!(cfg.sweeps.idempotency_ttl_hours, 24);
        assert_eq!(cfg.sweeps.soft_delete_retention_days, 30);
        assert!(!cfg.telemetry.enabled, "telemetry disabled by default");
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn test_valid_config_passes_validation() {
        let cfg = parse(valid_toml());
        let errors = cfg.validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn test_pool_bounds_validated() {
        let mut cfg = parse(valid_toml());
        cfg.postgres.min_connections = 20;
        cfg.postgres.max_connections = 5;
        let errors = cfg.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("min_connections"));
    }

    #[test]
    fn test_zero_cap_rejected() {
        let mut cfg = parse(valid_toml());
        cfg.tasks.max_concurrent_per_agent = 0;
        assert!(!cfg.validate().is_empty());
    }

    #[test]
    fn test_command_timeout_range() {
        let mut cfg = parse(valid_toml());
        cfg.postgres.command_timeout_secs = 0;
        assert!(!cfg.validate().is_empty());
        cfg.postgres.command_timeout_secs = 301;
        assert!(!cfg.validate().is_empty());
        cfg.postgres.command_timeout_secs = 300;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_section_overrides() {
        let toml_str = format!(
            "{}\n[rate_limits]\nwindow_secs = 10\nmax_requests = 5\n\n[tasks]\nmax_concurrent_per_agent = 1\n",
            valid_toml()
        );
        let cfg = parse(&toml_str);
        assert_eq!(cfg.rate_limits.window_secs, 10);
        assert_eq!(cfg.rate_limits.max_requests, 5);
        assert_eq!(cfg.tasks.max_concurrent_per_agent, 1);
        // Unspecified fields in an overridden section still default
        assert_eq!(cfg.rate_limits.max_store_size, 10_000);
        assert_eq!(cfg.tasks.default_timeout_minutes, 120);
    }

    #[test]
    fn test_telemetry_config_deserialize_from_toml() {
        let toml_str = r#"
enabled = true
otlp_endpoint = "http://jaeger:4317"
sample_rate = 0.5
log_level = "debug"
"#;
        let cfg: TelemetryConfig = toml::from_str(toml_str).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.otlp_endpoint, "http://jaeger:4317");
        assert!((cfg.sample_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.log_level, "debug");
    }
}
