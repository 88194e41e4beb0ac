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

#![allow(clippy::module_name_repetitions)]

mod api;
mod dispatcher;
mod error;
mod guard;
mod lifecycle;
mod model;
mod store;
mod sweeps;
mod validate;

use std::net::SocketAddr;
use std::process;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderName, Method};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};
use workhive_config::Config;

use crate::error::TaskServiceError;
use crate::guard::RateLimiter;
use crate::store::Db;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const SERVICE_NAME: &str = "task-service";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const API_KEY_HEADER: &str = "x-workhive-api-key";

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    pub api_key: Option<String>,
    pub rate_limiter: RateLimiter,
    pub start_time: Instant,
    // Atomic counters surfaced via /health
    pub tasks_claimed: AtomicU64,
    pub tasks_reclaimed: AtomicU64,
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("fatal: failed to load config: {e}");
        process::exit(1);
    });

    let config_errors = config.validate();
    if !config_errors.is_empty() {
        for err in &config_errors {
            eprintln!("fatal: invalid config: {err}");
        }
        process::exit(1);
    }

    let _telemetry_guard = workhive_telemetry::init_telemetry(SERVICE_NAME, &config.telemetry)
        .unwrap_or_else(|e| {
            eprintln!("fatal: telemetry init failed: {e}");
            process::exit(1);
        });

    info!(
        service = SERVICE_NAME,
        version = SERVICE_VERSION,
        env = %config.workhive.env,
        "starting"
    );

    let state = init_state(config);

    // Warm-up attempt; a failure is not fatal since init is lazy.
    if let Err(e) = state.db.pool().await {
        warn!(error = %e, "database not reachable at startup, connecting lazily");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_handles = sweeps::spawn_all(Arc::clone(&state), &shutdown_rx);

    let port = state.config.api.port;
    let app = build_router(Arc::clone(&state));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %addr, "failed to bind");
            process::exit(1);
        }
    };
    info!(addr = %addr, "listening");

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(workhive_runtime::shutdown_signal())
    .await
    {
        error!(error = %e, "server error");
        process::exit(1);
    }

    // Drain the control loops before tearing the pool down.
    let _ = shutdown_tx.send(true);
    for handle in sweep_handles {
        let _ = handle.await;
    }
    state.db.teardown().await;

    info!("shutdown complete");
}

fn init_state(config: Config) -> Arc<AppState> {
    let config = Arc::new(config);

    let api_key = std::env::var(&config.api.api_key_env)
        .ok()
        .filter(|k| !k.is_empty());
    if api_key.is_none() {
        if config.workhive.env == "dev" || config.workhive.env == "local" {
            warn!("no API key configured — mutations are unauthenticated (dev mode)");
        } else {
            warn!(
                env = %config.workhive.env,
                key_env = %config.api.api_key_env,
                "no API key configured in a non-dev environment — mutations are unauthenticated"
            );
        }
    }

    let rate_limiter = RateLimiter::new(&config.rate_limits);

    Arc::new(AppState {
        db: Db::new(config.postgres.clone()),
        config: Arc::clone(&config),
        api_key,
        rate_limiter,
        start_time: Instant::now(),
        tasks_claimed: AtomicU64::new(0),
        tasks_reclaimed: AtomicU64::new(0),
    })
}

// ---------------------------------------------------------------------------
// Router construction
// ---------------------------------------------------------------------------

fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.api.cors_origins, &state.config.workhive.env);
    let max_body = state.config.api.max_body_bytes;

    let v1 = Router::new()
        .route("/projects", get(api::list_projects).post(api::create_project))
        .route(
            "/projects/:project_id",
            get(api::get_project).delete(api::delete_project),
        )
        .route("/projects/:project_id/progress", get(api::project_progress))
        .route("/projects/:project_id/tasks", get(api::project_tasks))
        .route("/projects/:project_id/breakdown", post(api::breakdown_project))
        .route("/projects/:project_id/restore", post(api::restore_project))
        .route("/tasks", get(api::list_tasks).post(api::create_task))
        .route("/tasks/available", get(api::available_tasks))
        .route(
            "/tasks/available-for/:name",
            get(api::available_tasks_for_agent),
        )
        .route(
            "/tasks/:task_id",
            get(api::get_task)
                .patch(api::update_task)
                .delete(api::delete_task),
        )
        .route("/tasks/:task_id/claim", post(api::claim_task))
        .route("/tasks/:task_id/start", post(api::start_task))
        .route("/tasks/:task_id/submit", post(api::submit_task))
        .route("/tasks/:task_id/release", post(api::release_task))
        .route("/tasks/:task_id/retry", post(api::retry_task))
        .route("/tasks/:task_id/review", post(api::review_task))
        .route("/tasks/:task_id/cancel", post(api::cancel_task))
        .route("/tasks/:task_id/restore", post(api::restore_task))
        .route("/agents", get(api::list_agents))
        .route("/agents/register", post(api::register_agent))
        .route(
            "/agents/:name",
            get(api::get_agent).delete(api::unregister_agent),
        )
        .route("/agents/:name/heartbeat", post(api::heartbeat))
        .route("/agents/:name/channels", get(api::agent_channels))
        .route(
            "/agent-channels",
            post(api::bind_channel).delete(api::unbind_channel),
        )
        .route("/channels/:channel_id/agents", get(api::channel_agents))
        .route("/dashboard/stats", get(api::dashboard_stats));

    Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health))
        .nest("/v1", v1)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Admission control for every route, keyed by API key when present, else
/// client IP. The limiter state is process-local and rebuilt on restart.
async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Result<Response, TaskServiceError> {
    let key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(
            || format!("ip:{}", addr.ip()),
            |k| format!("key:{k}"),
        );

    state.rate_limiter.check(&key)?;
    let remaining = state.rate_limiter.remaining(&key);

    let mut resp = next.run(req).await;
    if let Ok(value) = header::HeaderValue::from_str(&remaining.to_string()) {
        resp.headers_mut().insert("x-ratelimit-remaining", value);
    }
    Ok(resp)
}

fn build_cors_layer(origins: &[String], env: &str) -> CorsLayer {
    let api_key_header = HeaderName::from_static(API_KEY_HEADER);
    let allowed_headers = [header::CONTENT_TYPE, api_key_header];
    let allowed_methods = [
        Method::GET,
        Method::POST,
        Method::PATCH,
        Method::DELETE,
    ];

    if origins.is_empty() {
        if env != "dev" && env != "local" {
            error!("api.cors_origins is empty in non-dev environment — refusing to start");
            process::exit(1);
        }
        warn!("api.cors_origins is empty — defaulting to http://localhost:3000 for dev");
        let localhost = "http://localhost:3000"
            .parse::<header::HeaderValue>()
            .unwrap_or_else(|_| header::HeaderValue::from_static("http://localhost:3000"));
        return CorsLayer::new()
            .allow_origin(AllowOrigin::list([localhost]))
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers);
    }

    let parsed: Vec<header::HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(allowed_methods)
        .allow_headers(allowed_headers)
}
