//! Health endpoint
//!
//! Read-only diagnostics for load balancers and operators: listener counters,
//! plus optional reachability checks of the media engine control port and the
//! relational store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::config::{ProbeTarget, ServerConfig};
use super::esl::OverflowPolicy;
use super::stats::{ServerStats, StatsSnapshot};

/// Upper bound on a single probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state of the health endpoint
pub struct HealthState {
    pub stats: Arc<ServerStats>,
    pub listener: ListenerInfo,
    pub routes: usize,
    pub freeswitch: Option<ProbeTarget>,
    pub db: Option<PgPool>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    pub bind: String,
    pub max_connections: usize,
    pub overflow_policy: OverflowPolicy,
}

impl ListenerInfo {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            bind: config.listen_addr(),
            max_connections: config.max_connections,
            overflow_policy: config.overflow_policy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub target: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub listener: ListenerInfo,
    pub calls: StatsSnapshot,
    pub routes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freeswitch: Option<ProbeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ProbeResult>,
}

/// Lazily connected pool used only for the health probe
pub fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(PROBE_TIMEOUT)
        .connect_lazy(database_url)
}

/// Create the health router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the health router until shutdown
pub async fn run_health_server(
    port: u16,
    state: Arc<HealthState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Health endpoint on http://0.0.0.0:{}/api/health", port);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health_check(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<HealthReport>) {
    let freeswitch = match &state.freeswitch {
        Some(target) => Some(probe_tcp(target).await),
        None => None,
    };
    let database = match &state.db {
        Some(pool) => Some(probe_db(pool).await),
        None => None,
    };

    let healthy = freeswitch.iter().chain(database.iter()).all(|probe| probe.ok);

    let report = HealthReport {
        status: if healthy { "ok" } else { "degraded" },
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds().max(0),
        listener: state.listener.clone(),
        calls: state.stats.snapshot(),
        routes: state.routes,
        freeswitch,
        database,
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn probe_tcp(target: &ProbeTarget) -> ProbeResult {
    let started = Instant::now();
    let result =
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((target.host.as_str(), target.port)))
            .await;

    let error = match result {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("no connection within {:?}", PROBE_TIMEOUT)),
    };
    if let Some(e) = &error {
        tracing::warn!("Media engine probe {} failed: {}", target, e);
    }

    ProbeResult {
        ok: error.is_none(),
        target: target.to_string(),
        latency_ms: started.elapsed().as_millis() as u64,
        error,
    }
}

async fn probe_db(pool: &PgPool) -> ProbeResult {
    let started = Instant::now();
    let result = tokio::time::timeout(PROBE_TIMEOUT, sqlx::query("SELECT 1").execute(pool)).await;

    let error = match result {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("no answer within {:?}", PROBE_TIMEOUT)),
    };
    if let Some(e) = &error {
        tracing::warn!("Database probe failed: {}", e);
    }

    ProbeResult {
        ok: error.is_none(),
        // The URL may carry credentials
        target: "database".to_string(),
        latency_ms: started.elapsed().as_millis() as u64,
        error,
    }
}
