//! Server-side code for the ESL call router
//!
//! This module contains the call handling engine and its surroundings:
//! - Outbound event socket listener and wire protocol
//! - Per-call session state machine
//! - Destination number routing
//! - Health endpoint (axum)

pub mod call;
pub mod config;
pub mod esl;
pub mod health;
pub mod routing;
pub mod stats;

pub use config::ServerConfig;

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use health::{HealthState, ListenerInfo};
use stats::ServerStats;

/// Run the outbound listener (and the health endpoint) until shutdown
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let routes = Arc::new(config.load_routes()?);
    match &config.routes_file {
        Some(path) => tracing::info!("Loaded {} routes from {}", routes.len(), path),
        None => tracing::info!("Using built-in routing table ({} routes)", routes.len()),
    }
    if routes.is_empty() {
        tracing::warn!("Routing table is empty, every call will be rejected");
    }
    for route in routes.routes() {
        tracing::debug!(
            "Route {} ({}): {} -> {} via {}",
            route.name,
            route.context,
            route.numbers.join(", "),
            route.targets.join(", "),
            route.domain
        );
    }

    let stats = Arc::new(ServerStats::new());
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    if config.health_port != 0 {
        let db = match &config.database_url {
            Some(url) => match health::init_pool(url) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    tracing::warn!("Database probe disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        let state = Arc::new(HealthState {
            stats: stats.clone(),
            listener: ListenerInfo::from_config(&config),
            routes: routes.len(),
            freeswitch: config.freeswitch.clone(),
            db,
            started_at: Utc::now(),
        });

        let port = config.health_port;
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = health::run_health_server(port, state, token).await {
                tracing::error!("Health endpoint error: {}", e);
            }
        });
    } else {
        tracing::info!("Health endpoint disabled");
    }

    tracing::info!("Starting outbound ESL server on {}...", config.listen_addr());
    tracing::info!("Waiting for media engine connections...");

    let server = esl::OutboundServer::new(&config, routes, stats, shutdown.clone());
    let result = server.listen().await;

    // Stops the health endpoint too
    shutdown.cancel();
    result?;
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, shutting down");
                    shutdown.cancel();
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received, shutting down"),
            _ = term.recv() => tracing::info!("SIGTERM received, shutting down"),
            _ = shutdown.cancelled() => return,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received, shutting down"),
            _ = shutdown.cancelled() => return,
        }
    }

    shutdown.cancel();
}
