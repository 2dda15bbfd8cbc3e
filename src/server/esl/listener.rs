//! Outbound connection acceptor
//!
//! One task per accepted connection; a semaphore caps how many run at once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::connection::EslConnection;
use super::EslError;
use crate::server::call::{CallSession, CallSettings};
use crate::server::config::ServerConfig;
use crate::server::routing::RoutingTable;
use crate::server::stats::ServerStats;

/// Pause after a failed accept so a persistent error does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What to do with a connection when every slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Stop accepting until a slot frees up; the kernel backlog holds the rest
    #[default]
    Queue,
    /// Accept and close immediately
    Refuse,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queue" => Ok(OverflowPolicy::Queue),
            "refuse" => Ok(OverflowPolicy::Refuse),
            other => Err(format!("expected queue or refuse, got {}", other)),
        }
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::Queue => write!(f, "queue"),
            OverflowPolicy::Refuse => write!(f, "refuse"),
        }
    }
}

/// Holds a concurrency slot and the active count for one session
struct ActiveSession {
    stats: Arc<ServerStats>,
    _permit: OwnedSemaphorePermit,
}

impl ActiveSession {
    fn new(stats: Arc<ServerStats>, permit: OwnedSemaphorePermit) -> Self {
        stats.session_started();
        Self {
            stats,
            _permit: permit,
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stats.session_finished();
    }
}

/// Accepts media engine connections and runs a call session for each
pub struct OutboundServer {
    bind_addr: String,
    max_connections: usize,
    overflow: OverflowPolicy,
    io_timeout: Duration,
    shutdown_drain: Duration,
    settings: CallSettings,
    routes: Arc<RoutingTable>,
    stats: Arc<ServerStats>,
    shutdown: CancellationToken,
}

impl OutboundServer {
    pub fn new(
        config: &ServerConfig,
        routes: Arc<RoutingTable>,
        stats: Arc<ServerStats>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bind_addr: config.listen_addr(),
            max_connections: config.max_connections,
            overflow: config.overflow_policy,
            io_timeout: config.command_timeout,
            shutdown_drain: config.shutdown_drain,
            settings: config.call_settings(),
            routes,
            stats,
            shutdown,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, EslError> {
        TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|source| EslError::Bind {
                addr: self.bind_addr.clone(),
                source,
            })
    }

    /// Bind and serve until shutdown. Only a bind failure returns an error.
    pub async fn listen(self) -> Result<(), EslError> {
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop over an already bound listener
    pub async fn serve(self, listener: TcpListener) {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.bind_addr.clone());
        tracing::info!(
            "Outbound server listening on {} (max {} calls, overflow: {})",
            local,
            self.max_connections,
            self.overflow
        );

        loop {
            let queued_permit = match self.overflow {
                OverflowPolicy::Queue => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                OverflowPolicy::Refuse => None,
            };

            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let permit = match queued_permit {
                Some(permit) => permit,
                None => match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.stats.record_refused();
                        tracing::warn!(
                            "Refusing connection from {}: {} calls in progress",
                            peer,
                            self.max_connections
                        );
                        drop(stream);
                        continue;
                    }
                },
            };

            let guard = ActiveSession::new(self.stats.clone(), permit);
            tokio::spawn(handle_connection(
                stream,
                peer,
                guard,
                self.routes.clone(),
                self.settings.clone(),
                self.io_timeout,
            ));
        }

        drop(listener);
        self.drain(&semaphore).await;
    }

    /// Wait for calls in progress to release their slots
    async fn drain(&self, semaphore: &Semaphore) {
        let active = self.stats.active();
        if active == 0 {
            tracing::info!("Outbound server stopped");
            return;
        }

        tracing::info!(
            "Waiting up to {:?} for {} calls in progress",
            self.shutdown_drain,
            active
        );
        let all = self.max_connections as u32;
        match tokio::time::timeout(self.shutdown_drain, semaphore.acquire_many(all)).await {
            Ok(_) => tracing::info!("All calls finished, outbound server stopped"),
            Err(_) => tracing::warn!(
                "Abandoning {} calls still in progress",
                self.stats.active()
            ),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    guard: ActiveSession,
    routes: Arc<RoutingTable>,
    settings: CallSettings,
    io_timeout: Duration,
) {
    let conn_id = Uuid::new_v4();
    let span = tracing::info_span!("call", %conn_id, %peer);

    async move {
        tracing::info!("New media engine connection");
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("TCP_NODELAY: {}", e);
        }

        let stats = guard.stats.clone();
        let (conn, channel_data) = match EslConnection::connect(stream, io_timeout).await {
            Ok(pair) => pair,
            Err(e) => {
                stats.record_handshake_failure();
                tracing::warn!("Handshake failed, dropping connection: {}", e);
                return;
            }
        };

        let outcome = CallSession::new(conn, &channel_data, routes, settings, stats)
            .run()
            .await;
        tracing::info!(
            "Call {} finished in {}: {:?}",
            outcome.call_id,
            outcome.final_state(),
            outcome.disposition
        );
        drop(guard);
    }
    .instrument(span)
    .await
}
