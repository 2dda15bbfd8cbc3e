//! Per-call control connection
//!
//! Commands are written in order and their replies arrive in the same order.
//! Detached commands are written without waiting; their replies are skipped
//! when they turn up ahead of the reply we are waiting for.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;

use super::codec::{EslCodec, EslCommand, EslMessage};
use super::constants::*;
use super::events;
use super::EslError;
use crate::server::call::CallControl;

/// Control connection for one call
pub struct EslConnection<S> {
    framed: Framed<S, EslCodec>,
    /// Call UUID from the handshake, empty if the engine omitted it
    uuid: String,
    io_timeout: Duration,
    /// Replies still owed for detached commands
    unacked: usize,
    /// Hangup cause seen in lingering events
    hangup_cause: Option<String>,
    events_seen: u64,
    closed: bool,
}

impl<S> EslConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, io_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, EslCodec),
            uuid: String::new(),
            io_timeout,
            unacked: 0,
            hangup_cause: None,
            events_seen: 0,
            closed: false,
        }
    }

    /// Perform the `connect` handshake and return the channel data
    pub async fn connect(
        stream: S,
        io_timeout: Duration,
    ) -> Result<(Self, HashMap<String, String>), EslError> {
        let mut conn = Self::new(stream, io_timeout);
        let reply = conn.command(EslCommand::connect()).await?;
        let channel_data = reply.into_headers();
        conn.uuid = channel_data
            .get(HEADER_UNIQUE_ID)
            .cloned()
            .unwrap_or_default();
        Ok((conn, channel_data))
    }

    #[cfg(test)]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[cfg(test)]
    pub fn hangup_cause(&self) -> Option<&str> {
        self.hangup_cause.as_deref()
    }

    #[cfg(test)]
    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn send(&mut self, cmd: EslCommand) -> Result<(), EslError> {
        if self.closed {
            return Err(EslError::Closed);
        }
        tracing::debug!("-> {}", cmd);
        self.framed.send(cmd).await
    }

    async fn recv(&mut self) -> Result<EslMessage, EslError> {
        match tokio::time::timeout(self.io_timeout, self.framed.next()).await {
            Err(_) => Err(EslError::Timeout(format!(
                "no frame within {:?}",
                self.io_timeout
            ))),
            Ok(None) => {
                self.closed = true;
                Err(EslError::Disconnected)
            }
            Ok(Some(result)) => result,
        }
    }

    /// Read until the reply to the last synchronous command arrives
    async fn await_reply(&mut self) -> Result<EslMessage, EslError> {
        loop {
            let msg = self.recv().await?;
            if msg.is_reply() {
                if self.unacked > 0 {
                    self.unacked -= 1;
                    tracing::trace!("Skipping reply to detached command: {:?}", msg.reply_text());
                    continue;
                }
                return Ok(msg);
            }

            if msg.is_event() {
                self.on_event(&msg);
            } else if msg.content_type() == Some(CONTENT_TYPE_DISCONNECT) {
                tracing::debug!("Disconnect notice received, lingering");
            } else {
                tracing::debug!("Ignoring frame with content type {:?}", msg.content_type());
            }
        }
    }

    fn on_event(&mut self, msg: &EslMessage) {
        self.events_seen += 1;
        let headers = msg.event_headers();
        let name = headers.get(HEADER_EVENT_NAME).map(String::as_str).unwrap_or("");
        match name {
            events::CHANNEL_HANGUP | events::CHANNEL_HANGUP_COMPLETE => {
                let cause = headers.get(HEADER_HANGUP_CAUSE).cloned().unwrap_or_default();
                tracing::info!("Call leg hung up: {}", cause);
                self.hangup_cause = Some(cause);
            }
            _ => tracing::debug!("Event: {}", name),
        }
    }

    /// Send a command and wait for its reply
    pub async fn command(&mut self, cmd: EslCommand) -> Result<EslMessage, EslError> {
        let line = cmd.to_string();
        self.send(cmd).await?;
        let reply = self.await_reply().await?;
        if let Some(err) = reply.error_text() {
            return Err(EslError::CommandFailed(format!("{}: {}", line, err)));
        }
        Ok(reply)
    }

    /// Send a command without waiting for its reply
    pub async fn command_detached(&mut self, cmd: EslCommand) -> Result<(), EslError> {
        self.send(cmd).await?;
        self.unacked += 1;
        Ok(())
    }

    async fn execute(&mut self, app: &str, arg: &str) -> Result<(), EslError> {
        let cmd = EslCommand::execute(&self.uuid, app, arg);
        self.command(cmd).await.map(|_| ())
    }
}

#[async_trait]
impl<S> CallControl for EslConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn subscribe_events(&mut self, call_id: &str) -> Result<(), EslError> {
        self.command(EslCommand::myevents(call_id)).await.map(|_| ())
    }

    async fn linger(&mut self) -> Result<(), EslError> {
        self.command_detached(EslCommand::linger()).await
    }

    async fn set_variable(&mut self, name: &str, value: &str) -> Result<(), EslError> {
        self.execute("set", &format!("{}={}", name, value)).await
    }

    async fn answer(&mut self) -> Result<(), EslError> {
        self.execute("answer", "").await
    }

    async fn bridge(&mut self, dial_string: &str) -> Result<(), EslError> {
        let cmd = EslCommand::execute(&self.uuid, "bridge", dial_string);
        self.command_detached(cmd).await
    }

    async fn hangup(&mut self, cause: &str) -> Result<(), EslError> {
        let cmd = EslCommand::hangup(&self.uuid, cause);
        self.command(cmd).await.map(|_| ())
    }

    async fn stop(&mut self) -> Result<(), EslError> {
        if self.closed {
            return Ok(());
        }

        let ack = match self.command(EslCommand::exit()).await {
            Ok(_) | Err(EslError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        };

        self.closed = true;
        if let Err(e) = self.framed.get_mut().shutdown().await {
            tracing::debug!("Socket shutdown: {}", e);
        }
        tracing::debug!(
            "Control socket closed after {} events, leg hangup cause: {}",
            self.events_seen,
            self.hangup_cause.as_deref().unwrap_or("none")
        );
        ack
    }
}
