//! Outbound Event Socket Layer
//!
//! The media engine dials into this service once per call and hands the call
//! over on a dedicated control socket. This module covers:
//! - Wire framing for replies, events and commands
//! - A per-call connection that issues commands and awaits replies
//! - The accept loop that spawns one call session per connection

mod codec;
mod connection;
mod listener;

pub use listener::{OutboundServer, OverflowPolicy};

use thiserror::Error;

/// Protocol constants
pub mod constants {
    /// Reply to a synchronous command
    pub const CONTENT_TYPE_REPLY: &str = "command/reply";

    /// Reply to an `api` command
    pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";

    /// Event in plain (header block) format
    pub const CONTENT_TYPE_EVENT: &str = "text/event-plain";

    /// Sent when the call leg goes away; the socket stays open while lingering
    pub const CONTENT_TYPE_DISCONNECT: &str = "text/disconnect-notice";

    pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
    pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
    pub const HEADER_REPLY_TEXT: &str = "Reply-Text";
    pub const HEADER_EVENT_NAME: &str = "Event-Name";
    pub const HEADER_HANGUP_CAUSE: &str = "Hangup-Cause";

    /// Channel data fields delivered in the `connect` reply
    pub const HEADER_UNIQUE_ID: &str = "Unique-ID";
    pub const HEADER_DESTINATION_NUMBER: &str = "Caller-Destination-Number";
    pub const HEADER_CALLER_NUMBER: &str = "Caller-Caller-ID-Number";
    pub const HEADER_SIP_PROFILE: &str = "variable_sip_profile_name";

    /// Longest header block accepted before the terminating blank line
    pub const MAX_HEADER_BLOCK: usize = 64 * 1024;

    /// Largest `Content-Length` accepted from the peer
    pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

    /// Default I/O timeout for a single read
    pub const COMMAND_TIMEOUT_SECS: u64 = 10;
}

/// Event names the connection reacts to
pub mod events {
    pub const CHANNEL_HANGUP: &str = "CHANNEL_HANGUP";
    pub const CHANNEL_HANGUP_COMPLETE: &str = "CHANNEL_HANGUP_COMPLETE";
}

/// Event socket errors
#[derive(Error, Debug)]
pub enum EslError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection closed by peer")]
    Disconnected,

    #[error("Connection already stopped")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
