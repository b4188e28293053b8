//! Streaming chat client for the Sydney/ChatHub backend.
//!
//! Provides the full turn pipeline:
//! - Session negotiation over HTTP (conversation credentials)
//! - Persistent WebSocket session with handshake + heartbeat
//! - Conversation history windowing with overflow spillover
//! - Stream reconstruction from out-of-order partial frames
//! - Three-way cancellation race (overall timeout, first-byte timeout, abort)
//! - Pluggable per-user conversation persistence

pub mod chathub;
pub mod client;
pub mod exchange;
pub mod history;
pub mod negotiate;
pub mod protocol;
pub mod reconstruct;
pub mod store;

pub use chathub::{ChatHub, ChatHubConfig};
pub use client::{ClientConfig, SydneyClient, TurnOptions, TurnOutcome};
pub use history::GroupContext;
pub use negotiate::SessionCredentials;
pub use protocol::{MessageType, ToneStyle};
pub use reconstruct::{AssembledReply, Reconstruction};
pub use store::{ConversationRecord, ConversationStore, MemoryStore, Role, StoredMessage};

/// Errors surfaced by a conversation turn.
///
/// Apart from `Negotiation` and `Handshake`, these are produced by the
/// exchange itself; any accumulated partial text takes priority over an
/// error, so an error here always means zero usable text was received.
#[derive(Debug, thiserror::Error)]
pub enum SydneyError {
    #[error("conversation create failed: {0}")]
    Negotiation(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("network error: {0}")]
    Network(String),

    /// Overall deadline elapsed with no text received.
    #[error("timed out waiting for a response")]
    Timeout,

    /// No first byte within the first-byte deadline.
    #[error("server did not start responding in time")]
    Unresponsive,

    /// Externally aborted before any text arrived.
    #[error("request aborted")]
    Aborted,

    /// The service rejected the credentials mid-turn; the caller should
    /// force re-negotiation before retrying.
    #[error("invalid session: {0}")]
    SessionInvalid(String),

    #[error("conversation exceeded the maximum context length")]
    ContextTooLong,

    #[error("request throttled by the service")]
    RateLimited,

    /// Catch-all for service-reported failures, carrying the diagnostic
    /// fields from the terminal frame.
    #[error("service error: {value}: {detail}")]
    Service { value: String, detail: String },

    #[error("conversation store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, SydneyError>;
