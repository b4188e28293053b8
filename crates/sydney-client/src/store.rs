//! Per-user conversation persistence.
//!
//! The store itself is an external collaborator (Redis, a file, ...); this
//! module only defines the opaque get/set contract and the record shape,
//! plus an in-memory implementation used by tests and single-process bots.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::negotiate::SessionCredentials;
use crate::Result;

/// Key prefix for conversation records.
pub const RECORD_KEY_PREFIX: &str = "bing:conversations:";

/// Store key for a user's conversation record.
pub fn record_key(user: &str) -> String {
    format!("{RECORD_KEY_PREFIX}{user}")
}

/// Message author role as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Bot,
}

/// A persisted message. Immutable once created; `parent_message_id` links
/// messages into a forest whose paths are conversation threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub parent_message_id: Option<String>,
    pub role: Role,
    pub text: String,
}

/// Per-user persisted conversation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Identity of the human this record belongs to.
    pub sender: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Completed turns; incremented by the calling layer.
    pub turn_count: u32,
    pub messages: Vec<StoredMessage>,
    /// Root of the next turn's thread walk.
    pub parent_message_id: Option<String>,
    /// Credentials reused across turns while valid.
    pub credentials: Option<SessionCredentials>,
    /// Turn index inside the current credentials' session.
    pub invocation_id: u64,
    /// User-turn budget discovered from throttling hints, kept per user
    /// rather than in shared config.
    pub user_turn_budget: Option<u32>,
}

impl ConversationRecord {
    pub fn new(sender: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            sender: sender.into(),
            created_at: now,
            updated_at: now,
            turn_count: 0,
            messages: Vec::new(),
            parent_message_id: None,
            credentials: None,
            invocation_id: 0,
            user_turn_budget: None,
        }
    }
}

/// Opaque get/set persistence, keyed per user.
///
/// Concurrent turns for the same key are not serialized here; callers own
/// the record for the duration of their read-modify-write cycle.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ConversationRecord>>;
    async fn set(&self, key: &str, record: &ConversationRecord) -> Result<()>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, ConversationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<ConversationRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, record: &ConversationRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(key.to_string(), record.clone());
        Ok(())
    }
}
