// src/dao/mod.rs - Contracts for the collaborators the pipeline calls out to
//
// Every call may fail on its own. "Not found" is an empty value, never an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::types::{BotError, ChatMessage, LoggedLine, TimeoutRecord, TimeoutSignal};

pub mod helix;
pub mod memory;
pub mod publisher;

/// How an outbound blacklist entry is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlacklistKind {
    /// Whole-word match refuses the message
    Word,
    /// Substring match refuses the message
    Text,
    /// Matches are masked
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub pattern: String,
    pub kind: BlacklistKind,
}

/// Chat log storage and search.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn record_message(&self, message: &ChatMessage, id: Uuid) -> Result<(), BotError>;
    async fn record_whisper(&self, message: &ChatMessage, id: Uuid) -> Result<(), BotError>;

    /// Timeout observed while the channel is live.
    async fn record_timeout(&self, signal: &TimeoutSignal) -> Result<(), BotError>;
    /// Offline timeout that ran its full course.
    async fn record_expired_timeout(&self, record: &TimeoutRecord) -> Result<(), BotError>;

    async fn message_count(&self, username: &str) -> Result<u64, BotError>;
    async fn mod_list(&self) -> Result<Vec<String>, BotError>;
    /// `(main, alt)` pairs
    async fn alts_list(&self) -> Result<Vec<(String, String)>, BotError>;
    async fn blacklist(&self) -> Result<Vec<BlacklistEntry>, BotError>;

    async fn disabled_list(&self) -> Result<HashSet<String>, BotError>;
    async fn add_disabled(&self, from: &str, username: &str) -> Result<(), BotError>;
    async fn remove_disabled(&self, username: &str) -> Result<(), BotError>;

    async fn alternate_names(&self, username: &str) -> Result<Vec<String>, BotError>;
    async fn add_alt(&self, main: &str, alt: &str) -> Result<(), BotError>;

    /// Per-user command overrides, keyed by command name.
    async fn personal_permissions(&self, username: &str) -> Result<HashMap<String, bool>, BotError>;
    async fn set_command_permission(&self, username: &str, command: &str, enabled: bool) -> Result<(), BotError>;

    /// Total seconds spent in finished timeouts.
    async fn timeout_amount(&self, username: &str) -> Result<u64, BotError>;
    async fn top_timeouts(&self, limit: usize) -> Result<Vec<(String, u64)>, BotError>;

    async fn first_message(&self, username: &str) -> Result<Option<LoggedLine>, BotError>;
    async fn last_message(&self, username: &str) -> Result<Option<LoggedLine>, BotError>;
    async fn last_seen(&self, username: &str) -> Result<Option<DateTime<Utc>>, BotError>;
    /// `year` restricts to one calendar year when present.
    async fn random_quote(&self, username: &str, year: Option<i32>) -> Result<Option<LoggedLine>, BotError>;
    async fn random_search(&self, username: &str, phrase: &str) -> Result<Option<LoggedLine>, BotError>;
    async fn first_occurrence(&self, phrase: &str) -> Result<Option<LoggedLine>, BotError>;
    async fn search(&self, phrase: &str) -> Result<u64, BotError>;
    async fn search_user(&self, username: &str, phrase: &str) -> Result<u64, BotError>;
    /// Most recent `limit` lines, oldest first.
    async fn logs(&self, username: &str, limit: usize) -> Result<Vec<LoggedLine>, BotError>;
}

/// Third-party status REST API.
#[async_trait]
pub trait StatusApi: Send + Sync {
    async fn acquire_token(&self) -> Result<(), BotError>;
    async fn resolve_user_id(&self, login: &str) -> Result<Option<String>, BotError>;
    async fn is_live(&self, channel: &str) -> Result<bool, BotError>;
    /// Every channel `login` follows, all pages. `None` if the user does not exist.
    async fn follow_list(&self, login: &str) -> Result<Option<Vec<String>>, BotError>;
}

/// Publishes generated text reports under a name.
#[async_trait]
pub trait ReportPublisher: Send + Sync {
    async fn publish(&self, name: &str, content: &str) -> Result<(), BotError>;
}
