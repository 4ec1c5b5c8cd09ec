// src/types/mod.rs - Core message types and the error taxonomy shared by every worker

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// A chat line or whisper as it flows to storage.
///
/// Whispers and channel messages share this shape; only routing differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    /// Numeric platform id, `None` for whispers where the protocol omits it
    pub user_id: Option<String>,
    pub text: String,
    pub subscriber: bool,
    pub timestamp: DateTime<Utc>,
    pub whisper: bool,
    /// Original protocol line, kept for audit
    pub raw: String,
}

impl ChatMessage {
    /// Deterministic id used by storage to drop replayed lines.
    ///
    /// Lines received from the server are identified by their raw text. The
    /// bot's own outbound messages have no server line yet, so sender, text
    /// and timestamp stand in for it.
    pub fn uuid(&self, bot_name: &str) -> Uuid {
        let key = if self.sender.eq_ignore_ascii_case(bot_name) {
            format!("{}{}{}{}", self.sender, self.text, self.timestamp.timestamp_millis(), self.raw)
        } else {
            self.raw.clone()
        };
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
    }
}

/// Moderation duration observed for one user.
///
/// A `length` of zero is a keepalive and is never tracked as an active timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSignal {
    pub username: String,
    pub user_id: String,
    pub length: u64,
    pub received_at: DateTime<Utc>,
}

impl TimeoutSignal {
    pub fn new(username: impl Into<String>, user_id: impl Into<String>, length: u64) -> Self {
        Self::at(username, user_id, length, Utc::now())
    }

    pub fn at(
        username: impl Into<String>,
        user_id: impl Into<String>,
        length: u64,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.into(),
            user_id: user_id.into(),
            length,
            received_at,
        }
    }

    pub fn is_keepalive(&self) -> bool {
        self.length == 0
    }
}

/// A moderation duration tracked locally until it runs out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutRecord {
    pub username: String,
    pub user_id: String,
    /// Seconds
    pub length: u64,
    /// Creation or last reset
    pub since: DateTime<Utc>,
}

impl TimeoutRecord {
    pub fn from_signal(signal: &TimeoutSignal, since: DateTime<Utc>) -> Self {
        Self {
            username: signal.username.clone(),
            user_id: signal.user_id.clone(),
            length: signal.length,
            since,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.since + chrono::Duration::seconds(self.length.min(u32::MAX as u64) as i64)
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

/// One stored chat line as returned by log queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedLine {
    pub username: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for LoggedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.username,
            self.text
        )
    }
}

/// Fixed reply vocabulary for command-path failures. Users never see raw error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    InternalError,
    NoMessages,
    QueryTimeout,
    NoSuchUser,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Response::InternalError => "internal error Deadlole",
            Response::NoMessages => "no messages found PEEPERS",
            Response::QueryTimeout => "query timeout, try again SLUDGE",
            Response::NoSuchUser => "no such user found PEEPERS",
        };
        f.write_str(text)
    }
}

/// Error taxonomy for the pipeline.
#[derive(Debug, Error)]
pub enum BotError {
    /// Connector read or write failed. Fatal to the current pipeline instance.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connector was closed, either by the peer or by shutdown.
    #[error("connection closed")]
    ConnectionClosed,

    /// Storage, status API or report publisher failed for a single request.
    #[error("{collaborator} failure: {message} (code {code:?})")]
    Collaborator {
        collaborator: &'static str,
        message: String,
        code: Option<i64>,
    },

    /// Workers did not all report ready in time.
    #[error("pipeline not healthy after {0}s")]
    HealthTimeout(u64),

    /// Workers did not all stop in time. Fatal to the whole process.
    #[error("workers still running {0}s after poison")]
    ShutdownTimeout(u64),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BotError {
    pub fn storage(message: impl Into<String>, code: Option<i64>) -> Self {
        BotError::Collaborator {
            collaborator: "storage",
            message: message.into(),
            code,
        }
    }

    pub fn status_api(message: impl Into<String>, code: Option<i64>) -> Self {
        BotError::Collaborator {
            collaborator: "status api",
            message: message.into(),
            code,
        }
    }

    pub fn publisher(message: impl Into<String>) -> Self {
        BotError::Collaborator {
            collaborator: "report publisher",
            message: message.into(),
            code: None,
        }
    }

    /// Whether this error must tear the whole process down instead of just the pipeline.
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, BotError::ShutdownTimeout(_))
    }
}

/// Parse the protocol's millisecond timestamp tag, falling back to `fallback`.
pub fn timestamp_from_millis(millis: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    millis
        .and_then(|m| m.parse::<i64>().ok())
        .and_then(|m| Utc.timestamp_millis_opt(m).single())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: &str, raw: &str) -> ChatMessage {
        ChatMessage {
            sender: sender.to_string(),
            user_id: Some("1".to_string()),
            text: "hello".to_string(),
            subscriber: false,
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            whisper: false,
            raw: raw.to_string(),
        }
    }

    #[test]
    fn test_uuid_is_deterministic_for_server_lines() {
        let a = message("alice", ":alice!alice PRIVMSG #chan :hello");
        let b = message("alice", ":alice!alice PRIVMSG #chan :hello");
        assert_eq!(a.uuid("nambot"), b.uuid("nambot"));

        let c = message("alice", ":alice!alice PRIVMSG #chan :hello again");
        assert_ne!(a.uuid("nambot"), c.uuid("nambot"));
    }

    #[test]
    fn test_uuid_for_own_messages_uses_timestamp() {
        let a = message("NamBot", "");
        let mut b = a.clone();
        b.timestamp = b.timestamp + chrono::Duration::seconds(1);
        assert_ne!(a.uuid("nambot"), b.uuid("nambot"));
    }

    #[test]
    fn test_timestamp_from_millis() {
        let fallback = Utc::now();
        let parsed = timestamp_from_millis(Some("1700000000000"), fallback);
        assert_eq!(parsed.timestamp(), 1_700_000_000);
        assert_eq!(timestamp_from_millis(Some("abc"), fallback), fallback);
        assert_eq!(timestamp_from_millis(None, fallback), fallback);
    }

    #[test]
    fn test_timeout_record_expiry_is_strict() {
        let since = Utc.timestamp_opt(1_000, 0).unwrap();
        let signal = TimeoutSignal::at("alice", "uid1", 600, since);
        let record = TimeoutRecord::from_signal(&signal, since);

        assert!(!record.has_expired(since + chrono::Duration::seconds(599)));
        assert!(!record.has_expired(since + chrono::Duration::seconds(600)));
        assert!(record.has_expired(since + chrono::Duration::seconds(601)));
    }

    #[test]
    fn test_logged_line_format() {
        let line = LoggedLine {
            username: "kroom".to_string(),
            text: "hello".to_string(),
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
        };
        assert_eq!(line.to_string(), "[1970-01-01 00:00:00] kroom: hello");
    }

    #[test]
    fn test_response_vocabulary() {
        assert_eq!(Response::InternalError.to_string(), "internal error Deadlole");
        assert_eq!(Response::NoMessages.to_string(), "no messages found PEEPERS");
    }

    #[test]
    fn test_only_shutdown_timeout_is_process_fatal() {
        assert!(BotError::ShutdownTimeout(60).is_process_fatal());
        assert!(!BotError::HealthTimeout(10).is_process_fatal());
        assert!(!BotError::Transport("reset".to_string()).is_process_fatal());
    }
}
