// src/bot/sender.rs - Outbound chat: blacklist filtering, PRIVMSG framing, sent-message logging

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::bot::queues::{poll_queue, push, unexpected, Polled, QueueMessage, QueueReceiver, QueueSender};
use crate::bot::state::SharedState;
use crate::bot::PipelineService;
use crate::dao::{BlacklistEntry, BlacklistKind};
use crate::platforms::Connector;
use crate::types::{BotError, ChatMessage};

/// Sent instead of a reply that contains a blacklisted word or text.
pub const REFUSAL: &str = "that message contained a blacklisted phrase monkaS";

const MASK: &str = "***";

/// Compiled outbound blacklist.
#[derive(Debug, Default)]
pub struct OutboundFilter {
    words: Option<Regex>,
    texts: Vec<String>,
    replace: Option<Regex>,
}

impl OutboundFilter {
    pub fn from_entries(entries: &[BlacklistEntry]) -> Self {
        let patterns = |kind: BlacklistKind| -> Vec<String> {
            entries
                .iter()
                .filter(|e| e.kind == kind && !e.pattern.is_empty())
                .map(|e| regex::escape(&e.pattern))
                .collect()
        };

        let words = patterns(BlacklistKind::Word);
        let replace = patterns(BlacklistKind::Replace);
        let texts = entries
            .iter()
            .filter(|e| e.kind == BlacklistKind::Text && !e.pattern.is_empty())
            .map(|e| e.pattern.to_lowercase())
            .collect();

        Self {
            words: compile(&words, true),
            texts,
            replace: compile(&replace, false),
        }
    }

    pub fn len(&self) -> usize {
        self.texts.len() + usize::from(self.words.is_some()) + usize::from(self.replace.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text to actually send.
    pub fn apply(&self, text: &str) -> String {
        let lowered = text.to_lowercase();
        let word_hit = self.words.as_ref().is_some_and(|re| re.is_match(text));
        let text_hit = self.texts.iter().any(|t| lowered.contains(t.as_str()));
        if word_hit || text_hit {
            warn!("Refusing outbound message containing a blacklisted phrase");
            return REFUSAL.to_string();
        }

        match &self.replace {
            Some(re) => re.replace_all(text, MASK).into_owned(),
            None => text.to_string(),
        }
    }
}

fn compile(patterns: &[String], whole_words: bool) -> Option<Regex> {
    if patterns.is_empty() {
        return None;
    }
    let alternation = patterns.join("|");
    let source = if whole_words {
        format!(r"\b(?:{})\b", alternation)
    } else {
        alternation
    };
    match RegexBuilder::new(&source).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            error!("Failed to compile outbound blacklist: {}", e);
            None
        }
    }
}

/// Worker draining the sending queue onto the connector.
pub struct SenderService {
    rx: QueueReceiver,
    log: QueueSender,
    connector: Arc<dyn Connector>,
    state: Arc<SharedState>,
    poll: Duration,
}

impl SenderService {
    pub fn new(
        rx: QueueReceiver,
        log: QueueSender,
        connector: Arc<dyn Connector>,
        state: Arc<SharedState>,
        poll: Duration,
    ) -> Self {
        Self {
            rx,
            log,
            connector,
            state,
            poll,
        }
    }

    async fn send(&self, text: String) -> Result<(), BotError> {
        let text = self.state.outbound_filter.read().await.apply(&text);
        let line = format!("PRIVMSG #{} :{}", self.state.channel, text);

        self.connector.send_line(&line).await?;
        self.state.count_sent();
        debug!("Sent to #{}: {}", self.state.channel, text);

        let message = ChatMessage {
            sender: self.state.bot_name.clone(),
            user_id: None,
            text,
            subscriber: false,
            timestamp: Utc::now(),
            whisper: false,
            raw: line,
        };
        push(&self.log, "log", QueueMessage::LoggableMessage(message));
        Ok(())
    }
}

#[async_trait]
impl PipelineService for SenderService {
    fn name(&self) -> &'static str {
        "sender"
    }

    async fn run(mut self: Box<Self>, ready: oneshot::Sender<()>) -> Result<(), BotError> {
        info!("{} started", self.name());
        let _ = ready.send(());

        loop {
            match poll_queue(&mut self.rx, self.poll).await {
                Polled::Poisoned => {
                    debug!("{} poisoned", self.name());
                    break;
                }
                Polled::Closed => break,
                Polled::Idle => {}
                Polled::Message(QueueMessage::OutboundText(text)) => {
                    if let Err(e) = self.send(text).await {
                        error!("Failed to send message to #{}: {}", self.state.channel, e);
                        return Err(e);
                    }
                }
                Polled::Message(other) => unexpected(self.name(), &other),
            }
        }

        info!("{} stopped", self.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::queues::channels;
    use crate::platforms::memory::MemoryConnector;

    fn entry(pattern: &str, kind: BlacklistKind) -> BlacklistEntry {
        BlacklistEntry {
            pattern: pattern.to_string(),
            kind,
        }
    }

    #[test]
    fn test_filter_semantics() {
        let filter = OutboundFilter::from_entries(&[
            entry("bad", BlacklistKind::Word),
            entry("evil.com", BlacklistKind::Text),
            entry("darn", BlacklistKind::Replace),
        ]);

        assert_eq!(filter.apply("this is BAD"), REFUSAL);
        // whole words only
        assert_eq!(filter.apply("badge collector"), "badge collector");
        assert_eq!(filter.apply("visit EVIL.COM/x"), REFUSAL);
        assert_eq!(filter.apply("darn it, Darn"), "*** it, ***");
        assert_eq!(filter.apply("all fine"), "all fine");
        assert!(OutboundFilter::default().is_empty());
    }

    #[test]
    fn test_patterns_are_literal() {
        let filter = OutboundFilter::from_entries(&[entry("a.c", BlacklistKind::Replace)]);
        assert_eq!(filter.apply("abc a.c"), "abc ***");
    }

    #[tokio::test]
    async fn test_sender_frames_counts_and_logs() {
        let connector = Arc::new(MemoryConnector::new());
        let state = Arc::new(SharedState::with_identity("nambot", "forsen", "kroom", ""));
        *state.outbound_filter.write().await =
            OutboundFilter::from_entries(&[entry("darn", BlacklistKind::Replace)]);
        let (queues, mut rx) = channels();

        let service = Box::new(SenderService::new(
            rx.sending,
            queues.log.clone(),
            connector.clone(),
            state.clone(),
            Duration::from_millis(20),
        ));
        let (ready_tx, _ready_rx) = oneshot::channel();
        let handle = tokio::spawn(service.run(ready_tx));

        queues.reply("hello darn chat");
        queues.sending.send(QueueMessage::Poison).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(
            connector.sent_lines().await,
            vec!["PRIVMSG #forsen :hello *** chat".to_string()]
        );
        assert_eq!(state.messages_sent(), 1);
        match rx.log.try_recv() {
            Ok(QueueMessage::LoggableMessage(message)) => {
                assert_eq!(message.sender, "nambot");
                assert_eq!(message.text, "hello *** chat");
            }
            other => panic!("expected logged message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_failure_stops_sender_with_error() {
        let connector = Arc::new(MemoryConnector::new());
        connector.set_fail_writes(true);
        let state = Arc::new(SharedState::with_identity("nambot", "forsen", "kroom", ""));
        let (queues, rx) = channels();

        let service = Box::new(SenderService::new(
            rx.sending,
            queues.log.clone(),
            connector,
            state,
            Duration::from_millis(20),
        ));
        let (ready_tx, _ready_rx) = oneshot::channel();
        let handle = tokio::spawn(service.run(ready_tx));
        queues.reply("hi");

        assert!(matches!(handle.await.unwrap(), Err(BotError::Transport(_))));
    }
}
