// src/bot/router.rs - Classify decoded lines and fan them out onto the work queues

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::bot::commands::{Command, CommandInvocation};
use crate::bot::queues::{push, QueueMessage, Queues};
use crate::bot::shutdown::{StopReason, StopSignal};
use crate::bot::state::{SharedState, AUTOBAN_SENDER};
use crate::bot::PipelineService;
use crate::platforms::Connector;
use crate::protocol::{decode, DecodedEvent};
use crate::types::{timestamp_from_millis, BotError, ChatMessage, TimeoutSignal};

/// Ban length at or above which a ban counts as permanent, in seconds.
pub const PERMABAN_LENGTH: u64 = 121_059_319;

const ACTION_MARKER: char = '\u{1}';

/// Whisper directives from the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Shutdown,
    Send(String),
    Restart,
}

impl Directive {
    pub fn parse(text: &str) -> Option<Directive> {
        let text = text.trim();
        match text.split_once(' ') {
            Some(("/send", rest)) if !rest.trim().is_empty() => Some(Directive::Send(rest.trim().to_string())),
            None if text == "/shutdown" => Some(Directive::Shutdown),
            None if text == "/restart" => Some(Directive::Restart),
            _ => None,
        }
    }
}

/// What one inbound line asks the pipeline to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Reply on the connector right away, bypassing the queues
    Pong(String),
    Log(ChatMessage),
    Command(CommandInvocation),
    Timeout(TimeoutSignal),
    Permaban,
    Directive(Directive),
    Reconnect,
}

/// Classify one decoded line. `admin` is the operator identity for whisper directives.
pub fn route(event: &DecodedEvent, raw: &str, admin: &str, now: DateTime<Utc>) -> Vec<Action> {
    match event.command_name() {
        "PING" => {
            let origin = if event.params.is_empty() {
                "tmi.twitch.tv"
            } else {
                event.params.as_str()
            };
            vec![Action::Pong(format!("PONG :{}", origin))]
        }
        "PRIVMSG" => route_chat(event, raw, now),
        "WHISPER" => route_whisper(event, raw, admin, now),
        "CLEARCHAT" => route_clearchat(event, now),
        "RECONNECT" => {
            info!("Server requested reconnect");
            vec![Action::Reconnect]
        }
        "USERSTATE" | "GLOBALUSERSTATE" | "ROOMSTATE" | "CAP" => {
            debug!("State ack: {}", event.command);
            Vec::new()
        }
        name if name.len() == 3 && name.bytes().all(|b| b.is_ascii_digit()) => {
            debug!("Numeric reply {}: {}", name, event.params);
            Vec::new()
        }
        "" => {
            warn!("Could not classify line: {}", raw);
            Vec::new()
        }
        _ => {
            trace!("Ignoring {}", event.command_name());
            Vec::new()
        }
    }
}

fn chat_message(event: &DecodedEvent, raw: &str, whisper: bool, now: DateTime<Utc>) -> ChatMessage {
    let sender = if event.name().is_empty() {
        event.tag("display-name").unwrap_or_default().to_lowercase()
    } else {
        event.name().to_lowercase()
    };

    ChatMessage {
        sender,
        user_id: event.tag("user-id").filter(|id| !id.is_empty()).map(str::to_string),
        text: normalize_action(&event.params),
        subscriber: event.tag("subscriber") == Some("1"),
        timestamp: timestamp_from_millis(event.tag("tmi-sent-ts"), now),
        whisper,
        raw: raw.to_string(),
    }
}

/// `\x01ACTION waves\x01` becomes `/me waves`.
pub fn normalize_action(text: &str) -> String {
    let marker = format!("{}ACTION ", ACTION_MARKER);
    if !text.starts_with(&marker) {
        return text.to_string();
    }
    let stripped: String = text.chars().filter(|c| *c != ACTION_MARKER).collect();
    stripped.replacen("ACTION", "/me", 1)
}

fn route_chat(event: &DecodedEvent, raw: &str, now: DateTime<Utc>) -> Vec<Action> {
    let message = chat_message(event, raw, false, now);
    let keepalive = TimeoutSignal::at(
        message.sender.clone(),
        message.user_id.clone().unwrap_or_default(),
        0,
        now,
    );

    let mut actions = Vec::with_capacity(3);
    if let Some(invocation) = CommandInvocation::parse(&message) {
        actions.push(Action::Command(invocation));
    }
    actions.push(Action::Log(message));
    actions.push(Action::Timeout(keepalive));
    actions
}

fn route_whisper(event: &DecodedEvent, raw: &str, admin: &str, now: DateTime<Utc>) -> Vec<Action> {
    let message = chat_message(event, raw, true, now);
    info!("Whisper from {}: {}", message.sender, message.text);

    let directive = if message.sender.eq_ignore_ascii_case(admin) {
        Directive::parse(&message.text)
    } else {
        None
    };

    let mut actions = vec![Action::Log(message)];
    if let Some(directive) = directive {
        actions.push(Action::Directive(directive));
    }
    actions
}

fn route_clearchat(event: &DecodedEvent, now: DateTime<Utc>) -> Vec<Action> {
    let user_id = match event.tag("target-user-id") {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            info!("Chat was cleared");
            return Vec::new();
        }
    };
    let username = event.params.trim().to_lowercase();

    // No duration at all means a permanent ban.
    let length = match event.tag("ban-duration") {
        None => PERMABAN_LENGTH,
        Some(raw) => match raw.parse::<u64>() {
            Ok(length) => length,
            Err(_) => {
                warn!("Dropping CLEARCHAT for {} with malformed ban-duration {:?}", username, raw);
                return Vec::new();
            }
        },
    };
    let issued_at = timestamp_from_millis(event.tag("tmi-sent-ts"), now);

    let mut actions = Vec::new();
    if length >= PERMABAN_LENGTH {
        info!("{} was permanently banned", username);
        actions.push(Action::Command(CommandInvocation {
            sender: AUTOBAN_SENDER.to_string(),
            command: Some(Command::AddDisabled),
            arguments: username.clone(),
            received_at: now,
        }));
        actions.push(Action::Permaban);
    } else {
        info!("{} timed out for {}s", username, length);
    }
    actions.push(Action::Timeout(TimeoutSignal::at(username, user_id, length, issued_at)));
    actions
}

/// Sole reader of the connector.
pub struct ListenerService {
    connector: Arc<dyn Connector>,
    queues: Queues,
    state: Arc<SharedState>,
    stop: StopSignal,
}

impl ListenerService {
    pub fn new(connector: Arc<dyn Connector>, queues: Queues, state: Arc<SharedState>, stop: StopSignal) -> Self {
        Self {
            connector,
            queues,
            state,
            stop,
        }
    }

    async fn dispatch(&self, action: Action) -> Result<(), BotError> {
        match action {
            Action::Pong(line) => {
                self.state.mark_ping(Utc::now());
                self.connector.send_line(&line).await?;
                debug!("Answered PING");
            }
            Action::Log(message) => {
                if !message.whisper {
                    self.state.mark_message(Utc::now());
                }
                push(&self.queues.log, "log", QueueMessage::LoggableMessage(message));
            }
            Action::Command(invocation) => {
                push(&self.queues.commands, "commands", QueueMessage::ChatCommand(invocation));
            }
            Action::Timeout(signal) => {
                push(&self.queues.timeouts, "timeouts", QueueMessage::TimeoutSignal(signal));
            }
            Action::Permaban => self.state.count_permaban(),
            Action::Directive(Directive::Shutdown) => {
                info!("Operator requested shutdown");
                self.state.request_shutdown();
                self.stop.request(StopReason::OperatorStop);
            }
            Action::Directive(Directive::Restart) => {
                info!("Operator requested restart");
                self.stop.request(StopReason::Reconnect);
            }
            Action::Directive(Directive::Send(text)) => self.queues.reply(text),
            Action::Reconnect => self.stop.request(StopReason::Reconnect),
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineService for ListenerService {
    fn name(&self) -> &'static str {
        "listener"
    }

    async fn run(self: Box<Self>, ready: oneshot::Sender<()>) -> Result<(), BotError> {
        info!("{} started on {}", self.name(), self.connector.name());
        let _ = ready.send(());

        loop {
            let line = match self.connector.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("Connector read failed: {}", e);
                    return Err(e);
                }
            };

            trace!("< {}", line);
            let event = decode(&line);
            for action in route(&event, &line, &self.state.admin, Utc::now()) {
                if let Err(e) = self.dispatch(action).await {
                    error!("Connector write failed: {}", e);
                    return Err(e);
                }
            }
        }

        // Closed under us; a no-op when the pipeline is already stopping.
        self.stop.request(StopReason::Reconnect);
        info!("{} stopped", self.name());
        Ok(())
    }
}
