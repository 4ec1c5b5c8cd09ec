// src/bot/queues.rs - Typed work queues between pipeline workers

use log::{debug, error};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::bot::commands::CommandInvocation;
use crate::types::{ChatMessage, TimeoutSignal};

/// Everything that can travel on a queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    ChatCommand(CommandInvocation),
    LoggableMessage(ChatMessage),
    TimeoutSignal(TimeoutSignal),
    OutboundText(String),
    /// Terminal marker. The consumer stops when it sees this.
    Poison,
}

impl QueueMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueMessage::ChatCommand(_) => "ChatCommand",
            QueueMessage::LoggableMessage(_) => "LoggableMessage",
            QueueMessage::TimeoutSignal(_) => "TimeoutSignal",
            QueueMessage::OutboundText(_) => "OutboundText",
            QueueMessage::Poison => "Poison",
        }
    }
}

pub type QueueSender = mpsc::UnboundedSender<QueueMessage>;
pub type QueueReceiver = mpsc::UnboundedReceiver<QueueMessage>;

/// Producer side of every pipeline queue.
#[derive(Clone)]
pub struct Queues {
    pub commands: QueueSender,
    pub log: QueueSender,
    pub timeouts: QueueSender,
    pub sending: QueueSender,
    /// Carries only Poison; lets queue-less workers share the poll loop.
    pub control: QueueSender,
}

/// Consumer side, handed out one receiver per worker.
pub struct QueueReceivers {
    pub commands: QueueReceiver,
    pub log: QueueReceiver,
    pub timeouts: QueueReceiver,
    pub sending: QueueReceiver,
    pub control: QueueReceiver,
}

pub fn channels() -> (Queues, QueueReceivers) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();
    let (sending_tx, sending_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    (
        Queues {
            commands: commands_tx,
            log: log_tx,
            timeouts: timeouts_tx,
            sending: sending_tx,
            control: control_tx,
        },
        QueueReceivers {
            commands: commands_rx,
            log: log_rx,
            timeouts: timeouts_rx,
            sending: sending_rx,
            control: control_rx,
        },
    )
}

impl Queues {
    /// Broadcast Poison to every queue. Closed queues are skipped.
    pub fn poison_all(&self) {
        for (name, queue) in self.named() {
            if queue.send(QueueMessage::Poison).is_err() {
                debug!("Queue '{}' already closed, not poisoning", name);
            }
        }
    }

    /// Queue a chat reply on the send path.
    pub fn reply(&self, text: impl Into<String>) {
        push(&self.sending, "sending", QueueMessage::OutboundText(text.into()));
    }

    fn named(&self) -> [(&'static str, &QueueSender); 5] {
        [
            ("commands", &self.commands),
            ("log", &self.log),
            ("timeouts", &self.timeouts),
            ("sending", &self.sending),
            ("control", &self.control),
        ]
    }
}

/// Send, logging instead of failing when the consumer is gone.
pub fn push(queue: &QueueSender, name: &str, message: QueueMessage) {
    if let Err(e) = queue.send(message) {
        debug!("Dropped {} on closed '{}' queue", e.0.kind(), name);
    }
}

/// Result of one bounded wait on a queue.
#[derive(Debug)]
pub enum Polled {
    Message(QueueMessage),
    /// Nothing arrived within the poll interval
    Idle,
    Poisoned,
    /// Every producer is gone
    Closed,
}

pub async fn poll_queue(rx: &mut QueueReceiver, poll: Duration) -> Polled {
    match timeout(poll, rx.recv()).await {
        Ok(Some(QueueMessage::Poison)) => Polled::Poisoned,
        Ok(Some(message)) => Polled::Message(message),
        Ok(None) => Polled::Closed,
        Err(_) => Polled::Idle,
    }
}

/// Log a message that reached a worker it was never meant for.
pub fn unexpected(worker: &str, message: &QueueMessage) {
    error!("Defect: {} received unexpected {} message, dropping", worker, message.kind());
}

impl fmt::Display for QueueMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}
