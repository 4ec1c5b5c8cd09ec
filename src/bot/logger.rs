// src/bot/logger.rs - Persist chat lines and whispers

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::bot::queues::{poll_queue, unexpected, Polled, QueueMessage, QueueReceiver};
use crate::bot::shutdown::{StopReason, StopSignal};
use crate::bot::state::SharedState;
use crate::bot::PipelineService;
use crate::dao::Storage;
use crate::types::{BotError, ChatMessage};

/// A healthy channel never goes this long without a line to log.
pub const IDLE_RECONNECT: Duration = Duration::from_secs(600);

pub struct MessageLoggerService {
    rx: QueueReceiver,
    storage: Arc<dyn Storage>,
    state: Arc<SharedState>,
    stop: StopSignal,
    poll: Duration,
    idle_limit: Duration,
}

impl MessageLoggerService {
    pub fn new(
        rx: QueueReceiver,
        storage: Arc<dyn Storage>,
        state: Arc<SharedState>,
        stop: StopSignal,
        poll: Duration,
    ) -> Self {
        Self {
            rx,
            storage,
            state,
            stop,
            poll,
            idle_limit: IDLE_RECONNECT,
        }
    }

    pub fn with_idle_limit(mut self, idle_limit: Duration) -> Self {
        self.idle_limit = idle_limit;
        self
    }

    async fn record(&self, message: ChatMessage) {
        let id = message.uuid(&self.state.bot_name);
        let result = if message.whisper {
            self.storage.record_whisper(&message, id).await
        } else {
            self.storage.record_message(&message, id).await
        };

        match result {
            Ok(()) => {
                self.state.count_logged();
                debug!("Logged {} from {}", id, message.sender);
            }
            Err(e) => error!("Failed to log message from {}: {}", message.sender, e),
        }
    }
}

#[async_trait]
impl PipelineService for MessageLoggerService {
    fn name(&self) -> &'static str {
        "message-logger"
    }

    async fn run(mut self: Box<Self>, ready: oneshot::Sender<()>) -> Result<(), BotError> {
        info!("{} started", self.name());
        let _ = ready.send(());
        let mut last_message = Instant::now();

        loop {
            match poll_queue(&mut self.rx, self.poll).await {
                Polled::Poisoned => {
                    debug!("{} poisoned", self.name());
                    break;
                }
                Polled::Closed => break,
                Polled::Idle => {
                    if last_message.elapsed() >= self.idle_limit {
                        warn!(
                            "No messages to log for {}s, requesting reconnect",
                            self.idle_limit.as_secs()
                        );
                        self.stop.request(StopReason::Reconnect);
                        last_message = Instant::now();
                    }
                }
                Polled::Message(QueueMessage::LoggableMessage(message)) => {
                    last_message = Instant::now();
                    self.record(message).await;
                }
                Polled::Message(other) => unexpected(self.name(), &other),
            }
        }

        info!("{} stopped", self.name());
        Ok(())
    }
}
