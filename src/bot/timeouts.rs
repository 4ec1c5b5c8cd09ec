// src/bot/timeouts.rs - Moderation timeout lifecycle: track while offline, publish on expiry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::bot::queues::{poll_queue, unexpected, Polled, QueueMessage, QueueReceiver};
use crate::bot::state::SharedState;
use crate::bot::PipelineService;
use crate::dao::Storage;
use crate::types::{BotError, TimeoutRecord, TimeoutSignal};

/// What a signal did to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Length zero, nothing changed
    Keepalive,
    /// Channel is live; write straight to storage
    RecordNow,
    Created,
    Reset { previous: u64 },
    /// Same length delivered again
    Unchanged,
    /// Late delivery of a moderation action already published
    AlreadyEmitted,
}

/// A moderation action: who, and when the server issued it.
type ActionKey = (String, DateTime<Utc>);

/// Active timeouts keyed by username, plus every moderation action already published.
#[derive(Debug, Default)]
pub struct TimeoutTracker {
    active: HashMap<String, TimeoutRecord>,
    /// Actions folded into each active record
    pending: HashMap<String, Vec<DateTime<Utc>>>,
    emitted: HashSet<ActionKey>,
}

impl TimeoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, signal: &TimeoutSignal, live: bool, now: DateTime<Utc>) -> Observation {
        if signal.is_keepalive() {
            return Observation::Keepalive;
        }

        if let Some(record) = self.active.get_mut(&signal.username) {
            if record.length == signal.length {
                return Observation::Unchanged;
            }
            let previous = record.length;
            record.length = signal.length;
            record.since = now;
            self.pending
                .entry(signal.username.clone())
                .or_default()
                .push(signal.received_at);
            return Observation::Reset { previous };
        }

        if self
            .emitted
            .contains(&(signal.username.clone(), signal.received_at))
        {
            return Observation::AlreadyEmitted;
        }

        if live {
            return Observation::RecordNow;
        }

        self.active
            .insert(signal.username.clone(), TimeoutRecord::from_signal(signal, now));
        self.pending
            .insert(signal.username.clone(), vec![signal.received_at]);
        Observation::Created
    }

    /// Remove every expired record and return those not published before.
    /// Each moderation action is published at most once per process.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<TimeoutRecord> {
        let expired: Vec<String> = self
            .active
            .values()
            .filter(|record| record.has_expired(now))
            .map(|record| record.username.clone())
            .collect();

        let mut publish = Vec::new();
        for username in expired {
            let Some(record) = self.active.remove(&username) else {
                continue;
            };
            let actions = self.pending.remove(&username).unwrap_or_default();
            let mut fresh = false;
            for issued_at in actions {
                fresh |= self.emitted.insert((username.clone(), issued_at));
            }
            if fresh {
                publish.push(record);
            } else {
                debug!("Timeout for {} already published, dropping", record.username);
            }
        }
        publish
    }

    pub fn active(&self, username: &str) -> Option<&TimeoutRecord> {
        self.active.get(username)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn was_emitted(&self, username: &str) -> bool {
        self.emitted.iter().any(|(name, _)| name == username)
    }
}

/// Worker consuming the timeout queue.
pub struct TimeoutLoggerService {
    rx: QueueReceiver,
    storage: Arc<dyn Storage>,
    state: Arc<SharedState>,
    poll: Duration,
}

impl TimeoutLoggerService {
    pub fn new(rx: QueueReceiver, storage: Arc<dyn Storage>, state: Arc<SharedState>, poll: Duration) -> Self {
        Self {
            rx,
            storage,
            state,
            poll,
        }
    }

    async fn handle(&self, signal: TimeoutSignal) {
        if !signal.is_keepalive() {
            self.state.count_timeout();
        }

        let now = Utc::now();
        let observation = self
            .state
            .timeout_tracker
            .lock()
            .await
            .observe(&signal, self.state.is_online(), now);

        match observation {
            Observation::RecordNow => {
                if let Err(e) = self.storage.record_timeout(&signal).await {
                    error!("Failed to record timeout for {}: {}", signal.username, e);
                }
            }
            Observation::Created => {
                info!("Tracking {}s timeout for {}", signal.length, signal.username);
            }
            Observation::Reset { previous } => {
                info!(
                    "Set {}'s {}s timeout to {}s",
                    signal.username, previous, signal.length
                );
            }
            Observation::AlreadyEmitted => {
                debug!("Ignoring late delivery of {}'s published timeout", signal.username);
            }
            Observation::Keepalive | Observation::Unchanged => {}
        }
    }

    async fn sweep(&self) {
        let expired = self.state.timeout_tracker.lock().await.sweep(Utc::now());
        for record in expired {
            info!("{}'s {}s timeout expired", record.username, record.length);
            if let Err(e) = self.storage.record_expired_timeout(&record).await {
                error!("Failed to record expired timeout for {}: {}", record.username, e);
            }
        }
    }
}

#[async_trait]
impl PipelineService for TimeoutLoggerService {
    fn name(&self) -> &'static str {
        "timeout-logger"
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
                Polled::Message(QueueMessage::TimeoutSignal(signal)) => self.handle(signal).await,
                Polled::Message(other) => unexpected(self.name(), &other),
            }
            self.sweep().await;
        }

        info!("{} stopped", self.name());
        Ok(())
    }
}
