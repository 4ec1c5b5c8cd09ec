// src/bot/online.rs - Poll stream status and watch connection liveness

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::bot::queues::{poll_queue, unexpected, Polled, QueueReceiver};
use crate::bot::shutdown::{StopReason, StopSignal};
use crate::bot::state::SharedState;
use crate::bot::PipelineService;
use crate::dao::StatusApi;
use crate::types::BotError;

/// Staleness thresholds for the connection watchdog.
#[derive(Debug, Clone, Copy)]
pub struct Staleness {
    pub ping: ChronoDuration,
    pub message: ChronoDuration,
}

impl Staleness {
    pub fn from_minutes(ping: i64, message: i64) -> Self {
        Self {
            ping: ChronoDuration::minutes(ping),
            message: ChronoDuration::minutes(message),
        }
    }
}

/// Worker that keeps the live flag current. Listens on the control queue
/// only so it stops with everyone else.
pub struct OnlineCheckerService {
    control: QueueReceiver,
    status: Arc<dyn StatusApi>,
    state: Arc<SharedState>,
    stop: StopSignal,
    interval: Duration,
    staleness: Staleness,
    has_token: bool,
}

impl OnlineCheckerService {
    pub fn new(
        control: QueueReceiver,
        status: Arc<dyn StatusApi>,
        state: Arc<SharedState>,
        stop: StopSignal,
        interval: Duration,
        staleness: Staleness,
    ) -> Self {
        Self {
            control,
            status,
            state,
            stop,
            interval,
            staleness,
            has_token: false,
        }
    }

    async fn refresh_live_flag(&mut self) {
        if !self.has_token {
            match self.status.acquire_token().await {
                Ok(()) => {
                    debug!("Status API token acquired");
                    self.has_token = true;
                }
                Err(e) => {
                    warn!("Could not acquire status API token: {}", e);
                    self.state.set_online(true);
                    return;
                }
            }
        }

        match self.status.is_live(&self.state.channel).await {
            Ok(live) => self.state.set_online(live),
            Err(e) => {
                warn!("Status check for #{} failed, assuming live: {}", self.state.channel, e);
                self.has_token = false;
                self.state.set_online(true);
            }
        }
    }

    /// True when both the server ping and chat have gone quiet.
    fn is_stale(&self) -> bool {
        let now = Utc::now();
        now - self.state.last_ping() > self.staleness.ping
            && now - self.state.last_message() > self.staleness.message
    }
}

#[async_trait]
impl PipelineService for OnlineCheckerService {
    fn name(&self) -> &'static str {
        "online-checker"
    }

    async fn run(mut self: Box<Self>, ready: oneshot::Sender<()>) -> Result<(), BotError> {
        info!("{} started", self.name());
        let _ = ready.send(());

        loop {
            self.refresh_live_flag().await;

            if self.is_stale() {
                warn!(
                    "No PING since {} and no chat since {}, requesting reconnect",
                    self.state.last_ping().format("%H:%M:%S"),
                    self.state.last_message().format("%H:%M:%S")
                );
                self.stop.request(StopReason::Reconnect);
            }

            match poll_queue(&mut self.control, self.interval).await {
                Polled::Poisoned => {
                    debug!("{} poisoned", self.name());
                    break;
                }
                Polled::Closed => break,
                Polled::Idle => {}
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
    use crate::bot::queues::{channels, QueueMessage};
    use crate::dao::memory::StaticStatus;

    fn service(
        control: QueueReceiver,
        status: Arc<StaticStatus>,
        state: Arc<SharedState>,
        stop: StopSignal,
        staleness: Staleness,
    ) -> Box<OnlineCheckerService> {
        Box::new(OnlineCheckerService::new(
            control,
            status,
            state,
            stop,
            Duration::from_millis(10),
            staleness,
        ))
    }

    #[tokio::test]
    async fn test_live_flag_follows_status_api() {
        let status = Arc::new(StaticStatus::new(false));
        let state = Arc::new(SharedState::with_identity("nambot", "forsen", "kroom", ""));
        let (queues, rx) = channels();
        let handle = tokio::spawn(
            service(rx.control, status.clone(), state.clone(), StopSignal::new(), Staleness::from_minutes(6, 3))
                .run(oneshot::channel().0),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!state.is_online());

        status.set_live(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.is_online());

        queues.control.send(QueueMessage::Poison).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(status.token_requests(), 1);
    }

    #[tokio::test]
    async fn test_status_failure_assumes_live() {
        let status = Arc::new(StaticStatus::new(false));
        status.set_failing(true);
        let state = Arc::new(SharedState::with_identity("nambot", "forsen", "kroom", ""));
        state.set_online(false);
        let (queues, rx) = channels();
        let handle = tokio::spawn(
            service(rx.control, status, state.clone(), StopSignal::new(), Staleness::from_minutes(6, 3))
                .run(oneshot::channel().0),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.is_online());

        queues.control.send(QueueMessage::Poison).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_connection_requests_reconnect() {
        let status = Arc::new(StaticStatus::new(true));
        let state = Arc::new(SharedState::with_identity("nambot", "forsen", "kroom", ""));
        let long_ago = Utc::now() - ChronoDuration::minutes(30);
        state.mark_ping(long_ago);
        state.mark_message(long_ago);
        let stop = StopSignal::new();
        let (queues, rx) = channels();
        let handle = tokio::spawn(
            service(rx.control, status, state, stop.clone(), Staleness::from_minutes(6, 3))
                .run(oneshot::channel().0),
        );

        let reason = tokio::time::timeout(Duration::from_secs(2), stop.stopped()).await.unwrap();
        assert_eq!(reason, StopReason::Reconnect);

        queues.control.send(QueueMessage::Poison).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recent_chat_keeps_connection() {
        let status = Arc::new(StaticStatus::new(true));
        let state = Arc::new(SharedState::with_identity("nambot", "forsen", "kroom", ""));
        state.mark_ping(Utc::now() - ChronoDuration::minutes(30));
        let stop = StopSignal::new();
        let (queues, rx) = channels();
        let handle = tokio::spawn(
            service(rx.control, status, state, stop.clone(), Staleness::from_minutes(6, 3))
                .run(oneshot::channel().0),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        queues.control.send(QueueMessage::Poison).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(stop.reason(), None);
    }
}
