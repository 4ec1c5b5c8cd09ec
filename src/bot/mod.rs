// src/bot/mod.rs - Pipeline orchestration: start workers, handshake, stop, reconnect

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::config::PipelineSettings;
use crate::dao::{ReportPublisher, StatusApi, Storage};
use crate::platforms::Connector;
use crate::types::BotError;

pub mod admission;
pub mod commands;
pub mod handler;
pub mod logger;
pub mod online;
pub mod queues;
pub mod router;
pub mod sender;
pub mod shutdown;
pub mod state;
pub mod timeouts;

use handler::CommandHandlerService;
use logger::MessageLoggerService;
use online::{OnlineCheckerService, Staleness};
use router::ListenerService;
use sender::SenderService;
use shutdown::{join_workers, StopReason, StopSignal};
use state::SharedState;
use timeouts::TimeoutLoggerService;

/// One long-running worker of a pipeline instance.
#[async_trait]
pub trait PipelineService: Send {
    fn name(&self) -> &'static str;

    /// Signal `ready` once set up, then loop until poisoned or failed.
    async fn run(self: Box<Self>, ready: oneshot::Sender<()>) -> Result<(), BotError>;
}

/// How a pipeline instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    /// Operator stop; the process should exit
    Stopped,
    /// Build a fresh instance on a new connection
    Reconnect,
}

/// Login identity for the protocol handshake.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub oauth_token: String,
}

/// External collaborators shared by every pipeline instance.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub status: Arc<dyn StatusApi>,
    pub publisher: Arc<dyn ReportPublisher>,
}

type WorkerHandle = (&'static str, JoinHandle<Result<(), BotError>>);

/// One connection's worth of workers. Consumed by `run`; build a new one to reconnect.
pub struct Pipeline {
    connector: Arc<dyn Connector>,
    collaborators: Collaborators,
    state: Arc<SharedState>,
    settings: PipelineSettings,
    credentials: Credentials,
}

impl Pipeline {
    pub fn new(
        connector: Arc<dyn Connector>,
        collaborators: Collaborators,
        state: Arc<SharedState>,
        settings: PipelineSettings,
        credentials: Credentials,
    ) -> Self {
        Self {
            connector,
            collaborators,
            state,
            settings,
            credentials,
        }
    }

    /// Run until stopped. `Err` is returned for health failures and stuck workers;
    /// only `BotError::is_process_fatal` errors should end the process.
    pub async fn run(self) -> Result<PipelineExit, BotError> {
        let stop = StopSignal::new();
        // Liveness marks from a previous connection must not count against this one.
        self.state.reset_liveness(Utc::now());
        let (queues, receivers) = queues::channels();
        let poll = self.settings.queue_poll();

        let listener: Box<dyn PipelineService> = Box::new(ListenerService::new(
            Arc::clone(&self.connector),
            queues.clone(),
            Arc::clone(&self.state),
            stop.clone(),
        ));
        let workers: Vec<Box<dyn PipelineService>> = vec![
            Box::new(CommandHandlerService::new(
                receivers.commands,
                queues.clone(),
                Arc::clone(&self.collaborators.storage),
                Arc::clone(&self.collaborators.status),
                Arc::clone(&self.collaborators.publisher),
                Arc::clone(&self.state),
                poll,
            )),
            Box::new(TimeoutLoggerService::new(
                receivers.timeouts,
                Arc::clone(&self.collaborators.storage),
                Arc::clone(&self.state),
                poll,
            )),
            Box::new(MessageLoggerService::new(
                receivers.log,
                Arc::clone(&self.collaborators.storage),
                Arc::clone(&self.state),
                stop.clone(),
                poll,
            )),
            Box::new(SenderService::new(
                receivers.sending,
                queues.log.clone(),
                Arc::clone(&self.connector),
                Arc::clone(&self.state),
                poll,
            )),
            Box::new(OnlineCheckerService::new(
                receivers.control,
                Arc::clone(&self.collaborators.status),
                Arc::clone(&self.state),
                stop.clone(),
                self.settings.online_check(),
                Staleness::from_minutes(
                    self.settings.ping_stale_minutes,
                    self.settings.message_stale_minutes,
                ),
            )),
        ];

        let mut ready = Vec::with_capacity(workers.len() + 1);
        let (listener_ready, listener_handle) = spawn_worker(listener, &stop);
        ready.push(("listener", listener_ready));
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let name = worker.name();
            let (ready_rx, handle) = spawn_worker(worker, &stop);
            ready.push((name, ready_rx));
            handles.push((name, handle));
        }
        let listener_handle = ("listener", listener_handle);

        let health_timeout = self.settings.health_timeout();
        match timeout(health_timeout, wait_ready(ready)).await {
            Ok(Ok(())) => info!("Pipeline healthy"),
            Ok(Err(name)) => {
                error!("{} exited before reporting ready", name);
                self.teardown(&queues, handles, listener_handle).await?;
                return Err(BotError::HealthTimeout(health_timeout.as_secs()));
            }
            Err(_) => {
                error!("Pipeline not healthy after {}s", health_timeout.as_secs());
                self.teardown(&queues, handles, listener_handle).await?;
                return Err(BotError::HealthTimeout(health_timeout.as_secs()));
            }
        }

        if let Err(e) = self.handshake().await {
            error!("Handshake failed: {}", e);
            self.teardown(&queues, handles, listener_handle).await?;
            return Err(e);
        }

        let reason = tokio::select! {
            reason = stop.stopped() => reason,
            _ = self.state.shutdown_requested() => StopReason::OperatorStop,
        };
        info!("Stopping pipeline: {:?}", reason);

        self.teardown(&queues, handles, listener_handle).await?;

        if reason.reconnects() && !self.state.is_shutdown_requested() {
            Ok(PipelineExit::Reconnect)
        } else {
            Ok(PipelineExit::Stopped)
        }
    }

    async fn handshake(&self) -> Result<(), BotError> {
        let lines = [
            format!("PASS {}", self.credentials.oauth_token),
            format!("NICK {}", self.credentials.username),
            "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
            format!("JOIN #{}", self.state.channel),
        ];
        for line in &lines {
            self.connector.send_line(line).await?;
        }
        info!("Joined #{} as {}", self.state.channel, self.credentials.username);
        Ok(())
    }

    /// Poison every queue, let the queue workers drain, then close the connector
    /// to release the listener. One deadline covers the whole stop.
    async fn teardown(
        &self,
        queues: &queues::Queues,
        workers: Vec<WorkerHandle>,
        listener: WorkerHandle,
    ) -> Result<(), BotError> {
        let limit = self.settings.stop_timeout();
        let deadline = Instant::now() + limit;

        queues.poison_all();
        join_workers(workers, limit).await?;

        self.connector.close().await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        join_workers(vec![listener], remaining)
            .await
            .map_err(|_| BotError::ShutdownTimeout(limit.as_secs()))?;

        debug!("All workers stopped");
        Ok(())
    }
}

/// Spawn a worker; a failing worker asks the pipeline to reconnect.
fn spawn_worker(
    worker: Box<dyn PipelineService>,
    stop: &StopSignal,
) -> (oneshot::Receiver<()>, JoinHandle<Result<(), BotError>>) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let stop = stop.clone();
    let name = worker.name();
    let handle = tokio::spawn(async move {
        let result = worker.run(ready_tx).await;
        if let Err(e) = &result {
            error!("{} failed: {}", name, e);
            stop.request(StopReason::WorkerFailed);
        }
        result
    });
    (ready_rx, handle)
}

/// Wait for every ready signal. `Err` names a worker that died first.
async fn wait_ready(ready: Vec<(&'static str, oneshot::Receiver<()>)>) -> Result<(), &'static str> {
    for (name, rx) in ready {
        if rx.await.is_err() {
            return Err(name);
        }
        debug!("{} ready", name);
    }
    Ok(())
}

/// Sleep between pipeline instances unless shutdown arrives first.
pub async fn reconnect_delay(state: &SharedState, delay: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = state.shutdown_requested() => warn!("Shutdown requested during reconnect delay"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::memory::{MemoryPublisher, MemoryStorage, StaticStatus};
    use crate::platforms::memory::MemoryConnector;

    struct Fixture {
        connector: Arc<MemoryConnector>,
        storage: Arc<MemoryStorage>,
        state: Arc<SharedState>,
        pipeline: Pipeline,
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            queue_poll_seconds: 1,
            health_timeout_seconds: 5,
            stop_timeout_seconds: 5,
            online_check_seconds: 1,
            ping_stale_minutes: 6,
            message_stale_minutes: 3,
            reconnect_delay_seconds: 0,
        }
    }

    fn fixture() -> Fixture {
        let connector = Arc::new(MemoryConnector::new());
        let storage = Arc::new(MemoryStorage::new());
        let state = Arc::new(SharedState::with_identity(
            "nambot",
            "forsen",
            "kroom",
            "https://example.com/",
        ));
        let collaborators = Collaborators {
            storage: storage.clone(),
            status: Arc::new(StaticStatus::new(false)),
            publisher: Arc::new(MemoryPublisher::new()),
        };
        let pipeline = Pipeline::new(
            connector.clone(),
            collaborators,
            state.clone(),
            settings(),
            Credentials {
                username: "nambot".to_string(),
                oauth_token: "oauth:secret".to_string(),
            },
        );
        Fixture {
            connector,
            storage,
            state,
            pipeline,
        }
    }

    async fn wait_for_sent(connector: &MemoryConnector, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let sent = connector.sent_lines().await;
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        connector.sent_lines().await
    }

    #[test_log::test(tokio::test)]
    async fn test_handshake_then_operator_shutdown() {
        let f = fixture();
        let handle = tokio::spawn(f.pipeline.run());

        let sent = wait_for_sent(&f.connector, 4).await;
        assert_eq!(
            &sent[..4],
            &[
                "PASS oauth:secret".to_string(),
                "NICK nambot".to_string(),
                "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
                "JOIN #forsen".to_string(),
            ]
        );

        f.connector.push_line(":kroom!kroom@kroom.tmi.twitch.tv WHISPER nambot :/shutdown");
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(exit, PipelineExit::Stopped);
        assert!(f.state.is_shutdown_requested());
        assert!(f.connector.is_closed());
        assert_eq!(f.storage.whispers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_chat_flows_to_storage_and_pong_is_sent() {
        let f = fixture();
        let handle = tokio::spawn(f.pipeline.run());
        wait_for_sent(&f.connector, 4).await;

        f.connector.push_line("PING :tmi.twitch.tv");
        f.connector
            .push_line("@user-id=7 :alice!alice@alice.tmi.twitch.tv PRIVMSG #forsen :hello chat");
        let sent = wait_for_sent(&f.connector, 5).await;
        assert!(sent.contains(&"PONG :tmi.twitch.tv".to_string()));

        for _ in 0..200 {
            if !f.storage.messages().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        f.state.request_shutdown();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, PipelineExit::Stopped);

        let messages = f.storage.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "alice");
        assert_eq!(messages[0].text, "hello chat");
    }

    #[tokio::test]
    async fn test_transport_failure_requests_reconnect() {
        let f = fixture();
        let handle = tokio::spawn(f.pipeline.run());
        wait_for_sent(&f.connector, 4).await;

        f.connector.push_failure("connection reset");
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(exit, PipelineExit::Reconnect);
        assert!(!f.state.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_fresh_pipeline_ignores_stale_marks_from_previous_connection() {
        let f = fixture();
        let long_ago = Utc::now() - chrono::Duration::minutes(30);
        f.state.mark_ping(long_ago);
        f.state.mark_message(long_ago);

        let handle = tokio::spawn(f.pipeline.run());
        wait_for_sent(&f.connector, 4).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        f.state.request_shutdown();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, PipelineExit::Stopped);
    }

    #[tokio::test]
    async fn test_server_reconnect_command() {
        let f = fixture();
        let handle = tokio::spawn(f.pipeline.run());
        wait_for_sent(&f.connector, 4).await;

        f.connector.push_line(":tmi.twitch.tv RECONNECT");
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, PipelineExit::Reconnect);
    }

    #[tokio::test]
    async fn test_failed_handshake_is_reported() {
        let f = fixture();
        f.connector.set_fail_writes(true);

        let result = tokio::time::timeout(Duration::from_secs(5), f.pipeline.run())
            .await
            .unwrap();
        assert!(matches!(result, Err(BotError::Transport(_))));
        assert!(f.connector.is_closed());
    }

    struct Stuck;

    #[async_trait]
    impl PipelineService for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn run(self: Box<Self>, _ready: oneshot::Sender<()>) -> Result<(), BotError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stuck_worker_never_reports_ready() {
        let stop = StopSignal::new();
        let (ready, handle) = spawn_worker(Box::new(Stuck), &stop);
        let waited = timeout(Duration::from_millis(50), wait_ready(vec![("stuck", ready)])).await;
        assert!(waited.is_err());

        let joined = join_workers(vec![("stuck", handle)], Duration::from_millis(20)).await;
        assert!(matches!(joined, Err(BotError::ShutdownTimeout(_))));
        assert!(matches!(
            joined.map_err(|e| e.is_process_fatal()),
            Err(true)
        ));
    }
}
