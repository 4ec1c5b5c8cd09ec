// src/bot/shutdown.rs - Stop requests, OS signal handling and bounded worker joins

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::bot::state::SharedState;
use crate::types::BotError;

/// Why a pipeline instance is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator or OS signal; the process exits afterwards
    OperatorStop,
    /// Server request, staleness or operator restart
    Reconnect,
    /// A worker returned an error
    WorkerFailed,
}

impl StopReason {
    pub fn reconnects(self) -> bool {
        !matches!(self, StopReason::OperatorStop)
    }
}

/// Per-pipeline stop request. The first reason requested wins.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn request(&self, reason: StopReason) {
        let accepted = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if accepted {
            info!("Pipeline stop requested: {:?}", reason);
        } else {
            debug!("Ignoring stop request {:?}, already stopping", reason);
        }
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.tx.borrow()
    }

    /// Resolves with the first requested reason.
    pub async fn stopped(&self) -> StopReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return StopReason::WorkerFailed;
            }
        }
    }
}

/// Route Ctrl+C and SIGTERM into a process shutdown request.
pub fn start_signal_handlers(state: Arc<SharedState>) {
    let ctrl_c_state = Arc::clone(&state);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal, initiating graceful shutdown...");
                ctrl_c_state.request_shutdown();
            }
            Err(err) => error!("Failed to listen for Ctrl+C signal: {}", err),
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    error!("Failed to register SIGTERM handler: {}", err);
                    return;
                }
            };
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM signal, initiating graceful shutdown...");
                state.request_shutdown();
            }
        });
    }
    #[cfg(not(unix))]
    drop(state);

    info!("Shutdown signal handlers started");
}

/// Join every worker within one shared deadline.
///
/// Worker errors are logged; only the deadline itself is an error.
pub async fn join_workers(
    handles: Vec<(&'static str, JoinHandle<Result<(), BotError>>)>,
    limit: Duration,
) -> Result<(), BotError> {
    let deadline = Instant::now() + limit;

    for (name, handle) in handles {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, handle).await {
            Ok(Ok(Ok(()))) => debug!("{} joined", name),
            Ok(Ok(Err(e))) => warn!("{} finished with error: {}", name, e),
            Ok(Err(e)) => error!("{} panicked or was cancelled: {}", name, e),
            Err(_) => {
                error!("{} did not stop within {}s", name, limit.as_secs());
                return Err(BotError::ShutdownTimeout(limit.as_secs()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let stop = StopSignal::new();
        assert_eq!(stop.reason(), None);

        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        stop.request(StopReason::Reconnect);
        stop.request(StopReason::OperatorStop);

        assert_eq!(waiter.await.unwrap(), StopReason::Reconnect);
        assert_eq!(stop.reason(), Some(StopReason::Reconnect));
        assert!(StopReason::Reconnect.reconnects());
        assert!(!StopReason::OperatorStop.reconnects());
    }

    #[tokio::test]
    async fn test_join_workers_times_out_on_stuck_worker() {
        let quick: JoinHandle<Result<(), BotError>> = tokio::spawn(async { Ok(()) });
        let failed: JoinHandle<Result<(), BotError>> =
            tokio::spawn(async { Err(BotError::ConnectionClosed) });
        assert!(join_workers(vec![("quick", quick), ("failed", failed)], Duration::from_secs(1))
            .await
            .is_ok());

        let stuck: JoinHandle<Result<(), BotError>> = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let result = join_workers(vec![("stuck", stuck)], Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BotError::ShutdownTimeout(_))));
    }
}
