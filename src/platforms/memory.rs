// src/platforms/memory.rs - In-process connector used by tests and dry runs

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch, Mutex};

use crate::platforms::Connector;
use crate::types::BotError;

/// Connector double: inbound lines are pushed by the test, outbound lines are recorded.
pub struct MemoryConnector {
    inbound_tx: mpsc::UnboundedSender<Result<String, BotError>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Result<String, BotError>>>,
    sent: Mutex<Vec<String>>,
    fail_writes: AtomicBool,
    closed: watch::Sender<bool>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            closed,
        }
    }

    /// Queue a line as if the server had sent it.
    pub fn push_line(&self, line: impl Into<String>) {
        let _ = self.inbound_tx.send(Ok(line.into()));
    }

    /// Make the next read fail as a broken transport would.
    pub fn push_failure(&self, message: impl Into<String>) {
        let _ = self.inbound_tx.send(Err(BotError::Transport(message.into())));
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn read_line(&self) -> Result<Option<String>, BotError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }

        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            _ = closed.changed() => Ok(None),
            next = inbound.recv() => match next {
                Some(Ok(line)) => Ok(Some(line)),
                Some(Err(e)) => Err(e),
                None => Err(BotError::ConnectionClosed),
            },
        }
    }

    async fn send_line(&self, line: &str) -> Result<(), BotError> {
        if self.is_closed() {
            return Err(BotError::ConnectionClosed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BotError::Transport("write refused".to_string()));
        }
        self.sent.lock().await.push(line.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn name(&self) -> &str {
        "memory"
    }
}
