use async_trait::async_trait;

use crate::types::BotError;

pub mod memory;
pub mod twitch;

/// Duplex line transport to the chat server.
///
/// Reads and writes go through `&self` so one connector can be shared between
/// the listener (sole reader) and the sender (sole writer).
#[async_trait]
pub trait Connector: Send + Sync {
    /// Next raw protocol line. `Ok(None)` once the connector is closed.
    async fn read_line(&self) -> Result<Option<String>, BotError>;

    /// Send one raw protocol line. The connector appends the line terminator.
    async fn send_line(&self, line: &str) -> Result<(), BotError>;

    /// Close the transport and unblock a pending `read_line`.
    async fn close(&self);

    /// Transport identifier for logging
    fn name(&self) -> &str;
}
