//! # NamBot
//!
//! Always-on chat bot for a single Twitch channel.
//!
//! Raw IRC lines are decoded, routed onto typed work queues and handled by a
//! small set of workers:
//!
//! - **Listener**: the only reader of the connection; classifies each line
//! - **Command handler**: layered admission (cooldown, burst bans, opt-outs,
//!   per-user overrides) followed by the chat commands themselves
//! - **Timeout logger**: tracks moderation timeouts while the channel is
//!   offline and records them once they expire
//! - **Message logger**, **sender** and **online checker**
//!
//! A [`bot::Pipeline`] owns one connection's worth of workers. Any transport
//! failure tears the whole pipeline down and the binary builds a fresh one.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nambot::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BotConfig::load(BotConfig::default_path()).await?;
//!     let state = Arc::new(SharedState::new(&config));
//!     let collaborators = Collaborators {
//!         storage: Arc::new(MemoryStorage::new()),
//!         status: Arc::new(StaticStatus::new(false)),
//!         publisher: Arc::new(DirectoryPublisher::new(&config.bot.report_dir)),
//!     };
//!
//!     let connector = Arc::new(TwitchConnector::connect(&config.twitch.irc_url).await?);
//!     let credentials = Credentials {
//!         username: config.twitch.username.clone(),
//!         oauth_token: config.twitch.oauth_token.clone(),
//!     };
//!     Pipeline::new(connector, collaborators, state, config.pipeline.clone(), credentials)
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod config;
pub mod dao;
pub mod platforms;
pub mod protocol;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::state::SharedState;
    pub use crate::bot::{Collaborators, Credentials, Pipeline, PipelineExit};
    pub use crate::config::BotConfig;
    pub use crate::dao::memory::{MemoryStorage, StaticStatus};
    pub use crate::dao::publisher::DirectoryPublisher;
    pub use crate::dao::{ReportPublisher, StatusApi, Storage};
    pub use crate::platforms::twitch::TwitchConnector;
    pub use crate::platforms::Connector;
    pub use crate::types::{BotError, ChatMessage, TimeoutSignal};
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
