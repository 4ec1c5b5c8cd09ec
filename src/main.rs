// src/main.rs - Bootstrap: config, collaborators, signal handling and the reconnect loop

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;

use nambot::bot::shutdown::start_signal_handlers;
use nambot::bot::state::SharedState;
use nambot::bot::{reconnect_delay, Collaborators, Credentials, Pipeline, PipelineExit};
use nambot::config::BotConfig;
use nambot::dao::helix::HelixClient;
use nambot::dao::memory::{MemoryStorage, StaticStatus};
use nambot::dao::publisher::DirectoryPublisher;
use nambot::dao::StatusApi;
use nambot::platforms::twitch::TwitchConnector;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables, then configuration so its log level can seed the logger
    dotenv::dotenv().ok();
    let config_path = BotConfig::default_path();
    let config = BotConfig::load(&config_path)
        .await
        .context("Failed to load configuration")?;

    let mut logger = env_logger::Builder::new();
    logger.filter_level(log::LevelFilter::Info);
    if let Some(level) = config.bot.log_level.as_deref() {
        logger.parse_filters(level);
    }
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    info!("Starting NamBot v{}", nambot::VERSION);
    info!(
        "Loaded configuration from {} for #{} as {}",
        config_path.display(),
        config.twitch.channel,
        config.twitch.username
    );

    let state = Arc::new(SharedState::new(&config));

    let status: Arc<dyn StatusApi> = match config.helix_credentials() {
        Some((client_id, secret)) => Arc::new(
            HelixClient::new(client_id, secret).context("Failed to build Helix client")?,
        ),
        None => {
            warn!("No Helix credentials configured, treating the channel as always live");
            Arc::new(StaticStatus::new(true))
        }
    };
    let collaborators = Collaborators {
        storage: Arc::new(MemoryStorage::new()),
        status,
        publisher: Arc::new(DirectoryPublisher::new(&config.bot.report_dir)),
    };
    let credentials = Credentials {
        username: config.twitch.username.clone(),
        oauth_token: config.twitch.oauth_token.clone(),
    };

    start_signal_handlers(Arc::clone(&state));

    loop {
        if state.is_shutdown_requested() {
            break;
        }

        let connector = match TwitchConnector::connect(&config.twitch.irc_url).await {
            Ok(connector) => Arc::new(connector),
            Err(e) => {
                error!("Failed to connect to {}: {:#}", config.twitch.irc_url, e);
                reconnect_delay(&state, config.pipeline.reconnect_delay()).await;
                continue;
            }
        };

        let pipeline = Pipeline::new(
            connector,
            collaborators.clone(),
            Arc::clone(&state),
            config.pipeline.clone(),
            credentials.clone(),
        );

        match pipeline.run().await {
            Ok(PipelineExit::Stopped) => break,
            Ok(PipelineExit::Reconnect) => info!("Reconnecting"),
            Err(e) if e.is_process_fatal() => {
                error!("Unrecoverable pipeline failure: {}", e);
                return Err(e.into());
            }
            Err(e) => warn!("Pipeline failed, reconnecting: {}", e),
        }

        reconnect_delay(&state, config.pipeline.reconnect_delay()).await;
    }

    info!("NamBot stopped");
    Ok(())
}
