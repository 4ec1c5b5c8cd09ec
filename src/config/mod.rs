// src/config/mod.rs - Bot configuration: YAML file plus environment overrides

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::platforms::twitch::DEFAULT_IRC_URL;
use crate::types::BotError;

pub const DEFAULT_CONFIG_PATH: &str = "config/bot.yaml";
pub const CONFIG_PATH_VAR: &str = "NAMBOT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotConfig {
    pub twitch: TwitchSettings,
    pub bot: BotSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TwitchSettings {
    pub username: String,
    /// `oauth:...`
    pub oauth_token: String,
    /// Without `#`
    pub channel: String,
    #[serde(default = "default_irc_url")]
    pub irc_url: String,
    /// Helix app credentials. The status poller is disabled without them.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotSettings {
    /// Operator identity allowed to whisper control directives
    pub admin: String,
    /// Prefix for published report links, e.g. `https://example.com/logs/`
    #[serde(default)]
    pub website: String,
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_poll_seconds: u64,
    pub health_timeout_seconds: u64,
    pub stop_timeout_seconds: u64,
    pub online_check_seconds: u64,
    pub ping_stale_minutes: i64,
    pub message_stale_minutes: i64,
    pub reconnect_delay_seconds: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_poll_seconds: 3,
            health_timeout_seconds: 10,
            stop_timeout_seconds: 60,
            online_check_seconds: 5,
            ping_stale_minutes: 6,
            message_stale_minutes: 3,
            reconnect_delay_seconds: 1,
        }
    }
}

impl PipelineSettings {
    pub fn queue_poll(&self) -> Duration {
        Duration::from_secs(self.queue_poll_seconds.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    pub fn online_check(&self) -> Duration {
        Duration::from_secs(self.online_check_seconds.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }
}

fn default_irc_url() -> String {
    DEFAULT_IRC_URL.to_string()
}

fn default_report_dir() -> String {
    "reports".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            twitch: TwitchSettings {
                username: "nambot".to_string(),
                oauth_token: "oauth:your_token_here".to_string(),
                channel: "your_channel".to_string(),
                irc_url: default_irc_url(),
                client_id: None,
                client_secret: None,
            },
            bot: BotSettings {
                admin: "your_admin".to_string(),
                website: String::new(),
                report_dir: default_report_dir(),
                log_level: Some("info".to_string()),
            },
            pipeline: PipelineSettings::default(),
        }
    }
}

impl BotConfig {
    /// Path from `NAMBOT_CONFIG`, else `config/bot.yaml`.
    pub fn default_path() -> PathBuf {
        env::var(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load from `path`, writing a default file first if none exists, then
    /// apply environment overrides and validate.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            Self::write_default(path).await?;
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;

        info!(
            "Loaded configuration from {} for #{} as {}",
            path.display(),
            config.twitch.channel,
            config.twitch.username
        );
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Invalid bot configuration")
    }

    async fn write_default(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        }
        let content = serde_yaml::to_string(&Self::default())?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write default config {}", path.display()))?;
        info!("Created default configuration: {}", path.display());
        Ok(())
    }

    /// Secrets and identity from the environment win over the file.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                debug!("Config override from {}", key);
                *target = value;
            }
        };
        set(&mut self.twitch.username, "NAMBOT_TWITCH_USERNAME");
        set(&mut self.twitch.oauth_token, "NAMBOT_TWITCH_OAUTH");
        set(&mut self.twitch.channel, "NAMBOT_TWITCH_CHANNEL");
        set(&mut self.bot.admin, "NAMBOT_BOT_ADMIN");
        set(&mut self.bot.website, "NAMBOT_BOT_WEBSITE");

        if let Some(id) = lookup("NAMBOT_TWITCH_CLIENT_ID").filter(|v| !v.is_empty()) {
            self.twitch.client_id = Some(id);
        }
        if let Some(secret) = lookup("NAMBOT_TWITCH_SECRET").filter(|v| !v.is_empty()) {
            self.twitch.client_secret = Some(secret);
        }
    }

    /// Normalise identities and reject unusable settings.
    pub fn validate(&mut self) -> Result<(), BotError> {
        self.twitch.channel = self.twitch.channel.trim().trim_start_matches('#').to_lowercase();
        self.twitch.username = self.twitch.username.trim().to_lowercase();
        self.bot.admin = self.bot.admin.trim().to_lowercase();

        if self.twitch.channel.is_empty() {
            return Err(BotError::Config("twitch.channel must not be empty".to_string()));
        }
        if self.twitch.username.is_empty() {
            return Err(BotError::Config("twitch.username must not be empty".to_string()));
        }
        if !self.twitch.oauth_token.starts_with("oauth:") {
            let shown: String = self.twitch.oauth_token.chars().take(10).collect();
            return Err(BotError::Config(format!(
                "twitch.oauth_token must start with 'oauth:' - got: {}...",
                shown
            )));
        }
        Ok(())
    }

    pub fn helix_credentials(&self) -> Option<(String, String)> {
        match (&self.twitch.client_id, &self.twitch.client_secret) {
            (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
            _ => None,
        }
    }
}
