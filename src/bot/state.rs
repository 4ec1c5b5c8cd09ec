// src/bot/state.rs - Process-lifetime context shared by every pipeline instance

use chrono::{DateTime, TimeZone, Utc};
use log::info;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use tokio::sync::{watch, Mutex, RwLock};

use crate::bot::sender::OutboundFilter;
use crate::bot::timeouts::TimeoutTracker;
use crate::config::BotConfig;

/// Cross-worker state. Built once in `main` and handed to each pipeline by `Arc`.
///
/// Flags and counters are atomics; lists read by several workers sit behind
/// `RwLock`s written only by the command handler.
pub struct SharedState {
    pub bot_name: String,
    pub channel: String,
    pub admin: String,
    pub website: String,
    pub started_at: DateTime<Utc>,

    online: AtomicBool,
    messages_logged: AtomicU64,
    messages_sent: AtomicU64,
    timeouts: AtomicU64,
    permabans: AtomicU64,
    last_ping_ms: AtomicI64,
    last_message_ms: AtomicI64,

    /// Users opted out of opt-out eligible commands
    pub disabled: RwLock<HashSet<String>>,
    pub outbound_filter: RwLock<OutboundFilter>,
    /// main -> alts
    pub alts: RwLock<HashMap<String, Vec<String>>>,
    /// alt (or main) -> main
    pub mains: RwLock<HashMap<String, String>>,
    /// Message count at the last log publication per user
    pub log_cache: RwLock<HashMap<String, u64>>,

    /// Survives reconnects so active timeouts and the emitted set are never lost.
    /// Only the timeout logger writes it; other holders just read.
    pub timeout_tracker: Mutex<TimeoutTracker>,

    shutdown: watch::Sender<bool>,
}

impl SharedState {
    pub fn new(config: &BotConfig) -> Self {
        Self::with_identity(
            &config.twitch.username,
            &config.twitch.channel,
            &config.bot.admin,
            &config.bot.website,
        )
    }

    pub fn with_identity(bot_name: &str, channel: &str, admin: &str, website: &str) -> Self {
        let now = Utc::now();
        let (shutdown, _) = watch::channel(false);
        Self {
            bot_name: bot_name.to_lowercase(),
            channel: channel.to_lowercase(),
            admin: admin.to_lowercase(),
            website: website.to_string(),
            started_at: now,
            // Assume live until the first poll says otherwise.
            online: AtomicBool::new(true),
            messages_logged: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            permabans: AtomicU64::new(0),
            last_ping_ms: AtomicI64::new(now.timestamp_millis()),
            last_message_ms: AtomicI64::new(now.timestamp_millis()),
            disabled: RwLock::new(HashSet::new()),
            outbound_filter: RwLock::new(OutboundFilter::default()),
            alts: RwLock::new(HashMap::new()),
            mains: RwLock::new(HashMap::new()),
            log_cache: RwLock::new(HashMap::new()),
            timeout_tracker: Mutex::new(TimeoutTracker::new()),
            shutdown,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            info!("#{} is now {}", self.channel, if online { "live" } else { "offline" });
        }
    }

    pub fn count_logged(&self) {
        self.messages_logged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_permaban(&self) {
        self.permabans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_logged(&self) -> u64 {
        self.messages_logged.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn permabans(&self) -> u64 {
        self.permabans.load(Ordering::Relaxed)
    }

    pub fn mark_ping(&self, now: DateTime<Utc>) {
        self.last_ping_ms.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn mark_message(&self, now: DateTime<Utc>) {
        self.last_message_ms.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    /// Restart both staleness clocks, as for a freshly opened connection.
    pub fn reset_liveness(&self, now: DateTime<Utc>) {
        self.mark_ping(now);
        self.mark_message(now);
    }

    pub fn last_ping(&self) -> DateTime<Utc> {
        millis_to_time(self.last_ping_ms.load(Ordering::SeqCst))
    }

    pub fn last_message(&self) -> DateTime<Utc> {
        millis_to_time(self.last_message_ms.load(Ordering::SeqCst))
    }

    /// Operator identities: admin, channel owner and the internal autoban sender.
    pub fn operators(&self) -> HashSet<String> {
        [self.admin.as_str(), self.channel.as_str(), AUTOBAN_SENDER]
            .iter()
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string())
            .collect()
    }

    /// Ask the whole process to stop after the current pipeline.
    pub fn request_shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Process shutdown requested");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Sender used for the opt-out registration triggered by a permanent ban.
pub const AUTOBAN_SENDER: &str = "autoban";

fn millis_to_time(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}
