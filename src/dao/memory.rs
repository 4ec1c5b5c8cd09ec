// src/dao/memory.rs - In-memory collaborators for tests and for running without a database

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rand::seq::IndexedRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::dao::{BlacklistEntry, ReportPublisher, StatusApi, Storage};
use crate::types::{BotError, ChatMessage, LoggedLine, TimeoutRecord, TimeoutSignal};

#[derive(Default)]
struct StorageInner {
    seen_ids: HashSet<Uuid>,
    messages: Vec<ChatMessage>,
    whispers: Vec<ChatMessage>,
    live_timeouts: Vec<TimeoutSignal>,
    expired_timeouts: Vec<TimeoutRecord>,
    mods: Vec<String>,
    alts: Vec<(String, String)>,
    blacklist: Vec<BlacklistEntry>,
    disabled: HashSet<String>,
    permissions: HashMap<String, HashMap<String, bool>>,
}

impl StorageInner {
    fn lines_for<'a>(&'a self, username: &'a str) -> impl Iterator<Item = &'a ChatMessage> + 'a {
        self.messages
            .iter()
            .filter(move |m| m.sender.eq_ignore_ascii_case(username))
    }
}

fn to_line(message: &ChatMessage) -> LoggedLine {
    LoggedLine {
        username: message.sender.clone(),
        text: message.text.clone(),
        timestamp: message.timestamp,
    }
}

fn contains_phrase(text: &str, phrase: &str) -> bool {
    text.to_lowercase().contains(&phrase.trim().to_lowercase())
}

/// Storage backed by process memory. Replayed message ids are dropped.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<StorageInner>,
    fail: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent call fails until reset.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn set_mods(&self, mods: &[&str]) {
        self.inner.write().await.mods = mods.iter().map(|m| m.to_string()).collect();
    }

    pub async fn set_blacklist(&self, entries: Vec<BlacklistEntry>) {
        self.inner.write().await.blacklist = entries;
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.read().await.messages.clone()
    }

    pub async fn whispers(&self) -> Vec<ChatMessage> {
        self.inner.read().await.whispers.clone()
    }

    pub async fn live_timeouts(&self) -> Vec<TimeoutSignal> {
        self.inner.read().await.live_timeouts.clone()
    }

    pub async fn expired_timeouts(&self) -> Vec<TimeoutRecord> {
        self.inner.read().await.expired_timeouts.clone()
    }

    fn check(&self) -> Result<(), BotError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BotError::storage("storage unavailable", Some(-1)));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn record_message(&self, message: &ChatMessage, id: Uuid) -> Result<(), BotError> {
        self.check()?;
        let mut inner = self.inner.write().await;
        if inner.seen_ids.insert(id) {
            inner.messages.push(message.clone());
        }
        Ok(())
    }

    async fn record_whisper(&self, message: &ChatMessage, id: Uuid) -> Result<(), BotError> {
        self.check()?;
        let mut inner = self.inner.write().await;
        if inner.seen_ids.insert(id) {
            inner.whispers.push(message.clone());
        }
        Ok(())
    }

    async fn record_timeout(&self, signal: &TimeoutSignal) -> Result<(), BotError> {
        self.check()?;
        self.inner.write().await.live_timeouts.push(signal.clone());
        Ok(())
    }

    async fn record_expired_timeout(&self, record: &TimeoutRecord) -> Result<(), BotError> {
        self.check()?;
        self.inner.write().await.expired_timeouts.push(record.clone());
        Ok(())
    }

    async fn message_count(&self, username: &str) -> Result<u64, BotError> {
        self.check()?;
        Ok(self.inner.read().await.lines_for(username).count() as u64)
    }

    async fn mod_list(&self) -> Result<Vec<String>, BotError> {
        self.check()?;
        Ok(self.inner.read().await.mods.clone())
    }

    async fn alts_list(&self) -> Result<Vec<(String, String)>, BotError> {
        self.check()?;
        Ok(self.inner.read().await.alts.clone())
    }

    async fn blacklist(&self) -> Result<Vec<BlacklistEntry>, BotError> {
        self.check()?;
        Ok(self.inner.read().await.blacklist.clone())
    }

    async fn disabled_list(&self) -> Result<HashSet<String>, BotError> {
        self.check()?;
        Ok(self.inner.read().await.disabled.clone())
    }

    async fn add_disabled(&self, _from: &str, username: &str) -> Result<(), BotError> {
        self.check()?;
        self.inner.write().await.disabled.insert(username.to_lowercase());
        Ok(())
    }

    async fn remove_disabled(&self, username: &str) -> Result<(), BotError> {
        self.check()?;
        self.inner.write().await.disabled.remove(&username.to_lowercase());
        Ok(())
    }

    async fn alternate_names(&self, username: &str) -> Result<Vec<String>, BotError> {
        self.check()?;
        let inner = self.inner.read().await;
        let main = inner
            .alts
            .iter()
            .find(|(_, alt)| alt == username)
            .map(|(main, _)| main.clone())
            .unwrap_or_else(|| username.to_string());

        let mut names: Vec<String> = inner
            .alts
            .iter()
            .filter(|(m, _)| *m == main)
            .map(|(_, alt)| alt.clone())
            .collect();
        if main != username {
            names.insert(0, main);
        }
        names.retain(|name| name != username);
        Ok(names)
    }

    async fn add_alt(&self, main: &str, alt: &str) -> Result<(), BotError> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let pair = (main.to_string(), alt.to_string());
        if !inner.alts.contains(&pair) {
            inner.alts.push(pair);
        }
        Ok(())
    }

    async fn personal_permissions(&self, username: &str) -> Result<HashMap<String, bool>, BotError> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .await
            .permissions
            .get(username)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_command_permission(&self, username: &str, command: &str, enabled: bool) -> Result<(), BotError> {
        self.check()?;
        self.inner
            .write()
            .await
            .permissions
            .entry(username.to_string())
            .or_default()
            .insert(command.to_string(), enabled);
        Ok(())
    }

    async fn timeout_amount(&self, username: &str) -> Result<u64, BotError> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .await
            .expired_timeouts
            .iter()
            .filter(|r| r.username == username)
            .map(|r| r.length)
            .sum())
    }

    async fn top_timeouts(&self, limit: usize) -> Result<Vec<(String, u64)>, BotError> {
        self.check()?;
        let inner = self.inner.read().await;
        let mut totals: HashMap<&str, u64> = HashMap::new();
        for record in &inner.expired_timeouts {
            *totals.entry(record.username.as_str()).or_default() += record.length;
        }
        let mut ranked: Vec<(String, u64)> = totals
            .into_iter()
            .map(|(name, total)| (name.to_string(), total))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn first_message(&self, username: &str) -> Result<Option<LoggedLine>, BotError> {
        self.check()?;
        Ok(self.inner.read().await.lines_for(username).next().map(to_line))
    }

    async fn last_message(&self, username: &str) -> Result<Option<LoggedLine>, BotError> {
        self.check()?;
        Ok(self.inner.read().await.lines_for(username).last().map(to_line))
    }

    async fn last_seen(&self, username: &str) -> Result<Option<DateTime<Utc>>, BotError> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .await
            .lines_for(username)
            .last()
            .map(|m| m.timestamp))
    }

    async fn random_quote(&self, username: &str, year: Option<i32>) -> Result<Option<LoggedLine>, BotError> {
        self.check()?;
        let inner = self.inner.read().await;
        let candidates: Vec<&ChatMessage> = inner
            .lines_for(username)
            .filter(|m| year.map_or(true, |y| m.timestamp.year() == y))
            .collect();
        Ok(candidates.choose(&mut rand::rng()).map(|m| to_line(m)))
    }

    async fn random_search(&self, username: &str, phrase: &str) -> Result<Option<LoggedLine>, BotError> {
        self.check()?;
        let inner = self.inner.read().await;
        let candidates: Vec<&ChatMessage> = inner
            .lines_for(username)
            .filter(|m| contains_phrase(&m.text, phrase))
            .collect();
        Ok(candidates.choose(&mut rand::rng()).map(|m| to_line(m)))
    }

    async fn first_occurrence(&self, phrase: &str) -> Result<Option<LoggedLine>, BotError> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .await
            .messages
            .iter()
            .find(|m| contains_phrase(&m.text, phrase))
            .map(to_line))
    }

    async fn search(&self, phrase: &str) -> Result<u64, BotError> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .await
            .messages
            .iter()
            .filter(|m| contains_phrase(&m.text, phrase))
            .count() as u64)
    }

    async fn search_user(&self, username: &str, phrase: &str) -> Result<u64, BotError> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .await
            .lines_for(username)
            .filter(|m| contains_phrase(&m.text, phrase))
            .count() as u64)
    }

    async fn logs(&self, username: &str, limit: usize) -> Result<Vec<LoggedLine>, BotError> {
        self.check()?;
        let inner = self.inner.read().await;
        let lines: Vec<LoggedLine> = inner.lines_for(username).map(to_line).collect();
        let skip = lines.len().saturating_sub(limit);
        Ok(lines.into_iter().skip(skip).collect())
    }
}

/// Status API double with a settable live flag.
#[derive(Default)]
pub struct StaticStatus {
    live: AtomicBool,
    fail: AtomicBool,
    token_requests: AtomicUsize,
    users: RwLock<HashMap<String, String>>,
    follows: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticStatus {
    pub fn new(live: bool) -> Self {
        let status = Self::default();
        status.set_live(live);
        status
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn token_requests(&self) -> usize {
        self.token_requests.load(Ordering::SeqCst)
    }

    pub async fn add_user(&self, login: &str, id: &str, follows: &[&str]) {
        self.users.write().await.insert(login.to_string(), id.to_string());
        self.follows
            .write()
            .await
            .insert(login.to_string(), follows.iter().map(|f| f.to_string()).collect());
    }

    fn check(&self) -> Result<(), BotError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BotError::status_api("status api unavailable", Some(503)));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusApi for StaticStatus {
    async fn acquire_token(&self) -> Result<(), BotError> {
        self.check()?;
        self.token_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resolve_user_id(&self, login: &str) -> Result<Option<String>, BotError> {
        self.check()?;
        Ok(self.users.read().await.get(login).cloned())
    }

    async fn is_live(&self, _channel: &str) -> Result<bool, BotError> {
        self.check()?;
        Ok(self.live.load(Ordering::SeqCst))
    }

    async fn follow_list(&self, login: &str) -> Result<Option<Vec<String>>, BotError> {
        self.check()?;
        Ok(self.follows.read().await.get(login).cloned())
    }
}

/// Publisher that keeps reports in memory.
#[derive(Default)]
pub struct MemoryPublisher {
    reports: RwLock<HashMap<String, String>>,
    fail: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn report(&self, name: &str) -> Option<String> {
        self.reports.read().await.get(name).cloned()
    }
}

#[async_trait]
impl ReportPublisher for MemoryPublisher {
    async fn publish(&self, name: &str, content: &str) -> Result<(), BotError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BotError::publisher("upload refused"));
        }
        self.reports
            .write()
            .await
            .insert(name.to_string(), content.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn chat(sender: &str, text: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            sender: sender.to_string(),
            user_id: None,
            text: text.to_string(),
            subscriber: false,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            whisper: false,
            raw: format!(":{0}!{0} PRIVMSG #c :{1} {2}", sender, text, secs),
        }
    }

    #[tokio::test]
    async fn test_replayed_ids_are_dropped() {
        let storage = MemoryStorage::new();
        let message = chat("kroom", "hello", 0);
        let id = message.uuid("nambot");

        storage.record_message(&message, id).await.unwrap();
        storage.record_message(&message, id).await.unwrap();

        assert_eq!(storage.message_count("kroom").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queries_over_logged_lines() {
        let storage = MemoryStorage::new();
        for (i, text) in ["first line", "forsen LULW", "last line"].iter().enumerate() {
            let message = chat("kroom", text, i as i64);
            storage.record_message(&message, message.uuid("nambot")).await.unwrap();
        }

        assert_eq!(storage.first_message("kroom").await.unwrap().unwrap().text, "first line");
        assert_eq!(storage.last_message("kroom").await.unwrap().unwrap().text, "last line");
        assert_eq!(storage.search("LINE").await.unwrap(), 2);
        assert_eq!(storage.search_user("kroom", "forsen").await.unwrap(), 1);
        assert_eq!(storage.logs("kroom", 2).await.unwrap().len(), 2);
        assert!(storage.first_message("nobody").await.unwrap().is_none());
        assert!(storage.random_quote("kroom", Some(2015)).await.unwrap().is_none());
        assert!(storage.random_quote("kroom", Some(1970)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_alternate_names_from_either_side() {
        let storage = MemoryStorage::new();
        storage.add_alt("kroom", "kroom2").await.unwrap();
        storage.add_alt("kroom", "kroom3").await.unwrap();

        assert_eq!(storage.alternate_names("kroom").await.unwrap(), vec!["kroom2", "kroom3"]);
        assert_eq!(storage.alternate_names("kroom2").await.unwrap(), vec!["kroom", "kroom3"]);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let storage = MemoryStorage::new();
        storage.set_failing(true);
        let err = storage.mod_list().await.unwrap_err();
        assert!(matches!(err, BotError::Collaborator { code: Some(-1), .. }));
    }
}
