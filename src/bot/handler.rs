// src/bot/handler.rs - Command admission worker and command logic

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::seq::IndexedRandom;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::bot::admission::{AdmissionContext, ModerationState, Verdict};
use crate::bot::commands::{
    clean_name, format_duration, message_without_username, word_list, year, Command, CommandInvocation,
};
use crate::bot::queues::{poll_queue, unexpected, Polled, QueueMessage, QueueReceiver, Queues};
use crate::bot::sender::OutboundFilter;
use crate::bot::state::{SharedState, AUTOBAN_SENDER};
use crate::bot::PipelineService;
use crate::dao::{ReportPublisher, StatusApi, Storage};
use crate::types::{BotError, LoggedLine, Response};

/// Upper bound for a single collaborator call on the command path.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

const TOP_NAMMERS: usize = 10;

type Reply = Result<Option<String>, Response>;

/// Single consumer of the command queue.
pub struct CommandHandlerService {
    rx: QueueReceiver,
    queues: Queues,
    storage: Arc<dyn Storage>,
    status: Arc<dyn StatusApi>,
    publisher: Arc<dyn ReportPublisher>,
    state: Arc<SharedState>,
    poll: Duration,
    query_timeout: Duration,
    moderation: ModerationState,
    operators: HashSet<String>,
    moderators: HashSet<String>,
}

impl CommandHandlerService {
    pub fn new(
        rx: QueueReceiver,
        queues: Queues,
        storage: Arc<dyn Storage>,
        status: Arc<dyn StatusApi>,
        publisher: Arc<dyn ReportPublisher>,
        state: Arc<SharedState>,
        poll: Duration,
    ) -> Self {
        let operators = state.operators();
        Self {
            rx,
            queues,
            storage,
            status,
            publisher,
            moderators: operators.clone(),
            operators,
            state,
            poll,
            query_timeout: QUERY_TIMEOUT,
            moderation: ModerationState::new(Utc::now()),
        }
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    /// Bound a collaborator call and fold its failure into the reply vocabulary.
    async fn query<T, F>(&self, call: F) -> Result<T, Response>
    where
        F: Future<Output = Result<T, BotError>>,
    {
        match timeout(self.query_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                match &e {
                    BotError::Collaborator {
                        collaborator,
                        message,
                        code,
                    } => error!("{} call failed: {}, vendor code: {:?}", collaborator, message, code),
                    other => error!("Command query failed: {}", other),
                }
                Err(Response::InternalError)
            }
            Err(_) => {
                warn!("Command query timed out after {}s", self.query_timeout.as_secs());
                Err(Response::QueryTimeout)
            }
        }
    }

    /// Reload moderators, opted-out users, alt links and the outbound blacklist.
    async fn refresh_lists(&mut self) -> Result<(), BotError> {
        let mods = self.storage.mod_list().await?;
        let disabled = self.storage.disabled_list().await?;
        let alt_pairs = self.storage.alts_list().await?;
        let blacklist = self.storage.blacklist().await?;

        self.operators = self.state.operators();
        self.moderators = self
            .operators
            .iter()
            .cloned()
            .chain(mods.into_iter().map(|m| m.to_lowercase()))
            .collect();

        let mut alts: HashMap<String, Vec<String>> = HashMap::new();
        let mut mains = HashMap::new();
        for (main, alt) in alt_pairs {
            mains.insert(alt.clone(), main.clone());
            mains.entry(main.clone()).or_insert_with(|| main.clone());
            alts.entry(main).or_default().push(alt);
        }

        let filter = OutboundFilter::from_entries(&blacklist);
        info!(
            "Loaded {} moderators, {} disabled users, {} alt groups, {} blacklist patterns",
            self.moderators.len(),
            disabled.len(),
            alts.len(),
            filter.len()
        );

        *self.state.disabled.write().await = disabled;
        *self.state.alts.write().await = alts;
        *self.state.mains.write().await = mains;
        *self.state.outbound_filter.write().await = filter;
        Ok(())
    }

    async fn handle(&mut self, invocation: CommandInvocation) {
        let Some(command) = invocation.command else {
            debug!("Ignoring unknown command from {}", invocation.sender);
            return;
        };
        info!(
            "{} used {} with arguments [{}]",
            invocation.sender, command, invocation.arguments
        );

        let now = Utc::now();
        // The list-membership commands check this after admission has refreshed it.
        let cooldown_passed = self.moderation.cooldown_passed(now);

        let verdict = {
            let disabled = self.state.disabled.read().await;
            let ctx = AdmissionContext {
                bot_name: &self.state.bot_name,
                operators: &self.operators,
                moderators: &self.moderators,
                disabled: &disabled,
                live: self.state.is_online(),
            };
            self.moderation.evaluate(&invocation, command, &ctx, now)
        };

        let admitted = match verdict {
            Verdict::Allow => Ok(()),
            Verdict::Deny(denial) => Err(denial),
            Verdict::Consult => {
                let user_override = self
                    .query(self.storage.personal_permissions(&invocation.sender))
                    .await
                    .ok()
                    .and_then(|permissions| permissions.get(command.name()).copied());
                self.moderation.resolve(&invocation, command, user_override, now)
            }
        };

        if let Err(denial) = admitted {
            info!("{} not allowed to use {}: {:?}", invocation.sender, command, denial);
            if let Some(reply) = denial.reply(&invocation.sender, command) {
                self.queues.reply(reply);
            }
            return;
        }

        match self.dispatch(&invocation, command, cooldown_passed, now).await {
            Ok(Some(reply)) => self.queues.reply(reply),
            Ok(None) => {}
            Err(response) => self.queues.reply(format!("@{}, {}", invocation.sender, response)),
        }
    }

    async fn dispatch(
        &mut self,
        invocation: &CommandInvocation,
        command: Command,
        cooldown_passed: bool,
        now: DateTime<Utc>,
    ) -> Reply {
        let from = invocation.sender.as_str();
        let target = invocation.target();

        match command {
            Command::Nammers => self.top_nammers().await,
            Command::NamPing => Ok(Some(self.ping(now))),
            Command::NamBan => {
                self.moderation.ban(&target, now);
                Ok(Some(format!("Banned {} from using the bot for 1h.", target)))
            }
            Command::Names => self.names(from, &target).await,
            Command::NamRefresh => match self.refresh_lists().await {
                Ok(()) => Ok(Some("Lists refreshed HACKERMANS".to_string())),
                Err(e) => {
                    error!("Failed to refresh lists: {}", e);
                    Err(Response::InternalError)
                }
            },
            Command::NamCommands => Ok(Some(format!(
                "@{}, commands for this bot: {}commands",
                from, self.state.website
            ))),
            Command::NamChoose => Ok(choose(from, &invocation.arguments)),
            Command::Nam => self.nam(from, &target).await,
            Command::LastMessage => {
                self.require_messages(&target).await?;
                let line = self.query(self.storage.last_message(&target)).await?;
                line_reply(from, line)
            }
            Command::FirstMessage => {
                self.require_messages(&target).await?;
                let line = self.query(self.storage.first_message(&target)).await?;
                line_reply(from, line)
            }
            Command::Log => self.logs(from, &target).await,
            Command::Rq => {
                self.require_messages(&target).await?;
                let line = self
                    .query(self.storage.random_quote(&target, year(invocation.arg(1))))
                    .await?;
                line.map(|l| Some(l.to_string())).ok_or(Response::NoMessages)
            }
            Command::Rs => {
                let Some(name) = invocation.arg(0) else {
                    return Ok(None);
                };
                let phrase = message_without_username(&invocation.arguments, name);
                let user = clean_name(from, name);
                let line = self.query(self.storage.random_search(&user, &phrase)).await?;
                line.map(|l| Some(l.to_string())).ok_or(Response::NoMessages)
            }
            Command::AddDisabled => self.add_disabled(from, &target, cooldown_passed).await,
            Command::RemDisabled => self.remove_disabled(from, &target, cooldown_passed).await,
            Command::Fs => {
                let line = self.query(self.storage.first_occurrence(&invocation.arguments)).await?;
                line_reply(from, line)
            }
            Command::Search => {
                if invocation.arguments.is_empty() {
                    return Ok(None);
                }
                match self.query(self.storage.search(&invocation.arguments)).await? {
                    0 => Err(Response::NoMessages),
                    count => Ok(Some(format!(
                        "@{} found {} in {} rows.",
                        from,
                        word_list(&invocation.arguments),
                        count
                    ))),
                }
            }
            Command::SearchUser => {
                let Some(name) = invocation.arg(0) else {
                    return Ok(None);
                };
                let phrase = message_without_username(&invocation.arguments, name);
                let user = clean_name(from, name);
                match self.query(self.storage.search_user(&user, &phrase)).await? {
                    0 => Err(Response::NoMessages),
                    count => Ok(Some(format!(
                        "@{}, {} has used {} in {} messages.",
                        from,
                        user,
                        word_list(&phrase),
                        count
                    ))),
                }
            }
            Command::AddAlt => self.add_alt(invocation).await,
            Command::Sc => self.set_permission(invocation).await,
            Command::LastSeen => match self.query(self.storage.last_seen(&target)).await? {
                Some(seen) => {
                    let ago = (now - seen).num_seconds().max(0) as u64;
                    Ok(Some(format!("{} was last seen {} ago", target, format_duration(ago))))
                }
                None => Err(Response::NoMessages),
            },
            Command::MCount => match self.query(self.storage.message_count(&target)).await? {
                0 => Err(Response::NoMessages),
                count => Ok(Some(format!("@{}, {} has {} logged messages.", from, target, count))),
            },
            Command::StalkList => self.stalk_list(from, &target).await,
        }
    }

    async fn require_messages(&self, username: &str) -> Result<u64, Response> {
        match self.query(self.storage.message_count(username)).await? {
            0 => {
                info!("Did not find any messages for user {}", username);
                Err(Response::NoMessages)
            }
            count => Ok(count),
        }
    }

    async fn top_nammers(&self) -> Reply {
        let top = self.query(self.storage.top_timeouts(TOP_NAMMERS)).await?;
        if top.is_empty() {
            return Ok(None);
        }
        let list: Vec<String> = top
            .iter()
            .map(|(name, seconds)| format!("{}: {}", name, format_duration(*seconds)))
            .collect();
        Ok(Some(format!("Top NaMmers: {}", list.join(" | "))))
    }

    fn ping(&self, now: DateTime<Utc>) -> String {
        let uptime = (now - self.state.started_at).num_seconds().max(0) as u64;
        format!(
            "NamBot online for {} | {} messages sent | {} messages logged | {} timeouts logged, of which {} were permabans.",
            format_duration(uptime),
            self.state.messages_sent(),
            self.state.messages_logged(),
            self.state.timeouts(),
            self.state.permabans()
        )
    }

    async fn names(&self, from: &str, username: &str) -> Reply {
        let names = self.query(self.storage.alternate_names(username)).await?;
        if names.is_empty() {
            return Ok(Some(format!("@{}, no alternate names found in logs PEEPERS", from)));
        }
        Ok(Some(format!(
            "@{}, {}'s other names are: {}",
            from,
            username,
            names.join(", ")
        )))
    }

    async fn nam(&self, from: &str, username: &str) -> Reply {
        let seconds = self.query(self.storage.timeout_amount(username)).await?;
        if seconds == 0 {
            return Ok(None);
        }
        let spent = format_duration(seconds);
        if from == username {
            Ok(Some(format!("@{}, you have spent {} in the shadow realm.", username, spent)))
        } else {
            Ok(Some(format!("{} has spent {} in the shadow realm.", username, spent)))
        }
    }

    async fn logs(&self, from: &str, username: &str) -> Reply {
        let count = self.query(self.storage.message_count(username)).await?;
        if count == 0 {
            info!("Did not find any logs for user {}", username);
            return Err(Response::NoMessages);
        }

        let link = format!(
            "@{} logs for {}: {}{}",
            from, username, self.state.website, username
        );
        if self.state.log_cache.read().await.get(username) == Some(&count) {
            debug!("No change to message count for {}, not republishing", username);
            return Ok(Some(link));
        }

        let lines = self.query(self.storage.logs(username, count as usize)).await?;
        let content = render_lines(&lines);
        self.publish_then_reply(username.to_string(), content, link, Some(count));
        Ok(None)
    }

    async fn stalk_list(&self, from: &str, username: &str) -> Reply {
        let Some(follows) = self.query(self.status.follow_list(username)).await? else {
            info!("No follow list found for {}", username);
            return Ok(Some(format!("@{}, {}", username, Response::NoSuchUser)));
        };
        let name = format!("stalk_{}", username);
        let link = format!(
            "@{} all channels followed by {}: {}{}",
            from, username, self.state.website, name
        );
        self.publish_then_reply(name, follows.join("\n"), link, None);
        Ok(None)
    }

    /// Upload in the background; the link is only sent once the upload succeeded.
    /// Publish in the background. `log_count` is cached for `name` only once
    /// the report is actually up.
    fn publish_then_reply(&self, name: String, content: String, reply: String, log_count: Option<u64>) {
        let publisher = Arc::clone(&self.publisher);
        let queues = self.queues.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let started = Utc::now();
            match publisher.publish(&name, &content).await {
                Ok(()) => {
                    let took = (Utc::now() - started).num_seconds().max(0) as u64;
                    info!("Published {} in {}", name, format_duration(took));
                    if let Some(count) = log_count {
                        state.log_cache.write().await.insert(name, count);
                    }
                    queues.reply(reply);
                }
                Err(e) => error!("Failed to publish {}: {}", name, e),
            }
        });
    }

    async fn add_disabled(&self, from: &str, username: &str, cooldown_passed: bool) -> Reply {
        if self.state.disabled.read().await.contains(username) {
            return Ok(None);
        }
        self.state.disabled.write().await.insert(username.to_string());
        self.query(self.storage.add_disabled(from, username)).await?;
        info!("{} added {} to disabled list", from, username);

        if from != AUTOBAN_SENDER && (self.moderators.contains(from) || cooldown_passed) {
            return Ok(Some(format!("@{}, added {} to ignore list.", from, username)));
        }
        Ok(None)
    }

    async fn remove_disabled(&self, from: &str, username: &str, cooldown_passed: bool) -> Reply {
        if !self.state.disabled.read().await.contains(username) {
            return Ok(None);
        }
        self.state.disabled.write().await.remove(username);
        self.query(self.storage.remove_disabled(username)).await?;
        info!("{} removed {} from disabled list", from, username);

        if self.moderators.contains(from) || cooldown_passed {
            return Ok(Some(format!("@{}, removed {} from ignore list.", from, username)));
        }
        Ok(None)
    }

    async fn add_alt(&self, invocation: &CommandInvocation) -> Reply {
        let (Some(main), Some(alt)) = (invocation.arg(0), invocation.arg(1)) else {
            return Ok(None);
        };
        let main = main.to_lowercase();
        let alt = alt.to_lowercase();

        if self
            .state
            .alts
            .read()
            .await
            .get(&main)
            .is_some_and(|alts| alts.contains(&alt))
        {
            return Ok(None);
        }

        info!("{} adding {} to {}'s alt list", invocation.sender, alt, main);
        self.query(self.storage.add_alt(&main, &alt)).await?;

        {
            let mut mains = self.state.mains.write().await;
            mains.insert(alt.clone(), main.clone());
            mains.entry(main.clone()).or_insert_with(|| main.clone());
        }
        self.state
            .alts
            .write()
            .await
            .entry(main.clone())
            .or_default()
            .push(alt.clone());

        Ok(Some(format!(
            "@{}, added {} as {}'s alt account.",
            invocation.sender, alt, main
        )))
    }

    /// `!sc <user> <command> <true|false>`
    async fn set_permission(&self, invocation: &CommandInvocation) -> Reply {
        let (Some(user), Some(token), Some(flag)) =
            (invocation.arg(0), invocation.arg(1), invocation.arg(2))
        else {
            return Ok(None);
        };
        let Some(command) = Command::from_token(&token.to_lowercase()) else {
            return Ok(None);
        };
        let enabled = match flag.to_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => return Ok(None),
        };
        let user = clean_name(&invocation.sender, user);

        self.query(self.storage.set_command_permission(&user, command.name(), enabled))
            .await?;
        info!("{} set {} for {} to {}", invocation.sender, command, user, enabled);
        Ok(Some(format!(
            "@{}, set {} for {} to {}.",
            invocation.sender, command, user, enabled
        )))
    }
}

fn line_reply(from: &str, line: Option<LoggedLine>) -> Reply {
    match line {
        Some(line) => Ok(Some(format!("@{}, {}", from, line))),
        None => Err(Response::NoMessages),
    }
}

fn choose(from: &str, arguments: &str) -> Option<String> {
    let choices: Vec<&str> = arguments.split_whitespace().collect();
    choices
        .choose(&mut rand::rng())
        .map(|choice| format!("@{}, I choose {}", from, choice))
}

fn render_lines(lines: &[LoggedLine]) -> String {
    lines
        .iter()
        .map(|line| line.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl PipelineService for CommandHandlerService {
    fn name(&self) -> &'static str {
        "command-handler"
    }

    async fn run(mut self: Box<Self>, ready: oneshot::Sender<()>) -> Result<(), BotError> {
        if let Err(e) = self.refresh_lists().await {
            error!("Failed to load lists, continuing with operators only: {}", e);
        }
        info!("{} started", self.name());
        let _ = ready.send(());

        loop {
            match poll_queue(&mut self.rx, self.poll).await {
                Polled::Poisoned => {
                    debug!("{} poisoned", self.name());
                    break;
                }
                Polled::Closed => break,
                Polled::Idle => {}
                Polled::Message(QueueMessage::ChatCommand(invocation)) => self.handle(invocation).await,
                Polled::Message(other) => unexpected(self.name(), &other),
            }
        }

        info!("{} stopped", self.name());
        Ok(())
    }
}
