// src/bot/admission.rs - Layered admission for chat commands
//
// Gates run in a fixed order and the first rejection wins. Time is always passed
// in so the chain stays deterministic under test.

use chrono::{DateTime, Duration, Utc};
use log::info;
use std::collections::{HashMap, HashSet};

use crate::bot::commands::{Command, CommandInvocation};

pub const COOLDOWN_SECONDS: i64 = 10;
pub const BURST_WINDOW_SECONDS: i64 = 300;
pub const BURST_LIMIT: usize = 5;
pub const SPAM_BAN_SECONDS: i64 = 600;
pub const MANUAL_BAN_SECONDS: i64 = 3600;

/// Glob metacharacters the search backend would expand in a username.
pub const WILDCARD_CHARS: [char; 5] = ['*', '?', '~', '{', '['];

/// Identity and shared-list view the gates consult.
pub struct AdmissionContext<'a> {
    pub bot_name: &'a str,
    pub operators: &'a HashSet<String>,
    pub moderators: &'a HashSet<String>,
    pub disabled: &'a HashSet<String>,
    pub live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    AdminOnly,
    Banned,
    Live,
    Cooldown,
    Spam,
    SelfReference,
    Wildcard,
    OptedOut,
    Override,
    Shape,
}

impl Denial {
    /// Chat reply for the denial, if users are told about it.
    pub fn reply(&self, sender: &str, command: Command) -> Option<String> {
        match self {
            Denial::Spam => Some(format!(
                "@{}, stop one man spamming. Banned from using commands for 10 minutes peepoD",
                sender
            )),
            Denial::SelfReference => Some("PepeSpin".to_string()),
            Denial::OptedOut => Some(format!(
                "@{}, that user has been removed from the {} command. Type !adddisabled to remove yourself or !remdisabled to re-enable commands.",
                sender, command
            )),
            _ => None,
        }
    }
}

/// Outcome of the gates that need no storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(Denial),
    /// Gates 1-10 passed; a per-user override decides next.
    Consult,
}

/// Rate-limit and ban state. Owned by the command handler alone.
#[derive(Debug)]
pub struct ModerationState {
    spam_bans: HashMap<String, DateTime<Utc>>,
    manual_bans: HashMap<String, DateTime<Utc>>,
    burst_sender: String,
    burst_times: Vec<DateTime<Utc>>,
    last_command: DateTime<Utc>,
}

impl ModerationState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            spam_bans: HashMap::new(),
            manual_bans: HashMap::new(),
            burst_sender: String::new(),
            burst_times: Vec::new(),
            // The first command after start is never on cooldown.
            last_command: now - Duration::seconds(COOLDOWN_SECONDS * 3),
        }
    }

    pub fn ban(&mut self, username: &str, now: DateTime<Utc>) {
        self.manual_bans.insert(username.to_lowercase(), now);
    }

    pub fn last_command(&self) -> DateTime<Utc> {
        self.last_command
    }

    pub fn cooldown_passed(&self, now: DateTime<Utc>) -> bool {
        now - self.last_command >= Duration::seconds(COOLDOWN_SECONDS)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_command = now;
    }

    /// Gates 1 through 10.
    pub fn evaluate(
        &mut self,
        invocation: &CommandInvocation,
        command: Command,
        ctx: &AdmissionContext<'_>,
        now: DateTime<Utc>,
    ) -> Verdict {
        let sender = invocation.sender.as_str();
        let target = invocation.target();
        let policy = command.policy();
        let is_operator = ctx.operators.contains(sender);
        let opted_out = policy.opt_out && ctx.disabled.contains(&target);

        if is_operator && !opted_out {
            return self.allow(now);
        }

        if policy.admin_only && !is_operator {
            return Verdict::Deny(Denial::AdminOnly);
        }

        if self.is_banned(sender, now) {
            info!("Banned user {} attempted to use {}", sender, command);
            return Verdict::Deny(Denial::Banned);
        }

        if ctx.live && !policy.online {
            info!("Attempted to use {} while stream is online", command);
            return Verdict::Deny(Denial::Live);
        }

        if !self.cooldown_passed(now) && !is_operator && !command.has_own_cooldown() {
            return Verdict::Deny(Denial::Cooldown);
        }

        if self.record_burst(sender, now) {
            info!("{} hit the burst limit, banned for {}s", sender, SPAM_BAN_SECONDS);
            self.spam_bans.insert(sender.to_string(), now);
            return Verdict::Deny(Denial::Spam);
        }

        if target.eq_ignore_ascii_case(ctx.bot_name) {
            return Verdict::Deny(Denial::SelfReference);
        }

        if target.contains(WILDCARD_CHARS) {
            return Verdict::Deny(Denial::Wildcard);
        }

        if opted_out {
            self.last_command = now;
            return Verdict::Deny(Denial::OptedOut);
        }

        if ctx.moderators.contains(sender) {
            return self.allow(now);
        }

        Verdict::Consult
    }

    /// Gates 11 and 12, run after `evaluate` returned `Consult`.
    pub fn resolve(
        &mut self,
        invocation: &CommandInvocation,
        command: Command,
        user_override: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<(), Denial> {
        let allowed = match user_override {
            Some(allowed) => {
                if !allowed {
                    return Err(Denial::Override);
                }
                true
            }
            None => {
                let policy = command.policy();
                if policy.no_args {
                    true
                } else if invocation.target() == invocation.sender {
                    policy.self_allowed
                } else {
                    policy.others_allowed
                }
            }
        };

        if allowed {
            self.last_command = now;
            Ok(())
        } else {
            Err(Denial::Shape)
        }
    }

    fn allow(&mut self, now: DateTime<Utc>) -> Verdict {
        self.last_command = now;
        Verdict::Allow
    }

    /// Ban check with lazy expiry.
    fn is_banned(&mut self, sender: &str, now: DateTime<Utc>) -> bool {
        for (bans, seconds) in [
            (&mut self.spam_bans, SPAM_BAN_SECONDS),
            (&mut self.manual_bans, MANUAL_BAN_SECONDS),
        ] {
            if let Some(since) = bans.get(sender).copied() {
                if now < since + Duration::seconds(seconds) {
                    return true;
                }
                bans.remove(sender);
            }
        }
        false
    }

    /// Track consecutive commands from one sender. True once the window is full.
    fn record_burst(&mut self, sender: &str, now: DateTime<Utc>) -> bool {
        if self.burst_sender != sender {
            self.burst_sender = sender.to_string();
            self.burst_times.clear();
        }
        self.burst_times.push(now);
        self.burst_times
            .retain(|t| now - *t <= Duration::seconds(BURST_WINDOW_SECONDS));
        self.burst_times.len() >= BURST_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Lists {
        operators: HashSet<String>,
        moderators: HashSet<String>,
        disabled: HashSet<String>,
    }

    impl Lists {
        fn new() -> Self {
            let operators: HashSet<String> = ["admin", "forsen", "autoban"].iter().map(|s| s.to_string()).collect();
            let mut moderators = operators.clone();
            moderators.insert("modguy".to_string());
            Self {
                operators,
                moderators,
                disabled: HashSet::new(),
            }
        }

        fn ctx(&self, live: bool) -> AdmissionContext<'_> {
            AdmissionContext {
                bot_name: "nambot",
                operators: &self.operators,
                moderators: &self.moderators,
                disabled: &self.disabled,
                live,
            }
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn invoke(sender: &str, text: &str, secs: i64) -> CommandInvocation {
        let token = text.trim_start_matches('!');
        let (name, args) = token.split_once(' ').unwrap_or((token, ""));
        CommandInvocation {
            sender: sender.to_string(),
            command: Command::from_token(name),
            arguments: args.to_string(),
            received_at: at(secs),
        }
    }

    /// Full chain with no stored overrides.
    fn admit(state: &mut ModerationState, lists: &Lists, sender: &str, text: &str, secs: i64) -> Verdict {
        let invocation = invoke(sender, text, secs);
        let command = invocation.command.unwrap();
        match state.evaluate(&invocation, command, &lists.ctx(false), at(secs)) {
            Verdict::Consult => match state.resolve(&invocation, command, None, at(secs)) {
                Ok(()) => Verdict::Allow,
                Err(denial) => Verdict::Deny(denial),
            },
            verdict => verdict,
        }
    }

    #[test]
    fn test_burst_bans_fifth_attempt_for_600_seconds() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));

        for i in 0..4 {
            assert_eq!(admit(&mut state, &lists, "spammer", "!nam", i * 20), Verdict::Allow);
        }
        assert_eq!(
            admit(&mut state, &lists, "spammer", "!nam", 80),
            Verdict::Deny(Denial::Spam)
        );

        assert_eq!(
            admit(&mut state, &lists, "spammer", "!nam", 80 + 599),
            Verdict::Deny(Denial::Banned)
        );
        assert_eq!(admit(&mut state, &lists, "spammer", "!nam", 80 + 600), Verdict::Allow);
    }

    #[test]
    fn test_other_sender_resets_burst_window() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));

        for i in 0..4 {
            assert_eq!(admit(&mut state, &lists, "kroom", "!nam", i * 20), Verdict::Allow);
        }
        assert_eq!(admit(&mut state, &lists, "other", "!nam", 80), Verdict::Allow);
        assert_eq!(admit(&mut state, &lists, "kroom", "!nam", 100), Verdict::Allow);
    }

    #[test]
    fn test_burst_entries_age_out() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));

        for i in 0..4 {
            assert_eq!(admit(&mut state, &lists, "kroom", "!nam", i * 100), Verdict::Allow);
        }
        // t=0 is older than the window by now
        assert_eq!(admit(&mut state, &lists, "kroom", "!nam", 400), Verdict::Allow);
    }

    #[test]
    fn test_manual_ban_lasts_exactly_an_hour() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));
        state.ban("Kroom", at(0));

        assert_eq!(admit(&mut state, &lists, "kroom", "!nam", 30), Verdict::Deny(Denial::Banned));
        assert_eq!(
            admit(&mut state, &lists, "kroom", "!nam", 3599),
            Verdict::Deny(Denial::Banned)
        );
        assert_eq!(admit(&mut state, &lists, "kroom", "!nam", 3600), Verdict::Allow);
    }

    #[test]
    fn test_operator_bypasses_bans_and_cooldown() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));
        state.ban("admin", at(0));

        assert_eq!(admit(&mut state, &lists, "admin", "!namrefresh", 1), Verdict::Allow);
        assert_eq!(admit(&mut state, &lists, "admin", "!lm forsen", 2), Verdict::Allow);
    }

    #[test]
    fn test_admin_only_outranks_moderator_bypass() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));

        assert_eq!(
            admit(&mut state, &lists, "modguy", "!namrefresh", 0),
            Verdict::Deny(Denial::AdminOnly)
        );
        assert_eq!(admit(&mut state, &lists, "modguy", "!namban kroom", 20), Verdict::Allow);
    }

    #[test]
    fn test_cooldown_and_list_membership_exemption() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));

        assert_eq!(admit(&mut state, &lists, "a", "!nam", 0), Verdict::Allow);
        assert_eq!(admit(&mut state, &lists, "b", "!nam", 5), Verdict::Deny(Denial::Cooldown));
        assert_eq!(admit(&mut state, &lists, "b", "!adddisabled", 6), Verdict::Allow);
        assert_eq!(admit(&mut state, &lists, "c", "!nam", 16), Verdict::Allow);
    }

    #[test]
    fn test_live_gate() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));
        let invocation = invoke("kroom", "!nam", 0);

        assert_eq!(
            state.evaluate(&invocation, Command::Nam, &lists.ctx(true), at(0)),
            Verdict::Deny(Denial::Live)
        );
        let invocation = invoke("kroom", "!log", 0);
        assert_eq!(
            state.evaluate(&invocation, Command::Log, &lists.ctx(true), at(0)),
            Verdict::Consult
        );
    }

    #[test]
    fn test_self_reference_and_wildcards() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));

        let verdict = admit(&mut state, &lists, "kroom", "!nam NamBot", 0);
        assert_eq!(verdict, Verdict::Deny(Denial::SelfReference));
        assert_eq!(
            Denial::SelfReference.reply("kroom", Command::Nam).as_deref(),
            Some("PepeSpin")
        );

        for (i, name) in ["for*", "f?rsen", "~x", "{a}", "[b]"].iter().enumerate() {
            let sender = format!("user{}", i);
            let text = format!("!nam {}", name);
            assert_eq!(
                admit(&mut state, &lists, &sender, &text, 20 * (i as i64 + 1)),
                Verdict::Deny(Denial::Wildcard)
            );
        }
    }

    #[test]
    fn test_opt_out_refreshes_cooldown_and_binds_operators() {
        let mut lists = Lists::new();
        lists.disabled.insert("forsen".to_string());
        let mut state = ModerationState::new(at(0));

        assert_eq!(
            admit(&mut state, &lists, "kroom", "!lm forsen", 0),
            Verdict::Deny(Denial::OptedOut)
        );
        assert_eq!(state.last_command(), at(0));
        assert_eq!(
            admit(&mut state, &lists, "admin", "!rq forsen", 1),
            Verdict::Deny(Denial::OptedOut)
        );
        // Not opt-out eligible, so the disabled list does not apply.
        assert_eq!(admit(&mut state, &lists, "kroom", "!nam forsen", 20), Verdict::Allow);

        let reply = Denial::OptedOut.reply("kroom", Command::LastMessage).unwrap();
        assert!(reply.contains("removed from the lastmessage command"));
    }

    #[test]
    fn test_override_is_authoritative() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));

        let invocation = invoke("kroom", "!fs forsen", 0);
        assert_eq!(
            state.evaluate(&invocation, Command::Fs, &lists.ctx(false), at(0)),
            Verdict::Consult
        );
        assert_eq!(
            state.resolve(&invocation, Command::Fs, Some(true), at(0)),
            Ok(())
        );

        let invocation = invoke("kroom", "!nam", 20);
        assert_eq!(
            state.resolve(&invocation, Command::Nam, Some(false), at(20)),
            Err(Denial::Override)
        );
    }

    #[test]
    fn test_default_shape_rule() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));

        // lastmessage: others only
        assert_eq!(admit(&mut state, &lists, "kroom", "!lm", 0), Verdict::Deny(Denial::Shape));
        assert_eq!(admit(&mut state, &lists, "kroom", "!lm forsen", 20), Verdict::Allow);
        // rs: self only
        assert_eq!(admit(&mut state, &lists, "a", "!rs forsen", 40), Verdict::Deny(Denial::Shape));
        // no flags at all: moderators only
        assert_eq!(admit(&mut state, &lists, "b", "!namban x", 60), Verdict::Deny(Denial::Shape));
        // no_args ignores the target
        assert_eq!(admit(&mut state, &lists, "c", "!search forsen", 80), Verdict::Allow);
    }

    #[test]
    fn test_denials_do_not_refresh_cooldown() {
        let lists = Lists::new();
        let mut state = ModerationState::new(at(0));

        assert_eq!(admit(&mut state, &lists, "kroom", "!nam", 0), Verdict::Allow);
        assert_eq!(admit(&mut state, &lists, "b", "!lm", 20), Verdict::Deny(Denial::Shape));
        assert_eq!(state.last_command(), at(0));
    }
}
