// src/bot/commands.rs - Command vocabulary, policy table and invocation parsing

use chrono::{DateTime, Utc};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::types::ChatMessage;

pub const COMMAND_PREFIX: char = '!';

/// Invisible tag character some chat clients append to defeat duplicate-message filters.
const INVISIBLE_TAG: char = '\u{E0000}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Nammers,
    NamPing,
    Names,
    NamRefresh,
    NamCommands,
    NamChoose,
    Nam,
    LastMessage,
    FirstMessage,
    Log,
    Rq,
    Rs,
    AddDisabled,
    RemDisabled,
    Fs,
    Search,
    SearchUser,
    AddAlt,
    NamBan,
    Sc,
    LastSeen,
    MCount,
    StalkList,
}

/// What an invocation of a command is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Policy {
    /// Usable while the channel is live
    pub online: bool,
    pub self_allowed: bool,
    pub others_allowed: bool,
    pub admin_only: bool,
    /// Target users can opt out of it
    pub opt_out: bool,
    /// Needs no target argument
    pub no_args: bool,
}

const ONLINE: u8 = 1;
const SELF: u8 = 1 << 1;
const OTHERS: u8 = 1 << 2;
const ADMIN_ONLY: u8 = 1 << 3;
const OPT_OUT: u8 = 1 << 4;
const NO_ARGS: u8 = 1 << 5;

const fn flags(bits: u8) -> Policy {
    Policy {
        online: bits & ONLINE != 0,
        self_allowed: bits & SELF != 0,
        others_allowed: bits & OTHERS != 0,
        admin_only: bits & ADMIN_ONLY != 0,
        opt_out: bits & OPT_OUT != 0,
        no_args: bits & NO_ARGS != 0,
    }
}

/// Policy per command. Commands without flags are moderator-only in practice.
static POLICY_TABLE: &[(Command, Policy)] = &[
    (Command::Nammers, flags(NO_ARGS)),
    (Command::NamPing, flags(NO_ARGS)),
    (Command::Names, flags(ONLINE | SELF | OTHERS)),
    (Command::NamRefresh, flags(ADMIN_ONLY)),
    (Command::NamCommands, flags(ADMIN_ONLY)),
    (Command::NamChoose, flags(NO_ARGS)),
    (Command::Nam, flags(SELF | OTHERS)),
    (Command::LastMessage, flags(OTHERS | OPT_OUT)),
    (Command::FirstMessage, flags(SELF | OTHERS | OPT_OUT)),
    (Command::Log, flags(ONLINE | SELF | OTHERS)),
    (Command::Rq, flags(SELF | OTHERS | OPT_OUT)),
    (Command::Rs, flags(SELF | OPT_OUT)),
    (Command::AddDisabled, flags(SELF)),
    (Command::RemDisabled, flags(SELF)),
    (Command::Fs, flags(0)),
    (Command::Search, flags(NO_ARGS)),
    (Command::SearchUser, flags(SELF | OTHERS)),
    (Command::AddAlt, flags(0)),
    (Command::NamBan, flags(0)),
    (Command::Sc, flags(ADMIN_ONLY)),
    (Command::LastSeen, flags(ONLINE | OTHERS)),
    (Command::MCount, flags(ONLINE | SELF | OTHERS)),
    (Command::StalkList, flags(SELF | OTHERS)),
];

/// Chat token to command. Aliases share their target's policy.
static TOKEN_TABLE: &[(&str, Command)] = &[
    ("nammers", Command::Nammers),
    ("namping", Command::NamPing),
    ("names", Command::Names),
    ("namrefresh", Command::NamRefresh),
    ("namcommands", Command::NamCommands),
    ("namchoose", Command::NamChoose),
    ("nam", Command::Nam),
    ("lastmessage", Command::LastMessage),
    ("lm", Command::LastMessage),
    ("firstmessage", Command::FirstMessage),
    ("fm", Command::FirstMessage),
    ("log", Command::Log),
    ("logs", Command::Log),
    ("rq", Command::Rq),
    ("rs", Command::Rs),
    ("adddisabled", Command::AddDisabled),
    ("remdisabled", Command::RemDisabled),
    ("fs", Command::Fs),
    ("search", Command::Search),
    ("searchuser", Command::SearchUser),
    ("addalt", Command::AddAlt),
    ("namban", Command::NamBan),
    ("sc", Command::Sc),
    ("lastseen", Command::LastSeen),
    ("ls", Command::LastSeen),
    ("mcount", Command::MCount),
    ("stalklist", Command::StalkList),
];

impl Command {
    pub fn from_token(token: &str) -> Option<Command> {
        TOKEN_TABLE
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, command)| *command)
    }

    pub fn policy(self) -> Policy {
        POLICY_TABLE
            .iter()
            .find(|(command, _)| *command == self)
            .map(|(_, policy)| *policy)
            .unwrap_or_default()
    }

    /// Canonical chat name, also the key for per-user overrides.
    pub fn name(self) -> &'static str {
        TOKEN_TABLE
            .iter()
            .find(|(_, command)| *command == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// List-membership commands run their own cooldown rule.
    pub fn has_own_cooldown(self) -> bool {
        matches!(self, Command::AddDisabled | Command::RemDisabled)
    }

    pub fn all() -> impl Iterator<Item = Command> {
        POLICY_TABLE.iter().map(|(command, _)| *command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One `!command args` line from chat.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInvocation {
    pub sender: String,
    /// `None` when the token is not a known command
    pub command: Option<Command>,
    pub arguments: String,
    pub received_at: DateTime<Utc>,
}

impl CommandInvocation {
    /// Build from a chat message; `None` if the text is not command-shaped.
    pub fn parse(message: &ChatMessage) -> Option<Self> {
        let cleaned: String = message.text.chars().filter(|c| *c != INVISIBLE_TAG).collect();
        let body = cleaned.trim().strip_prefix(COMMAND_PREFIX)?;

        let (token, arguments) = match body.split_once(char::is_whitespace) {
            Some((token, rest)) => (token, rest.trim()),
            None => (body, ""),
        };
        if token.is_empty() {
            return None;
        }

        Some(Self {
            sender: message.sender.to_lowercase(),
            command: Command::from_token(&token.to_lowercase()),
            arguments: arguments.to_string(),
            received_at: message.timestamp,
        })
    }

    /// Whitespace-separated argument by position.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.arguments.split_whitespace().nth(index)
    }

    /// The user a command is about: first argument, else the sender.
    pub fn target(&self) -> String {
        let raw = self.arg(0).unwrap_or(&self.sender);
        clean_name(&self.sender, raw)
    }
}

/// Strip one leading `@`, map `me` to the sender and lowercase.
pub fn clean_name(sender: &str, name: &str) -> String {
    let name = name.strip_prefix('@').unwrap_or(name);
    if name.eq_ignore_ascii_case("me") {
        return sender.to_lowercase();
    }
    name.to_lowercase()
}

/// Arguments with the leading username removed.
pub fn message_without_username(arguments: &str, username: &str) -> String {
    let trimmed = arguments.trim_start();
    trimmed
        .strip_prefix(username)
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

/// A four-digit year after 2000, used to narrow quote searches.
pub fn year(argument: Option<&str>) -> Option<i32> {
    let candidate = argument?;
    if candidate.len() != 4 {
        return None;
    }
    candidate.parse::<i32>().ok().filter(|y| *y > 2000)
}

/// Search terms as users see them echoed back: quoted phrases stay whole.
pub fn word_list(phrase: &str) -> String {
    static WORDS: OnceLock<Option<Regex>> = OnceLock::new();
    let cleaned: String = phrase
        .chars()
        .filter(|c| !matches!(c, ':' | '~' | '!' | '(' | ')' | '^' | '|' | '&'))
        .collect();

    let words: Vec<&str> = match WORDS.get_or_init(|| Regex::new(r#"([^"]\S*|".+?")\s*"#).ok()) {
        Some(re) => re
            .captures_iter(&cleaned)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect(),
        None => cleaned.split_whitespace().collect(),
    };
    words.join(", ")
}

/// `1d2h3m4s` style duration; zero components are skipped.
pub fn format_duration(total_seconds: u64) -> String {
    if total_seconds == 0 {
        return "0s".to_string();
    }
    let days = total_seconds / 86_400;
    let hours = total_seconds % 86_400 / 3_600;
    let minutes = total_seconds % 3_600 / 60;
    let seconds = total_seconds % 60;

    let mut out = String::new();
    for (value, unit) in [(days, 'd'), (hours, 'h'), (minutes, 'm'), (seconds, 's')] {
        if value > 0 {
            out.push_str(&value.to_string());
            out.push(unit);
        }
    }
    out
}
