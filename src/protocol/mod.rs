// src/protocol/mod.rs - Tag-prefixed IRC line decoder
//
// Format: [@tag=value;tag2=value2 ][:source ]COMMAND [middle params][ :trailing]
//
// Decoding never fails. A malformed line degrades to whatever fields could be
// read in one forward scan.

use std::collections::HashMap;

/// Structured form of one raw protocol line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedEvent {
    pub tags: HashMap<String, String>,
    /// `nick!user@host`, or empty
    pub source: String,
    /// Command token plus any middle parameters, e.g. `PRIVMSG #channel`
    pub command: String,
    /// Free-text tail after the first `:` following the command
    pub params: String,
}

impl DecodedEvent {
    /// First token of the command block, e.g. `PRIVMSG` out of `PRIVMSG #channel`.
    pub fn command_name(&self) -> &str {
        self.command.split_whitespace().next().unwrap_or("")
    }

    /// Middle parameters after the command token.
    pub fn middle(&self) -> impl Iterator<Item = &str> {
        self.command.split_whitespace().skip(1)
    }

    /// Nick part of the source.
    pub fn name(&self) -> &str {
        match self.source.find('!') {
            Some(i) => &self.source[..i],
            None => &self.source,
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Decode a raw line. Trailing CR/LF is ignored.
pub fn decode(line: &str) -> DecodedEvent {
    let mut rest = line.trim_end_matches(['\r', '\n']);
    let mut event = DecodedEvent::default();

    if let Some(tagged) = rest.strip_prefix('@') {
        let (block, after) = split_at_space(tagged);
        event.tags = parse_tags(block);
        rest = after;
    }

    if let Some(sourced) = rest.strip_prefix(':') {
        let (block, after) = split_at_space(sourced);
        event.source = block.to_string();
        rest = after;
    }

    match rest.find(':') {
        Some(i) => {
            event.command = rest[..i].trim().to_string();
            event.params = rest[i + 1..].to_string();
        }
        None => {
            event.command = rest.trim().to_string();
        }
    }

    event
}

fn split_at_space(s: &str) -> (&str, &str) {
    match s.find(' ') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    }
}

fn parse_tags(block: &str) -> HashMap<String, String> {
    block
        .split(';')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.split_once('=') {
            Some((key, value)) => (key.to_string(), unescape_tag_value(value)),
            None => (segment.to_string(), String::new()),
        })
        .collect()
}

/// IRCv3 tag value unescaping: `\:` `\s` `\\` `\r` `\n`.
fn unescape_tag_value(value: &str) -> String {
    if !value.contains('\\') {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
