//! LISTEN / NOTIFY command text.
//!
//! Channel names must already be validated identifiers. They are sent as
//! quoted identifiers so the server keeps their case: an unquoted
//! `LISTEN OrderCreated` would listen on `ordercreated` and deliver under
//! that name. Payloads are opaque and embedded as standard SQL string
//! literals, so the only escaping needed is doubling single quotes
//! (`standard_conforming_strings` is on by default since PostgreSQL 9.1,
//! making backslashes literal).

use crate::NotificationRequest;

/// `LISTEN "<channel>"`.
pub fn listen_command(channel: &str) -> String {
    format!("LISTEN {}", quote_identifier(channel))
}

/// `NOTIFY "<channel>"` or `NOTIFY "<channel>", '<payload>'`.
pub fn notify_command(request: &NotificationRequest) -> String {
    let channel = quote_identifier(&request.channel);
    match &request.payload {
        Some(payload) => format!("NOTIFY {}, {}", channel, quote_literal(payload)),
        None => format!("NOTIFY {}", channel),
    }
}

/// Wrap `name` in double quotes, doubling any embedded double quote.
pub fn quote_identifier(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Wrap `value` in single quotes, doubling any embedded quote.
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push('\'');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// A parsed LISTEN / NOTIFY command, used by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Listen(String),
    Notify {
        channel: String,
        payload: Option<String>,
    },
}

impl Command {
    /// Parse command text produced by this module.
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let text = text.trim().trim_end_matches(';');
        let (keyword, rest) = text.split_once(' ')?;

        if keyword.eq_ignore_ascii_case("LISTEN") {
            return parse_identifier(rest.trim()).map(Command::Listen);
        }

        if keyword.eq_ignore_ascii_case("NOTIFY") {
            return match rest.split_once(',') {
                Some((channel, literal)) => Some(Command::Notify {
                    channel: parse_identifier(channel.trim())?,
                    payload: Some(unquote_literal(literal.trim())?),
                }),
                None => Some(Command::Notify {
                    channel: parse_identifier(rest.trim())?,
                    payload: None,
                }),
            };
        }

        None
    }
}

/// Resolve an identifier the way the server does: quoted names keep their
/// case, unquoted names fold to lower case.
pub(crate) fn parse_identifier(token: &str) -> Option<String> {
    if token.starts_with('"') {
        let inner = token.strip_prefix('"')?.strip_suffix('"')?;
        let mut name = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '"' && chars.next() != Some('"') {
                return None;
            }
            name.push(c);
        }
        return (!name.is_empty()).then_some(name);
    }

    (!token.is_empty()).then(|| token.to_ascii_lowercase())
}

/// Inverse of [`quote_literal`]. Rejects unterminated literals and lone quotes.
pub(crate) fn unquote_literal(literal: &str) -> Option<String> {
    let inner = literal.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut value = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        if c == '\'' && chars.next() != Some('\'') {
            return None;
        }
        value.push(c);
    }

    Some(value)
}
