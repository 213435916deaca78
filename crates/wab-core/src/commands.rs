//! Inbound text → command parsing.

use crate::domain::{InboundMessage, Jid};

/// A parsed chat command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Menu,
    Ping,
    ListAdmins,
    Promote { group: Jid, member: String },
    Demote { group: Jid, member: String },
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Menu => "menu",
            Command::Ping => "ping",
            Command::ListAdmins => "admins",
            Command::Promote { .. } => "promote",
            Command::Demote { .. } => "demote",
        }
    }
}

/// Text body of a message, or `None` when it must be ignored.
///
/// Self-authored echoes and events without a payload are rejected. The plain
/// conversational body wins over the extended body; an empty body counts as absent.
pub fn extract_text(msg: &InboundMessage) -> Option<String> {
    if msg.from_me {
        return None;
    }
    let content = msg.content.as_ref()?;

    let text = content
        .conversation
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(content.extended_text.as_deref())
        .unwrap_or("");
    Some(text.to_string())
}

/// Match a text body against the command grammar.
///
/// Case-sensitive. Anything that does not match, including admin commands
/// with the wrong number of arguments, yields `None`.
pub fn parse_command(from: &Jid, text: &str, group_suffix: &str) -> Option<Command> {
    match text {
        "!menu" => return Some(Command::Menu),
        "!ping" => return Some(Command::Ping),
        "!admins" => {
            return from.is_group(group_suffix).then_some(Command::ListAdmins);
        }
        _ => {}
    }

    if let Some((group, member)) = parse_role_args(text, "!promote") {
        return Some(Command::Promote { group, member });
    }
    if let Some((group, member)) = parse_role_args(text, "!demote") {
        return Some(Command::Demote { group, member });
    }
    None
}

fn parse_role_args(text: &str, verb: &str) -> Option<(Jid, String)> {
    let rest = text.strip_prefix(verb)?;
    // The verb must end at a token boundary.
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let mut tokens = rest.split_whitespace();
    let group = tokens.next()?;
    let member = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }
    Some((Jid::new(group), member.to_string()))
}
