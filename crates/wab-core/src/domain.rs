use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Conversation / participant address (`user@server`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(pub String);

impl Jid {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Build a participant address from a bare number and a server domain.
    pub fn for_user(number: &str, domain: &str) -> Self {
        Self(format!("{number}@{domain}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Group conversations are recognized by their address suffix (`@g.us`).
    pub fn is_group(&self, group_suffix: &str) -> bool {
        self.0.ends_with(group_suffix)
    }

    /// The part before the first `@` (the bare number for user addresses).
    pub fn user(&self) -> &str {
        self.0.split('@').next().unwrap_or("")
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status code attached to a connection close.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DisconnectCode(pub u16);

impl fmt::Display for DisconnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Bootstrapping,
    Connecting,
    Open,
    Closed,
}

/// Direction of an administrator-status mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleChange {
    Promote,
    Demote,
}

impl RoleChange {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleChange::Promote => "promote",
            RoleChange::Demote => "demote",
        }
    }
}

/// Text payload of an inbound message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageContent {
    /// Plain conversational body.
    pub conversation: Option<String>,
    /// Body of an extended (rich) text message.
    pub extended_text: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: Jid,
    pub from_me: bool,
    pub content: Option<MessageContent>,
}

impl InboundMessage {
    pub fn text(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: Jid::new(from),
            from_me: false,
            content: Some(MessageContent {
                conversation: Some(text.into()),
                extended_text: None,
            }),
        }
    }
}

/// A single role change, consumed once by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMutationRequest {
    pub group: Jid,
    pub participant: Jid,
    pub role: RoleChange,
}

impl GroupMutationRequest {
    pub fn new(group: Jid, member_number: &str, user_domain: &str, role: RoleChange) -> Self {
        Self {
            group,
            participant: Jid::for_user(member_number, user_domain),
            role,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminRole {
    Admin,
    SuperAdmin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub id: Jid,
    #[serde(default)]
    pub admin: Option<AdminRole>,
}

impl GroupParticipant {
    pub fn is_admin(&self) -> bool {
        self.admin.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    #[serde(default)]
    pub participants: Vec<GroupParticipant>,
}

/// Protocol version negotiated before connecting (`major.minor.patch`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion(pub [u32; 3]);

impl ProtocolVersion {
    pub fn parse(s: &str) -> Result<Self> {
        let parts = s
            .trim()
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Transport(format!("invalid protocol version {s:?}: {e}")))?;
        match parts.as_slice() {
            [a, b, c] => Ok(Self([*a, *b, *c])),
            _ => Err(Error::Transport(format!(
                "invalid protocol version {s:?}: expected three components"
            ))),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a}.{b}.{c}")
    }
}
