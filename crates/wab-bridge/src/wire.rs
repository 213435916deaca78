//! NDJSON frames exchanged with the bridge process.

use serde::{Deserialize, Serialize};

use wab_core::{
    credentials::Credentials,
    domain::{ConnectionPhase, DisconnectCode, InboundMessage, Jid, MessageContent, RoleChange},
    transport::port::{ConnectionUpdate, TransportEvent},
};

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub op: RequestOp<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum RequestOp<'a> {
    Connect {
        credentials: &'a Credentials,
        version: String,
    },
    RequestPairingCode {
        phone: &'a str,
    },
    SendMessage {
        jid: &'a str,
        text: &'a str,
    },
    GroupMetadata {
        jid: &'a str,
    },
    GroupParticipantsUpdate {
        jid: &'a str,
        participants: Vec<&'a str>,
        action: RoleChange,
    },
}

impl RequestOp<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            RequestOp::Connect { .. } => "connect",
            RequestOp::RequestPairingCode { .. } => "request_pairing_code",
            RequestOp::SendMessage { .. } => "send_message",
            RequestOp::GroupMetadata { .. } => "group_metadata",
            RequestOp::GroupParticipantsUpdate { .. } => "group_participants_update",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum Frame {
    #[serde(rename = "response")]
    Response {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "creds.update")]
    CredsUpdate { credentials: Credentials },
    #[serde(rename = "connection.update")]
    ConnectionUpdate {
        #[serde(default)]
        connection: Option<String>,
        #[serde(default, rename = "statusCode")]
        status_code: Option<u16>,
    },
    #[serde(rename = "messages.upsert")]
    MessagesUpsert {
        #[serde(default)]
        messages: Vec<WireMessage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMessage {
    key: WireKey,
    #[serde(default)]
    message: Option<WirePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireKey {
    #[serde(default)]
    remote_jid: Option<String>,
    #[serde(default)]
    from_me: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload {
    #[serde(default)]
    conversation: Option<String>,
    #[serde(default)]
    extended_text_message: Option<ExtendedText>,
}

#[derive(Debug, Deserialize)]
struct ExtendedText {
    #[serde(default)]
    text: Option<String>,
}

impl WireMessage {
    fn into_inbound(self) -> Option<InboundMessage> {
        let from = self.key.remote_jid?;
        let content = self.message.map(|m| MessageContent {
            conversation: m.conversation,
            extended_text: m.extended_text_message.and_then(|e| e.text),
        });
        Some(InboundMessage {
            from: Jid::new(from),
            from_me: self.key.from_me,
            content,
        })
    }
}

impl Frame {
    /// Map a non-response frame to a transport event. `None` for frames we ignore.
    pub fn into_event(self) -> Option<TransportEvent> {
        match self {
            Frame::CredsUpdate { credentials } => {
                Some(TransportEvent::CredentialsUpdate(credentials))
            }
            Frame::ConnectionUpdate {
                connection,
                status_code,
            } => {
                let phase = match connection.as_deref()? {
                    "connecting" => ConnectionPhase::Connecting,
                    "open" => ConnectionPhase::Open,
                    "close" => ConnectionPhase::Closed,
                    other => {
                        tracing::debug!(connection = other, "ignoring unknown connection state");
                        return None;
                    }
                };
                Some(TransportEvent::Connection(ConnectionUpdate {
                    phase,
                    code: status_code.map(DisconnectCode),
                }))
            }
            Frame::MessagesUpsert { messages } => {
                let batch: Vec<InboundMessage> = messages
                    .into_iter()
                    .filter_map(WireMessage::into_inbound)
                    .collect();
                (!batch.is_empty()).then_some(TransportEvent::Messages(batch))
            }
            Frame::Response { .. } | Frame::Other => None,
        }
    }
}
