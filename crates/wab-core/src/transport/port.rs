use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    credentials::Credentials,
    domain::{
        ConnectionPhase, DisconnectCode, GroupMetadata, InboundMessage, Jid, ProtocolVersion,
        RoleChange,
    },
    Result,
};

/// Connection-phase notification from the protocol client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub phase: ConnectionPhase,
    /// Disconnect cause, only meaningful for `Closed`.
    pub code: Option<DisconnectCode>,
}

impl ConnectionUpdate {
    pub fn open() -> Self {
        Self {
            phase: ConnectionPhase::Open,
            code: None,
        }
    }

    pub fn closed(code: Option<DisconnectCode>) -> Self {
        Self {
            phase: ConnectionPhase::Closed,
            code,
        }
    }
}

#[derive(Clone, Debug)]
pub enum TransportEvent {
    CredentialsUpdate(Credentials),
    Connection(ConnectionUpdate),
    Messages(Vec<InboundMessage>),
}

/// A freshly opened connection: the control handle plus its event stream.
pub struct Connection {
    pub link: Arc<dyn Link>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Protocol client entry point.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn latest_version(&self) -> Result<ProtocolVersion>;

    async fn connect(&self, credentials: Credentials, version: ProtocolVersion)
        -> Result<Connection>;
}

/// Control surface of one live connection. Only the session controller holds it.
#[async_trait]
pub trait Link: Send + Sync {
    async fn request_pairing_code(&self, phone: &str) -> Result<String>;

    /// Capability-scoped handle handed to the router (send / query / mutate).
    fn chat(&self) -> Arc<dyn ChatPort>;

    async fn close(&self) -> Result<()>;
}

/// Chat operations available to command handlers.
#[async_trait]
pub trait ChatPort: Send + Sync {
    async fn send_text(&self, to: &Jid, text: &str) -> Result<()>;

    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata>;

    async fn group_participants_update(
        &self,
        group: &Jid,
        participants: &[Jid],
        role: RoleChange,
    ) -> Result<()>;
}
