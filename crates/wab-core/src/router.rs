//! Command dispatch: one inbound message in, at most one action out.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    admin::AdminOps,
    audit::{AuditEvent, AuditLogger},
    commands::{extract_text, parse_command, Command},
    console::{OperatorConsole, StatusKind},
    domain::{InboundMessage, Jid},
    formatting::{MENU_TEXT, PONG_TEXT},
    transport::port::ChatPort,
    Result,
};

/// Receiver side of the chat capability published by the session controller.
pub type ChatHandle = watch::Receiver<Option<Arc<dyn ChatPort>>>;

pub struct CommandRouter {
    group_suffix: String,
    admin: AdminOps,
    console: Arc<dyn OperatorConsole>,
    audit: Option<Arc<AuditLogger>>,
}

impl CommandRouter {
    pub fn new(
        group_suffix: impl Into<String>,
        admin: AdminOps,
        console: Arc<dyn OperatorConsole>,
    ) -> Self {
        Self {
            group_suffix: group_suffix.into(),
            admin,
            console,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Parse a message into a command; `None` means "ignore silently".
    pub fn route(&self, msg: &InboundMessage) -> Option<Command> {
        let text = extract_text(msg)?;
        tracing::info!(from = %msg.from, text = %text, "[MSG]");
        parse_command(&msg.from, &text, &self.group_suffix)
    }

    /// Handle one inbound message end to end. Failures never escape.
    pub async fn handle(&self, chat: &dyn ChatPort, msg: InboundMessage) {
        let Some(cmd) = self.route(&msg) else {
            return;
        };

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.write(AuditEvent::command(&msg.from, cmd.verb())) {
                tracing::warn!(error = %e, "audit write failed");
            }
        }

        let verb = cmd.verb();
        if let Err(e) = self.dispatch(chat, &msg.from, cmd).await {
            tracing::warn!(from = %msg.from, verb, error = %e, "command failed");
            self.console.status(
                StatusKind::Failure,
                &format!("!{verb} failed for {}: {e}", msg.from),
            );
        }
    }

    pub async fn dispatch(&self, chat: &dyn ChatPort, from: &Jid, cmd: Command) -> Result<()> {
        match cmd {
            Command::Menu => chat.send_text(from, MENU_TEXT).await,
            Command::Ping => chat.send_text(from, PONG_TEXT).await,
            Command::ListAdmins => self.admin.list_admins(chat, from).await,
            Command::Promote { group, member } => {
                self.admin.promote(chat, &group, &member).await;
                Ok(())
            }
            Command::Demote { group, member } => {
                self.admin.demote(chat, &group, &member).await;
                Ok(())
            }
        }
    }
}

/// Single-consumer dispatch loop.
///
/// Messages are handled one at a time in arrival order, each against the chat
/// capability that is current when it is dequeued.
pub async fn run_dispatch(
    router: Arc<CommandRouter>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    chat: ChatHandle,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };

        let current = chat.borrow().clone();
        let Some(port) = current else {
            tracing::warn!(from = %msg.from, "no live connection; dropping message");
            continue;
        };
        router.handle(port.as_ref(), msg).await;
    }
    tracing::debug!("dispatch loop stopped");
}
