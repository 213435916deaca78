//! Privileged group-role mutations and the admin listing.
//!
//! Mutation failures are reported to the operator console and swallowed here;
//! nothing is sent back into the requesting chat.

use std::sync::Arc;

use crate::{
    audit::{AuditEvent, AuditLogger},
    console::{OperatorConsole, StatusKind},
    domain::{GroupMutationRequest, Jid, RoleChange},
    formatting::format_admin_list,
    transport::port::ChatPort,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    Failed(String),
}

pub struct AdminOps {
    user_domain: String,
    console: Arc<dyn OperatorConsole>,
    audit: Option<Arc<AuditLogger>>,
}

impl AdminOps {
    pub fn new(user_domain: impl Into<String>, console: Arc<dyn OperatorConsole>) -> Self {
        Self {
            user_domain: user_domain.into(),
            console,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub async fn promote(&self, chat: &dyn ChatPort, group: &Jid, member: &str) -> MutationOutcome {
        let req = GroupMutationRequest::new(
            group.clone(),
            member,
            &self.user_domain,
            RoleChange::Promote,
        );
        self.apply(chat, req).await
    }

    pub async fn demote(&self, chat: &dyn ChatPort, group: &Jid, member: &str) -> MutationOutcome {
        let req = GroupMutationRequest::new(
            group.clone(),
            member,
            &self.user_domain,
            RoleChange::Demote,
        );
        self.apply(chat, req).await
    }

    pub async fn apply(&self, chat: &dyn ChatPort, req: GroupMutationRequest) -> MutationOutcome {
        let member = req.participant.user().to_string();
        let res = chat
            .group_participants_update(
                &req.group,
                std::slice::from_ref(&req.participant),
                req.role,
            )
            .await;

        let outcome = match res {
            Ok(()) => {
                let (kind, verb) = match req.role {
                    RoleChange::Promote => (StatusKind::Success, "promoted"),
                    RoleChange::Demote => (StatusKind::Warning, "demoted"),
                };
                tracing::info!(
                    group = %req.group,
                    participant = %req.participant,
                    role = req.role.as_str(),
                    "group mutation applied"
                );
                self.console.status(kind, &format!("Admin {verb}: {member}"));
                MutationOutcome::Applied
            }
            Err(e) => {
                let verb = match req.role {
                    RoleChange::Promote => "Promote",
                    RoleChange::Demote => "Demote",
                };
                tracing::warn!(
                    group = %req.group,
                    participant = %req.participant,
                    role = req.role.as_str(),
                    error = %e,
                    "group mutation failed"
                );
                self.console
                    .status(StatusKind::Failure, &format!("{verb} failed: {e}"));
                MutationOutcome::Failed(e.to_string())
            }
        };

        if let Some(audit) = &self.audit {
            let err = match &outcome {
                MutationOutcome::Applied => None,
                MutationOutcome::Failed(e) => Some(e.as_str()),
            };
            if let Err(e) = audit.write(AuditEvent::mutation(&req, err)) {
                tracing::warn!(path = %audit.path().display(), error = %e, "audit write failed");
            }
        }

        outcome
    }

    /// Reply into `group` with the list of its administrators.
    pub async fn list_admins(&self, chat: &dyn ChatPort, group: &Jid) -> Result<()> {
        let meta = chat.group_metadata(group).await?;
        let text = format_admin_list(&meta.participants);
        chat.send_text(group, &text).await
    }
}
