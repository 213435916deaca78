use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    domain::{GroupMetadata, Jid, RoleChange},
    errors::Error,
    transport::port::ChatPort,
    Result,
};

/// ChatPort decorator that bounds every network call.
pub struct TimeoutChat {
    inner: Arc<dyn ChatPort>,
    limit: Duration,
}

impl TimeoutChat {
    pub fn new(inner: Arc<dyn ChatPort>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.limit, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(format!(
                "{what} did not complete within {}ms",
                self.limit.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl ChatPort for TimeoutChat {
    async fn send_text(&self, to: &Jid, text: &str) -> Result<()> {
        self.bounded("send_text", self.inner.send_text(to, text)).await
    }

    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata> {
        self.bounded("group_metadata", self.inner.group_metadata(group)).await
    }

    async fn group_participants_update(
        &self,
        group: &Jid,
        participants: &[Jid],
        role: RoleChange,
    ) -> Result<()> {
        self.bounded(
            "group_participants_update",
            self.inner.group_participants_update(group, participants, role),
        )
        .await
    }
}
