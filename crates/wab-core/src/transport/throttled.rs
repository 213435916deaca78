use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{GroupMetadata, Jid, RoleChange},
    transport::port::ChatPort,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls that target the same conversation.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        self.reserve_at(Instant::now())
    }

    fn reserve_at(&mut self, now: Instant) -> Duration {
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// ChatPort decorator that rate-limits outbound calls.
///
/// Group mutations and metadata queries are keyed by the group address, text
/// sends by the destination conversation.
pub struct ThrottledChat {
    inner: Arc<dyn ChatPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<Jid, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledChat {
    pub fn new(inner: Arc<dyn ChatPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, jid: &Jid) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        // Idle limiters carry no state worth keeping: their next slot is already open.
        let now = Instant::now();
        map.retain(|key, lim| {
            key == jid
                || Arc::strong_count(lim) > 1
                || lim.try_lock().map_or(true, |l| l.next > now)
        });
        map.entry(jid.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, jid: &Jid) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(jid).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl ChatPort for ThrottledChat {
    async fn send_text(&self, to: &Jid, text: &str) -> Result<()> {
        self.throttle_chat(to).await;
        self.inner.send_text(to, text).await
    }

    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata> {
        self.throttle_chat(group).await;
        self.inner.group_metadata(group).await
    }

    async fn group_participants_update(
        &self,
        group: &Jid,
        participants: &[Jid],
        role: RoleChange,
    ) -> Result<()> {
        self.throttle_chat(group).await;
        self.inner
            .group_participants_update(group, participants, role)
            .await
    }
}
