//! Session lifecycle: pairing bootstrap, connect, and the reconnect-vs-terminate decision.
//!
//! The controller is the only owner of the live connection. It publishes a
//! capability-scoped chat handle for the dispatch loop and replaces it on every
//! reconnect; nothing else can swap or close the link.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    console::{OperatorConsole, PromptSource, StatusKind},
    credentials::{CredentialStore, Credentials},
    domain::{ConnectionPhase, DisconnectCode, InboundMessage, ProtocolVersion},
    formatting::{PAIRING_INSTRUCTIONS, PAIRING_QUESTION},
    router::ChatHandle,
    transport::{
        port::{ChatPort, Connection, ConnectionUpdate, Link, Transport, TransportEvent},
        throttled::ThrottledChat,
        timeout::TimeoutChat,
    },
    Result,
};

/// Backoff between reconnect attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive attempts allowed without reaching `Open`; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): doubling, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseDecision {
    Terminate,
    Reconnect,
}

/// Logout is terminal; every other cause, including an unknown one, is transient.
pub fn classify_close(code: Option<DisconnectCode>, logged_out: DisconnectCode) -> CloseDecision {
    match code {
        Some(c) if c == logged_out => CloseDecision::Terminate,
        _ => CloseDecision::Reconnect,
    }
}

/// One logical bot identity for the lifetime of one connect sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub registered: bool,
    pub phase: ConnectionPhase,
    /// Connect sequences started in this process (1 for the first session).
    pub generation: u64,
}

impl Session {
    fn begin(registered: bool, generation: u64) -> Self {
        let phase = if registered {
            ConnectionPhase::Connecting
        } else {
            ConnectionPhase::Bootstrapping
        };
        Self {
            registered,
            phase,
            generation,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    LoggedOut,
    RetriesExhausted { attempts: u32 },
    Shutdown,
}

/// Consumer ends handed to the dispatch side.
pub struct SessionChannels {
    pub chat: ChatHandle,
    pub inbound: mpsc::Receiver<InboundMessage>,
}

#[derive(Debug)]
enum ConnectionEnd {
    LoggedOut,
    Dropped { code: Option<DisconnectCode> },
    Shutdown,
}

pub struct SessionController {
    cfg: Arc<Config>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    console: Arc<dyn OperatorConsole>,
    prompt: Option<Box<dyn PromptSource>>,
    pairing: Option<JoinHandle<()>>,
    chat_tx: watch::Sender<Option<Arc<dyn ChatPort>>>,
    link_tx: watch::Sender<Option<Arc<dyn Link>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    session: Session,
    attempts: u32,
}

impl SessionController {
    pub fn new(
        cfg: Arc<Config>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        console: Arc<dyn OperatorConsole>,
        prompt: Box<dyn PromptSource>,
    ) -> (Self, SessionChannels) {
        let (chat_tx, chat_rx) = watch::channel(None);
        let (link_tx, _) = watch::channel(None);
        let (inbound_tx, inbound_rx) = mpsc::channel(cfg.dispatch_queue_size.max(1));

        let controller = Self {
            cfg,
            transport,
            store,
            console,
            prompt: Some(prompt),
            pairing: None,
            chat_tx,
            link_tx,
            inbound_tx,
            session: Session::begin(false, 0),
            attempts: 0,
        };
        let channels = SessionChannels {
            chat: chat_rx,
            inbound: inbound_rx,
        };
        (controller, channels)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Keep the bot online until logout, retry exhaustion, or cancellation.
    ///
    /// Only a credential-store load failure is returned as an error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<SessionOutcome> {
        let (writer, writer_task) = CredentialWriter::spawn(self.store.clone());

        let outcome = self.drive(&cancel, &writer).await;

        self.publish(None);
        if let Some(pairing) = self.pairing.take() {
            pairing.abort();
        }
        drop(writer);
        if let Err(e) = writer_task.await {
            tracing::warn!(error = %e, "credential writer task failed");
        }
        outcome
    }

    async fn drive(
        &mut self,
        cancel: &CancellationToken,
        writer: &CredentialWriter,
    ) -> Result<SessionOutcome> {
        loop {
            let code = match self.connect_once(cancel, writer).await? {
                ConnectionEnd::LoggedOut => {
                    self.console.status(StatusKind::Failure, "Logged out. Session terminated.");
                    return Ok(SessionOutcome::LoggedOut);
                }
                ConnectionEnd::Shutdown => return Ok(SessionOutcome::Shutdown),
                ConnectionEnd::Dropped { code } => code,
            };

            let attempt = self.attempts + 1;
            if !self.cfg.reconnect.allows(attempt) {
                self.console.status(
                    StatusKind::Failure,
                    &format!("Giving up after {} reconnect attempts", self.attempts),
                );
                return Ok(SessionOutcome::RetriesExhausted {
                    attempts: self.attempts,
                });
            }
            self.attempts = attempt;

            let delay = self.cfg.reconnect.delay_for(attempt);
            tracing::info!(
                code = ?code.map(|c| c.0),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "connection closed; reconnecting"
            );
            self.console.status(StatusKind::Warning, "Reconnecting...");

            tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionOutcome::Shutdown),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One full connect sequence, from credential load to close.
    async fn connect_once(
        &mut self,
        cancel: &CancellationToken,
        writer: &CredentialWriter,
    ) -> Result<ConnectionEnd> {
        // Saves from the previous connection must land before we reload.
        writer.flush().await;
        let credentials = self.store.load().await?;
        self.session = Session::begin(credentials.registered, self.session.generation + 1);
        tracing::debug!(
            generation = self.session.generation,
            registered = self.session.registered,
            "starting session"
        );

        let version = match self.negotiate_version().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "protocol version negotiation failed");
                return Ok(ConnectionEnd::Dropped { code: None });
            }
        };

        let Connection { link, mut events } =
            match self.transport.connect(credentials, version).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "connect failed");
                    return Ok(ConnectionEnd::Dropped { code: None });
                }
            };

        self.publish(Some(link.clone()));
        if !self.session.registered {
            self.start_bootstrap();
        }

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break ConnectionEnd::Shutdown,
                ev = events.recv() => {
                    let Some(ev) = ev else {
                        self.session.phase = ConnectionPhase::Closed;
                        break ConnectionEnd::Dropped { code: None };
                    };
                    if let Some(end) = self.on_event(ev, cancel, writer).await {
                        break end;
                    }
                }
            }
        };

        self.publish(None);
        if let Err(e) = link.close().await {
            tracing::debug!(error = %e, "closing link failed");
        }
        Ok(end)
    }

    async fn negotiate_version(&self) -> Result<ProtocolVersion> {
        match self.cfg.protocol_version {
            Some(v) => Ok(v),
            None => self.transport.latest_version().await,
        }
    }

    async fn on_event(
        &mut self,
        ev: TransportEvent,
        cancel: &CancellationToken,
        writer: &CredentialWriter,
    ) -> Option<ConnectionEnd> {
        match ev {
            TransportEvent::CredentialsUpdate(creds) => {
                self.session.registered = creds.registered;
                writer.save(creds);
                None
            }
            TransportEvent::Connection(update) => self.on_connection_update(update),
            TransportEvent::Messages(msgs) => {
                // A full dispatch queue parks only this event path; shutdown still wins.
                for msg in msgs {
                    tokio::select! {
                        _ = cancel.cancelled() => return Some(ConnectionEnd::Shutdown),
                        sent = self.inbound_tx.send(msg) => {
                            if sent.is_err() {
                                tracing::warn!("dispatch loop is gone; dropping inbound message");
                            }
                        }
                    }
                }
                None
            }
        }
    }

    fn on_connection_update(&mut self, update: ConnectionUpdate) -> Option<ConnectionEnd> {
        self.session.phase = update.phase;
        match update.phase {
            ConnectionPhase::Open => {
                self.attempts = 0;
                tracing::info!(generation = self.session.generation, "connection open");
                self.console.status(StatusKind::Success, "BOT CONNECTED SUCCESSFULLY");
                None
            }
            ConnectionPhase::Closed => {
                match classify_close(update.code, self.cfg.logged_out_code) {
                    CloseDecision::Terminate => Some(ConnectionEnd::LoggedOut),
                    CloseDecision::Reconnect => Some(ConnectionEnd::Dropped { code: update.code }),
                }
            }
            ConnectionPhase::Connecting | ConnectionPhase::Bootstrapping => None,
        }
    }

    /// Start the pairing prompt; runs at most once per process.
    fn start_bootstrap(&mut self) {
        let Some(prompt) = self.prompt.take() else {
            return;
        };
        let links = self.link_tx.subscribe();
        let console = self.console.clone();
        self.pairing = Some(tokio::spawn(pair_device(prompt, links, console)));
    }

    fn publish(&self, link: Option<Arc<dyn Link>>) {
        let chat = link.as_ref().map(|l| {
            let throttled: Arc<dyn ChatPort> =
                Arc::new(ThrottledChat::new(l.chat(), self.cfg.throttle));
            Arc::new(TimeoutChat::new(throttled, self.cfg.call_timeout)) as Arc<dyn ChatPort>
        });
        self.chat_tx.send_replace(chat);
        self.link_tx.send_replace(link);
    }
}

/// Ask the operator for a number, then request a pairing code on the current link.
async fn pair_device(
    prompt: Box<dyn PromptSource>,
    mut links: watch::Receiver<Option<Arc<dyn Link>>>,
    console: Arc<dyn OperatorConsole>,
) {
    let number = match prompt.ask(PAIRING_QUESTION).await {
        Ok(n) => n,
        Err(e) => {
            console.status(StatusKind::Failure, &format!("Pairing prompt failed: {e}"));
            return;
        }
    };
    if number.is_empty() {
        console.status(StatusKind::Failure, "No number entered; pairing skipped");
        return;
    }

    let link = match links.wait_for(Option::is_some).await {
        Ok(current) => (*current).clone(),
        Err(_) => return,
    };
    let Some(link) = link else {
        return;
    };

    match link.request_pairing_code(&number).await {
        Ok(code) => {
            console.status(StatusKind::Info, &format!("PAIRING CODE: {code}"));
            console.status(StatusKind::Info, PAIRING_INSTRUCTIONS);
        }
        Err(e) => {
            console.status(
                StatusKind::Failure,
                &format!("Pairing code request failed: {e}"),
            );
        }
    }
}

enum CredentialOp {
    Save(Credentials),
    Flush(oneshot::Sender<()>),
}

/// Ordered, fire-and-forget credential persistence.
struct CredentialWriter {
    tx: mpsc::UnboundedSender<CredentialOp>,
}

impl CredentialWriter {
    fn spawn(store: Arc<dyn CredentialStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    CredentialOp::Save(creds) => {
                        if let Err(e) = store.save(&creds).await {
                            tracing::warn!(error = %e, "saving credentials failed");
                        }
                    }
                    CredentialOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        (Self { tx }, task)
    }

    fn save(&self, creds: Credentials) {
        if self.tx.send(CredentialOp::Save(creds)).is_err() {
            tracing::warn!("credential writer stopped; update lost");
        }
    }

    async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(CredentialOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::console::{testing::RecordingConsole, PresetPrompt};
    use crate::domain::{GroupMetadata, Jid, RoleChange};
    use crate::errors::Error;
    use crate::transport::throttled::ThrottleConfig;

    const LOGGED_OUT: u16 = 401;

    fn test_config(max_attempts: Option<u32>) -> Arc<Config> {
        Arc::new(Config {
            auth_dir: "/tmp/wab-test-auth".into(),
            pairing_number: None,
            bridge_path: "wa-bridge".into(),
            bridge_args: vec![],
            protocol_version: None,
            user_domain: "s.whatsapp.net".to_string(),
            group_suffix: "@g.us".to_string(),
            logged_out_code: DisconnectCode(LOGGED_OUT),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                max_attempts,
            },
            call_timeout: Duration::from_secs(1),
            dispatch_queue_size: 16,
            throttle: ThrottleConfig {
                global_min_interval: Duration::ZERO,
                per_chat_min_interval: Duration::ZERO,
            },
            audit_log_path: "/tmp/wab-test-audit.log".into(),
            audit_log_json: false,
        })
    }

    #[derive(Default)]
    struct MemoryStore {
        current: Mutex<Credentials>,
        saves: Mutex<Vec<Credentials>>,
    }

    impl MemoryStore {
        fn registered() -> Self {
            let store = Self::default();
            store.current.lock().unwrap().registered = true;
            store
        }

        fn saves(&self) -> Vec<Credentials> {
            self.saves.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn load(&self) -> Result<Credentials> {
            Ok(self.current.lock().unwrap().clone())
        }

        async fn save(&self, credentials: &Credentials) -> Result<()> {
            *self.current.lock().unwrap() = credentials.clone();
            self.saves.lock().unwrap().push(credentials.clone());
            Ok(())
        }
    }

    struct Script {
        events: Vec<TransportEvent>,
        hold_open: bool,
    }

    fn script(events: Vec<TransportEvent>) -> Script {
        Script {
            events,
            hold_open: false,
        }
    }

    fn closed(code: Option<u16>) -> TransportEvent {
        TransportEvent::Connection(ConnectionUpdate::closed(code.map(DisconnectCode)))
    }

    fn open() -> TransportEvent {
        TransportEvent::Connection(ConnectionUpdate::open())
    }

    #[derive(Default)]
    struct FakeTransport {
        scripts: Mutex<VecDeque<Script>>,
        connects: AtomicUsize,
        connected_with: Mutex<Vec<Credentials>>,
        pairing_requests: Arc<Mutex<Vec<String>>>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeTransport {
        fn with_scripts(scripts: Vec<Script>) -> Self {
            let t = Self::default();
            *t.scripts.lock().unwrap() = scripts.into();
            t
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn latest_version(&self) -> Result<ProtocolVersion> {
            Ok(ProtocolVersion([2, 3000, 1]))
        }

        async fn connect(
            &self,
            credentials: Credentials,
            _version: ProtocolVersion,
        ) -> Result<Connection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected_with.lock().unwrap().push(credentials);

            let Some(script) = self.scripts.lock().unwrap().pop_front() else {
                return Err(Error::Transport("connection refused".to_string()));
            };

            let (tx, rx) = mpsc::channel(64);
            for ev in script.events {
                tx.try_send(ev).unwrap();
            }
            let link = FakeLink {
                events: script.hold_open.then_some(tx),
                pairing_requests: self.pairing_requests.clone(),
                closes: self.closes.clone(),
            };
            Ok(Connection {
                link: Arc::new(link),
                events: rx,
            })
        }
    }

    struct FakeLink {
        events: Option<mpsc::Sender<TransportEvent>>,
        pairing_requests: Arc<Mutex<Vec<String>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Link for FakeLink {
        async fn request_pairing_code(&self, phone: &str) -> Result<String> {
            self.pairing_requests.lock().unwrap().push(phone.to_string());
            // The account links, then the server asks for a restart.
            if let Some(tx) = &self.events {
                tx.try_send(TransportEvent::CredentialsUpdate(Credentials {
                    registered: true,
                    state: json!({"me": phone}),
                }))
                .unwrap();
                tx.try_send(closed(Some(515))).unwrap();
            }
            Ok("ABCD-1234".to_string())
        }

        fn chat(&self) -> Arc<dyn ChatPort> {
            Arc::new(NullChat)
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullChat;

    #[async_trait]
    impl ChatPort for NullChat {
        async fn send_text(&self, _to: &Jid, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn group_metadata(&self, _group: &Jid) -> Result<GroupMetadata> {
            Ok(GroupMetadata::default())
        }

        async fn group_participants_update(
            &self,
            _group: &Jid,
            _participants: &[Jid],
            _role: RoleChange,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct TrackingPrompt(Arc<AtomicBool>);

    #[async_trait]
    impl PromptSource for TrackingPrompt {
        async fn ask(self: Box<Self>, _question: &str) -> Result<String> {
            self.0.store(true, Ordering::SeqCst);
            Ok(String::new())
        }
    }

    /// Waits forever, like an operator who never types an answer.
    struct SilentPrompt {
        asked: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for SilentPrompt {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PromptSource for SilentPrompt {
        async fn ask(self: Box<Self>, _question: &str) -> Result<String> {
            self.asked.store(true, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(String::new())
        }
    }

    fn silent_prompt() -> (Box<SilentPrompt>, Arc<AtomicBool>, Arc<AtomicBool>) {
        let asked = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let prompt = SilentPrompt {
            asked: asked.clone(),
            dropped: dropped.clone(),
        };
        (Box::new(prompt), asked, dropped)
    }

    async fn wait_until(flag: &AtomicBool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !flag.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("flag was never set");
    }

    fn controller(
        cfg: Arc<Config>,
        transport: Arc<FakeTransport>,
        store: Arc<MemoryStore>,
        console: Arc<RecordingConsole>,
        prompt: Box<dyn PromptSource>,
    ) -> (SessionController, SessionChannels) {
        SessionController::new(cfg, transport, store, console, prompt)
    }

    #[test]
    fn only_the_logout_code_terminates() {
        let logout = DisconnectCode(LOGGED_OUT);
        assert_eq!(classify_close(Some(logout), logout), CloseDecision::Terminate);
        assert_eq!(
            classify_close(Some(DisconnectCode(428)), logout),
            CloseDecision::Reconnect
        );
        assert_eq!(classify_close(None, logout), CloseDecision::Reconnect);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let p = ReconnectPolicy {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            max_attempts: Some(10),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1000));
        assert_eq!(p.delay_for(3), Duration::from_millis(2000));
        assert_eq!(p.delay_for(4), Duration::from_secs(3));
        assert_eq!(p.delay_for(200), Duration::from_secs(3));
        assert!(p.allows(10));
        assert!(!p.allows(11));
        assert!(ReconnectPolicy::default().allows(u32::MAX));
    }

    #[tokio::test]
    async fn logout_terminates_without_reconnect() {
        let transport = Arc::new(FakeTransport::with_scripts(vec![script(vec![
            open(),
            closed(Some(LOGGED_OUT)),
        ])]));
        let console = Arc::new(RecordingConsole::default());
        let (mut c, channels) = controller(
            test_config(None),
            transport.clone(),
            Arc::new(MemoryStore::registered()),
            console.clone(),
            Box::new(PresetPrompt("1".to_string())),
        );

        let out = c.run(CancellationToken::new()).await.unwrap();

        assert_eq!(out, SessionOutcome::LoggedOut);
        assert_eq!(transport.connects(), 1);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(c.session().phase, ConnectionPhase::Closed);
        assert!(console.contains(StatusKind::Success, "CONNECTED"));
        assert!(channels.chat.borrow().is_none());
    }

    #[tokio::test]
    async fn each_transient_close_triggers_exactly_one_reconnect() {
        let transport = Arc::new(FakeTransport::with_scripts(vec![
            script(vec![open(), closed(Some(500))]),
            // Stream ends without a close event: unknown cause.
            script(vec![open()]),
            script(vec![closed(Some(428))]),
            script(vec![open(), closed(Some(LOGGED_OUT))]),
        ]));
        let console = Arc::new(RecordingConsole::default());
        let (mut c, _channels) = controller(
            test_config(None),
            transport.clone(),
            Arc::new(MemoryStore::registered()),
            console.clone(),
            Box::new(PresetPrompt("1".to_string())),
        );

        let out = c.run(CancellationToken::new()).await.unwrap();

        assert_eq!(out, SessionOutcome::LoggedOut);
        assert_eq!(transport.connects(), 4);
        assert_eq!(c.session().generation, 4);
        let reconnects = console
            .lines()
            .iter()
            .filter(|(k, t)| *k == StatusKind::Warning && t.contains("Reconnecting"))
            .count();
        assert_eq!(reconnects, 3);
    }

    #[tokio::test]
    async fn retry_ceiling_ends_the_session() {
        let transport = Arc::new(FakeTransport::with_scripts(vec![
            script(vec![closed(Some(500))]),
            script(vec![closed(Some(500))]),
            script(vec![closed(Some(500))]),
        ]));
        let (mut c, _channels) = controller(
            test_config(Some(2)),
            transport.clone(),
            Arc::new(MemoryStore::registered()),
            Arc::new(RecordingConsole::default()),
            Box::new(PresetPrompt("1".to_string())),
        );

        let out = c.run(CancellationToken::new()).await.unwrap();

        assert_eq!(out, SessionOutcome::RetriesExhausted { attempts: 2 });
        assert_eq!(transport.connects(), 3);
    }

    #[tokio::test]
    async fn failed_connects_are_transient() {
        let transport = Arc::new(FakeTransport::default());
        let (mut c, _channels) = controller(
            test_config(Some(1)),
            transport.clone(),
            Arc::new(MemoryStore::registered()),
            Arc::new(RecordingConsole::default()),
            Box::new(PresetPrompt("1".to_string())),
        );

        let out = c.run(CancellationToken::new()).await.unwrap();

        assert_eq!(out, SessionOutcome::RetriesExhausted { attempts: 1 });
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test]
    async fn open_resets_the_retry_counter() {
        let transport = Arc::new(FakeTransport::with_scripts(vec![
            script(vec![closed(Some(500))]),
            script(vec![open(), closed(Some(500))]),
            script(vec![closed(Some(500))]),
            script(vec![closed(Some(LOGGED_OUT))]),
        ]));
        let (mut c, _channels) = controller(
            test_config(Some(1)),
            transport.clone(),
            Arc::new(MemoryStore::registered()),
            Arc::new(RecordingConsole::default()),
            Box::new(PresetPrompt("1".to_string())),
        );

        let out = c.run(CancellationToken::new()).await.unwrap();

        // First close uses the only attempt; the open in between resets it.
        assert_eq!(out, SessionOutcome::RetriesExhausted { attempts: 1 });
        assert_eq!(transport.connects(), 3);
    }

    #[tokio::test]
    async fn credential_updates_are_persisted_in_order() {
        let c1 = Credentials {
            registered: true,
            state: json!({"n": 1}),
        };
        let c2 = Credentials {
            registered: true,
            state: json!({"n": 2}),
        };
        let transport = Arc::new(FakeTransport::with_scripts(vec![
            script(vec![
                TransportEvent::CredentialsUpdate(c1.clone()),
                closed(Some(500)),
            ]),
            script(vec![
                TransportEvent::CredentialsUpdate(c2.clone()),
                closed(Some(LOGGED_OUT)),
            ]),
        ]));
        let store = Arc::new(MemoryStore::registered());
        let (mut c, _channels) = controller(
            test_config(None),
            transport.clone(),
            store.clone(),
            Arc::new(RecordingConsole::default()),
            Box::new(PresetPrompt("1".to_string())),
        );

        c.run(CancellationToken::new()).await.unwrap();

        assert_eq!(store.saves(), vec![c1.clone(), c2]);
        // The reconnect loaded what the first connection saved.
        assert_eq!(transport.connected_with.lock().unwrap()[1], c1);
    }

    #[tokio::test]
    async fn messages_are_forwarded_to_the_dispatch_queue() {
        let m1 = InboundMessage::text("1203@g.us", "!ping");
        let m2 = InboundMessage::text("923001234567@s.whatsapp.net", "!menu");
        let transport = Arc::new(FakeTransport::with_scripts(vec![script(vec![
            open(),
            TransportEvent::Messages(vec![m1.clone(), m2.clone()]),
            closed(Some(LOGGED_OUT)),
        ])]));
        let (mut c, mut channels) = controller(
            test_config(None),
            transport,
            Arc::new(MemoryStore::registered()),
            Arc::new(RecordingConsole::default()),
            Box::new(PresetPrompt("1".to_string())),
        );

        c.run(CancellationToken::new()).await.unwrap();

        assert_eq!(channels.inbound.recv().await, Some(m1));
        assert_eq!(channels.inbound.recv().await, Some(m2));
    }

    #[tokio::test]
    async fn registered_identity_never_prompts() {
        let asked = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(FakeTransport::with_scripts(vec![script(vec![
            open(),
            closed(Some(LOGGED_OUT)),
        ])]));
        let (mut c, _channels) = controller(
            test_config(None),
            transport.clone(),
            Arc::new(MemoryStore::registered()),
            Arc::new(RecordingConsole::default()),
            Box::new(TrackingPrompt(asked.clone())),
        );

        c.run(CancellationToken::new()).await.unwrap();
        tokio::task::yield_now().await;

        assert!(!asked.load(Ordering::SeqCst));
        assert!(transport.pairing_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregistered_identity_pairs_once_then_reconnects_registered() {
        let transport = Arc::new(FakeTransport::with_scripts(vec![
            Script {
                events: vec![TransportEvent::Connection(ConnectionUpdate {
                    phase: ConnectionPhase::Connecting,
                    code: None,
                })],
                hold_open: true,
            },
            script(vec![open(), closed(Some(LOGGED_OUT))]),
        ]));
        let store = Arc::new(MemoryStore::default());
        let console = Arc::new(RecordingConsole::default());
        let (mut c, _channels) = controller(
            test_config(None),
            transport.clone(),
            store.clone(),
            console.clone(),
            Box::new(PresetPrompt(" 923001234567 ".to_string())),
        );

        let out = c.run(CancellationToken::new()).await.unwrap();

        assert_eq!(out, SessionOutcome::LoggedOut);
        assert_eq!(
            *transport.pairing_requests.lock().unwrap(),
            vec!["923001234567".to_string()]
        );
        assert!(console.contains(StatusKind::Info, "PAIRING CODE: ABCD-1234"));
        assert_eq!(transport.connects(), 2);

        let connected_with = transport.connected_with.lock().unwrap().clone();
        assert!(!connected_with[0].registered);
        assert!(connected_with[1].registered);
        assert!(c.session().registered);
    }

    #[tokio::test]
    async fn unanswered_pairing_prompt_does_not_hold_up_logout() {
        let transport = Arc::new(FakeTransport::with_scripts(vec![script(vec![
            open(),
            closed(Some(LOGGED_OUT)),
        ])]));
        let (prompt, _asked, dropped) = silent_prompt();
        let (mut c, _channels) = controller(
            test_config(None),
            transport,
            Arc::new(MemoryStore::default()),
            Arc::new(RecordingConsole::default()),
            prompt,
        );

        let out = tokio::time::timeout(Duration::from_secs(5), c.run(CancellationToken::new()))
            .await
            .expect("run waited on the prompt")
            .unwrap();

        assert_eq!(out, SessionOutcome::LoggedOut);
        // The abandoned prompt is released rather than left running.
        wait_until(&dropped).await;
    }

    #[tokio::test]
    async fn unanswered_pairing_prompt_does_not_hold_up_shutdown() {
        let transport = Arc::new(FakeTransport::with_scripts(vec![Script {
            events: vec![TransportEvent::Connection(ConnectionUpdate {
                phase: ConnectionPhase::Connecting,
                code: None,
            })],
            hold_open: true,
        }]));
        let (prompt, asked, dropped) = silent_prompt();
        let (mut c, _channels) = controller(
            test_config(None),
            transport.clone(),
            Arc::new(MemoryStore::default()),
            Arc::new(RecordingConsole::default()),
            prompt,
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            wait_until(&asked).await;
            trigger.cancel();
        });

        let out = tokio::time::timeout(Duration::from_secs(5), c.run(cancel))
            .await
            .expect("shutdown waited on the prompt")
            .unwrap();

        assert_eq!(out, SessionOutcome::Shutdown);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        wait_until(&dropped).await;
    }

    #[tokio::test]
    async fn cancellation_shuts_down_and_closes_the_link() {
        let transport = Arc::new(FakeTransport::with_scripts(vec![Script {
            events: vec![open()],
            hold_open: true,
        }]));
        let (mut c, channels) = controller(
            test_config(None),
            transport.clone(),
            Arc::new(MemoryStore::registered()),
            Arc::new(RecordingConsole::default()),
            Box::new(PresetPrompt("1".to_string())),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut chat = channels.chat.clone();
        tokio::spawn(async move {
            // Cancel once the chat handle has been published.
            let _ = chat.wait_for(Option::is_some).await;
            trigger.cancel();
        });

        let out = c.run(cancel).await.unwrap();

        assert_eq!(out, SessionOutcome::Shutdown);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert!(channels.chat.borrow().is_none());
    }
}
