//! Protocol-client adapter backed by a bridge child process.
//!
//! The bridge speaks newline-delimited JSON over stdio: requests carry an `id`
//! and an `op`, and the bridge answers with `response` frames interleaved with
//! unsolicited event frames (`creds.update`, `connection.update`,
//! `messages.upsert`).

mod wire;

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot, Mutex},
};

use wab_core::{
    config::Config,
    credentials::Credentials,
    domain::{GroupMetadata, Jid, ProtocolVersion, RoleChange},
    errors::Error,
    formatting::truncate_text,
    transport::port::{ChatPort, Connection, ConnectionUpdate, Link, Transport, TransportEvent},
    Result,
};

use crate::wire::{Frame, Request, RequestOp};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Capacity of the event channel handed to the session controller. Events
    /// beyond it queue inside the adapter.
    pub event_buffer: usize,
    /// Limit for `connect` and `request_pairing_code`; chat calls are bounded upstream.
    pub call_timeout: Duration,
}

impl BridgeConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            program: cfg.bridge_path.clone(),
            args: cfg.bridge_args.clone(),
            event_buffer: cfg.dispatch_queue_size,
            call_timeout: cfg.call_timeout,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            match self.lines.pop_front() {
                Some(front) => self.bytes = self.bytes.saturating_sub(front.len() + 1),
                None => break,
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[derive(Clone, Debug)]
pub struct BridgeTransport {
    cfg: BridgeConfig,
}

impl BridgeTransport {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self { cfg }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.args);
        cmd
    }
}

impl BridgeTransport {
    async fn query_version(&self) -> Result<ProtocolVersion> {
        let out = self
            .command()
            .arg("--print-version")
            .stdin(Stdio::null())
            .output()
            .await?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::External(format!(
                "{} --print-version exited with status {}: {}",
                self.cfg.program.display(),
                out.status,
                stderr.trim()
            )));
        }
        ProtocolVersion::parse(String::from_utf8_lossy(&out.stdout).trim())
    }

    /// Spawn the bridge and complete the `connect` handshake.
    async fn start(
        &self,
        credentials: Credentials,
        version: ProtocolVersion,
    ) -> Result<(BridgeLink, mpsc::Receiver<TransportEvent>)> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External("bridge stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("bridge stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        let inner = Arc::new(Inner {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending: std::sync::Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
            stderr_tail: Mutex::new(StderrTail::default()),
            call_timeout: self.cfg.call_timeout,
        });

        // Drain stderr in background to avoid blocking on a full pipe.
        if let Some(stderr) = stderr {
            let inner = inner.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tracing::debug!(target: "wab_bridge::stderr", "{line}");
                    inner.stderr_tail.lock().await.push_line(line);
                }
            });
        }

        let (queued_tx, queued_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(self.cfg.event_buffer.max(1));
        tokio::spawn(read_frames(inner.clone(), stdout, queued_tx));
        tokio::spawn(forward_events(queued_rx, events_tx));

        let link = BridgeLink { inner };
        let connect = RequestOp::Connect {
            credentials: &credentials,
            version: version.to_string(),
        };
        if let Err(e) = link.call_bounded(connect).await {
            if let Err(close_e) = link.close().await {
                tracing::debug!(error = %close_e, "closing bridge after failed connect");
            }
            return Err(e);
        }
        tracing::info!(%version, "bridge connected");
        Ok((link, events_rx))
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn latest_version(&self) -> Result<ProtocolVersion> {
        self.query_version().await
    }

    async fn connect(
        &self,
        credentials: Credentials,
        version: ProtocolVersion,
    ) -> Result<Connection> {
        let (link, events) = self.start(credentials, version).await?;
        Ok(Connection {
            link: Arc::new(link),
            events,
        })
    }
}

type Reply = Result<serde_json::Value>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

struct Inner {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: std::sync::Mutex<Pending>,
    next_id: AtomicU64,
    stderr_tail: Mutex<StderrTail>,
    call_timeout: Duration,
}

impl Inner {
    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        // A poisoned map is still a valid map.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, id: u64) -> Result<oneshot::Receiver<Reply>> {
        let mut pending = self.pending();
        if pending.closed {
            return Err(Error::Transport("bridge connection is closed".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(id, tx);
        Ok(rx)
    }

    fn forget(&self, id: u64) {
        self.pending().waiters.remove(&id);
    }

    fn resolve(&self, id: u64, reply: Reply) {
        let waiter = self.pending().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!(id, "response for unknown request"),
        }
    }

    fn fail_all(&self, reason: &str) {
        let waiters = {
            let mut pending = self.pending();
            pending.closed = true;
            std::mem::take(&mut pending.waiters)
        };
        for (_, tx) in waiters {
            let _ = tx.send(Err(Error::Transport(reason.to_string())));
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(Error::Transport("bridge stdin is closed".to_string()));
        };
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn kill_child(&self) -> Result<()> {
        self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return Ok(());
        };

        // If it's already exited, `try_wait` reaps it.
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        match child.kill().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if child.try_wait()?.is_none() {
                    *self.child.lock().await = Some(child);
                    return Err(Error::Io(e));
                }
                Ok(())
            }
        }
    }
}

/// Route stdout frames: responses to their waiters, everything else to the event queue.
///
/// The event queue is unbounded so a slow consumer can never keep a response
/// from reaching its waiter.
async fn read_frames(
    inner: Arc<Inner>,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "bridge stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame: Frame = match serde_json::from_str(&line) {
            Ok(f) => f,
            Err(e) => {
                let line = truncate_text(&line, 200);
                tracing::warn!(error = %e, %line, "unparseable bridge frame");
                continue;
            }
        };

        match frame {
            Frame::Response {
                id,
                ok,
                result,
                error,
            } => {
                let reply = if ok {
                    Ok(result)
                } else {
                    Err(Error::Transport(
                        error.unwrap_or_else(|| "bridge request failed".to_string()),
                    ))
                };
                inner.resolve(id, reply);
            }
            other => {
                if let Some(ev) = other.into_event() {
                    if events.send(ev).is_err() {
                        tracing::debug!("event consumer is gone; dropping bridge event");
                    }
                }
            }
        }
    }

    inner.fail_all("bridge stdout closed");
    let stderr = inner.stderr_tail.lock().await.snapshot();
    if stderr.trim().is_empty() {
        tracing::info!("bridge stream ended");
    } else {
        tracing::warn!(stderr = %stderr, "bridge stream ended");
    }
    // Cause unknown: the session controller treats this as transient.
    let _ = events.send(TransportEvent::Connection(ConnectionUpdate::closed(None)));
}

/// Hand queued events to the bounded channel the session controller reads.
async fn forward_events(
    mut queued: mpsc::UnboundedReceiver<TransportEvent>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(ev) = queued.recv().await {
        if events.send(ev).await.is_err() {
            break;
        }
    }
}

/// Removes the waiter when a call ends before its response, e.g. on timeout.
struct WaiterGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.inner.forget(self.id);
    }
}

/// Handle to one running bridge process.
#[derive(Clone)]
pub struct BridgeLink {
    inner: Arc<Inner>,
}

impl BridgeLink {
    async fn call(&self, op: RequestOp<'_>) -> Result<serde_json::Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let name = op.name();
        let line = serde_json::to_string(&Request { id, op })?;

        let rx = self.inner.register(id)?;
        let _waiter = WaiterGuard {
            inner: &self.inner,
            id,
        };
        self.inner.write_line(&line).await?;
        tracing::debug!(id, op = name, "bridge request sent");

        rx.await
            .map_err(|_| Error::Transport(format!("bridge dropped request {name}")))?
    }

    async fn call_bounded(&self, op: RequestOp<'_>) -> Result<serde_json::Value> {
        let name = op.name();
        let limit = self.inner.call_timeout;
        match tokio::time::timeout(limit, self.call(op)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(format!(
                "bridge {name} did not complete within {}ms",
                limit.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl Link for BridgeLink {
    async fn request_pairing_code(&self, phone: &str) -> Result<String> {
        let v = self
            .call_bounded(RequestOp::RequestPairingCode { phone })
            .await?;
        v.as_str()
            .map(str::to_string)
            .or_else(|| v.get("code").and_then(|c| c.as_str()).map(str::to_string))
            .ok_or_else(|| Error::Transport("pairing response carried no code".to_string()))
    }

    fn chat(&self) -> Arc<dyn ChatPort> {
        Arc::new(self.clone())
    }

    async fn close(&self) -> Result<()> {
        self.inner.fail_all("bridge connection closed");
        self.inner.kill_child().await
    }
}

#[async_trait]
impl ChatPort for BridgeLink {
    async fn send_text(&self, to: &Jid, text: &str) -> Result<()> {
        self.call(RequestOp::SendMessage {
            jid: to.as_str(),
            text,
        })
        .await?;
        Ok(())
    }

    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata> {
        let v = self
            .call(RequestOp::GroupMetadata {
                jid: group.as_str(),
            })
            .await?;
        Ok(serde_json::from_value(v)?)
    }

    async fn group_participants_update(
        &self,
        group: &Jid,
        participants: &[Jid],
        role: RoleChange,
    ) -> Result<()> {
        self.call(RequestOp::GroupParticipantsUpdate {
            jid: group.as_str(),
            participants: participants.iter().map(Jid::as_str).collect(),
            action: role,
        })
        .await?;
        Ok(())
    }
}
