//! Worker sessions on the coordinator.
//!
//! A session is the TCP lifetime of one authenticated worker. It runs three
//! cooperating tasks: a reader pumping wire messages into the session
//! mailbox, a writer draining an outbound queue, and a dispatcher that owns
//! all session state. The `outstanding` request map is touched only by the
//! dispatcher; work arriving from other tasks (HTTP build requests, cache
//! arrivals) is posted onto the mailbox instead of locking.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use batt_common::conn::{Conn, ConnError, ConnReader, ConnWriter};
use batt_common::message::{Message, ParseError};
use rand::RngCore;
use thiserror::Error;
use tokio::fs::File;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};

use crate::AppContext;
use crate::cache;

/// How long an unauthenticated connection may sit before it is booted.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinator-side heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

const OUTBOUND_BUFFER: usize = 32;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque 128-bit token correlating a build request across the wire,
/// rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle(String);

impl Handle {
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A build handed off to exactly one worker session. The reply slot is a
/// oneshot, so at-most-one delivery holds by construction.
pub struct BuildRequest {
    pub handle: Handle,
    pub package: String,
    pub platform: String,
    reply: oneshot::Sender<BuildResult>,
}

impl BuildRequest {
    pub fn new(
        package: impl Into<String>,
        platform: impl Into<String>,
    ) -> (Self, oneshot::Receiver<BuildResult>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                handle: Handle::new(),
                package: package.into(),
                platform: platform.into(),
                reply,
            },
            rx,
        )
    }

    fn respond(self, result: BuildResult) {
        // The HTTP handler may have given up already; that is fine.
        let _ = self.reply.send(result);
    }
}

pub type BuildResult = Result<Artifact, BuildError>;

/// A successful build: the open cache entry plus the name the binary should
/// be delivered under.
#[derive(Debug)]
pub struct Artifact {
    pub file: File,
    pub filename: String,
}

#[derive(Debug, Error)]
pub enum BuildError {
    /// The worker's fetch-and-build failed; carries its error text.
    #[error("{0}")]
    Remote(String),
    #[error("worker disconnected")]
    WorkerDisconnected,
    #[error("missing expected sha1 file")]
    MissingCacheEntry,
    #[error("malformed result from worker")]
    MalformedResult,
    #[error("build request timed out")]
    DeadlineExceeded,
}

/// Everything the dispatcher multiplexes.
pub enum SessionEvent {
    /// Inbound wire message from the reader task.
    Wire(Message),
    /// Build request handed over from the HTTP side.
    Request(BuildRequest),
    /// A subscribed SHA-1 arrived in the cache; deliver to its request.
    Deliver {
        handle: String,
        sha1: String,
        filename: String,
    },
    /// Reader or writer hit a terminal condition.
    Closed(CloseReason),
}

/// Why a session ended. Rendered into the disconnect log line.
#[derive(Debug, Error)]
pub enum CloseReason {
    #[error("login-timeout")]
    LoginTimeout,
    #[error("speaking-while-unauthenticated")]
    Unauthenticated,
    #[error("bad-password")]
    BadPassword,
    #[error("protocol-error: {0}")]
    Protocol(ParseError),
    #[error("protocol-error: record too long")]
    OversizeRecord,
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("transport error: {0}")]
    Transport(std::io::Error),
}

impl From<ConnError> for CloseReason {
    fn from(err: ConnError) -> Self {
        match err {
            ConnError::Closed => Self::PeerClosed,
            ConnError::Oversize => Self::OversizeRecord,
            ConnError::Protocol(e) => Self::Protocol(e),
            ConnError::Io(e) => Self::Transport(e),
        }
    }
}

/// Cheap, cloneable reference to a live session: what the registry stores
/// and what the HTTP side submits builds through.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    addr: SocketAddr,
    platforms: Arc<Vec<String>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    fn new(
        addr: SocketAddr,
        platforms: Vec<String>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            platforms: Arc::new(platforms),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    /// Hand a build request to this session's dispatcher. Returns false if
    /// the session is already gone; the request's reply slot is dropped and
    /// the waiter observes a disconnect.
    pub fn submit(&self, request: BuildRequest) -> bool {
        self.events.send(SessionEvent::Request(request)).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(platforms: &[&str]) -> Self {
        let (events, _rx) = mpsc::unbounded_channel();
        Self::new(
            "127.0.0.1:0".parse().expect("literal addr"),
            platforms.iter().map(|p| p.to_string()).collect(),
            events,
        )
    }
}

/// Accept loop for the worker TCP listener: one session task per connection.
pub async fn accept_workers(listener: TcpListener, ctx: AppContext) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(handle_conn(stream, addr, ctx));
            }
            Err(err) => warn!(%err, "worker accept error"),
        }
    }
}

/// Drive one worker connection from accept to teardown.
pub async fn handle_conn(stream: TcpStream, addr: SocketAddr, ctx: AppContext) {
    info!(%addr, "worker connected");
    let reason = run_session(stream, addr, &ctx).await;
    info!(%addr, %reason, "worker disconnected");
}

async fn run_session(stream: TcpStream, addr: SocketAddr, ctx: &AppContext) -> CloseReason {
    let mut conn = Conn::new(stream);

    let hello = match authenticate(&mut conn, &ctx.secret).await {
        Ok(m) => m,
        Err(reason) => return reason,
    };
    if let Err(err) = conn.write(&Message::new("hello")).await {
        return err.into();
    }
    let platforms: Vec<String> = hello.values("p").to_vec();
    info!(%addr, ?platforms, "worker authenticated");

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (reader, writer) = conn.split();
    let read_task = tokio::spawn(read_loop(reader, events_tx.clone()));
    let write_task = tokio::spawn(write_loop(writer, out_rx, events_tx.clone()));

    let session = SessionHandle::new(addr, platforms, events_tx);
    ctx.registry.register(&session);

    let mut dispatcher = Dispatcher {
        session: session.clone(),
        out: out_tx,
        outstanding: HashMap::new(),
        ctx: ctx.clone(),
    };
    let reason = dispatcher.run(&mut events_rx).await;

    ctx.registry.unregister(&session);
    dispatcher.fail_outstanding();
    read_task.abort();
    write_task.abort();
    reason
}

/// First message must be `hello` carrying the shared secret, within
/// [`AUTH_TIMEOUT`] of accept.
async fn authenticate(conn: &mut Conn, secret: &str) -> Result<Message, CloseReason> {
    let first = match timeout(AUTH_TIMEOUT, conn.read()).await {
        Err(_) => return Err(CloseReason::LoginTimeout),
        Ok(Err(err)) => return Err(err.into()),
        Ok(Ok(m)) => m,
    };
    if first.verb != "hello" {
        return Err(CloseReason::Unauthenticated);
    }
    if first.get("k") != Some(secret) {
        return Err(CloseReason::BadPassword);
    }
    Ok(first)
}

async fn read_loop(mut reader: ConnReader<TcpStream>, events: mpsc::UnboundedSender<SessionEvent>) {
    loop {
        match reader.read().await {
            Ok(m) => {
                if events.send(SessionEvent::Wire(m)).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = events.send(SessionEvent::Closed(err.into()));
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: ConnWriter<TcpStream>,
    mut out: mpsc::Receiver<Message>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(m) = out.recv().await {
        if let Err(err) = writer.write(&m).await {
            let _ = events.send(SessionEvent::Closed(err.into()));
            return;
        }
    }
}

/// Serializes all mutation of a session's outstanding-request map.
struct Dispatcher {
    session: SessionHandle,
    out: mpsc::Sender<Message>,
    outstanding: HashMap<String, BuildRequest>,
    ctx: AppContext,
}

impl Dispatcher {
    async fn run(&mut self, events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> CloseReason {
        let mut heartbeat = interval_at(
            Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    // Writer teardown surfaces as a Closed event; a failed
                    // send here needs no separate handling.
                    let _ = self.out.send(Message::new("nop")).await;
                }
                event = events.recv() => match event {
                    Some(SessionEvent::Wire(m)) => self.on_message(m).await,
                    Some(SessionEvent::Request(request)) => self.on_request(request).await,
                    Some(SessionEvent::Deliver { handle, sha1, filename }) => {
                        self.on_deliver(handle, sha1, filename).await;
                    }
                    Some(SessionEvent::Closed(reason)) => return reason,
                    None => return CloseReason::PeerClosed,
                },
            }
        }
    }

    async fn on_message(&mut self, m: Message) {
        match m.verb.as_str() {
            "nop" => {}
            "status" => {
                let handle = m.get("h").unwrap_or("");
                let text = m.get("text").unwrap_or("");
                match self.outstanding.get(handle) {
                    Some(request) => info!(
                        session = self.session.id(),
                        %handle,
                        package = %request.package,
                        %text,
                        "worker status"
                    ),
                    None => debug!(
                        session = self.session.id(),
                        %handle,
                        %text,
                        "status for unknown handle"
                    ),
                }
            }
            "result" => self.on_result(m).await,
            other => {
                warn!(session = self.session.id(), verb = %other, "unknown verb from worker");
                let diagnostic =
                    Message::new("error").with("text", format!("unknown verb {other}"));
                let _ = self.out.send(diagnostic).await;
            }
        }
    }

    /// Record a build from the HTTP side and put it on the wire.
    async fn on_request(&mut self, request: BuildRequest) {
        let m = Message::new("build")
            .with("h", request.handle.as_str())
            .with("path", request.package.as_str())
            .with("platform", request.platform.as_str());
        debug!(
            session = self.session.id(),
            handle = %request.handle,
            package = %request.package,
            platform = %request.platform,
            "dispatching build"
        );
        self.outstanding
            .insert(request.handle.as_str().to_string(), request);
        let _ = self.out.send(m).await;
    }

    /// Second half of the build round trip: either fail the request, serve
    /// it from the cache, or subscribe for the upload and send `accept`.
    async fn on_result(&mut self, m: Message) {
        let Some(handle) = m.get("h").map(str::to_string) else {
            warn!(session = self.session.id(), "result without handle");
            return;
        };
        if !self.outstanding.contains_key(&handle) {
            warn!(session = self.session.id(), %handle, "result for unknown handle");
            return;
        }

        let err_text = m.get("err").unwrap_or("");
        if !err_text.is_empty() {
            if let Some(request) = self.outstanding.remove(&handle) {
                request.respond(Err(BuildError::Remote(err_text.to_string())));
            }
            return;
        }

        let fields = (m.get("sha1"), m.get("filename"), m.get("size"));
        let ((sha1, filename, size), valid) = match fields {
            (Some(s), Some(f), Some(n)) => ((s, f, n), cache::is_valid_sha1(s)),
            _ => (("", "", ""), false),
        };
        if !valid {
            warn!(session = self.session.id(), %handle, "malformed result");
            if let Some(request) = self.outstanding.remove(&handle) {
                request.respond(Err(BuildError::MalformedResult));
            }
            return;
        }

        if let Some(file) = self.ctx.cache.open(sha1).await {
            debug!(session = self.session.id(), %handle, %sha1, "serving cached artifact");
            if let Some(request) = self.outstanding.remove(&handle) {
                request.respond(Ok(Artifact {
                    file,
                    filename: filename.to_string(),
                }));
            }
            return;
        }

        // Not cached yet. Park the request until the upload lands; the
        // callback only posts back onto this dispatcher's mailbox.
        let events = self.session.events.clone();
        let deliver = SessionEvent::Deliver {
            handle: handle.clone(),
            sha1: sha1.to_string(),
            filename: filename.to_string(),
        };
        let token = self.ctx.registry.subscribe(
            sha1,
            Box::new(move || {
                let _ = events.send(deliver);
            }),
        );

        // A concurrent build of the same hash may have finished its upload
        // between the cache check and the subscription, in which case its
        // notify has already drained and the callback would sit in the
        // table forever. Unwind it and deliver directly; if the callback
        // fired in the window instead, the extra Deliver is a no-op.
        if self.ctx.cache.open(sha1).await.is_some() {
            self.ctx.registry.unsubscribe(sha1, token);
            let _ = self.session.events.send(SessionEvent::Deliver {
                handle: handle.clone(),
                sha1: sha1.to_string(),
                filename: filename.to_string(),
            });
            return;
        }

        let url = format!(
            "{}/accept?size={}&sha1={}&k={}",
            self.ctx.base_url,
            size,
            sha1,
            self.ctx.upload_key.sign(sha1)
        );
        let accept = Message::new("accept")
            .with("h", handle.as_str())
            .with("url", url);
        let _ = self.out.send(accept).await;
    }

    async fn on_deliver(&mut self, handle: String, sha1: String, filename: String) {
        let Some(request) = self.outstanding.remove(&handle) else {
            debug!(session = self.session.id(), %handle, "cache arrival for completed handle");
            return;
        };
        match self.ctx.cache.open(&sha1).await {
            Some(file) => request.respond(Ok(Artifact { file, filename })),
            None => request.respond(Err(BuildError::MissingCacheEntry)),
        }
    }

    fn fail_outstanding(&mut self) {
        for (_, request) in self.outstanding.drain() {
            request.respond(Err(BuildError::WorkerDisconnected));
        }
    }
}
