//! Worker side of the coordinator protocol.
//!
//! A session dials the coordinator, authenticates with the shared secret,
//! and then serves `build`/`accept` messages until the transport dies. Jobs
//! run one task each; the job table is touched only by the dispatcher.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, bail};
use batt_common::conn::{Conn, ConnError, ConnReader, ConnWriter};
use batt_common::message::Message;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep, timeout};
use tracing::{debug, info, warn};

use crate::job::{self, BuildParams, JobOutcome};

/// Idle period after which the worker pings the coordinator.
pub const NOP_DELAY: Duration = Duration::from_secs(10);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const OUTBOUND_BUFFER: usize = 32;

pub struct Config {
    pub server: String,
    pub secret: String,
    pub platforms: Vec<String>,
    pub toolchain: String,
}

enum WorkerEvent {
    Wire(Message),
    Built(JobOutcome),
    Closed(ConnError),
}

enum JobState {
    Building,
    Staged(PathBuf),
}

/// An authenticated connection, ready to serve builds.
#[derive(Debug)]
pub struct Session {
    conn: Conn,
    toolchain: String,
}

/// Dial and authenticate. A completed handshake is what resets the caller's
/// reconnect backoff.
pub async fn connect(config: &Config) -> anyhow::Result<Session> {
    let stream = TcpStream::connect(&config.server)
        .await
        .with_context(|| format!("dialing {}", config.server))?;
    let mut conn = Conn::new(stream);

    let mut hello = Message::new("hello").with("k", config.secret.as_str());
    for platform in &config.platforms {
        hello.append("p", platform.as_str());
    }
    conn.write(&hello).await.context("sending hello")?;

    let ack = timeout(HANDSHAKE_TIMEOUT, conn.read())
        .await
        .context("handshake timed out")?
        .context("reading hello acknowledgement")?;
    if ack.verb != "hello" {
        bail!("expected \"hello\", got {:?}", ack.verb);
    }
    info!(server = %config.server, platforms = ?config.platforms, "connected");
    Ok(Session {
        conn,
        toolchain: config.toolchain.clone(),
    })
}

impl Session {
    /// Serve builds until the transport dies; returns the terminal error.
    pub async fn run(self) -> ConnError {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (reader, writer) = self.conn.split();
        let read_task = tokio::spawn(read_loop(reader, events_tx.clone()));
        let write_task = tokio::spawn(write_loop(writer, out_rx, events_tx.clone()));

        let mut dispatcher = Dispatcher {
            toolchain: self.toolchain,
            jobs: HashMap::new(),
            out: out_tx,
            events: events_tx,
        };
        let reason = dispatcher.run(&mut events_rx).await;

        read_task.abort();
        write_task.abort();
        reason
    }
}

async fn read_loop(
    mut reader: ConnReader<TcpStream>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    loop {
        match reader.read().await {
            Ok(m) => {
                if events.send(WorkerEvent::Wire(m)).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = events.send(WorkerEvent::Closed(err));
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: ConnWriter<TcpStream>,
    mut out: mpsc::Receiver<Message>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    while let Some(m) = out.recv().await {
        if let Err(err) = writer.write(&m).await {
            let _ = events.send(WorkerEvent::Closed(err));
            return;
        }
    }
}

struct Dispatcher {
    toolchain: String,
    jobs: HashMap<String, JobState>,
    out: mpsc::Sender<Message>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Dispatcher {
    async fn run(&mut self, events: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> ConnError {
        loop {
            let event = tokio::select! {
                _ = sleep(NOP_DELAY) => {
                    let _ = self.out.send(Message::new("nop")).await;
                    continue;
                }
                event = events.recv() => event,
            };
            match event {
                Some(WorkerEvent::Wire(m)) => self.on_message(m),
                Some(WorkerEvent::Built(outcome)) => self.on_built(outcome),
                Some(WorkerEvent::Closed(err)) => return err,
                None => return ConnError::Closed,
            }
        }
    }

    fn on_message(&mut self, m: Message) {
        match m.verb.as_str() {
            "nop" => {}
            "build" => self.on_build(m),
            "accept" => self.on_accept(m),
            "error" => warn!(text = m.get("text").unwrap_or(""), "coordinator reported error"),
            other => warn!(verb = %other, "unknown verb from coordinator"),
        }
    }

    fn on_build(&mut self, m: Message) {
        let Some(handle) = m.get("h").map(str::to_string) else {
            warn!("build without handle");
            return;
        };
        let params = BuildParams {
            handle: handle.clone(),
            package: m.get("path").unwrap_or("").to_string(),
            platform: m.get("platform").unwrap_or("").to_string(),
            toolchain: self.toolchain.clone(),
        };
        info!(%handle, package = %params.package, platform = %params.platform, "starting build");
        self.jobs.insert(handle, JobState::Building);

        let out = self.out.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = job::build(params, out).await;
            let _ = events.send(WorkerEvent::Built(outcome));
        });
    }

    fn on_built(&mut self, outcome: JobOutcome) {
        match outcome.staged {
            // Hold the staged artifact for the accept that follows result.
            Some(staged) => {
                self.jobs.insert(outcome.handle, JobState::Staged(staged));
            }
            // Failed builds get no accept; forget the job.
            None => {
                self.jobs.remove(&outcome.handle);
            }
        }
    }

    fn on_accept(&mut self, m: Message) {
        let Some(handle) = m.get("h").map(str::to_string) else {
            warn!("accept without handle");
            return;
        };
        let Some(url) = m.get("url").map(str::to_string) else {
            warn!(%handle, "accept without url");
            return;
        };
        match self.jobs.remove(&handle) {
            None => warn!(%handle, "unknown job"),
            Some(JobState::Building) => warn!(%handle, "accept before result"),
            Some(JobState::Staged(staged)) => {
                debug!(%handle, %url, "uploading artifact");
                tokio::spawn(job::accept(handle, staged, url, self.out.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn spawn_session(config: Config) {
        tokio::spawn(async move {
            let session = connect(&config).await.expect("worker connect failed");
            session.run().await
        });
    }

    fn config(addr: SocketAddr, toolchain: &str) -> Config {
        Config {
            server: addr.to_string(),
            secret: "s".to_string(),
            platforms: vec!["linux-amd64".to_string()],
            toolchain: toolchain.to_string(),
        }
    }

    /// Accept one worker connection and complete the server side of the
    /// handshake, asserting on the hello contents.
    async fn accept_and_greet(listener: &TcpListener) -> Conn {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Conn::new(stream);
        let hello = conn.read().await.unwrap();
        assert_eq!(hello.verb, "hello");
        assert_eq!(hello.get("k"), Some("s"));
        assert_eq!(hello.values("p"), ["linux-amd64"]);
        conn.write(&Message::new("hello")).await.unwrap();
        conn
    }

    async fn read_verb(conn: &mut Conn, verb: &str) -> Message {
        loop {
            let m = timeout(Duration::from_secs(10), conn.read())
                .await
                .expect("timed out waiting for message")
                .expect("connection closed while waiting for message");
            if m.verb == verb {
                return m;
            }
            assert_eq!(m.verb, "nop", "unexpected interleaved message");
        }
    }

    async fn read_status(conn: &mut Conn, handle: &str) -> String {
        let m = read_verb(conn, "status").await;
        assert_eq!(m.get("h"), Some(handle));
        m.get("text").unwrap_or("").to_string()
    }

    #[tokio::test]
    async fn handshake_rejects_non_hello_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Conn::new(stream);
            let _ = conn.read().await;
            conn.write(&Message::new("nop")).await.unwrap();
        });

        let err = connect(&config(addr, "sh")).await.unwrap_err();
        assert!(err.to_string().contains("expected \"hello\""));
    }

    #[tokio::test]
    async fn full_build_and_accept_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("toolchain.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nmkdir -p \"$WORKSPACE/bin\"\nprintf 'example binary!!!' > \"$WORKSPACE/bin/tool\"\n",
        )
        .unwrap();

        spawn_session(config(addr, "sh"));
        let mut coordinator = accept_and_greet(&listener).await;

        let build = Message::new("build")
            .with("h", "42")
            .with("path", script.to_string_lossy().into_owned())
            .with("platform", "linux-amd64");
        coordinator.write(&build).await.unwrap();

        for expected in [
            "starting",
            "fetching and building",
            "finding binary",
            "hashing",
            "storing file",
        ] {
            assert_eq!(read_status(&mut coordinator, "42").await, expected);
        }

        let result = read_verb(&mut coordinator, "result").await;
        assert_eq!(result.get("h"), Some("42"));
        assert_eq!(result.get("filename"), Some("tool"));
        assert_eq!(result.get("size"), Some("17"));
        let sha = hex::encode(Sha1::digest(b"example binary!!!"));
        assert_eq!(result.get("sha1"), Some(sha.as_str()));

        assert_eq!(read_status(&mut coordinator, "42").await, "waiting for accept");

        // Nothing listens on port 1; the upload fails but the job still
        // cleans up and reports done.
        coordinator
            .write(
                &Message::new("accept")
                    .with("h", "42")
                    .with("url", "http://127.0.0.1:1/accept"),
            )
            .await
            .unwrap();
        assert_eq!(read_status(&mut coordinator, "42").await, "uploading");
        assert_eq!(read_status(&mut coordinator, "42").await, "done");
    }

    #[tokio::test]
    async fn failed_build_reports_err_and_tolerates_stray_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("toolchain.sh");
        std::fs::write(&script, "#!/bin/sh\necho boom >&2\nexit 1\n").unwrap();

        spawn_session(config(addr, "sh"));
        let mut coordinator = accept_and_greet(&listener).await;

        // Stray traffic first: unknown verb and an accept for no job.
        coordinator.write(&Message::new("frobnicate")).await.unwrap();
        coordinator
            .write(
                &Message::new("accept")
                    .with("h", "ghost")
                    .with("url", "http://127.0.0.1:1/x"),
            )
            .await
            .unwrap();

        let build = Message::new("build")
            .with("h", "9")
            .with("path", script.to_string_lossy().into_owned())
            .with("platform", "linux-amd64");
        coordinator.write(&build).await.unwrap();

        assert_eq!(read_status(&mut coordinator, "9").await, "starting");
        assert_eq!(
            read_status(&mut coordinator, "9").await,
            "fetching and building"
        );

        let result = read_verb(&mut coordinator, "result").await;
        assert_eq!(result.get("h"), Some("9"));
        let err = result.get("err").unwrap();
        assert!(err.contains("boom"), "err text: {err}");
    }
}
