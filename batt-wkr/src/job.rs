//! Build jobs.
//!
//! Each inbound `build` message becomes one job task: fetch-and-build in a
//! virgin workspace, hash the binary, stage it under a hash-derived temp
//! name, and report `result`. The accept phase uploads the staged bytes to
//! the coordinator's one-shot URL and cleans up.

use std::path::{Path, PathBuf};

use batt_common::Message;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::toolchain::{self, ToolchainError};

pub struct BuildParams {
    pub handle: String,
    pub package: String,
    pub platform: String,
    pub toolchain: String,
}

/// What the session dispatcher learns when a job's build phase finishes.
pub struct JobOutcome {
    pub handle: String,
    /// Staged artifact awaiting `accept`; absent if the build failed.
    pub staged: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum JobError {
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("couldn't determine binary name")]
    NoFileName,
}

/// `status` emitter for one job.
struct Status {
    handle: String,
    out: mpsc::Sender<Message>,
}

impl Status {
    async fn send(&self, text: &str) {
        let m = Message::new("status")
            .with("h", self.handle.as_str())
            .with("text", text);
        let _ = self.out.send(m).await;
    }
}

/// Run the build phase and emit the `result` message.
pub async fn build(params: BuildParams, out: mpsc::Sender<Message>) -> JobOutcome {
    let status = Status {
        handle: params.handle.clone(),
        out: out.clone(),
    };
    status.send("starting").await;

    let mut result = Message::new("result").with("h", params.handle.as_str());
    let mut staged = None;
    match build_inner(&params, &status).await {
        Ok(built) => {
            result.set("filename", built.filename);
            result.set("size", built.size.to_string());
            result.set("sha1", built.sha1);
            staged = Some(built.staged);
        }
        Err(err) => {
            warn!(handle = %params.handle, %err, "build failed");
            result.set("err", err.to_string());
        }
    }
    let _ = out.send(result).await;
    if staged.is_some() {
        status.send("waiting for accept").await;
    }
    JobOutcome {
        handle: params.handle,
        staged,
    }
}

struct Built {
    filename: String,
    size: u64,
    sha1: String,
    staged: PathBuf,
}

async fn build_inner(params: &BuildParams, status: &Status) -> Result<Built, JobError> {
    // Virgin workspace per job; removed when the build phase ends.
    let root = tempfile::Builder::new().prefix("batt-wkr").tempdir()?;

    status.send("fetching and building").await;
    toolchain::fetch_and_build(
        &params.toolchain,
        &params.package,
        &params.platform,
        root.path(),
    )
    .await?;

    status.send("finding binary").await;
    let bin = toolchain::find_binary(&root.path().join("bin"))?;
    let filename = bin
        .file_name()
        .ok_or(JobError::NoFileName)?
        .to_string_lossy()
        .into_owned();
    let size = tokio::fs::metadata(&bin).await?.len();

    status.send("hashing").await;
    let sha1 = sha1_file(&bin).await?;

    status.send("storing file").await;
    let staged = stage_artifact(&bin, &sha1).await?;

    Ok(Built {
        filename,
        size,
        sha1,
        staged,
    })
}

/// Streamed SHA-1 of a file, lowercase hex.
async fn sha1_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Copy the binary to a temp file named after its hash. It outlives the
/// workspace; the accept phase deletes it after the upload.
async fn stage_artifact(bin: &Path, sha1: &str) -> std::io::Result<PathBuf> {
    let tmp = tempfile::Builder::new()
        .prefix(&format!("{sha1}-"))
        .tempfile()?;
    let (_file, path) = tmp.keep().map_err(|e| e.error)?;
    tokio::fs::copy(bin, &path).await?;
    Ok(path)
}

/// Accept phase: PUT the staged artifact to the one-shot URL. The staging
/// file is removed and `status done` emitted regardless of outcome.
pub async fn accept(handle: String, staged: PathBuf, url: String, out: mpsc::Sender<Message>) {
    let status = Status { handle, out };
    status.send("uploading").await;
    if let Err(err) = upload(&staged, &url).await {
        warn!(%url, %err, "upload failed");
    }
    if let Err(err) = tokio::fs::remove_file(&staged).await {
        warn!(staged = %staged.display(), %err, "removing staged artifact");
    }
    status.send("done").await;
}

async fn upload(staged: &Path, url: &str) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(staged).await?;
    let size = file.metadata().await?.len();
    let response = reqwest::Client::new()
        .put(url)
        .header(reqwest::header::CONTENT_LENGTH, size)
        .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
        .send()
        .await?;
    anyhow::ensure!(
        response.status().is_success(),
        "bad upload: {}",
        response.status()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"example binary!!!";

    fn write_script(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("toolchain.sh");
        std::fs::write(&path, contents).unwrap();
        path
    }

    async fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(m) = rx.try_recv() {
            messages.push(m);
        }
        messages
    }

    fn statuses(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .filter(|m| m.verb == "status")
            .map(|m| m.get("text").unwrap_or("").to_string())
            .collect()
    }

    #[tokio::test]
    async fn successful_build_reports_result_and_stages_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "#!/bin/sh\nmkdir -p \"$WORKSPACE/bin\"\nprintf 'example binary!!!' > \"$WORKSPACE/bin/tool\"\n",
        );

        let (tx, mut rx) = mpsc::channel(64);
        let outcome = build(
            BuildParams {
                handle: "h1".to_string(),
                package: script.to_string_lossy().into_owned(),
                platform: "linux-amd64".to_string(),
                toolchain: "sh".to_string(),
            },
            tx,
        )
        .await;

        let messages = drain(&mut rx).await;
        assert_eq!(
            statuses(&messages),
            [
                "starting",
                "fetching and building",
                "finding binary",
                "hashing",
                "storing file",
                "waiting for accept",
            ]
        );

        let result = messages.iter().find(|m| m.verb == "result").unwrap();
        assert_eq!(result.get("h"), Some("h1"));
        assert_eq!(result.get("filename"), Some("tool"));
        assert_eq!(result.get("size"), Some("17"));
        assert_eq!(
            result.get("sha1"),
            Some(hex::encode(Sha1::digest(BODY)).as_str())
        );
        assert_eq!(result.get("err"), None);

        let staged = outcome.staged.expect("artifact staged");
        assert_eq!(std::fs::read(&staged).unwrap(), BODY);
        std::fs::remove_file(staged).unwrap();
    }

    #[tokio::test]
    async fn failed_build_reports_error_text() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "#!/bin/sh\necho no such package >&2\nexit 2\n");

        let (tx, mut rx) = mpsc::channel(64);
        let outcome = build(
            BuildParams {
                handle: "h2".to_string(),
                package: script.to_string_lossy().into_owned(),
                platform: "linux-amd64".to_string(),
                toolchain: "sh".to_string(),
            },
            tx,
        )
        .await;

        assert!(outcome.staged.is_none());
        let messages = drain(&mut rx).await;
        let result = messages.iter().find(|m| m.verb == "result").unwrap();
        let err = result.get("err").unwrap();
        assert!(err.contains("no such package"), "err text: {err}");
        // No accept is coming for a failed build.
        assert!(!statuses(&messages).contains(&"waiting for accept".to_string()));
    }

    #[tokio::test]
    async fn build_with_no_binary_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "#!/bin/sh\nexit 0\n");

        let (tx, mut rx) = mpsc::channel(64);
        let outcome = build(
            BuildParams {
                handle: "h3".to_string(),
                package: script.to_string_lossy().into_owned(),
                platform: "linux-amd64".to_string(),
                toolchain: "sh".to_string(),
            },
            tx,
        )
        .await;

        assert!(outcome.staged.is_none());
        let messages = drain(&mut rx).await;
        let result = messages.iter().find(|m| m.verb == "result").unwrap();
        assert_eq!(result.get("err"), Some("couldn't find file"));
    }

    #[tokio::test]
    async fn accept_cleans_up_staging_even_when_upload_fails() {
        let staged = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(staged.path(), b"bytes").unwrap();
        let (_file, path) = staged.keep().unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        // Nothing listens on port 1; the PUT fails fast.
        accept(
            "h4".to_string(),
            path.clone(),
            "http://127.0.0.1:1/accept?size=5".to_string(),
            tx,
        )
        .await;

        assert!(!path.exists(), "staging file should be removed");
        let messages = drain(&mut rx).await;
        assert_eq!(statuses(&messages), ["uploading", "done"]);
    }

    #[tokio::test]
    async fn sha1_file_matches_digest() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), BODY).unwrap();
        assert_eq!(
            sha1_file(file.path()).await.unwrap(),
            hex::encode(Sha1::digest(BODY))
        );
    }
}
