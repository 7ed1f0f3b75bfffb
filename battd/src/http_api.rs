//! HTTP plane of the coordinator.
//!
//! - `GET /` - landing page with a build form for the connected platforms
//! - `POST /build` - dispatch a build to a worker and stream back the binary
//! - `PUT /accept` - verified ingest into the content-addressed cache

use askama::Template;
use axum::{
    Form, Router,
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
};
use futures_util::StreamExt;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::time::{Duration, timeout};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};
use url::form_urlencoded;

use crate::AppContext;
use crate::cache::{self, MAX_BINARY_SIZE};
use crate::session::{Artifact, BuildError, BuildRequest};

/// Upper bound on how long `/build` blocks for a worker. Expiry abandons the
/// reply slot; the remote build itself is never cancelled.
pub const BUILD_DEADLINE: Duration = Duration::from_secs(15 * 60);

pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/build", post(build).fallback(not_a_post))
        .route("/accept", put(accept).fallback(not_a_put))
        .with_state(ctx)
}

#[derive(Template)]
#[template(path = "home.html")]
struct HomeTemplate {
    platforms: Vec<String>,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    message: String,
}

async fn home(State(ctx): State<AppContext>) -> Response {
    let page = HomeTemplate {
        platforms: ctx.registry.platforms(),
    };
    match page.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            error!(%err, "rendering landing page");
            (StatusCode::INTERNAL_SERVER_ERROR, "template error").into_response()
        }
    }
}

#[derive(Deserialize)]
struct BuildForm {
    #[serde(default)]
    platform: String,
    #[serde(default)]
    pkg: String,
    #[serde(default)]
    disclaimed: String,
}

/// Blocks until the build completes, the worker disconnects, or the
/// deadline passes.
async fn build(State(ctx): State<AppContext>, Form(form): Form<BuildForm>) -> Response {
    if form.disclaimed != "ok" {
        return (
            StatusCode::PAYMENT_REQUIRED,
            "You must accept the disclaimer to use this service.",
        )
            .into_response();
    }
    let Some(worker) = ctx.registry.worker_for(&form.platform) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "invalid platform, or no connected workers",
        )
            .into_response();
    };

    let (request, reply) = BuildRequest::new(form.pkg, form.platform);
    debug!(
        handle = %request.handle,
        package = %request.package,
        platform = %request.platform,
        worker = worker.id(),
        "accepted build request"
    );
    worker.submit(request);

    let result = match timeout(BUILD_DEADLINE, reply).await {
        Err(_) => Err(BuildError::DeadlineExceeded),
        Ok(Err(_)) => Err(BuildError::WorkerDisconnected),
        Ok(Ok(result)) => result,
    };
    match result {
        Ok(artifact) => artifact_response(artifact),
        Err(err) => build_error_response(err),
    }
}

fn artifact_response(artifact: Artifact) -> Response {
    let filename: String =
        form_urlencoded::byte_serialize(artifact.filename.as_bytes()).collect();
    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(artifact.file)),
    )
        .into_response()
}

fn build_error_response(err: BuildError) -> Response {
    let page = ErrorTemplate {
        message: err.to_string(),
    };
    match page.render() {
        Ok(html) => (StatusCode::INTERNAL_SERVER_ERROR, Html(html)).into_response(),
        Err(render_err) => {
            error!(%render_err, "rendering error page");
            (StatusCode::INTERNAL_SERVER_ERROR, "build failed").into_response()
        }
    }
}

#[derive(Deserialize)]
struct AcceptParams {
    #[serde(default)]
    size: String,
    #[serde(default)]
    sha1: String,
    #[serde(default)]
    k: String,
}

/// The only entry into the cache. Validations run in order, each failure a
/// 400 with no write; subscribers fire only after the entry is durable.
async fn accept(
    State(ctx): State<AppContext>,
    Query(params): Query<AcceptParams>,
    body: Body,
) -> Response {
    let size = match params.size.parse::<u64>() {
        Ok(n) if (1..=MAX_BINARY_SIZE).contains(&n) => n,
        _ => return (StatusCode::BAD_REQUEST, "bad size").into_response(),
    };
    if !cache::is_valid_sha1(&params.sha1) {
        return (StatusCode::BAD_REQUEST, "bad sha1").into_response();
    }
    if !ctx.upload_key.verify(&params.sha1, &params.k) {
        return (StatusCode::BAD_REQUEST, "bad hmac key").into_response();
    }

    // Read at most `size` bytes, hashing as we go.
    let mut stream = body.into_data_stream();
    let mut buf: Vec<u8> = Vec::with_capacity(size as usize);
    let mut hasher = Sha1::new();
    let mut remaining = size as usize;
    while remaining > 0 {
        match stream.next().await {
            None => break,
            Some(Err(err)) => {
                warn!(%err, "upload body read error");
                return (StatusCode::BAD_REQUEST, "copy error").into_response();
            }
            Some(Ok(chunk)) => {
                let take = chunk.len().min(remaining);
                hasher.update(&chunk[..take]);
                buf.extend_from_slice(&chunk[..take]);
                remaining -= take;
            }
        }
    }
    if buf.len() as u64 != size {
        return (StatusCode::BAD_REQUEST, "bad size").into_response();
    }
    if hex::encode(hasher.finalize()) != params.sha1 {
        return (StatusCode::BAD_REQUEST, "bad sha1").into_response();
    }

    if let Err(err) = ctx.cache.store(&params.sha1, buf).await {
        error!(%err, sha1 = %params.sha1, "cache write failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, "fs write error").into_response();
    }
    ctx.registry.notify(&params.sha1);
    StatusCode::NO_CONTENT.into_response()
}

async fn not_a_post() -> Response {
    (StatusCode::BAD_REQUEST, "not a POST").into_response()
}

async fn not_a_put() -> Response {
    (StatusCode::BAD_REQUEST, "not a PUT").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, UploadKey};
    use crate::registry::Registry;
    use crate::session::SessionHandle;
    use axum::http::Request;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn make_ctx() -> (AppContext, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext {
            registry: Arc::new(Registry::new()),
            cache: Cache::new(dir.path()),
            upload_key: Arc::new(UploadKey::generate()),
            base_url: "http://batt.test".to_string(),
            secret: "s".to_string(),
        };
        (ctx, dir)
    }

    fn sha1_hex(bytes: &[u8]) -> String {
        hex::encode(Sha1::digest(bytes))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn put_accept(uri: String, body: &[u8]) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .body(Body::from(body.to_vec()))
            .unwrap()
    }

    #[tokio::test]
    async fn home_lists_connected_platforms() {
        let (ctx, _dir) = make_ctx();
        ctx.registry
            .register(&SessionHandle::for_tests(&["linux-amd64", "darwin-arm64"]));
        let router = create_router(ctx);

        let response = router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let html = body_string(response).await;
        assert!(html.contains("linux-amd64"));
        assert!(html.contains("darwin-arm64"));
        assert!(html.contains("name=\"pkg\""));
    }

    #[tokio::test]
    async fn home_without_workers_says_none_available() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx);

        let response = router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let html = body_string(response).await;
        assert!(html.contains("None available"));
    }

    #[tokio::test]
    async fn build_without_disclaimer_is_402() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/build")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("platform=linux-amd64&pkg=example.com%2Ftool"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert!(body_string(response).await.contains("You must accept the disclaimer"));
    }

    #[tokio::test]
    async fn build_without_workers_is_500() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/build")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(
                        "platform=plan9-arm&pkg=example.com%2Ftool&disclaimed=ok",
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_string(response).await,
            "invalid platform, or no connected workers"
        );
    }

    #[tokio::test]
    async fn build_rejects_non_post() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx);

        let response = router
            .oneshot(Request::builder().uri("/build").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "not a POST");
    }

    #[tokio::test]
    async fn accept_rejects_non_put() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx);

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/accept?size=1&sha1=x&k=y")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "not a PUT");
    }

    #[tokio::test]
    async fn accept_validates_size_first() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx);

        for query in [
            "/accept".to_string(),
            "/accept?size=0&sha1=a&k=b".to_string(),
            "/accept?size=-1&sha1=a&k=b".to_string(),
            "/accept?size=nope&sha1=a&k=b".to_string(),
            format!("/accept?size={}&sha1=a&k=b", MAX_BINARY_SIZE + 1),
        ] {
            let response = router
                .clone()
                .oneshot(put_accept(query.clone(), b""))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query {query}");
            assert_eq!(body_string(response).await, "bad size");
        }
    }

    #[tokio::test]
    async fn accept_validates_sha1_shape() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx);

        let response = router
            .oneshot(put_accept("/accept?size=4&sha1=XYZ&k=b".to_string(), b"body"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "bad sha1");
    }

    #[tokio::test]
    async fn accept_validates_hmac() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx);

        let body = b"four";
        let sha = sha1_hex(body);
        let response = router
            .oneshot(put_accept(
                format!("/accept?size=4&sha1={sha}&k=deadbeef"),
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "bad hmac key");
    }

    #[tokio::test]
    async fn accept_stores_verified_upload_and_fires_subscribers() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx.clone());

        let body = b"example binary!!!";
        let sha = sha1_hex(body);
        let k = ctx.upload_key.sign(&sha);

        let (fired_tx, mut fired_rx) = tokio::sync::mpsc::unbounded_channel();
        ctx.registry.subscribe(
            &sha,
            Box::new(move || {
                let _ = fired_tx.send(());
            }),
        );

        let response = router
            .oneshot(put_accept(
                format!("/accept?size={}&sha1={sha}&k={k}", body.len()),
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Entry is on disk with the right contents.
        let stored = std::fs::read(ctx.cache.entry_path(&sha)).unwrap();
        assert_eq!(stored, body);
        // Subscriber fired after the write.
        fired_rx.try_recv().expect("subscriber did not fire");
    }

    #[tokio::test]
    async fn accept_rejects_tampered_content() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx.clone());

        let claimed = sha1_hex(b"claimed bytes");
        let k = ctx.upload_key.sign(&claimed);
        let tampered = b"other bytes!!";

        let response = router
            .oneshot(put_accept(
                format!("/accept?size={}&sha1={claimed}&k={k}", tampered.len()),
                tampered,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "bad sha1");
        assert!(!ctx.cache.entry_path(&claimed).exists());
    }

    #[tokio::test]
    async fn accept_rejects_short_body() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx.clone());

        let body = b"full body here";
        let sha = sha1_hex(body);
        let k = ctx.upload_key.sign(&sha);

        let response = router
            .oneshot(put_accept(
                // Claim more bytes than we send.
                format!("/accept?size={}&sha1={sha}&k={k}", body.len() + 10),
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "bad size");
        assert!(!ctx.cache.entry_path(&sha).exists());
    }

    #[tokio::test]
    async fn accept_ignores_bytes_past_declared_size() {
        let (ctx, _dir) = make_ctx();
        let router = create_router(ctx.clone());

        let declared = b"declared";
        let sha = sha1_hex(declared);
        let k = ctx.upload_key.sign(&sha);
        let mut oversent = declared.to_vec();
        oversent.extend_from_slice(b" plus trailing junk");

        let response = router
            .oneshot(put_accept(
                format!("/accept?size={}&sha1={sha}&k={k}", declared.len()),
                &oversent,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let stored = std::fs::read(ctx.cache.entry_path(&sha)).unwrap();
        assert_eq!(stored, declared);
    }
}
