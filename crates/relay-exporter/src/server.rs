//! HTTP surface of the exporter.
//!
//! - `GET /health`: unauthenticated liveness probe
//! - `GET /download?image=<name>`: streamed export, see [`crate::export`]
//! - `GET /cleanup?file=<artifact>`: delete an exported artifact
//!
//! Optionally also serves the artifact directory on the file port.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use relay_protocol::endpoints::{
    CLEANUP, DOWNLOAD, EVENT_STREAM_CONTENT_TYPE, FILE_PARAM, HEALTH, IMAGE_PARAM,
};
use tokio::net::TcpListener;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::auth::auth_middleware;
use crate::cleanup::delete_artifact;
use crate::config::ExporterConfig;
use crate::export::{run_export, EventSink, ExportRequest, EVENT_BUFFER};
use crate::state::ServerState;

/// Create the control-plane router.
pub fn create_app(state: ServerState) -> Router {
    let protected = Router::new()
        .route(DOWNLOAD, get(download))
        .route(CLEANUP, get(cleanup))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route(HEALTH, get(health_check))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Static file router over the artifact directory.
pub fn file_server(dir: &Path) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(dir))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "relay-exporter",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn download(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let request_id = Uuid::new_v4();
    let image = params.get(IMAGE_PARAM).cloned().unwrap_or_default();
    let host = advertised_host(&state.config, &headers);
    let span = info_span!("export", %request_id, image = %image);

    let (sink, rx) = EventSink::channel(EVENT_BUFFER);
    let request = ExportRequest {
        request_id,
        image,
        host,
    };
    tokio::spawn(
        async move {
            if let Err(failure) = run_export(state, request, sink).await {
                debug!(stage = %failure.stage, "export ended early");
            }
        }
        .instrument(span),
    );

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn cleanup(
    State(state): State<ServerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let file = params.get(FILE_PARAM).map(String::as_str);
    match delete_artifact(&state, file).await {
        Ok(token) => format!("deleted: {}", token).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Host to place in download URLs: the configured public host, else the
/// host the client used to reach us, else the listen address.
fn advertised_host(config: &ExporterConfig, headers: &HeaderMap) -> String {
    if let Some(host) = &config.public_host {
        return host.clone();
    }
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(strip_port)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| config.listen.ip().to_string())
}

/// `host:port` to `host`, keeping IPv6 literals bracketed.
fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Start the exporter, and the file server when enabled, until Ctrl-C or
/// SIGTERM.
pub async fn start_server(state: ServerState) -> Result<()> {
    let addr = state.config.listen;

    if state.config.serve_files {
        let file_addr = state.config.file_addr();
        let listener = TcpListener::bind(file_addr)
            .await
            .with_context(|| format!("failed to bind file server on {}", file_addr))?;
        let app = file_server(&state.config.download_dir);
        info!("Serving artifacts on http://{}", file_addr);
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
            {
                error!(error = %err, "file server failed");
            }
        });
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control plane on {}", addr))?;
    serve(listener, state).await
}

/// Serve the control plane on an already bound listener.
pub async fn serve(listener: TcpListener, state: ServerState) -> Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    let app = create_app(state);

    info!("Starting relay exporter on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Relay exporter stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStore;
    use axum::body::to_bytes;
    use axum::http::{Request, StatusCode};
    use relay_protocol::{decode_line, TransferEvent};
    use std::sync::Arc;
    use tower::ServiceExt;

    const TOKEN: &str = "45dc157e53aa468aaab484d937a9be52";

    fn state(dir: &Path, store: Arc<FakeStore>) -> ServerState {
        let config = ExporterConfig {
            token: TOKEN.to_string(),
            download_dir: dir.to_path_buf(),
            ..Default::default()
        };
        ServerState::new(config, store)
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).header(header::HOST, "10.0.0.5:50000");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_app(state(dir.path(), Arc::new(FakeStore::default())));

        let response = app.oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("relay-exporter"));
    }

    #[tokio::test]
    async fn test_auth_rejected_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpine_latest.tar"), b"x").unwrap();
        let store = Arc::new(FakeStore::with_artifact(b"x".to_vec()));
        let app = create_app(state(dir.path(), store.clone()));

        for (uri, token) in [
            ("/download?image=alpine:latest", None),
            ("/download?image=alpine:latest", Some("wrong")),
            ("/cleanup?file=alpine_latest.tar", None),
            ("/cleanup?file=alpine_latest.tar", Some("wrong")),
        ] {
            let response = app.clone().oneshot(get(uri, token)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/download?image=alpine:latest")
                    .header(header::AUTHORIZATION, format!("Basic {}", TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert!(store.calls().is_empty());
        assert!(dir.path().join("alpine_latest.tar").exists());
    }

    #[tokio::test]
    async fn test_download_streams_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::with_artifact(vec![0u8; 1000]));
        let app = create_app(state(dir.path(), store));

        let response = app
            .oneshot(get("/download?image=alpine:latest", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            EVENT_STREAM_CONTENT_TYPE
        );

        let text = body_text(response).await;
        let events: Vec<TransferEvent> = text
            .lines()
            .filter_map(|line| decode_line(line).into_event())
            .collect();
        assert!(events.contains(&TransferEvent::size_known(1000)));
        assert!(events.contains(&TransferEvent::url_ready(
            "http://10.0.0.5:30000/alpine_latest.tar"
        )));
        assert!(!events.iter().any(TransferEvent::is_error));
    }

    #[tokio::test]
    async fn test_download_without_image_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::default());
        let app = create_app(state(dir.path(), store.clone()));

        let response = app.oneshot(get("/download", Some(TOKEN))).await.unwrap();
        let text = body_text(response).await;
        let events: Vec<TransferEvent> = text
            .lines()
            .filter_map(|line| decode_line(line).into_event())
            .collect();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_error());
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_statuses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpine_latest.tar"), b"x").unwrap();
        let app = create_app(state(dir.path(), Arc::new(FakeStore::default())));

        let response = app
            .clone()
            .oneshot(get("/cleanup?file=alpine_latest.tar", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "deleted: alpine_latest.tar");

        let response = app
            .clone()
            .oneshot(get("/cleanup?file=alpine_latest.tar", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("alpine_latest.tar"));

        let response = app
            .clone()
            .oneshot(get("/cleanup", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(get("/cleanup?file=..%2Fetc%2Fpasswd.tar", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_advertised_host() {
        let mut config = ExporterConfig::default();
        let mut headers = HeaderMap::new();

        headers.insert(header::HOST, "10.0.0.5:50000".parse().unwrap());
        assert_eq!(advertised_host(&config, &headers), "10.0.0.5");

        headers.insert(header::HOST, "[fd00::5]:50000".parse().unwrap());
        assert_eq!(advertised_host(&config, &headers), "[fd00::5]");

        headers.insert(header::HOST, "relay.internal".parse().unwrap());
        assert_eq!(advertised_host(&config, &headers), "relay.internal");

        config.public_host = Some("files.example.net".to_string());
        assert_eq!(advertised_host(&config, &headers), "files.example.net");

        config.public_host = None;
        assert_eq!(advertised_host(&config, &HeaderMap::new()), "0.0.0.0");
    }

    #[tokio::test]
    async fn test_file_server_serves_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpine_latest.tar"), b"tar-bytes").unwrap();
        let app = file_server(dir.path());

        let response = app
            .oneshot(get("/alpine_latest.tar", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "tar-bytes");
    }
}
