//! HTTP server for uploads, progress polling and downloads

pub mod routes;
pub mod shutdown;
pub mod state;

use axum::{middleware, routing::get, Router};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::SalsaConfig;
use crate::error::{Error, Result};
use crate::tasks::spawn_sweeper;
use shutdown::{count_request, shutdown_signal, RequestBudget};
pub use state::AppState;

/// Vocal isolation HTTP server
pub struct SalsaServer {
    config: SalsaConfig,
    state: AppState,
}

impl SalsaServer {
    /// Create a server backed by the real external tools
    pub fn new(config: SalsaConfig) -> Self {
        let state = AppState::new(config.clone());
        Self { config, state }
    }

    /// Create a server around existing state
    pub fn with_state(state: AppState) -> Self {
        Self {
            config: state.config().clone(),
            state,
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until a signal or the request budget asks us to stop, then
    /// drain connections for at most the graceful timeout.
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = self
            .address()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;

        let budget = RequestBudget::from_config(&self.config.serving);
        let mut router = self.build_router();
        if let Some(budget) = &budget {
            tracing::info!("Restarting after {} requests", budget.limit());
            router = router.layer(middleware::from_fn_with_state(budget.clone(), count_request));
        }

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("Failed to bind: {}", e)))?;

        tracing::info!("Starting salsa-milk server on http://{}", addr);
        tracing::info!(
            "Request timeout {}s, graceful timeout {}s",
            self.config.serving.timeout_secs,
            self.config.serving.graceful_timeout().as_secs()
        );

        let sweeper = self
            .config
            .serving
            .task_ttl()
            .map(|ttl| spawn_sweeper(self.state.registry(), ttl));

        let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = drain_rx.await;
        });
        let mut handle = tokio::spawn(async move { server.await });

        let stopped = tokio::select! {
            joined = &mut handle => Some(flatten(joined)),
            _ = shutdown_signal(budget) => None,
        };
        if let Some(sweeper) = &sweeper {
            sweeper.abort();
        }
        if let Some(result) = stopped {
            return result;
        }

        let graceful = self.config.serving.graceful_timeout();
        let _ = drain_tx.send(());
        match tokio::time::timeout(graceful, handle).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                tracing::warn!(
                    "Graceful shutdown timed out after {}s, {} task(s) abandoned",
                    graceful.as_secs(),
                    self.state.registry().len()
                );
                Ok(())
            }
        }
    }

    /// Get the server address
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.server.host, self.config.server.port)
    }
}

fn flatten(
    joined: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    joined
        .map_err(|e| Error::Internal(format!("Server task failed: {}", e)))?
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))
}

/// Full application router for `state`
pub fn router(state: AppState) -> Router {
    let max_upload_size = state.config().server.max_upload_size;
    let timeout = Duration::from_secs(state.config().serving.timeout_secs);

    Router::new()
        .route("/", get(routes::index::index))
        .route("/health", get(health_check))
        .nest("/api", routes::api_routes(max_upload_size))
        .layer(middleware::map_response_with_state(
            state.clone(),
            routes::index::redirect_too_large,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaProcessor, ProcessingRequest, ProcessingResult, ProgressCallback, ProgressEvent, Stage};
    use crate::tasks::TaskStatus;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use serde_json::Value;
    use std::path::Path;
    use std::sync::Arc;
    use tower::ServiceExt;

    const BOUNDARY: &str = "salsa-milk-test-boundary";

    #[derive(Clone, Copy)]
    enum Outcome {
        Succeed,
        Fail,
        Empty,
    }

    struct FakeProcessor(Outcome);

    impl MediaProcessor for FakeProcessor {
        fn process(
            &self,
            request: &ProcessingRequest,
            progress: Option<ProgressCallback>,
        ) -> crate::error::Result<Vec<ProcessingResult>> {
            if let Some(progress) = &progress {
                progress(ProgressEvent::new(Stage::Demucs, 0.5, None));
            }
            match self.0 {
                Outcome::Succeed => {
                    let input = request.files[0].clone();
                    let stem = input.file_stem().unwrap().to_string_lossy().to_string();
                    std::fs::create_dir_all(&request.output_dir)?;
                    let output = request.output_dir.join(format!("{}_vocals.mp3", stem));
                    std::fs::write(&output, b"isolated vocals")?;
                    Ok(vec![ProcessingResult { input, output, id: stem }])
                }
                Outcome::Fail => Err(Error::tool_failed("demucs", Some(1))),
                Outcome::Empty => Ok(Vec::new()),
            }
        }
    }

    fn test_state(root: &Path, outcome: Outcome, max_upload_size: usize) -> AppState {
        let mut config = SalsaConfig::default();
        config.serving.task_dir = Some(root.to_path_buf());
        config.server.max_upload_size = max_upload_size;
        AppState::with_processor(config, Arc::new(FakeProcessor(outcome)))
    }

    /// (field name, optional filename, contents)
    fn multipart(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/process")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_for(state: &AppState, task_id: &str, status: TaskStatus) {
        for _ in 0..500 {
            if state.registry().get(task_id).map(|t| t.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {:?}", task_id, status);
    }

    fn work_dirs(root: &Path) -> usize {
        std::fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(state::WORK_DIR_PREFIX))
            .count()
    }

    #[tokio::test]
    async fn test_health() {
        let root = tempfile::tempdir().unwrap();
        let app = router(test_state(root.path(), Outcome::Succeed, 1024));

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], &b"OK"[..]);
    }

    #[tokio::test]
    async fn test_upload_poll_download_cycle() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), Outcome::Succeed, 1024 * 1024);
        let app = router(state.clone());

        let body = multipart(&[("file", Some("My Song.mp3"), &b"fake audio"[..]), ("model", None, &b""[..])]);
        let response = app.clone().oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

        let json = json_body(response).await;
        assert_eq!(json["status"], "queued");
        let task_id = json["task_id"].as_str().unwrap().to_string();
        assert_eq!(task_id.len(), 32);

        wait_for(&state, &task_id, TaskStatus::Completed).await;
        let task = state.registry().get(&task_id).unwrap();
        assert_eq!(task.model, "htdemucs");
        assert!(task.input_path.ends_with("uploads/My_Song.mp3"));
        let work_dir = task.work_dir.clone();

        let response = app
            .clone()
            .oneshot(get(&format!("/api/progress/{}", task_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["progress"], 100.0);
        assert_eq!(json["download_ready"], true);
        assert_eq!(json["message"], "Demucs separation complete! Preparing download...");

        let response = app
            .clone()
            .oneshot(get(&format!("/api/download/{}", task_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"My_Song_vocals.mp3\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], &b"isolated vocals"[..]);

        // The finished download forgets the task and removes its files
        assert!(state.registry().is_empty());
        assert!(!work_dir.exists());

        let response = app
            .clone()
            .oneshot(get(&format!("/api/download/{}", task_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(get(&format!("/api/progress/{}", task_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), Outcome::Succeed, 1024);
        let app = router(state.clone());

        let body = multipart(&[("model", None, &b"htdemucs"[..])]);
        let response = app.clone().oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error"], "no_file");
        assert_eq!(json["message"], "Please choose a media file to upload.");

        let body = multipart(&[("file", Some(""), &b"data"[..])]);
        let response = app.oneshot(upload_request(body)).await.unwrap();
        assert_eq!(json_body(response).await["error"], "no_file");
        assert!(state.registry().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_type_creates_nothing() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), Outcome::Succeed, 1024);
        let app = router(state.clone());

        let body = multipart(&[("file", Some("notes.txt"), &b"hello"[..])]);
        let response = app.oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error"], "invalid_type");
        assert_eq!(
            json["message"],
            "Unsupported file type. Please upload audio or video media."
        );

        assert!(state.registry().is_empty());
        assert_eq!(work_dirs(root.path()), 0);
    }

    #[tokio::test]
    async fn test_processing_failure_reported() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), Outcome::Fail, 1024);
        let app = router(state.clone());

        let body = multipart(&[("file", Some("clip.mp4"), &b"video"[..]), ("model", None, &b"mdx_extra"[..])]);
        let json = json_body(app.clone().oneshot(upload_request(body)).await.unwrap()).await;
        let task_id = json["task_id"].as_str().unwrap().to_string();

        wait_for(&state, &task_id, TaskStatus::Error).await;
        assert_eq!(state.registry().get(&task_id).unwrap().model, "mdx_extra");

        let response = app
            .clone()
            .oneshot(get(&format!("/api/progress/{}", task_id)))
            .await
            .unwrap();
        let json = json_body(response).await;
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "Processing failed. Please try again.");
        assert_eq!(json["error"], "demucs exited with status 1");
        assert_eq!(json["download_ready"], false);
        assert_eq!(json["progress"], 50.0);

        let response = app
            .oneshot(get(&format!("/api/download/{}", task_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_no_output_reported() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), Outcome::Empty, 1024);
        let app = router(state.clone());

        let body = multipart(&[("file", Some("take.flac"), &b"audio"[..])]);
        let json = json_body(app.oneshot(upload_request(body)).await.unwrap()).await;
        let task_id = json["task_id"].as_str().unwrap().to_string();

        wait_for(&state, &task_id, TaskStatus::Error).await;
        let snapshot = state.registry().snapshot(&task_id).unwrap();
        assert_eq!(snapshot.message, "No output was produced. Please try a different file.");
        assert_eq!(snapshot.error.as_deref(), Some("no_output"));
    }

    #[tokio::test]
    async fn test_oversized_upload_redirects_with_flash() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), Outcome::Succeed, 64);
        let app = router(state.clone());

        let body = multipart(&[("file", Some("big.wav"), &[0u8; 512][..])]);
        let response = app.clone().oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("salsa_milk_flash=too_large"));
        assert!(state.registry().is_empty());

        let request = Request::builder()
            .uri("/")
            .header(header::COOKIE, "salsa_milk_flash=too_large")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cleared = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cleared.contains("Max-Age=0"));
        let page = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8_lossy(&page);
        assert!(page.contains("The uploaded file is too large for the server to process."));

        // Without the cookie the page carries no message
        let response = app.oneshot(get("/")).await.unwrap();
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        let page = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(!String::from_utf8_lossy(&page).contains("too large for the server"));
    }
}
