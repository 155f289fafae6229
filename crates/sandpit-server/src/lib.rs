//! HTTP and websocket front end for the code playground
//!
//! Exposes the compile-and-run engine of `sandpit-core` to browsers:
//!
//! - `POST /compile` takes `{"src": ...}` and answers with the compiler
//!   output and a token for the artifact
//! - `GET /run?token=...&args=...` upgrades to a websocket carrying the
//!   program's stdin, stdout and stderr as JSON text frames
//! - `GET /health` (and `HEAD`) probes the compiler
//!
//! Static files for the editor can be served from a directory as a fallback.

pub mod error;
pub mod ws;

pub use error::{Result, ServerError};
pub use ws::RunQuery;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use futures_util::StreamExt;
use sandpit_core::config::ServerSection;
use sandpit_core::Playground;
use sandpit_types::{CompileRequest, CompileResponse, HealthReport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Configuration for the playground server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Enable CORS
    pub enable_cors: bool,
    /// Directory served for paths no route matches
    pub static_dir: Option<PathBuf>,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Enable request logging
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: true,
            static_dir: None,
            max_body_size: 1024 * 1024, // 1MB
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the server configuration from the `server` section of the
    /// playground configuration.
    pub fn from_section(section: &ServerSection) -> Result<Self> {
        Ok(Self::new()
            .with_bind_addr_str(&section.bind_addr)?
            .with_cors(section.enable_cors)
            .with_static_dir(section.static_dir.clone())
            .with_max_body_size(section.max_body_size))
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address: {}", e)))?;
        Ok(self)
    }

    /// Enable or disable CORS.
    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    /// Serve static files from `dir`.
    pub fn with_static_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.static_dir = dir;
        self
    }

    /// Set maximum request body size.
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub playground: Arc<Playground>,
    pub config: ServerConfig,
}

/// Handler for the /compile POST endpoint.
async fn compile_handler(
    State(app_state): State<AppState>,
    request: std::result::Result<Json<CompileRequest>, JsonRejection>,
) -> Result<Json<CompileResponse>> {
    let Json(request) = request.map_err(|e| {
        log::warn!("Rejecting compile request: {}", e.body_text());
        ServerError::invalid_request(e.body_text())
    })?;

    let response = app_state.playground.compile(&request.src).await?;
    log::info!(
        "Compilation for token {} finished with code {}",
        response.token,
        response.return_code
    );
    Ok(Json(response))
}

/// Handler for the /run websocket endpoint.
async fn run_handler(
    State(app_state): State<AppState>,
    RawQuery(query): RawQuery,
    upgrade: WebSocketUpgrade,
) -> Response {
    let query = RunQuery::parse(query.as_deref().unwrap_or(""));
    log::info!("New run connection for token {:?}", query.token);

    let playground = app_state.playground.clone();
    upgrade.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        ws::run_session(playground, query, sink, stream).await;
    })
}

/// Handler for the /health endpoint, GET and HEAD.
async fn health_handler(State(app_state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    log::debug!("Starting health check");
    let report = app_state.playground.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// The playground HTTP server.
pub struct PlaygroundServer {
    playground: Arc<Playground>,
    config: ServerConfig,
}

impl PlaygroundServer {
    /// Create a new server with default configuration.
    pub fn new(playground: Arc<Playground>) -> Self {
        Self {
            playground,
            config: ServerConfig::default(),
        }
    }

    /// Create a new server with custom configuration.
    pub fn with_config(playground: Arc<Playground>, config: ServerConfig) -> Self {
        Self { playground, config }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            playground: self.playground.clone(),
            config: self.config.clone(),
        };

        let mut router = Router::new()
            .route("/compile", post(compile_handler))
            .route("/run", get(run_handler))
            // get routes also answer HEAD requests
            .route("/health", get(health_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .with_state(state);

        if let Some(dir) = &self.config.static_dir {
            router = router.fallback_service(ServeDir::new(dir));
        }

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>,
                 next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    // Health probes arrive constantly; keep them out of info logs.
                    let quiet = uri.path() == "/health";
                    if quiet {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    let duration = start.elapsed();

                    if quiet {
                        log::debug!(
                            "Response {} {} in {:?}",
                            request_id,
                            response.status(),
                            duration
                        );
                    } else {
                        log::info!(
                            "Response {} {} in {:?}",
                            request_id,
                            response.status(),
                            duration
                        );
                    }

                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }

    /// Start the server with graceful shutdown support.
    ///
    /// The server will shut down when the provided shutdown signal is received.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        log::info!("Playground server listening on {}", self.config.bind_addr);
        log::info!("Compile endpoint: http://{}/compile", self.config.bind_addr);
        log::info!("Run endpoint: ws://{}/run", self.config.bind_addr);
        log::info!("Health check: http://{}/health", self.config.bind_addr);
        if let Some(dir) = &self.config.static_dir {
            log::info!("Serving static files from {}", dir.display());
        }

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("Playground server shut down gracefully");
        Ok(())
    }
}

/// Utility function to create a shutdown signal from Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::extract::ws::{CloseFrame, Message};
    use axum::http::Request;
    use sandpit_core::{ArtifactRegistry, NoopSandbox, SandpitConfig};
    use serial_test::serial;
    use std::convert::Infallible;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::PollSender;
    use tower::ServiceExt; // for `oneshot`

    // Copies the source (a shell script) to the -o target.
    const FAKE_COMPILER: &str = r#"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
cat > "$out"
chmod +x "$out"
echo "compiled"
"#;

    fn playground(dir: &TempDir, configure: impl FnOnce(&mut SandpitConfig)) -> Arc<Playground> {
        let script = dir.path().join("fake-cc.sh");
        std::fs::write(&script, FAKE_COMPILER).unwrap();

        let mut config = SandpitConfig::default();
        config.compiler.program = "sh".to_string();
        config.compiler.args = vec![script.display().to_string()];
        config.compiler.version_args = vec!["-c".to_string(), "echo fake-cc 1.0".to_string()];
        configure(&mut config);

        let registry = Arc::new(ArtifactRegistry::open(dir.path().join("scratch")).unwrap());
        Arc::new(Playground::new(&config, registry, Arc::new(NoopSandbox)))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn compile_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/compile")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn test_compile_endpoint_returns_token() {
        let dir = tempfile::tempdir().unwrap();
        let app = PlaygroundServer::new(playground(&dir, |_| {})).build_router();

        let response = app
            .oneshot(compile_request(r##"{"src":"#!/bin/sh\necho hi"}"##))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["returnCode"], 0);
        assert_eq!(body["stdout"], "compiled\n");
        assert!(body["error"].is_null());
        let token = body["token"].as_str().unwrap();
        assert!(token.parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn test_compile_rejects_malformed_body() {
        let dir = tempfile::tempdir().unwrap();
        let app = PlaygroundServer::new(playground(&dir, |_| {})).build_router();

        let response = app.oneshot(compile_request("{not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["type"], "invalid_request");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_compile_reports_missing_compiler() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-compiler").display().to_string();
        let playground = playground(&dir, |config| config.compiler.program = missing);
        let app = PlaygroundServer::new(playground.clone()).build_router();

        let response = app.oneshot(compile_request(r#"{"src":""}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["type"], "compile_error");
        assert!(playground.registry().is_empty());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = PlaygroundServer::new(playground(&dir, |_| {})).build_router();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["healthy"], true);
        assert_eq!(body["compiler"]["version"], "fake-cc 1.0");
        assert_eq!(body["availableSlots"], 50);

        let response = app
            .oneshot(
                Request::builder()
                    .method("HEAD")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unhealthy_compiler_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let playground = playground(&dir, |config| {
            config.compiler.version_args = vec!["-c".to_string(), "exit 2".to_string()];
        });
        let app = PlaygroundServer::new(playground).build_router();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["healthy"], false);
        assert_eq!(body["compiler"]["exitStatus"], 2);
    }

    #[tokio::test]
    async fn test_static_files_served_as_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let static_dir = dir.path().join("static");
        std::fs::create_dir_all(&static_dir).unwrap();
        std::fs::write(static_dir.join("index.html"), "<h1>playground</h1>").unwrap();

        let config = ServerConfig::new().with_static_dir(Some(static_dir));
        let app = PlaygroundServer::with_config(playground(&dir, |_| {}), config).build_router();

        let response = app
            .oneshot(Request::builder().uri("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"<h1>playground</h1>");
    }

    #[test]
    fn test_config_from_section() {
        let section = ServerSection {
            bind_addr: "0.0.0.0:9000".to_string(),
            ..ServerSection::default()
        };
        let config = ServerConfig::from_section(&section).unwrap();
        assert_eq!(config.bind_addr.port(), 9000);

        let bad = ServerSection {
            bind_addr: "nowhere".to_string(),
            ..ServerSection::default()
        };
        assert!(matches!(
            ServerConfig::from_section(&bad),
            Err(ServerError::Config(_))
        ));
    }

    struct Client {
        inbound: mpsc::Sender<std::result::Result<Message, Infallible>>,
        outbound: mpsc::Receiver<Message>,
    }

    /// Starts a run session over in-memory channels standing in for the socket.
    fn connect(playground: Arc<Playground>, query: &str) -> (Client, tokio::task::JoinHandle<()>) {
        let (inbound, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound) = mpsc::channel(64);
        let stream = Box::pin(async_stream::stream! {
            let mut rx = inbound_rx;
            while let Some(message) = rx.recv().await {
                yield message;
            }
        });
        let session = tokio::spawn(ws::run_session(
            playground,
            RunQuery::parse(query),
            PollSender::new(outbound_tx),
            stream,
        ));
        (Client { inbound, outbound }, session)
    }

    async fn compile(playground: &Playground, src: &str) -> String {
        playground.compile(src).await.unwrap().token.to_string()
    }

    fn close_frame(message: Option<Message>) -> CloseFrame {
        match message {
            Some(Message::Close(Some(frame))) => frame,
            other => panic!("expected a close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_run_session_streams_output_then_closes() {
        let dir = tempfile::tempdir().unwrap();
        let playground = playground(&dir, |_| {});
        let token = compile(&playground, "#!/bin/sh\nprintf hi\n").await;

        let (mut client, session) = connect(playground, &format!("token={}", token));
        client
            .inbound
            .send(Ok(Message::Text(r#"{"msg":"","eof":true}"#.into())))
            .await
            .unwrap();

        match client.outbound.recv().await {
            Some(Message::Text(text)) => {
                assert_eq!(text.as_str(), r#"{"msg":"hi","isStderr":false}"#)
            }
            other => panic!("expected an output frame, got {:?}", other),
        }
        let close = close_frame(client.outbound.recv().await);
        assert_eq!(close.code, 1000);
        assert_eq!(close.reason.as_str(), "program exited with code 0");

        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_session_rejects_unknown_token() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, session) = connect(playground(&dir, |_| {}), "token=42");

        let close = close_frame(client.outbound.recv().await);
        assert_eq!(close.code, 1007);
        assert_eq!(close.reason.as_str(), "invalid token");

        session.await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_disconnect_cancels_run() {
        let dir = tempfile::tempdir().unwrap();
        let playground = playground(&dir, |_| {});
        let token = compile(&playground, "#!/bin/sh\nread x\n").await;

        let (client, session) = connect(playground.clone(), &format!("token={}", token));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let Client {
            inbound,
            mut outbound,
        } = client;
        drop(inbound);

        let close = close_frame(outbound.recv().await);
        assert_eq!(close.code, 1011);
        assert!(close.reason.as_str().contains("cancelled"));

        session.await.unwrap();
        assert_eq!(
            playground.engine().available_slots(),
            playground.engine().capacity()
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_disconnect_cancels_run_that_ignores_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let playground = playground(&dir, |config| config.execution.run_timeout_secs = 30);
        let token = compile(&playground, "#!/bin/sh\nwhile :; do :; done\n").await;

        let (client, session) = connect(playground.clone(), &format!("token={}", token));
        let Client {
            inbound,
            mut outbound,
        } = client;

        // Far more input than the pipe and the frame buffers can hold.
        let chunk = "x".repeat(64 * 1024);
        let frame = serde_json::json!({ "msg": chunk, "eof": false }).to_string();
        for _ in 0..40 {
            inbound
                .send(Ok(Message::Text(frame.clone().into())))
                .await
                .unwrap();
        }
        inbound
            .send(Ok(Message::Close(Some(CloseFrame {
                code: 1001,
                reason: "".into(),
            }))))
            .await
            .unwrap();
        drop(inbound);

        let close = tokio::time::timeout(Duration::from_secs(10), outbound.recv())
            .await
            .expect("the run should end long before its timeout");
        let close = close_frame(close);
        assert_eq!(close.code, 1011);
        assert!(close.reason.as_str().contains("cancelled"));

        session.await.unwrap();
        assert_eq!(
            playground.engine().available_slots(),
            playground.engine().capacity()
        );
    }
}
