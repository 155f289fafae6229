//! Compile and run sessions
//!
//! [`Playground`] ties the registry, compiler and engine together for the
//! two things a client does: compile a program and get a token back, then
//! run the artifact behind that token with its I/O attached to a connection.
//! It has no knowledge of HTTP; the server only translates requests and
//! frames.

use crate::compiler::Compiler;
use crate::config::SandpitConfig;
use crate::errors::CompileError;
use crate::executors::{ExecutionEngine, RunRequest};
use crate::registry::ArtifactRegistry;
use crate::sandbox::Sandbox;
use sandpit_types::{CloseStatus, CompileResponse, HealthReport, Token};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Close reason for a missing, malformed or unknown token
pub const INVALID_TOKEN: &str = "invalid token";

#[derive(Debug)]
pub struct Playground {
    registry: Arc<ArtifactRegistry>,
    compiler: Compiler,
    engine: ExecutionEngine,
    cache_duration: Duration,
    run_timeout: Duration,
    max_source_log_length: usize,
}

impl Playground {
    pub fn new(
        config: &SandpitConfig,
        registry: Arc<ArtifactRegistry>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        Self {
            registry,
            compiler: Compiler::new(&config.compiler),
            engine: ExecutionEngine::new(&config.execution, sandbox),
            cache_duration: config.artifacts.cache_duration(),
            run_timeout: config.execution.run_timeout(),
            max_source_log_length: config.logging.max_source_log_length,
        }
    }

    pub fn registry(&self) -> &Arc<ArtifactRegistry> {
        &self.registry
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Compile `source` and register the artifact under a fresh token.
    ///
    /// A failed compile still yields a response carrying the diagnostics,
    /// but its token is never runnable. A successful artifact is reclaimed
    /// after the cache duration unless a run claims it first.
    pub async fn compile(&self, source: &str) -> Result<CompileResponse, CompileError> {
        let (token, path) = self.registry.mint();
        log::info!(
            "Compile request for token {}: {}",
            token,
            truncate(source, self.max_source_log_length)
        );

        let outcome = match self.compiler.compile(source, token, &path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Compiler invocation failed for token {}: {}", token, e);
                self.registry.delete(token);
                return Err(e);
            }
        };

        if outcome.succeeded() {
            self.registry.set(token, path.clone());
            self.schedule_reclaim(token, path);
        } else {
            log::info!(
                "Compilation failed for token {}: {}",
                token,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            self.registry.delete(token);
        }

        Ok(outcome.into_response(token))
    }

    fn schedule_reclaim(&self, token: Token, path: PathBuf) {
        let registry = self.registry.clone();
        let idle = self.cache_duration;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if registry.reclaim(token, &path) {
                log::info!("Reclaimed unused artifact for token {}", token);
            }
        });
    }

    /// Run the artifact behind `token` with the given streams.
    ///
    /// Returns how the connection should be closed. Cancelling `cancel`
    /// kills the program; the artifact is deleted however the run ends.
    pub async fn run<I, O, E>(
        &self,
        token: Option<&str>,
        args: Vec<String>,
        stdin: I,
        stdout: O,
        stderr: E,
        cancel: CancellationToken,
    ) -> CloseStatus
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let token = match token.map(str::parse::<Token>) {
            Some(Ok(token)) => token,
            Some(Err(e)) => {
                log::info!("Rejecting run request: {}", e);
                return CloseStatus::invalid_payload(INVALID_TOKEN);
            }
            None => {
                log::info!("Rejecting run request without a token");
                return CloseStatus::invalid_payload(INVALID_TOKEN);
            }
        };

        let Some(path) = self.registry.claim(token) else {
            log::info!("Rejecting run request for unknown token {}", token);
            return CloseStatus::invalid_payload(INVALID_TOKEN);
        };

        log::info!("Running token {} with args {:?}", token, args);
        let request = RunRequest::new(path.clone(), self.run_timeout)
            .with_args(args)
            .with_cancel(cancel);
        let outcome = self.engine.run(request, stdin, stdout, stderr).await;
        self.registry.discard(token, &path);

        outcome.close_status()
    }

    /// Probe the compiler and report capacity.
    pub async fn health(&self) -> HealthReport {
        let compiler = self.compiler.version().await;
        if !compiler.healthy {
            log::warn!("Health check failed: {:?}", compiler.error);
        }
        HealthReport {
            healthy: compiler.healthy,
            compiler,
            available_slots: self.engine.available_slots(),
            pending_artifacts: self.registry.len(),
        }
    }
}

/// Shorten `text` to at most `max` characters for logging.
pub fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
