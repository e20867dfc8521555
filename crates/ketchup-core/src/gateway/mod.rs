//! HTTP gateway in front of the agent loop.
//!
//! Routes:
//! - `GET  /healthz`              process liveness
//! - `GET  /readyz`               live inference backend probe
//! - `POST /agent`                blocking agent run
//! - `POST /agent/stream`         agent run as server-sent events
//! - `POST /v1/chat/completions`  OpenAI-compatible pass-through (no tools)

pub mod error;
pub mod routes;

use anyhow::Context;
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::AgentLoop;
use crate::config::Config;
use crate::provider::openai::OpenAiProvider;
use crate::tools::{ToolInvoker, ToolRegistry};

pub use error::ApiError;

/// Connect timeout for tool backends. The per-call limit is the tool's own timeout.
const TOOL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by all handlers. Holds no per-request data.
pub struct AppState {
    pub agent: Arc<AgentLoop>,
    ever_ready: AtomicBool,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(agent: Arc<AgentLoop>) -> Self {
        Self {
            agent,
            ever_ready: AtomicBool::new(false),
        }
    }

    /// Wire the backend client, tool registry and agent loop from configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let provider =
            OpenAiProvider::new(&config.backend).context("creating inference backend client")?;

        let tool_client = reqwest::Client::builder()
            .connect_timeout(TOOL_CONNECT_TIMEOUT)
            .build()
            .context("creating tool HTTP client")?;
        let registry = ToolRegistry::from_config(&config.tools, tool_client);
        info!(tools = ?registry.names(), "Tool registry ready");

        let invoker = ToolInvoker::new(Arc::new(registry), config.tools.retry_backoff());
        let agent = AgentLoop::new(Arc::new(provider), invoker, config.agent.clone());
        Ok(Self::new(Arc::new(agent)))
    }

    /// Probe the backend now. Nothing is cached between calls.
    pub async fn check_ready(&self) -> bool {
        let ready = self.agent.provider().probe_ready().await;
        if ready {
            if !self.ever_ready.swap(true, Ordering::Relaxed) {
                info!("Inference backend is ready");
            }
        } else if self.ever_ready.load(Ordering::Relaxed) {
            warn!("Inference backend probe failed");
        }
        ready
    }
}

/// Build the router with request tracing.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::agent_routes())
        .merge(routes::completion_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` is cancelled, then drain in-flight requests.
pub async fn serve(state: SharedState, addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding gateway to {addr}"))?;
    info!(addr = %listener.local_addr()?, "Gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("gateway server failed")?;

    info!("Gateway stopped");
    Ok(())
}
