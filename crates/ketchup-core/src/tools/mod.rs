//! Tool system: trait, registry, invoker, and built-in tools.
//!
//! Every tool implements the `Tool` trait and is registered together with a
//! [`ToolSpec`] carrying its invocation policy. The registry is built once at
//! startup and then shared read-only; the [`invoker`] dispatches calls by name.

pub mod invoker;
pub mod places;
pub mod schema;
pub mod web;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ToolsConfig;
use crate::provider::types::{ToolDefinition, ToolFunctionDef};

pub use invoker::{ToolCallResult, ToolInvoker};

/// Error returned by a tool handler.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The upstream request could not be completed (network, timeout, decode).
    #[error("{0}")]
    Request(String),

    /// The upstream API answered with an error.
    #[error("upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The arguments passed schema validation but were still unusable.
    #[error("{0}")]
    Input(String),
}

impl ToolError {
    /// Whether repeating the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Request(_) => true,
            ToolError::Upstream { status, .. } => *status == 429 || *status >= 500,
            ToolError::Input(_) => false,
        }
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(e: reqwest::Error) -> Self {
        ToolError::Request(e.to_string())
    }
}

/// Failure categories reported back to the model as tool messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ToolFailureKind {
    UnknownTool,
    InvalidArguments,
    ToolExecutionError,
    ToolTimeout,
}

/// A tool-level failure. Never aborts the conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolFailure {
    pub kind: ToolFailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn new(kind: ToolFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Trait that all agent tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name used in function calls (e.g., "search_places").
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> Value;

    /// Pure lookups are idempotent and may be retried.
    fn idempotent(&self) -> bool {
        true
    }

    /// Execute the tool. Arguments have already been validated against
    /// [`Tool::parameters`].
    async fn execute(&self, args: &Map<String, Value>) -> Result<Value, ToolError>;
}

/// Invocation contract for a registered tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub timeout: Duration,
    pub max_retries: u32,
    pub idempotent: bool,
}

impl ToolSpec {
    /// Spec for `tool` using the process-wide timeout and retry defaults.
    pub fn for_tool(tool: &dyn Tool, config: &ToolsConfig) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters(),
            timeout: config.timeout(),
            max_retries: config.max_retries,
            idempotent: tool.idempotent(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            def_type: "function".into(),
            function: ToolFunctionDef {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

/// A spec together with its handler.
#[derive(Clone)]
pub struct RegisteredTool {
    pub spec: ToolSpec,
    pub handler: Arc<dyn Tool>,
}

/// Registry of tools keyed by name.
///
/// Mutated only while being built; wrap it in an `Arc` afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, spec: ToolSpec, handler: Arc<dyn Tool>) {
        debug!(tool = %spec.name, timeout_ms = spec.timeout.as_millis() as u64, "Registered tool");
        self.tools
            .insert(spec.name.clone(), RegisteredTool { spec, handler });
    }

    /// Register a tool with the default policy from `config`.
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>, config: &ToolsConfig) {
        let spec = ToolSpec::for_tool(tool.as_ref(), config);
        self.register(spec, tool);
    }

    pub fn resolve(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool definitions in OpenAI function-calling format, sorted by name so
    /// the request body is stable across runs.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.spec.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Build the built-in registry. Tools whose API key is absent are left
    /// out entirely rather than failing at call time.
    pub fn from_config(config: &ToolsConfig, client: reqwest::Client) -> Self {
        let mut registry = Self::new();

        if config.maps_api_key.trim().is_empty() {
            info!("No maps API key configured; search_places and get_directions disabled");
        } else {
            registry.register_tool(
                Arc::new(places::SearchPlacesTool::new(client.clone(), &config.maps_api_key)),
                config,
            );
            registry.register_tool(
                Arc::new(places::DirectionsTool::new(client.clone(), &config.maps_api_key)),
                config,
            );
        }

        if config.brave_api_key.trim().is_empty() {
            info!("No Brave API key configured; web_search disabled");
        } else {
            registry.register_tool(
                Arc::new(web::WebSearchTool::new(
                    client,
                    &config.brave_api_key,
                    config.web_search_max_results,
                )),
                config,
            );
        }

        registry
    }
}
