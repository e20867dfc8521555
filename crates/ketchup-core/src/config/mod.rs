//! Configuration module for the ketchup gateway.
//!
//! Loads typed configuration from an optional `~/.ketchup/config.json`, then
//! overlays environment variables (the deployment's primary source). All
//! sections use `#[serde(default)]` so a partial file is valid.

use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub agent: AgentSettings,
    pub tools: ToolsConfig,
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load from the default path (if present) and overlay the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load from a specific JSON file without touching the environment.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ketchup")
            .join("config.json")
    }

    /// Overlay environment-style settings. `lookup` abstracts `std::env::var`
    /// so tests can inject a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let b = &mut self.backend;
        set_string(&mut b.base_url, get("VLLM_BASE_URL"));
        set_string(&mut b.model, get("MODEL_NAME"));
        set_string(&mut b.api_key, get("VLLM_API_KEY"));
        set_parsed(&mut b.health_timeout_secs, get("VLLM_HEALTH_TIMEOUT"), "VLLM_HEALTH_TIMEOUT")?;
        set_parsed(&mut b.infer_timeout_secs, get("VLLM_INFER_TIMEOUT"), "VLLM_INFER_TIMEOUT")?;
        set_parsed(&mut b.connect_timeout_secs, get("VLLM_CONNECT_TIMEOUT"), "VLLM_CONNECT_TIMEOUT")?;
        set_parsed(&mut b.transport_retries, get("VLLM_TRANSPORT_RETRIES"), "VLLM_TRANSPORT_RETRIES")?;
        set_parsed(&mut b.max_connections, get("VLLM_MAX_CONNECTIONS"), "VLLM_MAX_CONNECTIONS")?;
        set_parsed(&mut b.send_n_predict, get("VLLM_SEND_N_PREDICT"), "VLLM_SEND_N_PREDICT")?;
        set_parsed(&mut b.temperature, get("MODEL_TEMPERATURE"), "MODEL_TEMPERATURE")?;
        set_parsed(&mut b.max_tokens, get("MODEL_MAX_TOKENS"), "MODEL_MAX_TOKENS")?;
        for (env_key, flag) in LAUNCH_FORWARDED {
            if let Some(value) = get(env_key) {
                b.launch.insert((*flag).to_string(), value);
            }
        }

        let a = &mut self.agent;
        set_parsed(&mut a.max_turns, get("AGENT_MAX_TURNS"), "AGENT_MAX_TURNS")?;
        set_parsed(&mut a.deadline_secs, get("AGENT_DEADLINE_SECS"), "AGENT_DEADLINE_SECS")?;
        set_parsed(
            &mut a.max_concurrent_tools,
            get("AGENT_MAX_CONCURRENT_TOOLS"),
            "AGENT_MAX_CONCURRENT_TOOLS",
        )?;
        set_parsed(&mut a.max_reprompts, get("AGENT_MAX_REPROMPTS"), "AGENT_MAX_REPROMPTS")?;
        set_parsed(
            &mut a.max_failed_rounds,
            get("AGENT_MAX_FAILED_ROUNDS"),
            "AGENT_MAX_FAILED_ROUNDS",
        )?;
        set_string(&mut a.system_prompt, get("AGENT_SYSTEM_PROMPT"));

        let t = &mut self.tools;
        set_parsed(&mut t.timeout_secs, get("TOOL_TIMEOUT_SECS"), "TOOL_TIMEOUT_SECS")?;
        set_parsed(&mut t.max_retries, get("TOOL_MAX_RETRIES"), "TOOL_MAX_RETRIES")?;
        set_parsed(&mut t.retry_backoff_ms, get("TOOL_RETRY_BACKOFF_MS"), "TOOL_RETRY_BACKOFF_MS")?;
        set_string(
            &mut t.maps_api_key,
            get("MAPS_API_KEY").or_else(|| get("GOOGLE_MAPS_API_KEY")),
        );
        set_string(&mut t.brave_api_key, get("BRAVE_API_KEY"));

        let g = &mut self.gateway;
        set_string(&mut g.host, get("GATEWAY_HOST"));
        set_parsed(&mut g.port, get("PORT"), "PORT")?;

        Ok(())
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.backend.base_url.starts_with("http://") && !self.backend.base_url.starts_with("https://") {
            errors.push(format!(
                "backend.base_url must be an http(s) URL, got '{}'",
                self.backend.base_url
            ));
        }
        if self.backend.model.trim().is_empty() {
            errors.push("backend.model must not be empty".into());
        }
        for (name, secs) in [
            ("backend.health_timeout_secs", self.backend.health_timeout_secs),
            ("backend.infer_timeout_secs", self.backend.infer_timeout_secs),
            ("backend.connect_timeout_secs", self.backend.connect_timeout_secs),
            ("agent.deadline_secs", self.agent.deadline_secs),
            ("tools.timeout_secs", self.tools.timeout_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0 && secs <= MAX_TIMEOUT_SECS) {
                errors.push(format!(
                    "{name} must be a positive number of seconds, at most {MAX_TIMEOUT_SECS}"
                ));
            }
        }
        if !(0.0..=2.0).contains(&self.backend.temperature) {
            errors.push("backend.temperature must be within 0.0..=2.0".into());
        }
        if self.agent.max_turns == 0 {
            errors.push("agent.max_turns must be at least 1".into());
        }
        if self.agent.max_concurrent_tools == 0 {
            errors.push("agent.max_concurrent_tools must be at least 1".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Upper bound for every timeout and deadline setting (one day).
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

/// Seconds to a `Duration`, capped at [`MAX_TIMEOUT_SECS`]. Negative or NaN
/// values become zero instead of panicking.
pub fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.min(MAX_TIMEOUT_SECS)).unwrap_or(Duration::ZERO)
}

fn set_string(slot: &mut String, value: Option<String>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn set_parsed<T>(slot: &mut T, value: Option<String>, key: &str) -> anyhow::Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = value {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key} ('{raw}'): {e}"))?;
    }
    Ok(())
}

/// Environment keys forwarded verbatim to the model-server launcher.
const LAUNCH_FORWARDED: &[(&str, &str)] = &[
    ("VLLM_MAX_NUM_SEQS", "--max-num-seqs"),
    ("VLLM_GPU_MEMORY_UTILIZATION", "--gpu-memory-utilization"),
    ("VLLM_MAX_MODEL_LEN", "--max-model-len"),
];

// ── Backend Configuration ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub health_timeout_secs: f64,
    pub infer_timeout_secs: f64,
    pub connect_timeout_secs: f64,
    pub transport_retries: u32,
    pub max_connections: usize,
    pub send_n_predict: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Launch flags for the model server. Carried, never interpreted here.
    pub launch: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/v1".into(),
            model: "Qwen3-4B-Instruct-2507".into(),
            api_key: "EMPTY".into(),
            health_timeout_secs: 3.0,
            infer_timeout_secs: 120.0,
            connect_timeout_secs: 10.0,
            transport_retries: 0,
            max_connections: 32,
            send_n_predict: false,
            temperature: 0.2,
            max_tokens: 512,
            launch: BTreeMap::new(),
        }
    }
}

impl BackendConfig {
    /// Launch flags as an argv fragment, e.g. `["--max-num-seqs", "4"]`.
    pub fn launch_args(&self) -> Vec<String> {
        self.launch
            .iter()
            .flat_map(|(flag, value)| [flag.clone(), value.clone()])
            .collect()
    }
}

// ── Agent Configuration ─────────────────────────────────────────────

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Use tools when needed for venue search and travel logistics.";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_turns: u32,
    pub deadline_secs: f64,
    pub max_concurrent_tools: usize,
    /// Corrective re-prompts allowed after a malformed tool call.
    pub max_reprompts: u32,
    /// Consecutive rounds where every tool failed before the model is asked
    /// to answer without tools. Zero disables the nudge.
    pub max_failed_rounds: u32,
    pub system_prompt: String,
    pub strip_reasoning: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: 6,
            deadline_secs: 180.0,
            max_concurrent_tools: 4,
            max_reprompts: 1,
            max_failed_rounds: 2,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            strip_reasoning: true,
        }
    }
}

impl AgentSettings {
    pub fn deadline(&self) -> Duration {
        secs_to_duration(self.deadline_secs)
    }
}

// ── Tools Configuration ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub timeout_secs: f64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub maps_api_key: String,
    pub brave_api_key: String,
    pub web_search_max_results: u32,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20.0,
            max_retries: 1,
            retry_backoff_ms: 250,
            maps_api_key: String::new(),
            brave_api_key: String::new(),
            web_search_max_results: 5,
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ── Gateway Configuration ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl GatewayConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
