//! ketchup-gateway: HTTP gateway and one-shot CLI for the ketchup agent.
//!
//! Usage:
//!   ketchup-gateway serve          Run the HTTP gateway (default)
//!   ketchup-gateway ask "<input>"  Run one agent request and print the answer
//!   ketchup-gateway status         Show configuration, tools and backend readiness
//!   ketchup-gateway backend-args   Print flags forwarded to the model server

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use ketchup_core::agent::AgentEvent;
use ketchup_core::config::Config;
use ketchup_core::gateway::{self, AppState};

#[derive(Parser)]
#[command(
    name = "ketchup-gateway",
    version,
    about = "Tool-calling agent gateway for a local inference server"
)]
struct Cli {
    /// Configuration file (default: ~/.ketchup/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Listen host (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one agent request and print the answer
    Ask {
        /// Free-text input
        input: String,

        /// Print the answer as it is generated
        #[arg(short, long)]
        stream: bool,
    },

    /// Show configuration, enabled tools and backend readiness
    Status,

    /// Print the launch flags forwarded to the model server
    BackendArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Serve { host, port }) => cmd_serve(config, host, port).await?,
        Some(Commands::Ask { input, stream }) => cmd_ask(&config, &input, stream).await?,
        Some(Commands::Status) => cmd_status(&config).await?,
        Some(Commands::BackendArgs) => cmd_backend_args(&config),
        None => cmd_serve(config, None, None).await?,
    }

    Ok(())
}

// ── Shared Setup ────────────────────────────────────────────────────

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env(|key| std::env::var(key).ok())?;
            Ok(config)
        }
        None => Config::load(),
    }
}

fn validate_config(config: &Config) -> Result<()> {
    if let Err(errors) = config.validate() {
        eprintln!("\n  \x1b[31m❌ Configuration errors:\x1b[0m");
        for e in &errors {
            eprintln!("     • {}", e);
        }
        eprintln!();
        anyhow::bail!("Fix the above {} error(s) in config or environment", errors.len());
    }
    Ok(())
}

// ── Serve ───────────────────────────────────────────────────────────

async fn cmd_serve(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    validate_config(&config)?;

    let state = Arc::new(AppState::from_config(&config)?);
    let addr = config.gateway.listen_addr();

    tracing::info!(
        backend = %config.backend.base_url,
        model = %config.backend.model,
        max_turns = config.agent.max_turns,
        "Starting ketchup gateway"
    );

    // Readiness is informational at startup; the backend may still be loading.
    if !state.check_ready().await {
        tracing::warn!(
            backend = %config.backend.base_url,
            "Inference backend not reachable yet; /readyz will report 503 until it is"
        );
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n  ⏳ Shutting down gracefully...");
            shutdown.cancel();
        }
    });

    gateway::serve(state, &addr, cancel).await?;

    println!("  ✅ Shutdown complete.");
    Ok(())
}

// ── Ask ─────────────────────────────────────────────────────────────

async fn cmd_ask(config: &Config, input: &str, stream: bool) -> Result<()> {
    validate_config(config)?;
    let state = AppState::from_config(config)?;

    if !stream {
        let out = state.agent.run(input).await?;
        println!("{}", out.output);
        tracing::debug!(turns = out.turns, tool_calls = out.tool_calls, "Answer complete");
        return Ok(());
    }

    let mut events = Arc::clone(&state.agent).run_stream(input.to_string());
    let mut stdout = io::stdout();
    while let Some(event) = events.next().await {
        match event {
            AgentEvent::Delta { text } => {
                print!("{text}");
                stdout.flush()?;
            }
            AgentEvent::ToolCall { name, .. } => {
                eprintln!("\x1b[2m  → {name}\x1b[0m");
            }
            AgentEvent::ToolResult { name, ok, kind, .. } => {
                if ok {
                    eprintln!("\x1b[2m  ✓ {name}\x1b[0m");
                } else {
                    eprintln!("\x1b[2m  ✗ {name} ({kind:?})\x1b[0m");
                }
            }
            AgentEvent::Final { .. } => println!(),
            AgentEvent::Error { kind, message } => {
                println!();
                anyhow::bail!("{kind}: {message}");
            }
        }
    }
    Ok(())
}

// ── Status ──────────────────────────────────────────────────────────

async fn cmd_status(config: &Config) -> Result<()> {
    let config_path = Config::default_path();

    println!();
    println!("  🍅 ketchup-gateway status");
    println!("  ─────────────────────────────────────");

    if config_path.exists() {
        println!("  Config:    {}", config_path.display());
    } else {
        println!("  Config:    defaults + environment (no {})", config_path.display());
    }

    println!("  Backend:   {}", config.backend.base_url);
    println!("  Model:     {}", config.backend.model);
    println!(
        "  Limits:    {} turns, {:.0}s deadline, {} concurrent tools",
        config.agent.max_turns, config.agent.deadline_secs, config.agent.max_concurrent_tools
    );
    println!("  Listen:    {}", config.gateway.listen_addr());

    if let Err(errors) = config.validate() {
        println!("  Validity:  ❌ {} error(s)", errors.len());
        for e in &errors {
            println!("     • {}", e);
        }
        println!();
        return Ok(());
    }

    let state = AppState::from_config(config)?;
    let tools = state.agent.invoker().registry().names();
    if tools.is_empty() {
        println!("  Tools:     ⚠️  none (set MAPS_API_KEY or BRAVE_API_KEY)");
    } else {
        println!("  Tools:     {}", tools.join(", "));
    }

    let ready = state.check_ready().await;
    println!(
        "  Readiness: {}",
        if ready { "✅ backend reachable" } else { "❌ backend not reachable" }
    );

    println!();
    Ok(())
}

// ── Backend Args ────────────────────────────────────────────────────

fn cmd_backend_args(config: &Config) {
    let args = config.backend.launch_args();
    if args.is_empty() {
        println!("  No backend launch flags configured.");
    } else {
        println!("{}", args.join(" "));
    }
}
