//! ketchup-core: tool-calling agent gateway for a local inference server.
//!
//! Turns single-shot chat completions into a bounded, multi-turn loop in
//! which the model can call external tools and react to their results.
//!
//! - [`config`]: typed configuration from JSON and environment
//! - [`provider`]: inference backend trait and OpenAI-compatible client
//! - [`tools`]: tool trait, registry, invoker and built-in tools
//! - [`agent`]: conversation loop state machine, blocking and streaming
//! - [`gateway`]: HTTP surface (`axum`)
//!
//! # Quick Start
//!
//! ```no_run
//! use ketchup_core::config::Config;
//! use ketchup_core::gateway::AppState;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let state = AppState::from_config(&config)?;
//!
//! let answer = state.agent.run("Find top coffee shops near Times Square").await?;
//! println!("{}", answer.output);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod gateway;
pub mod provider;
pub mod tools;
