//! # Bridge Pipeline
//!
//! Everything between a decoded [`crate::mesh::MeshMessage`] and a Telegram chat:
//!
//! - [`grouping`] - per-node correlation windows that collapse bursts of updates
//! - [`format`] - rendering of grouped events into plain text
//! - [`dispatch`] - fan-out to the group chat and permitted users, one worker per chat
//! - [`commands`] - `/start`, `/help`, `/status`, `/info` behind the allow-list
//! - [`access`] - the allow-list itself
//! - [`server`] - task wiring and lifecycle of the whole process
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshgram::bridge::Bridge;
//! use meshgram::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("config.toml").await?;
//!     config.apply_env_overrides()?;
//!     Bridge::new(config)?.run().await
//! }
//! ```

pub mod access;
pub mod commands;
pub mod dispatch;
pub mod format;
pub mod grouping;
pub mod server;

pub use access::AccessPolicy;
pub use format::OutboundNotification;
pub use grouping::{MeshEvent, NodeSummary, Reception, TextPacket};
pub use server::Bridge;
