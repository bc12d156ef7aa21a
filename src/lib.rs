//! # Meshgram - Meshtastic to Telegram bridge
//!
//! Meshgram consumes the JSON feed a Meshtastic mesh publishes to an MQTT broker,
//! turns it into readable Telegram messages and, in parallel, republishes the raw
//! traffic to any number of downstream brokers.
//!
//! ## Features
//!
//! - **Typed Decoding**: text, position, nodeinfo and telemetry packets become a tagged union; malformed input is logged and dropped.
//! - **Node Cache**: last-known names, hardware and position per node, shared safely across tasks and persisted as JSON.
//! - **Correlation Windows**: bursts of updates from one node collapse into a single summary; text is never delayed.
//! - **Isolated Delivery**: one worker per Telegram chat, so a failing chat never blocks the others.
//! - **MQTT Proxy**: independent connection, topic prefix and QoS per downstream broker, with bounded reconnect backoff.
//! - **Bot Commands**: `/start`, `/help`, `/status`, `/info` in private chats, gated by an allow-list.
//!
//! ## Quick Start
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
//!
//! ## Module Organization
//!
//! - [`mesh`] - domain model, message factory and node cache
//! - [`mqtt`] - broker links, source consumer and proxy forwarder
//! - [`bridge`] - grouping, formatting, dispatch, commands and process wiring
//! - [`telegram`] - Bot API client
//! - [`config`] - configuration loading and validation
//! - [`validation`] - reusable checks for broker and Telegram settings
//! - [`metrics`] - process-wide counters
//! - [`logutil`] - log line sanitizing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌─────────────────┐
//! │  Source broker  │ ───► │  Proxy targets  │
//! └─────────────────┘      └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Factory + Cache │
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Grouping/Format │
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Dispatch     │ ──► Telegram
//! └─────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod logutil;
pub mod mesh;
pub mod metrics;
pub mod mqtt;
pub mod telegram;
pub mod validation;
