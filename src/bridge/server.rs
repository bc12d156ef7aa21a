//! Process wiring: builds every task of the bridge and runs until Ctrl-C.
//!
//! ```text
//! source link ──► proxy targets (raw bytes)
//!      │
//!      └─► factory ─► node cache ─► grouping ─► formatter ─► per-chat workers ─► Telegram
//!
//! Telegram getUpdates ─► command dispatcher ─► sendMessage
//! ```

use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::access::AccessPolicy;
use super::commands::{BotCommandParser, ChatKind, CommandDispatcher, StatusProbe};
use super::dispatch::{spawn_notifier, Audience, Dispatcher};
use super::format::{FormatOptions, Formatter};
use super::grouping::{spawn_grouping, GroupingPolicy};
use crate::config::Config;
use crate::mesh::NodeCache;
use crate::mqtt::proxy::{self, ProxyHandle, TargetSpec};
use crate::mqtt::source::{run_source, Ingestor, SourceSpec};
use crate::mqtt::{qos_from_u8, Backoff, ConnectionState, LinkOptions, RumqttLink};
use crate::telegram::TelegramClient;

/// Capacity of the parsed-message channel between source and grouping.
const INGEST_QUEUE: usize = 1024;
/// Capacity of the grouped-event channel between grouping and the notifier.
const EVENT_QUEUE: usize = 256;
/// How long shutdown waits for pending windows and deliveries.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Pause after a failed getUpdates call.
const POLL_RETRY: Duration = Duration::from_secs(5);

pub struct Bridge {
    config: Config,
}

impl Bridge {
    /// Validates the configuration; an invalid one never reaches `run`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub async fn run(self) -> Result<()> {
        let cfg = self.config;
        let started = Instant::now();

        let cache = Arc::new(load_cache(cfg.node_cache.file.as_deref()));
        info!("node cache holds {} node(s)", cache.len());

        // Proxy targets
        let mut targets = Vec::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for target in &cfg.proxy_targets {
            let link = RumqttLink::new(&LinkOptions::from(target));
            let backoff = Backoff::from_secs(&target.reconnect_backoff_seconds);
            let (handle, task) = proxy::spawn_target(TargetSpec::from(target), link, backoff);
            if handle.enabled() {
                info!(
                    "proxy target={} -> {}:{} (prefix '{}', qos {})",
                    target.name, target.host, target.port, target.topic_prefix, target.qos
                );
            } else {
                info!("proxy target={} is disabled", target.name);
            }
            targets.push(handle);
            tasks.extend(task);
        }
        let proxy = ProxyHandle::new(targets);

        // Pipeline: grouping -> notifier
        let telegram = Arc::new(TelegramClient::new(&cfg.telegram));
        let (msg_tx, msg_rx) = mpsc::channel(INGEST_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let grouping = spawn_grouping(GroupingPolicy::from_config(&cfg.grouping)?, msg_rx, event_tx);
        let formatter = Formatter::new(
            cache.clone(),
            FormatOptions::from_config(&cfg.formatting, cfg.telegram.node_updates),
        );
        let dispatcher = Dispatcher::new(telegram.clone(), Audience::from_config(&cfg.telegram));
        let notifier = spawn_notifier(event_rx, formatter, dispatcher);

        // Source
        let (source_state_tx, source_state) = watch::channel(ConnectionState::Disconnected);
        info!(
            "source broker {}:{} topic {}",
            cfg.source.host, cfg.source.port, cfg.source.topic
        );
        let source = tokio::spawn(run_source(
            SourceSpec {
                filter: cfg.source.topic.clone(),
                qos: qos_from_u8(cfg.source.qos),
            },
            RumqttLink::new(&LinkOptions::from(&cfg.source)),
            Backoff::from_secs(&cfg.source.reconnect_backoff_seconds),
            source_state_tx,
            proxy.clone(),
            Ingestor::new(cache.clone(), msg_tx),
        ));

        // Periodic cache snapshot
        if let Some(path) = cfg.node_cache.file.clone() {
            let every = Duration::from_secs(cfg.node_cache.save_interval_secs.max(1));
            tasks.push(spawn_cache_saver(cache.clone(), path, every));
        }

        // Commands
        if cfg.telegram.commands_enabled {
            let username = match telegram.get_me().await {
                Ok(Some(me)) => {
                    info!("telegram bot @{} ready", me.username.as_deref().unwrap_or("?"));
                    me.username
                }
                Ok(None) => None,
                Err(e) => {
                    warn!("telegram getMe failed: {} (continuing)", e);
                    None
                }
            };
            let commands = CommandDispatcher::new(
                AccessPolicy::new(cfg.telegram.allowed_user_ids.iter().copied()),
                BotCommandParser::new(username),
                cfg.telegram.group_chat_id,
                StatusProbe {
                    source: source_state,
                    proxy: proxy.clone(),
                    cache: cache.clone(),
                    stale_after: chrono::Duration::hours(
                        i64::try_from(cfg.node_cache.stale_after_hours).unwrap_or(i64::MAX / 3600),
                    ),
                    started,
                },
            );
            tasks.push(tokio::spawn(run_command_poller(
                telegram.clone(),
                commands,
                cfg.telegram.poll_timeout_secs,
            )));
        }

        info!("bridge running; press Ctrl-C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");

        // Stopping the source closes the pipeline from the front: grouping flushes its
        // open windows, the notifier drains and closes the delivery workers.
        source.abort();
        let _ = source.await;
        for task in &tasks {
            task.abort();
        }
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            let _ = grouping.await;
            let _ = notifier.await;
        })
        .await;
        if drained.is_err() {
            warn!("pipeline did not drain within {:?}", SHUTDOWN_GRACE);
        }

        if let Some(path) = &cfg.node_cache.file {
            match cache.save_to_file(path) {
                Ok(()) => info!("node cache saved to {}", path),
                Err(e) => warn!("failed to save node cache to {}: {}", path, e),
            }
        }
        info!("bridge stopped");
        Ok(())
    }
}

fn load_cache(path: Option<&str>) -> NodeCache {
    let Some(path) = path else {
        return NodeCache::new();
    };
    match NodeCache::load_from_file(path) {
        Ok(cache) => cache,
        Err(e) => {
            warn!("ignoring unreadable node cache {}: {}", path, e);
            NodeCache::new()
        }
    }
}

fn spawn_cache_saver(cache: Arc<NodeCache>, path: String, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !cache.is_dirty() {
                continue;
            }
            match cache.save_to_file(&path) {
                Ok(()) => debug!("node cache saved ({} nodes)", cache.len()),
                Err(e) => warn!("failed to save node cache to {}: {}", path, e),
            }
        }
    })
}

async fn run_command_poller(
    client: Arc<TelegramClient>,
    commands: CommandDispatcher,
    poll_timeout_secs: u64,
) {
    let mut offset: Option<i64> = None;
    loop {
        let updates = match client.get_updates(offset, poll_timeout_secs).await {
            Ok(updates) => updates,
            Err(e) => {
                warn!("telegram getUpdates failed: {}", e);
                tokio::time::sleep(POLL_RETRY).await;
                continue;
            }
        };
        for update in updates {
            offset = Some(update.update_id + 1);
            let Some(msg) = update.message else { continue };
            let (Some(user), Some(text)) = (msg.from.as_ref(), msg.text.as_deref()) else {
                continue;
            };
            let chat = if msg.chat.is_private() {
                ChatKind::Private
            } else {
                ChatKind::Group
            };
            if let Some(outcome) = commands.handle(user.id, chat, text) {
                if let Err(e) = client.send_message(msg.chat.id, outcome.text()).await {
                    warn!("telegram reply to chat={} failed: {}", msg.chat.id, e);
                }
            }
        }
    }
}
