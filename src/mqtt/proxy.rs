//! # MQTT Proxy Forwarder
//!
//! Republishes raw source traffic to downstream brokers. Every enabled target gets its
//! own task, its own [`BrokerLink`] and its own bounded request queue, so a dead or
//! slow target never affects the source loop or the other targets.
//!
//! Forwarding is best-effort: a message reaching a target that is not currently
//! connected is dropped for that target (no buffering), and so is a message that finds
//! the target's queue full. Within one target, messages are published in the order the
//! source delivered them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshgram::mqtt::{proxy, Backoff, RumqttLink, LinkOptions};
//! use meshgram::config::ProxyTargetConfig;
//!
//! # fn demo(cfg: ProxyTargetConfig) {
//! let link = RumqttLink::new(&LinkOptions::from(&cfg));
//! let backoff = Backoff::from_secs(&cfg.reconnect_backoff_seconds);
//! let (target, _task) = proxy::spawn_target(proxy::TargetSpec::from(&cfg), link, backoff);
//! let handle = proxy::ProxyHandle::new(vec![target]);
//! handle.forward("msh/2/json/!abc123", &bytes::Bytes::from_static(b"{}"));
//! # }
//! ```

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{qos_from_u8, Backoff, BrokerLink, ConnectionState, LinkEvent, QoS};
use crate::config::ProxyTargetConfig;
use crate::metrics;

/// Per-target queue depth between the source loop and the target task.
pub const TARGET_QUEUE: usize = 256;

/// Prefix `topic` with a target's rewrite rule.
///
/// An empty prefix keeps the topic. A prefix ending in `/` (or a topic starting with
/// `/`) is concatenated as-is; otherwise the two are joined with a single `/`.
/// `rewrite_topic("fwd/", "msh/2/json/!abc123")` == `"fwd/msh/2/json/!abc123"`.
pub fn rewrite_topic(prefix: &str, topic: &str) -> String {
    if prefix.is_empty() {
        topic.to_string()
    } else if prefix.ends_with('/') || topic.starts_with('/') {
        format!("{}{}", prefix, topic)
    } else {
        format!("{}/{}", prefix, topic)
    }
}

#[derive(Debug, Clone)]
struct Forward {
    topic: String,
    payload: Bytes,
}

/// Static description of a target, independent of its connection.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub name: String,
    pub topic_prefix: String,
    pub qos: QoS,
    pub enabled: bool,
}

impl From<&ProxyTargetConfig> for TargetSpec {
    fn from(cfg: &ProxyTargetConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            topic_prefix: cfg.topic_prefix.clone(),
            qos: qos_from_u8(cfg.qos),
            enabled: cfg.enabled,
        }
    }
}

/// Sending side of one target plus its live connection state.
#[derive(Debug, Clone)]
pub struct TargetHandle {
    name: String,
    enabled: bool,
    tx: Option<mpsc::Sender<Forward>>,
    state: watch::Receiver<ConnectionState>,
}

impl TargetHandle {
    /// Handle for a target that is configured but switched off. Nothing is spawned.
    pub fn disabled(name: impl Into<String>) -> Self {
        let (_tx, state) = watch::channel(ConnectionState::Disconnected);
        Self {
            name: name.into(),
            enabled: false,
            tx: None,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition of this target.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Fan-out entry point used by the source loop. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ProxyHandle {
    targets: Vec<TargetHandle>,
}

impl ProxyHandle {
    pub fn new(targets: Vec<TargetHandle>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[TargetHandle] {
        &self.targets
    }

    pub fn connected_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.enabled && t.state().is_connected())
            .count()
    }

    /// Queue `payload` for every enabled target. Never waits.
    pub fn forward(&self, topic: &str, payload: &Bytes) {
        for target in &self.targets {
            let Some(tx) = &target.tx else { continue };
            let req = Forward {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if let Err(e) = tx.try_send(req) {
                metrics::inc_proxy_dropped();
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        debug!("proxy target={} queue full; dropping {}", target.name, topic)
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        debug!("proxy target={} task stopped; dropping {}", target.name, topic)
                    }
                }
            }
        }
    }
}

/// Start the task for one target. Disabled specs yield [`TargetHandle::disabled`] and no task.
pub fn spawn_target<L>(
    spec: TargetSpec,
    link: L,
    backoff: Backoff,
) -> (TargetHandle, Option<JoinHandle<()>>)
where
    L: BrokerLink + 'static,
{
    if !spec.enabled {
        return (TargetHandle::disabled(spec.name), None);
    }
    let (tx, rx) = mpsc::channel(TARGET_QUEUE);
    let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
    let handle = TargetHandle {
        name: spec.name.clone(),
        enabled: true,
        tx: Some(tx),
        state,
    };
    let task = tokio::spawn(run_target(spec, link, backoff, rx, state_tx));
    (handle, Some(task))
}

async fn run_target<L: BrokerLink>(
    spec: TargetSpec,
    mut link: L,
    mut backoff: Backoff,
    mut rx: mpsc::Receiver<Forward>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let set_state = |s: ConnectionState| {
        state_tx.send_replace(s);
    };
    let publisher = link.publisher();
    set_state(ConnectionState::Connecting);
    info!("proxy target={} connecting", spec.name);

    'outer: loop {
        // The poll future survives forward requests; dropping it mid-handshake
        // would restart the connect on every message.
        let event = {
            let poll = link.poll();
            tokio::pin!(poll);
            loop {
                tokio::select! {
                    event = &mut poll => break event,
                    req = rx.recv() => {
                        let Some(req) = req else { break 'outer };
                        if !state_tx.borrow().is_connected() {
                            metrics::inc_proxy_dropped();
                            continue;
                        }
                        let topic = rewrite_topic(&spec.topic_prefix, &req.topic);
                        match publisher.publish(&topic, spec.qos, req.payload) {
                            Ok(()) => metrics::inc_proxy_forwarded(),
                            Err(e) => {
                                metrics::inc_proxy_dropped();
                                warn!("proxy target={} publish to {} failed: {}", spec.name, topic, e);
                            }
                        }
                    }
                }
            }
        };

        match event {
            LinkEvent::Connected => {
                backoff.reset();
                set_state(ConnectionState::Connected);
                info!("proxy target={} connected", spec.name);
            }
            LinkEvent::Disconnected(reason) => {
                let delay = backoff.next_delay();
                set_state(ConnectionState::Disconnected);
                warn!(
                    "proxy target={} connection error: {} (retry in {}s)",
                    spec.name,
                    reason,
                    delay.as_secs_f32()
                );
                if !drain_for(&spec.name, &mut rx, delay).await {
                    break;
                }
                set_state(ConnectionState::Reconnecting);
            }
            LinkEvent::Message { .. } | LinkEvent::Idle => {}
        }
    }
    set_state(ConnectionState::Disconnected);
    debug!("proxy target={} task stopped", spec.name);
}

/// Wait out a backoff delay, dropping anything queued meanwhile.
/// Returns false when the source side has gone away.
async fn drain_for(name: &str, rx: &mut mpsc::Receiver<Forward>, delay: std::time::Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    let mut dropped = 0u64;
    let alive = loop {
        tokio::select! {
            _ = &mut sleep => break true,
            req = rx.recv() => match req {
                Some(_) => {
                    dropped += 1;
                    metrics::inc_proxy_dropped();
                }
                None => break false,
            }
        }
    };
    if dropped > 0 {
        debug!("proxy target={} dropped {} message(s) while reconnecting", name, dropped);
    }
    alive
}
