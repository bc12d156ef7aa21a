//! # Correlation Windows
//!
//! Collapses bursts of node updates into one event per node.
//!
//! A window opens on the first position / nodeinfo / telemetry message for a node and
//! absorbs every further update for the same node. It closes when:
//!
//! - no update arrived for `quiet_period` (quiet close),
//! - `max_window` elapsed since it opened (forced close, even under constant traffic),
//! - a message of a configured flush kind was merged into it,
//! - a text message for the node arrives (the window is emitted first, then the text), or
//! - more than `max_open_windows` are open (the oldest one is closed early).
//!
//! Text messages never wait in a window. Unknown kinds are ignored. Inside a window the
//! latest value of each field wins; events leave in the order their windows close.
//!
//! The same text packet is usually uplinked by several gateways. The first copy is
//! emitted as [`MeshEvent::Text`]; each further gateway heard within `max_window` adds
//! a [`Reception`] and re-emits the packet as [`MeshEvent::TextReceived`] so the sent
//! Telegram message can be updated in place. Repeats from a known gateway are dropped.
//!
//! [`GroupingState`] is a pure state machine driven with explicit instants; the async
//! wrapper [`spawn_grouping`] feeds it from a channel and sleeps until the next deadline.

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{ConfigError, GroupingConfig};
use crate::mesh::{
    LinkQuality, MeshMessage, MeshPayload, MessageKind, NodeId, NodeInfoPayload, Position,
    Route, Telemetry,
};

/// Identity of one mesh packet: originating node and packet id.
pub type PacketKey = (NodeId, u32);

/// One gateway's uplink of a packet, with the signal it measured.
#[derive(Debug, Clone, PartialEq)]
pub struct Reception {
    pub gateway: NodeId,
    pub link: LinkQuality,
}

impl Reception {
    fn of(msg: &MeshMessage) -> Option<Self> {
        msg.gateway_id.as_ref().map(|gw| Reception {
            gateway: gw.clone(),
            link: msg.link,
        })
    }
}

/// Record `r` in `list`; a known gateway has its link data refreshed instead.
/// Returns true when the gateway was new.
fn add_reception(list: &mut Vec<Reception>, r: Reception) -> bool {
    match list.iter_mut().find(|known| known.gateway == r.gateway) {
        Some(known) => {
            known.link.merge(&r.link);
            false
        }
        None => {
            list.push(r);
            true
        }
    }
}

/// A text message and every gateway that has uplinked it so far.
#[derive(Debug, Clone, PartialEq)]
pub struct TextPacket {
    pub message: MeshMessage,
    pub receptions: Vec<Reception>,
}

impl TextPacket {
    pub fn new(message: MeshMessage) -> Self {
        let receptions = Reception::of(&message).into_iter().collect();
        Self {
            message,
            receptions,
        }
    }

    pub fn key(&self) -> Option<PacketKey> {
        self.message
            .packet_id
            .map(|id| (self.message.node_id.clone(), id))
    }
}

#[derive(Debug, Clone)]
pub struct GroupingPolicy {
    pub quiet_period: Duration,
    pub max_window: Duration,
    pub flush_kinds: HashSet<MessageKind>,
    pub max_open_windows: usize,
}

impl Default for GroupingPolicy {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(3000),
            max_window: Duration::from_millis(15000),
            flush_kinds: HashSet::new(),
            max_open_windows: 256,
        }
    }
}

impl GroupingPolicy {
    pub fn from_config(cfg: &GroupingConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            quiet_period: cfg.quiet_period(),
            max_window: cfg.max_window(),
            flush_kinds: cfg.parsed_flush_kinds()?.into_iter().collect(),
            max_open_windows: cfg.max_open_windows.max(1),
        })
    }
}

/// Everything learned about one node during a window.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary {
    pub node_id: NodeId,
    /// Kinds merged, in order of first appearance.
    pub kinds: Vec<MessageKind>,
    pub nodeinfo: Option<NodeInfoPayload>,
    pub position: Option<Position>,
    pub telemetry: Option<Telemetry>,
    pub link: LinkQuality,
    /// Latest packet time reported by the mesh.
    pub timestamp: Option<DateTime<Utc>>,
    /// Distinct gateways that uplinked packets of this window, in order first heard.
    pub receptions: Vec<Reception>,
    /// Route of the latest merged packet.
    pub route: Route,
    pub message_count: usize,
}

impl NodeSummary {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            kinds: Vec::new(),
            nodeinfo: None,
            position: None,
            telemetry: None,
            link: LinkQuality::default(),
            timestamp: None,
            receptions: Vec::new(),
            route: Route::default(),
            message_count: 0,
        }
    }

    fn absorb(&mut self, msg: &MeshMessage) {
        let kind = msg.kind();
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        match &msg.payload {
            MeshPayload::NodeInfo(info) => {
                let merged = self.nodeinfo.get_or_insert_with(NodeInfoPayload::default);
                if info.long_name.is_some() {
                    merged.long_name = info.long_name.clone();
                }
                if info.short_name.is_some() {
                    merged.short_name = info.short_name.clone();
                }
                if info.hardware.is_some() {
                    merged.hardware = info.hardware.clone();
                }
            }
            MeshPayload::Position(pos) => self.position = Some(*pos),
            MeshPayload::Telemetry(t) => self
                .telemetry
                .get_or_insert_with(Telemetry::default)
                .merge(t),
            MeshPayload::Text { .. } | MeshPayload::Unknown { .. } => {}
        }
        self.link.merge(&msg.link);
        if msg.timestamp.is_some() {
            self.timestamp = msg.timestamp;
        }
        if let Some(r) = Reception::of(msg) {
            add_reception(&mut self.receptions, r);
        }
        self.route = msg.route;
        self.message_count += 1;
    }
}

/// Output of the grouping stage.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Text(TextPacket),
    /// A new gateway reported an already emitted text packet.
    TextReceived(TextPacket),
    NodeUpdate(NodeSummary),
}

impl MeshEvent {
    pub fn node_id(&self) -> &NodeId {
        match self {
            MeshEvent::Text(p) | MeshEvent::TextReceived(p) => &p.message.node_id,
            MeshEvent::NodeUpdate(summary) => &summary.node_id,
        }
    }

    pub fn route(&self) -> Route {
        match self {
            MeshEvent::Text(p) | MeshEvent::TextReceived(p) => p.message.route,
            MeshEvent::NodeUpdate(summary) => summary.route,
        }
    }
}

#[derive(Debug)]
struct RecentText {
    first_seen: Instant,
    packet: TextPacket,
}

#[derive(Debug)]
struct Window {
    summary: NodeSummary,
    opened: Instant,
    last: Instant,
}

impl Window {
    fn deadline(&self, policy: &GroupingPolicy) -> Instant {
        (self.last + policy.quiet_period).min(self.opened + policy.max_window)
    }
}

/// Open windows keyed by node id, plus recently emitted text packets.
#[derive(Debug)]
pub struct GroupingState {
    policy: GroupingPolicy,
    windows: HashMap<NodeId, Window>,
    recent_text: HashMap<PacketKey, RecentText>,
}

impl GroupingState {
    pub fn new(policy: GroupingPolicy) -> Self {
        Self {
            policy,
            windows: HashMap::new(),
            recent_text: HashMap::new(),
        }
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    /// Earliest instant at which some window must close.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.windows
            .values()
            .map(|w| w.deadline(&self.policy))
            .min()
    }

    /// Feed one message received at `now`. Returns events ready for formatting.
    pub fn push(&mut self, msg: MeshMessage, now: Instant) -> Vec<MeshEvent> {
        let mut out = self.expire(now);
        let kind = msg.kind();
        match kind {
            MessageKind::Unknown => {}
            MessageKind::Text => {
                let packet = TextPacket::new(msg);
                let Some(key) = packet.key() else {
                    self.emit_text(packet, &mut out);
                    return out;
                };
                if let Some(recent) = self.recent_text.get_mut(&key) {
                    let receptions = &mut recent.packet.receptions;
                    let added = Reception::of(&packet.message)
                        .map_or(false, |r| add_reception(receptions, r));
                    // a single reception renders like the original message
                    if added && receptions.len() > 1 {
                        out.push(MeshEvent::TextReceived(recent.packet.clone()));
                    } else {
                        debug!("{}: duplicate text packet {} dropped", key.0, key.1);
                    }
                    return out;
                }
                self.recent_text.insert(
                    key,
                    RecentText {
                        first_seen: now,
                        packet: packet.clone(),
                    },
                );
                self.emit_text(packet, &mut out);
            }
            _ => {
                let node_id = msg.node_id.clone();
                if let Some(w) = self.windows.get_mut(&node_id) {
                    w.summary.absorb(&msg);
                    w.last = now;
                } else {
                    if self.windows.len() >= self.policy.max_open_windows {
                        out.extend(self.close_oldest());
                    }
                    let mut summary = NodeSummary::new(node_id.clone());
                    summary.absorb(&msg);
                    self.windows.insert(
                        node_id.clone(),
                        Window {
                            summary,
                            opened: now,
                            last: now,
                        },
                    );
                }
                if self.policy.flush_kinds.contains(&kind) {
                    if let Some(w) = self.windows.remove(&node_id) {
                        out.push(MeshEvent::NodeUpdate(w.summary));
                    }
                }
            }
        }
        out
    }

    /// Close every window whose deadline is at or before `now`, earliest first.
    pub fn expire(&mut self, now: Instant) -> Vec<MeshEvent> {
        let dedup_span = self.policy.max_window;
        self.recent_text
            .retain(|_, t| now.saturating_duration_since(t.first_seen) < dedup_span);

        let policy = &self.policy;
        let mut due: Vec<(Instant, NodeId)> = self
            .windows
            .iter()
            .map(|(id, w)| (w.deadline(policy), id.clone()))
            .filter(|(deadline, _)| *deadline <= now)
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|(_, id)| self.windows.remove(&id))
            .map(|w| MeshEvent::NodeUpdate(w.summary))
            .collect()
    }

    /// Close all windows, earliest deadline first. Used on shutdown.
    pub fn drain(&mut self) -> Vec<MeshEvent> {
        let policy = &self.policy;
        let mut all: Vec<Window> = self.windows.drain().map(|(_, w)| w).collect();
        all.sort_by_key(|w| w.deadline(policy));
        all.into_iter()
            .map(|w| MeshEvent::NodeUpdate(w.summary))
            .collect()
    }

    fn close_oldest(&mut self) -> Option<MeshEvent> {
        let oldest = self
            .windows
            .iter()
            .min_by_key(|(_, w)| w.opened)
            .map(|(id, _)| id.clone())?;
        debug!("too many open windows; closing {} early", oldest);
        self.windows
            .remove(&oldest)
            .map(|w| MeshEvent::NodeUpdate(w.summary))
    }

    /// Text closes the node's open window first so events stay in arrival order.
    fn emit_text(&mut self, packet: TextPacket, out: &mut Vec<MeshEvent>) {
        if let Some(w) = self.windows.remove(&packet.message.node_id) {
            out.push(MeshEvent::NodeUpdate(w.summary));
        }
        out.push(MeshEvent::Text(packet));
    }
}

/// Run the grouping stage until `rx` closes; remaining windows are flushed on exit.
pub fn spawn_grouping(
    policy: GroupingPolicy,
    mut rx: mpsc::Receiver<MeshMessage>,
    tx: mpsc::Sender<MeshEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = GroupingState::new(policy);
        loop {
            let deadline = state.next_deadline();
            let events = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => state.push(msg, Instant::now()),
                    None => {
                        let rest = state.drain();
                        emit(&tx, rest).await;
                        break;
                    }
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    state.expire(Instant::now())
                }
            };
            if !emit(&tx, events).await {
                break;
            }
        }
        debug!("grouping task stopped");
    })
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn emit(tx: &mpsc::Sender<MeshEvent>, events: Vec<MeshEvent>) -> bool {
    for event in events {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}
