//! # Mesh Domain Model
//!
//! Typed representation of the Meshtastic JSON feed published on `msh/.../2/json/...`
//! MQTT topics, plus the node-identity cache built from it.
//!
//! - [`factory`] - turns `(topic, payload bytes)` into a [`MeshMessage`] or a [`ParseError`]
//! - [`node_cache`] - shared node-id -> [`node_cache::NodeRecord`] map with merge-on-upsert
//!
//! A [`MeshMessage`] is immutable once built. Its [`MeshPayload`] is a tagged union:
//! parsing yields a fully populated variant or an error, never a half-filled value.
//! Packet kinds the bridge does not understand are kept as [`MeshPayload::Unknown`]
//! so they can still refresh the cache, but they never reach Telegram.

pub mod factory;
pub mod node_cache;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use factory::MessageFactory;
pub use node_cache::{NodeCache, NodeRecord, NodeUpdate};

/// Meshtastic broadcast address (`!ffffffff`).
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

/// Mesh node identifier in canonical `!xxxxxxxx` form.
///
/// Numeric ids are rendered as 8 lowercase hex digits. Textual ids that already start
/// with `!` are lowercased and kept as-is, so short test ids like `!1` stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn from_num(num: u32) -> Self {
        NodeId(format!("!{:08x}", num))
    }

    /// Normalize a textual id: `!ABC` -> `!abc`, `"1234"` (decimal) -> `!000004d2`,
    /// `0x1a` -> `!0000001a`. Returns `None` for empty or unrecognized input.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim();
        if let Some(rest) = s.strip_prefix('!') {
            if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_alphanumeric()) {
                return None;
            }
            return Some(NodeId(format!("!{}", rest.to_ascii_lowercase())));
        }
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u32::from_str_radix(hex, 16).ok().map(Self::from_num);
        }
        s.parse::<u32>().ok().map(Self::from_num)
    }

    /// Interpret a JSON `from`/`to`/`id` value (number or string).
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Self::from_num),
            serde_json::Value::String(s) => Self::parse(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == "!ffffffff"
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a decoded mesh event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Position,
    NodeInfo,
    Telemetry,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Position => "position",
            MessageKind::NodeInfo => "nodeinfo",
            MessageKind::Telemetry => "telemetry",
            MessageKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(MessageKind::Text),
            "position" => Ok(MessageKind::Position),
            "nodeinfo" => Ok(MessageKind::NodeInfo),
            "telemetry" => Ok(MessageKind::Telemetry),
            other => Err(format!("unknown message kind '{}'", other)),
        }
    }
}

/// Geographic fix in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfoPayload {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hardware: Option<String>,
}

/// Device and environment metrics. Absent fields stay `None` and are never rendered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub battery_level: Option<u32>,
    pub voltage: Option<f64>,
    pub channel_utilization: Option<f64>,
    pub air_util_tx: Option<f64>,
    pub uptime_seconds: Option<u64>,
    pub temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub barometric_pressure: Option<f64>,
}

impl Telemetry {
    pub fn is_empty(&self) -> bool {
        *self == Telemetry::default()
    }

    /// Overlay `newer` on top of `self`: fields present in `newer` win.
    pub fn merge(&mut self, newer: &Telemetry) {
        macro_rules! take {
            ($($f:ident),*) => { $( if newer.$f.is_some() { self.$f = newer.$f; } )* };
        }
        take!(
            battery_level,
            voltage,
            channel_utilization,
            air_util_tx,
            uptime_seconds,
            temperature,
            relative_humidity,
            barometric_pressure
        );
    }
}

/// Kind-specific body of a [`MeshMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum MeshPayload {
    Text { text: String },
    Position(Position),
    NodeInfo(NodeInfoPayload),
    Telemetry(Telemetry),
    /// Recognized envelope with a packet type the bridge does not render.
    Unknown { kind: String },
}

impl MeshPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MeshPayload::Text { .. } => MessageKind::Text,
            MeshPayload::Position(_) => MessageKind::Position,
            MeshPayload::NodeInfo(_) => MessageKind::NodeInfo,
            MeshPayload::Telemetry(_) => MessageKind::Telemetry,
            MeshPayload::Unknown { .. } => MessageKind::Unknown,
        }
    }
}

/// Radio link metadata reported by the uplinking gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkQuality {
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
    pub hops_away: Option<u32>,
}

impl LinkQuality {
    pub fn merge(&mut self, newer: &LinkQuality) {
        if newer.rssi.is_some() {
            self.rssi = newer.rssi;
        }
        if newer.snr.is_some() {
            self.snr = newer.snr;
        }
        if newer.hops_away.is_some() {
            self.hops_away = newer.hops_away;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rssi.is_none() && self.snr.is_none() && self.hops_away.is_none()
    }
}

/// One decoded mesh event.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshMessage {
    /// MQTT topic the packet arrived on.
    pub topic: String,
    /// Originating node.
    pub node_id: NodeId,
    /// Gateway that uplinked the packet (final topic segment), if it names a node.
    pub gateway_id: Option<NodeId>,
    pub packet_id: Option<u32>,
    /// Destination; `None` when absent from the envelope.
    pub to: Option<NodeId>,
    pub channel: Option<u32>,
    pub link: LinkQuality,
    /// Packet time reported by the mesh (`rx_time` / `timestamp`).
    pub timestamp: Option<DateTime<Utc>>,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
    /// Telegram audience selected by the topic layout.
    pub route: Route,
    pub payload: MeshPayload,
}

impl MeshMessage {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// True when the packet is addressed to a single node rather than the channel.
    pub fn is_direct(&self) -> bool {
        matches!(&self.to, Some(to) if !to.is_broadcast())
    }
}

/// Telegram audience of a packet, chosen by the topic it was published on.
///
/// ```text
/// msh/private/<tg_id>/group/2/json/...  PrivateGroup(tg_id)
/// msh/private/<tg_id>/2/json/...        Private(tg_id)
/// msh/group/2/json/...                  Group
/// anything else                         All
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Route {
    /// Group chat plus the configured notify users.
    #[default]
    All,
    /// Group chat only.
    Group,
    /// One Telegram user only.
    Private(i64),
    /// The group chat and one Telegram user.
    PrivateGroup(i64),
}

impl Route {
    pub fn from_topic(topic: &str) -> Self {
        let levels: Vec<&str> = topic.split('/').collect();
        match levels.as_slice() {
            ["msh", "private", id, rest @ ..] => match id.parse::<i64>() {
                Ok(user) if user > 0 && id.bytes().all(|b| b.is_ascii_digit()) => {
                    if rest.first() == Some(&"group") {
                        Route::PrivateGroup(user)
                    } else {
                        Route::Private(user)
                    }
                }
                _ => Route::All,
            },
            ["msh", "group", ..] => Route::Group,
            _ => Route::All,
        }
    }

    pub fn includes_group(&self) -> bool {
        !matches!(self, Route::Private(_))
    }

    /// The Telegram user named by the topic, if any.
    pub fn user(&self) -> Option<i64> {
        match self {
            Route::Private(id) | Route::PrivateGroup(id) => Some(*id),
            Route::All | Route::Group => None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::All => f.write_str("all"),
            Route::Group => f.write_str("group"),
            Route::Private(id) => write!(f, "private:{}", id),
            Route::PrivateGroup(id) => write!(f, "private+group:{}", id),
        }
    }
}

/// Why a raw MQTT message was dropped before reaching the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unrecognized topic '{topic}'")]
    UnrecognizedTopic { topic: String },

    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_normalization() {
        assert_eq!(NodeId::from_num(0x698535e0).as_str(), "!698535e0");
        assert_eq!(NodeId::parse("!ABC123").unwrap().as_str(), "!abc123");
        assert_eq!(NodeId::parse("1234").unwrap().as_str(), "!000004d2");
        assert_eq!(NodeId::parse("0x1a").unwrap().as_str(), "!0000001a");
        assert!(NodeId::parse("").is_none());
        assert!(NodeId::parse("!").is_none());
        assert!(NodeId::parse("gateway").is_none());
        assert!(NodeId::from_num(BROADCAST_NUM).is_broadcast());
    }

    #[test]
    fn node_id_from_json_values() {
        assert_eq!(
            NodeId::from_json(&serde_json::json!(4294967295u64)).unwrap(),
            NodeId::from_num(BROADCAST_NUM)
        );
        assert_eq!(
            NodeId::from_json(&serde_json::json!("!1")).unwrap().as_str(),
            "!1"
        );
        assert!(NodeId::from_json(&serde_json::json!(-5)).is_none());
        assert!(NodeId::from_json(&serde_json::json!(null)).is_none());
    }

    #[test]
    fn telemetry_merge_keeps_unset_fields() {
        let mut base = Telemetry {
            battery_level: Some(90),
            voltage: Some(4.1),
            ..Default::default()
        };
        base.merge(&Telemetry {
            battery_level: Some(87),
            ..Default::default()
        });
        assert_eq!(base.battery_level, Some(87));
        assert_eq!(base.voltage, Some(4.1));
    }

    #[test]
    fn route_from_topic_layout() {
        assert_eq!(Route::from_topic("msh/2/json/LongFast/!1"), Route::All);
        assert_eq!(Route::from_topic("msh/EU_868/2/json/!1"), Route::All);
        assert_eq!(Route::from_topic("msh/group/2/json/!1"), Route::Group);
        assert_eq!(
            Route::from_topic("msh/private/123456/2/json/!1"),
            Route::Private(123456)
        );
        assert_eq!(
            Route::from_topic("msh/private/77/group/2/json/!1"),
            Route::PrivateGroup(77)
        );
        // not a usable Telegram id
        assert_eq!(Route::from_topic("msh/private/abc/2/json/!1"), Route::All);
        assert_eq!(Route::from_topic("msh/private/+5/2/json/!1"), Route::All);
        assert_eq!(Route::from_topic("msh/private/0/2/json/!1"), Route::All);

        assert!(!Route::Private(1).includes_group());
        assert!(Route::PrivateGroup(1).includes_group());
        assert_eq!(Route::Group.user(), None);
    }

    #[test]
    fn message_kind_from_str() {
        assert_eq!("Text".parse::<MessageKind>().unwrap(), MessageKind::Text);
        assert_eq!(
            "nodeinfo".parse::<MessageKind>().unwrap(),
            MessageKind::NodeInfo
        );
        assert!("traceroute".parse::<MessageKind>().is_err());
    }
}
