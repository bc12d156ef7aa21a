//! Decoding of Meshtastic JSON uplink packets.
//!
//! Accepted topics look like `msh/2/json/<channel>/<gatewayId>` or `msh/<region>/2/json/...`
//! (routing prefixes such as `msh/private/<tg_id>/...` included, see [`Route`]):
//! the levels must start with `msh`, contain `2` immediately followed by `json`, and have
//! at least one non-empty level after `json`. The packet kind comes from the payload's
//! `type` field; everything kind-specific lives under `payload`.
//!
//! ```text
//! msh/2/json/!1  {"type":"nodeinfo","from":1,"payload":{"longname":"Base","shortname":"BS"}}
//! msh/2/json/!1  {"type":"telemetry","payload":{"battery_level":87,"voltage":4.1}}
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use super::{
    LinkQuality, MeshMessage, MeshPayload, NodeId, NodeInfoPayload, ParseError, Position,
    Route, Telemetry,
};

type Object = Map<String, Value>;

/// Stateless parser from raw MQTT messages to [`MeshMessage`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageFactory;

impl MessageFactory {
    pub fn new() -> Self {
        Self
    }

    /// Parse a message received now.
    pub fn parse(&self, topic: &str, payload: &[u8]) -> Result<MeshMessage, ParseError> {
        self.parse_at(topic, payload, Utc::now())
    }

    /// Parse a message with an explicit local receive time.
    pub fn parse_at(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<MeshMessage, ParseError> {
        let gateway_segment = json_topic_tail(topic)?;
        let gateway_id = if gateway_segment.starts_with('!') {
            NodeId::parse(gateway_segment)
        } else {
            None
        };

        let envelope: Value = serde_json::from_slice(payload)
            .map_err(|e| malformed("envelope", format!("invalid JSON: {}", e)))?;
        let envelope = envelope
            .as_object()
            .ok_or_else(|| malformed("envelope", "top-level JSON is not an object"))?;

        let kind = envelope
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");

        let payload = match kind {
            "text" => parse_text(envelope)?,
            "position" => MeshPayload::Position(parse_position(body_object(envelope, kind)?)?),
            "nodeinfo" => MeshPayload::NodeInfo(parse_nodeinfo(body_object(envelope, kind)?)?),
            "telemetry" => MeshPayload::Telemetry(parse_telemetry(body_object(envelope, kind)?)),
            "" => MeshPayload::Unknown {
                kind: "untyped".to_string(),
            },
            other => MeshPayload::Unknown {
                kind: other.to_string(),
            },
        };

        // nodeinfo carries the described node's user id; prefer it over the packet sender.
        let described = match (&payload, envelope.get("payload")) {
            (MeshPayload::NodeInfo(_), Some(Value::Object(body))) => {
                body.get("id").and_then(NodeId::from_json)
            }
            _ => None,
        };
        let node_id = described
            .or_else(|| envelope.get("from").and_then(NodeId::from_json))
            .or_else(|| gateway_id.clone())
            .ok_or_else(|| malformed(kind_label(kind), "no source node id in payload or topic"))?;

        Ok(MeshMessage {
            topic: topic.to_string(),
            node_id,
            gateway_id,
            packet_id: envelope.get("id").and_then(as_u64).and_then(|v| u32::try_from(v).ok()),
            to: envelope.get("to").and_then(NodeId::from_json),
            channel: envelope
                .get("channel")
                .and_then(as_u64)
                .and_then(|v| u32::try_from(v).ok()),
            link: parse_link(envelope),
            timestamp: envelope
                .get("rx_time")
                .or_else(|| envelope.get("timestamp"))
                .and_then(as_i64)
                .filter(|secs| *secs > 0)
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            received_at,
            route: Route::from_topic(topic),
            payload,
        })
    }
}

/// Returns the final topic level when the topic matches the JSON uplink schema.
fn json_topic_tail(topic: &str) -> Result<&str, ParseError> {
    let unrecognized = || ParseError::UnrecognizedTopic {
        topic: topic.to_string(),
    };
    let levels: Vec<&str> = topic.split('/').collect();
    if levels.first() != Some(&"msh") {
        return Err(unrecognized());
    }
    let json_at = levels
        .windows(2)
        .position(|w| w[0] == "2" && w[1] == "json")
        .map(|i| i + 1)
        .ok_or_else(unrecognized)?;
    match levels.last() {
        Some(last) if levels.len() > json_at + 1 && !last.is_empty() => Ok(last),
        _ => Err(unrecognized()),
    }
}

fn malformed(kind: &str, reason: impl Into<String>) -> ParseError {
    ParseError::MalformedPayload {
        kind: kind.to_string(),
        reason: reason.into(),
    }
}

fn kind_label(kind: &str) -> &str {
    if kind.is_empty() {
        "untyped"
    } else {
        kind
    }
}

fn body_object<'a>(envelope: &'a Object, kind: &str) -> Result<&'a Object, ParseError> {
    envelope
        .get("payload")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed(kind, "'payload' is missing or not an object"))
}

/// First present key among `keys`.
fn pick<'a>(obj: &'a Object, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|f: &f64| f.is_finite())
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    as_i64(v).and_then(|i| u64::try_from(i).ok())
}

fn non_empty_string(v: &Value) -> Option<String> {
    v.as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_text(envelope: &Object) -> Result<MeshPayload, ParseError> {
    let text = match envelope.get("payload") {
        Some(Value::Object(body)) => body.get("text").and_then(Value::as_str),
        Some(Value::String(s)) => Some(s.as_str()),
        _ => None,
    }
    .or_else(|| envelope.get("text").and_then(Value::as_str))
    .filter(|t| !t.trim().is_empty())
    .ok_or_else(|| malformed("text", "missing text"))?;
    Ok(MeshPayload::Text {
        text: text.to_string(),
    })
}

fn coordinate(body: &Object, scaled: &str, plain: &str) -> Option<f64> {
    if let Some(raw) = body.get(scaled).and_then(as_f64) {
        // *_i is an integer count of 1e-7 degrees. A fractional value means the
        // gateway already converted to degrees.
        return Some(if raw.fract() == 0.0 { raw / 1e7 } else { raw });
    }
    body.get(plain).and_then(as_f64)
}

fn parse_position(body: &Object) -> Result<Position, ParseError> {
    let latitude = coordinate(body, "latitude_i", "latitude")
        .ok_or_else(|| malformed("position", "missing latitude"))?;
    let longitude = coordinate(body, "longitude_i", "longitude")
        .ok_or_else(|| malformed("position", "missing longitude"))?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(malformed(
            "position",
            format!("coordinates out of range ({}, {})", latitude, longitude),
        ));
    }
    let altitude = body
        .get("altitude")
        .and_then(as_i64)
        .and_then(|a| i32::try_from(a).ok());
    Ok(Position {
        latitude,
        longitude,
        altitude,
    })
}

fn parse_nodeinfo(body: &Object) -> Result<NodeInfoPayload, ParseError> {
    let info = NodeInfoPayload {
        long_name: pick(body, &["longname", "long_name", "longName"]).and_then(non_empty_string),
        short_name: pick(body, &["shortname", "short_name", "shortName"])
            .and_then(non_empty_string),
        hardware: pick(body, &["hardware", "hw_model", "hwModel"]).and_then(|v| match v {
            Value::Number(_) => as_u64(v).map(hardware_name),
            other => non_empty_string(other),
        }),
    };
    if info == NodeInfoPayload::default() {
        return Err(malformed("nodeinfo", "no name or hardware fields"));
    }
    Ok(info)
}

fn parse_telemetry(body: &Object) -> Telemetry {
    Telemetry {
        battery_level: pick(body, &["battery_level", "battery", "batteryLevel"])
            .and_then(as_u64)
            .and_then(|b| u32::try_from(b).ok()),
        voltage: body.get("voltage").and_then(as_f64),
        channel_utilization: pick(body, &["channel_utilization", "channelUtilization"])
            .and_then(as_f64),
        air_util_tx: pick(body, &["air_util_tx", "airUtilTx"]).and_then(as_f64),
        uptime_seconds: pick(body, &["uptime_seconds", "uptimeSeconds"]).and_then(as_u64),
        temperature: body.get("temperature").and_then(as_f64),
        relative_humidity: pick(body, &["relative_humidity", "relativeHumidity"])
            .and_then(as_f64),
        barometric_pressure: pick(body, &["barometric_pressure", "barometricPressure"])
            .and_then(as_f64),
    }
}

fn parse_link(envelope: &Object) -> LinkQuality {
    let hops_away = envelope
        .get("hops_away")
        .and_then(as_u64)
        .or_else(|| {
            let start = envelope.get("hop_start").and_then(as_i64)?;
            let limit = envelope.get("hop_limit").and_then(as_i64)?;
            u64::try_from(start - limit).ok()
        })
        .and_then(|h| u32::try_from(h).ok());
    LinkQuality {
        rssi: envelope
            .get("rssi")
            .and_then(as_i64)
            .and_then(|r| i32::try_from(r).ok()),
        snr: envelope.get("snr").and_then(as_f64).map(|s| s as f32),
        hops_away,
    }
}

/// Display name for the numeric `HardwareModel` enum; unknown values keep the number.
fn hardware_name(model: u64) -> String {
    let name = match model {
        1 => "TLORA_V2",
        2 => "TLORA_V1",
        3 => "TLORA_V2_1_1P6",
        4 => "TBEAM",
        5 => "HELTEC_V2_0",
        6 => "TBEAM_V0P7",
        7 => "T_ECHO",
        8 => "TLORA_V1_1P3",
        9 => "RAK4631",
        10 => "HELTEC_V2_1",
        11 => "HELTEC_V1",
        12 => "LILYGO_TBEAM_S3_CORE",
        13 => "RAK11200",
        14 => "NANO_G1",
        15 => "TLORA_V2_1_1P8",
        16 => "TLORA_T3_S3",
        43 => "HELTEC_V3",
        44 => "HELTEC_WSL_V3",
        48 => "HELTEC_WIRELESS_TRACKER",
        50 => "T_DECK",
        _ => return format!("model {}", model),
    };
    name.to_string()
}
