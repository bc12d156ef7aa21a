//! Rendering of mesh events into Telegram text.
//!
//! Text messages become `<name>: <text>`. Node updates become a short multi-line
//! summary headed by `<name> (<id>)`. Only fields actually present are rendered.
//!
//! When more than one gateway heard a packet the single signal line is replaced by a
//! per-gateway list:
//!
//! ```text
//! Base: hello
//! Received by 2 gateways:
//! - Roof: RSSI -95 dBm (fair) | SNR 5.5 dB (good) | hops 1
//! - !0000beef: RSSI -112 dBm (poor)
//! ```

use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::sync::Arc;

use super::grouping::{MeshEvent, NodeSummary, PacketKey, Reception, TextPacket};
use crate::config::FormattingConfig;
use crate::mesh::{
    LinkQuality, MeshPayload, MessageKind, NodeCache, NodeId, NodeInfoPayload, Position, Route,
    Telemetry,
};

/// Rendered text plus its intended audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundNotification {
    pub text: String,
    /// Deliver to the configured group chat.
    pub to_group: bool,
    /// Explicit user recipients; `None` means the default audience.
    pub recipients: Option<Vec<i64>>,
    /// Mesh packet the text describes, so later receptions can update it.
    pub packet: Option<PacketKey>,
    /// Replace the message already sent for `packet` instead of sending a new one.
    pub edit: bool,
}

impl OutboundNotification {
    pub fn for_group(text: impl Into<String>) -> Self {
        Self::routed(text, Route::All)
    }

    /// Audience derived from the topic route.
    pub fn routed(text: impl Into<String>, route: Route) -> Self {
        let recipients = match route {
            Route::All => None,
            Route::Group => Some(Vec::new()),
            Route::Private(user) | Route::PrivateGroup(user) => Some(vec![user]),
        };
        Self {
            text: text.into(),
            to_group: route.includes_group(),
            recipients,
            packet: None,
            edit: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub show_signal: bool,
    pub show_time: bool,
    pub show_map_link: bool,
    /// Render node-update summaries at all.
    pub node_updates: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            show_signal: true,
            show_time: false,
            show_map_link: true,
            node_updates: true,
        }
    }
}

impl FormatOptions {
    pub fn from_config(cfg: &FormattingConfig, node_updates: bool) -> Self {
        Self {
            show_signal: cfg.show_signal,
            show_time: cfg.show_time,
            show_map_link: cfg.show_map_link,
            node_updates,
        }
    }
}

pub struct Formatter {
    cache: Arc<NodeCache>,
    opts: FormatOptions,
}

impl Formatter {
    pub fn new(cache: Arc<NodeCache>, opts: FormatOptions) -> Self {
        Self { cache, opts }
    }

    /// Render an event and address it by its route. `None` when there is nothing to say.
    pub fn format(&self, event: &MeshEvent) -> Option<OutboundNotification> {
        let (text, packet, edit) = match event {
            MeshEvent::Text(p) => (self.render_text(p)?, p.key(), false),
            MeshEvent::TextReceived(p) => (self.render_text(p)?, Some(p.key()?), true),
            MeshEvent::NodeUpdate(summary) if self.opts.node_updates => {
                (self.render_summary(summary)?, None, false)
            }
            MeshEvent::NodeUpdate(_) => return None,
        };
        let mut n = OutboundNotification::routed(text, event.route());
        n.packet = packet;
        n.edit = edit;
        Some(n)
    }

    fn render_text(&self, packet: &TextPacket) -> Option<String> {
        let msg = &packet.message;
        let MeshPayload::Text { text } = &msg.payload else {
            return None;
        };
        let mut out = format!("{}: {}", self.name_of(&msg.node_id, None), text);
        if msg.is_direct() {
            if let Some(to) = &msg.to {
                let _ = write!(out, "\nTo: {}", self.name_of(to, None));
            }
        }
        self.push_footer(&mut out, &msg.link, &packet.receptions, msg.timestamp);
        Some(out)
    }

    fn render_summary(&self, s: &NodeSummary) -> Option<String> {
        let mut body: Vec<String> = Vec::new();
        if let Some(hw) = s.nodeinfo.as_ref().and_then(|n| n.hardware.as_deref()) {
            body.push(format!("Hardware: {}", hw));
        }
        if let Some(t) = &s.telemetry {
            body.extend(telemetry_lines(t));
        }
        if let Some(pos) = &s.position {
            body.push(position_line(pos));
            if self.opts.show_map_link {
                body.push(map_link(pos));
            }
        }
        if body.is_empty() && !s.kinds.contains(&MessageKind::NodeInfo) {
            return None;
        }

        let name = self.name_of(&s.node_id, s.nodeinfo.as_ref());
        let mut out = if name == s.node_id.as_str() {
            name
        } else {
            format!("{} ({})", name, s.node_id)
        };
        for line in body {
            out.push('\n');
            out.push_str(&line);
        }
        self.push_footer(&mut out, &s.link, &s.receptions, s.timestamp);
        Some(out)
    }

    fn push_footer(
        &self,
        out: &mut String,
        link: &LinkQuality,
        receptions: &[Reception],
        ts: Option<DateTime<Utc>>,
    ) {
        if receptions.len() > 1 {
            let _ = write!(out, "\nReceived by {} gateways:", receptions.len());
            for r in receptions {
                let _ = write!(out, "\n- {}", self.name_of(&r.gateway, None));
                if let Some(signal) = signal_parts(&r.link).filter(|_| self.opts.show_signal) {
                    let _ = write!(out, ": {}", signal);
                }
            }
        } else if self.opts.show_signal {
            if let Some(signal) = signal_line(link) {
                out.push('\n');
                out.push_str(&signal);
            }
        }
        if self.opts.show_time {
            if let Some(ts) = ts {
                let _ = write!(out, "\nTime: {} UTC", ts.format("%H:%M %d.%m.%Y"));
            }
        }
    }

    /// Long name, then any cached name, then short name, then the raw id.
    fn name_of(&self, node_id: &NodeId, hint: Option<&NodeInfoPayload>) -> String {
        if let Some(long) = hint.and_then(|h| h.long_name.as_deref()) {
            return long.to_string();
        }
        if let Some(rec) = self.cache.lookup(node_id) {
            if rec.has_name() {
                return rec.display_name().to_string();
            }
        }
        if let Some(short) = hint.and_then(|h| h.short_name.as_deref()) {
            return short.to_string();
        }
        node_id.to_string()
    }
}

fn telemetry_lines(t: &Telemetry) -> Vec<String> {
    let mut lines = Vec::new();

    let mut power = Vec::new();
    match t.battery_level {
        Some(level) if level > 100 => power.push("external power".to_string()),
        Some(level) => power.push(format!("{}%", level)),
        None => {}
    }
    if let Some(v) = t.voltage {
        power.push(format!("{:.2} V", v));
    }
    if !power.is_empty() {
        lines.push(format!("Battery: {}", power.join(" | ")));
    }

    let mut env = Vec::new();
    if let Some(c) = t.temperature {
        env.push(format!("Temperature: {:.1} °C", c));
    }
    if let Some(h) = t.relative_humidity {
        env.push(format!("Humidity: {:.0}%", h));
    }
    if let Some(p) = t.barometric_pressure {
        env.push(format!("Pressure: {:.1} hPa", p));
    }
    if !env.is_empty() {
        lines.push(env.join(" | "));
    }

    let mut air = Vec::new();
    if let Some(cu) = t.channel_utilization {
        air.push(format!("Channel util: {:.1}%", cu));
    }
    if let Some(tx) = t.air_util_tx {
        air.push(format!("Air TX: {:.1}%", tx));
    }
    if !air.is_empty() {
        lines.push(air.join(" | "));
    }

    if let Some(secs) = t.uptime_seconds {
        lines.push(format!("Uptime: {}", format_uptime(secs)));
    }
    lines
}

fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

fn position_line(pos: &Position) -> String {
    let mut line = format!("Position: {:.6}, {:.6}", pos.latitude, pos.longitude);
    if let Some(alt) = pos.altitude {
        let _ = write!(line, ", alt {} m", alt);
    }
    line
}

fn map_link(pos: &Position) -> String {
    format!(
        "https://www.openstreetmap.org/?mlat={lat:.6}&mlon={lon:.6}#map=15/{lat:.6}/{lon:.6}",
        lat = pos.latitude,
        lon = pos.longitude
    )
}

pub fn rssi_quality(rssi: i32) -> Option<&'static str> {
    if !(-150..0).contains(&rssi) {
        return None;
    }
    Some(if rssi > -80 {
        "excellent"
    } else if rssi >= -100 {
        "fair"
    } else if rssi >= -120 {
        "poor"
    } else {
        "very poor"
    })
}

pub fn snr_quality(snr: f32) -> Option<&'static str> {
    if !(-20.0..=30.0).contains(&snr) {
        return None;
    }
    Some(if snr >= 10.0 {
        "excellent"
    } else if snr >= 5.0 {
        "good"
    } else if snr >= 0.0 {
        "fair"
    } else if snr >= -5.0 {
        "poor"
    } else {
        "very poor"
    })
}

/// `Signal: RSSI -95 dBm (fair) | SNR 5.5 dB (good) | hops 2`; `None` if nothing valid.
pub fn signal_line(link: &LinkQuality) -> Option<String> {
    signal_parts(link).map(|parts| format!("Signal: {}", parts))
}

fn signal_parts(link: &LinkQuality) -> Option<String> {
    let mut parts = Vec::new();
    if let Some((rssi, q)) = link.rssi.and_then(|r| rssi_quality(r).map(|q| (r, q))) {
        parts.push(format!("RSSI {} dBm ({})", rssi, q));
    }
    if let Some((snr, q)) = link.snr.and_then(|s| snr_quality(s).map(|q| (s, q))) {
        parts.push(format!("SNR {:.1} dB ({})", snr, q));
    }
    if let Some(hops) = link.hops_away {
        parts.push(format!("hops {}", hops));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_thresholds() {
        assert_eq!(rssi_quality(-79), Some("excellent"));
        assert_eq!(rssi_quality(-80), Some("fair"));
        assert_eq!(rssi_quality(-100), Some("fair"));
        assert_eq!(rssi_quality(-120), Some("poor"));
        assert_eq!(rssi_quality(-121), Some("very poor"));
        assert_eq!(rssi_quality(0), None);
        assert_eq!(rssi_quality(-151), None);

        assert_eq!(snr_quality(10.0), Some("excellent"));
        assert_eq!(snr_quality(5.5), Some("good"));
        assert_eq!(snr_quality(0.0), Some("fair"));
        assert_eq!(snr_quality(-5.0), Some("poor"));
        assert_eq!(snr_quality(-6.0), Some("very poor"));
        assert_eq!(snr_quality(31.0), None);
    }

    #[test]
    fn signal_line_skips_invalid_parts() {
        let link = LinkQuality {
            rssi: Some(-95),
            snr: Some(5.5),
            hops_away: Some(2),
        };
        assert_eq!(
            signal_line(&link).unwrap(),
            "Signal: RSSI -95 dBm (fair) | SNR 5.5 dB (good) | hops 2"
        );
        let link = LinkQuality {
            rssi: Some(0),
            ..Default::default()
        };
        assert_eq!(signal_line(&link), None);
    }

    #[test]
    fn telemetry_omits_absent_fields() {
        let t = Telemetry {
            battery_level: Some(87),
            ..Default::default()
        };
        assert_eq!(telemetry_lines(&t), vec!["Battery: 87%".to_string()]);

        let t = Telemetry {
            battery_level: Some(101),
            voltage: Some(4.2),
            uptime_seconds: Some(90_061),
            ..Default::default()
        };
        assert_eq!(
            telemetry_lines(&t),
            vec![
                "Battery: external power | 4.20 V".to_string(),
                "Uptime: 1d 1h 1m".to_string()
            ]
        );
    }

    #[test]
    fn routes_select_the_audience() {
        let n = OutboundNotification::routed("x", Route::All);
        assert!(n.to_group);
        assert_eq!(n.recipients, None);

        let n = OutboundNotification::routed("x", Route::Group);
        assert!(n.to_group);
        assert_eq!(n.recipients, Some(vec![]));

        let n = OutboundNotification::routed("x", Route::Private(42));
        assert!(!n.to_group);
        assert_eq!(n.recipients, Some(vec![42]));

        let n = OutboundNotification::routed("x", Route::PrivateGroup(42));
        assert!(n.to_group);
        assert_eq!(n.recipients, Some(vec![42]));
    }

    #[test]
    fn position_rendering() {
        let pos = Position {
            latitude: 55.75,
            longitude: 37.62,
            altitude: Some(150),
        };
        assert_eq!(position_line(&pos), "Position: 55.750000, 37.620000, alt 150 m");
        assert!(map_link(&pos).contains("mlat=55.750000&mlon=37.620000"));
    }
}
