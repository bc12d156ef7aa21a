//! # MQTT Links
//!
//! Broker connections used by the bridge: the source feed ([`source`]) and the
//! downstream proxy targets ([`proxy`]). Each connection is owned by exactly one task
//! and driven through the [`BrokerLink`] trait, so tests can swap the real
//! [`RumqttLink`] for an in-memory double.
//!
//! Connection lifecycle per link:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (network failure) -> Reconnecting -> Connected
//! ```
//!
//! Reconnect delays follow a [`Backoff`] schedule; attempts never stop.

pub mod proxy;
pub mod source;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use std::fmt;
use std::time::Duration;

pub use rumqttc::QoS;

use crate::config::{ProxyTargetConfig, SourceConfig};

/// Request channel capacity between [`AsyncClient`] and its event loop.
const CLIENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        })
    }
}

/// Reconnect delay schedule. The last delay repeats once the schedule is exhausted.
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: Vec<Duration>,
    attempt: usize,
}

impl Backoff {
    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().map(|s| Duration::from_secs(*s)).collect())
    }

    pub fn new(schedule: Vec<Duration>) -> Self {
        let schedule = if schedule.is_empty() {
            vec![Duration::from_secs(1)]
        } else {
            schedule
        };
        Self {
            schedule,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let idx = self.attempt.min(self.schedule.len() - 1);
        self.attempt = self.attempt.saturating_add(1);
        self.schedule[idx]
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failed attempts since the last reset.
    pub fn attempts(&self) -> usize {
        self.attempt
    }
}

/// What a link reports each time it is polled.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Session established (CONNACK).
    Connected,
    Message { topic: String, payload: Bytes },
    /// Connection lost or refused; the next poll attempts to reconnect.
    Disconnected(String),
    /// Protocol traffic with no meaning for the bridge (acks, pings).
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,

    #[error("broker request rejected: {0}")]
    Request(String),
}

/// One broker connection.
///
/// `poll` drives the connection (including reconnect attempts) and must be called
/// continuously. A pending `poll` may be in the middle of the TCP connect or the
/// CONNACK wait, so callers keep the future alive until it completes instead of
/// racing it against other work. Publishing goes through [`BrokerLink::publisher`],
/// which needs no access to the link while a poll is in flight.
#[async_trait]
pub trait BrokerLink: Send {
    async fn poll(&mut self) -> LinkEvent;
    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), LinkError>;
    fn publisher(&self) -> Box<dyn LinkPublisher>;
}

/// Request side of a [`BrokerLink`]. Only enqueues; never blocks.
pub trait LinkPublisher: Send + Sync {
    fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), LinkError>;
}

impl LinkPublisher for AsyncClient {
    fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), LinkError> {
        self.try_publish(topic, qos, false, payload.to_vec())
            .map_err(|e| LinkError::Request(e.to_string()))
    }
}

pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Connection parameters shared by source and proxy links.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl From<&SourceConfig> for LinkOptions {
    fn from(cfg: &SourceConfig) -> Self {
        Self {
            client_id: cfg.client_id(),
            host: cfg.host.clone(),
            port: cfg.port,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            keep_alive: Duration::from_secs(cfg.keep_alive_secs.max(5)),
        }
    }
}

impl From<&ProxyTargetConfig> for LinkOptions {
    fn from(cfg: &ProxyTargetConfig) -> Self {
        Self {
            client_id: cfg.client_id(),
            host: cfg.host.clone(),
            port: cfg.port,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            keep_alive: Duration::from_secs(cfg.keep_alive_secs.max(5)),
        }
    }
}

/// [`BrokerLink`] backed by a `rumqttc` client and event loop.
pub struct RumqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl RumqttLink {
    /// Build the client. No network activity happens until the first `poll`.
    pub fn new(opts: &LinkOptions) -> Self {
        let mut mqtt = MqttOptions::new(opts.client_id.clone(), opts.host.clone(), opts.port);
        mqtt.set_keep_alive(opts.keep_alive);
        mqtt.set_clean_session(true);
        if let Some(user) = &opts.username {
            mqtt.set_credentials(user.clone(), opts.password.clone().unwrap_or_default());
        }
        let (client, eventloop) = AsyncClient::new(mqtt, CLIENT_CAPACITY);
        Self { client, eventloop }
    }
}

#[async_trait]
impl BrokerLink for RumqttLink {
    async fn poll(&mut self) -> LinkEvent {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => LinkEvent::Connected,
            Ok(Event::Incoming(Packet::Publish(p))) => LinkEvent::Message {
                topic: p.topic,
                payload: p.payload,
            },
            Ok(_) => LinkEvent::Idle,
            Err(e) => LinkEvent::Disconnected(e.to_string()),
        }
    }

    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), LinkError> {
        self.client
            .try_subscribe(filter, qos)
            .map_err(|e| LinkError::Request(e.to_string()))
    }

    fn publisher(&self) -> Box<dyn LinkPublisher> {
        Box::new(self.client.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_repeats_last_delay_and_resets() {
        let mut b = Backoff::from_secs(&[1, 2, 5]);
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 5, 5, 5]);
        assert_eq!(b.attempts(), 5);
        b.reset();
        assert_eq!(b.next_delay().as_secs(), 1);
    }

    #[test]
    fn empty_backoff_schedule_still_waits() {
        let mut b = Backoff::new(Vec::new());
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }
}
