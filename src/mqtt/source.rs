//! Source feed consumer.
//!
//! Owns the subscription to the Meshtastic JSON feed. Every inbound message is first
//! handed to the proxy forwarder untouched, then parsed; parsed messages update the
//! node cache and continue to the grouping stage. Parse failures are logged and the
//! loop moves on.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::proxy::ProxyHandle;
use super::{Backoff, BrokerLink, ConnectionState, LinkEvent, QoS};
use crate::logutil::truncate_payload;
use crate::mesh::{MeshMessage, MessageFactory, MessageKind, NodeCache};
use crate::metrics;

/// Parse-and-route step, separated from the connection loop.
#[derive(Clone)]
pub struct Ingestor {
    factory: MessageFactory,
    cache: Arc<NodeCache>,
    events: mpsc::Sender<MeshMessage>,
}

impl Ingestor {
    pub fn new(cache: Arc<NodeCache>, events: mpsc::Sender<MeshMessage>) -> Self {
        Self {
            factory: MessageFactory::new(),
            cache,
            events,
        }
    }

    /// Returns false once the downstream pipeline has shut down.
    pub async fn ingest(&self, topic: &str, payload: &[u8]) -> bool {
        let msg = match self.factory.parse(topic, payload) {
            Ok(msg) => msg,
            Err(e) => {
                metrics::inc_parse_errors();
                warn!(
                    "dropping message on {}: {} (payload: {})",
                    topic,
                    e,
                    truncate_payload(payload)
                );
                return true;
            }
        };
        self.cache.record_message(&msg);
        if msg.kind() == MessageKind::Unknown {
            debug!("{}: ignoring packet kind {:?}", msg.node_id, msg.payload);
            return true;
        }
        self.events.send(msg).await.is_ok()
    }
}

/// Source connection settings.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub filter: String,
    pub qos: QoS,
}

/// Drive the source link until the pipeline downstream is gone.
pub async fn run_source<L: BrokerLink>(
    spec: SourceSpec,
    mut link: L,
    mut backoff: Backoff,
    state_tx: watch::Sender<ConnectionState>,
    proxy: ProxyHandle,
    ingestor: Ingestor,
) {
    state_tx.send_replace(ConnectionState::Connecting);
    loop {
        match link.poll().await {
            LinkEvent::Connected => {
                backoff.reset();
                state_tx.send_replace(ConnectionState::Connected);
                info!("source connected; subscribing to {}", spec.filter);
                if let Err(e) = link.subscribe(&spec.filter, spec.qos) {
                    warn!("source subscribe to {} failed: {}", spec.filter, e);
                }
            }
            LinkEvent::Message { topic, payload } => {
                metrics::inc_mqtt_received();
                proxy.forward(&topic, &payload);
                if !ingestor.ingest(&topic, &payload).await {
                    break;
                }
            }
            LinkEvent::Disconnected(reason) => {
                let delay = backoff.next_delay();
                state_tx.send_replace(ConnectionState::Disconnected);
                warn!(
                    "source connection error: {} (retry in {}s)",
                    reason,
                    delay.as_secs_f32()
                );
                tokio::time::sleep(delay).await;
                state_tx.send_replace(ConnectionState::Reconnecting);
            }
            LinkEvent::Idle => {}
        }
    }
    state_tx.send_replace(ConnectionState::Disconnected);
    debug!("source loop stopped");
}
