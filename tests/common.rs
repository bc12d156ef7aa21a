//! Test doubles shared by integration tests.
//! In-memory [`BrokerLink`] and [`TelegramSink`] implementations driven over channels.
#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use meshgram::bridge::dispatch::TelegramSink;
use meshgram::mqtt::{BrokerLink, LinkError, LinkEvent, LinkPublisher, QoS};
use meshgram::telegram::DispatchError;

/// Something a [`ChannelLink`] was asked to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

/// Broker link whose events are scripted by the test.
pub struct ChannelLink {
    events: mpsc::UnboundedReceiver<LinkEvent>,
    published: mpsc::UnboundedSender<Published>,
    subscriptions: mpsc::UnboundedSender<String>,
}

/// Test-side handle of a [`ChannelLink`].
pub struct LinkController {
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub published: mpsc::UnboundedReceiver<Published>,
    pub subscriptions: mpsc::UnboundedReceiver<String>,
}

pub fn channel_link() -> (ChannelLink, LinkController) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (pub_tx, pub_rx) = mpsc::unbounded_channel();
    let (sub_tx, sub_rx) = mpsc::unbounded_channel();
    (
        ChannelLink {
            events: events_rx,
            published: pub_tx,
            subscriptions: sub_tx,
        },
        LinkController {
            events: events_tx,
            published: pub_rx,
            subscriptions: sub_rx,
        },
    )
}

#[async_trait]
impl BrokerLink for ChannelLink {
    async fn poll(&mut self) -> LinkEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    fn subscribe(&mut self, filter: &str, _qos: QoS) -> Result<(), LinkError> {
        self.subscriptions
            .send(filter.to_string())
            .map_err(|e| LinkError::Request(e.to_string()))
    }

    fn publisher(&self) -> Box<dyn LinkPublisher> {
        Box::new(ChannelPublisher(self.published.clone()))
    }
}

/// Publishing half of a test link; records every request on a channel.
pub struct ChannelPublisher(pub mpsc::UnboundedSender<Published>);

impl LinkPublisher for ChannelPublisher {
    fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), LinkError> {
        self.0
            .send(Published {
                topic: topic.to_string(),
                qos,
                payload,
            })
            .map_err(|e| LinkError::Request(e.to_string()))
    }
}

impl LinkController {
    pub fn send(&self, event: LinkEvent) {
        self.events.send(event).expect("link task alive");
    }

    pub fn message(&self, topic: &str, payload: &[u8]) {
        self.send(LinkEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
        });
    }

    pub async fn next_published(&mut self) -> Published {
        within(self.published.recv())
            .await
            .expect("publish channel open")
    }

    pub async fn next_subscription(&mut self) -> String {
        within(self.subscriptions.recv())
            .await
            .expect("subscription channel open")
    }
}

/// Telegram sink that records deliveries and fails for selected chats.
/// Message ids are handed out from 1 upwards across all chats.
pub struct RecordingSink {
    failing: HashSet<i64>,
    next_id: AtomicI64,
    delivered: mpsc::UnboundedSender<(i64, String)>,
    attempts: mpsc::UnboundedSender<i64>,
    edits: mpsc::UnboundedSender<Edit>,
}

/// An `edit_text` call seen by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct Edit {
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
}

pub struct SinkObserver {
    pub delivered: mpsc::UnboundedReceiver<(i64, String)>,
    pub attempts: mpsc::UnboundedReceiver<i64>,
    pub edits: mpsc::UnboundedReceiver<Edit>,
}

pub fn recording_sink(failing: impl IntoIterator<Item = i64>) -> (RecordingSink, SinkObserver) {
    let (d_tx, d_rx) = mpsc::unbounded_channel();
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (e_tx, e_rx) = mpsc::unbounded_channel();
    (
        RecordingSink {
            failing: failing.into_iter().collect(),
            next_id: AtomicI64::new(1),
            delivered: d_tx,
            attempts: a_tx,
            edits: e_tx,
        },
        SinkObserver {
            delivered: d_rx,
            attempts: a_rx,
            edits: e_rx,
        },
    )
}

fn blocked() -> DispatchError {
    DispatchError::Api {
        code: 403,
        description: "Forbidden: bot was blocked by the user".into(),
    }
}

#[async_trait]
impl TelegramSink for RecordingSink {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i64, DispatchError> {
        let _ = self.attempts.send(chat_id);
        if self.failing.contains(&chat_id) {
            return Err(blocked());
        }
        let _ = self.delivered.send((chat_id, text.to_string()));
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), DispatchError> {
        if self.failing.contains(&chat_id) {
            return Err(blocked());
        }
        let _ = self.edits.send(Edit {
            chat_id,
            message_id,
            text: text.to_string(),
        });
        Ok(())
    }
}

impl SinkObserver {
    pub async fn next_delivery(&mut self) -> (i64, String) {
        within(self.delivered.recv())
            .await
            .expect("sink still alive")
    }

    pub async fn next_edit(&mut self) -> Edit {
        within(self.edits.recv()).await.expect("sink still alive")
    }

    /// Collect deliveries until nothing arrives for `quiet`.
    pub async fn collect_for(&mut self, quiet: Duration) -> Vec<(i64, String)> {
        let mut out = Vec::new();
        while let Ok(Some(d)) = tokio::time::timeout(quiet, self.delivered.recv()).await {
            out.push(d);
        }
        out
    }
}

/// Bound every wait in tests so a regression fails instead of hanging.
pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out waiting")
}
