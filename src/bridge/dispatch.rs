//! # Dispatch Service
//!
//! Fans a rendered notification out to the group chat and to individual users.
//!
//! Every destination chat has its own delivery worker fed through a bounded queue, so
//! a slow or failing chat never holds up the others or the pipeline upstream:
//!
//! - per-chat order is preserved (one worker, FIFO queue)
//! - a full queue drops the notification for that chat only
//! - a failed send is logged with the chat id and not retried
//!
//! A worker remembers the Telegram message id of recent packet notifications, so a
//! later reception of the same packet edits that message instead of posting again.
//! Edits for a packet the chat never received successfully are skipped.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshgram::bridge::dispatch::{Audience, Dispatcher};
//! use meshgram::bridge::{AccessPolicy, OutboundNotification};
//! use meshgram::telegram::TelegramClient;
//! use meshgram::config::TelegramConfig;
//!
//! # async fn demo(cfg: TelegramConfig) {
//! let sink = Arc::new(TelegramClient::new(&cfg));
//! let mut dispatcher = Dispatcher::new(sink, Audience::from_config(&cfg));
//! dispatcher.dispatch(&OutboundNotification::for_group("Base: hello"));
//! dispatcher.close().await;
//! # }
//! ```

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::access::AccessPolicy;
use super::format::{Formatter, OutboundNotification};
use super::grouping::{MeshEvent, PacketKey};
use crate::config::TelegramConfig;
use crate::metrics;
use crate::telegram::DispatchError;

/// Queue depth of one chat's delivery worker.
pub const CHAT_QUEUE: usize = 64;

/// Sent packet notifications a worker can still edit.
pub const EDITABLE_MESSAGES: usize = 256;

/// Outbound Telegram transport.
#[async_trait]
pub trait TelegramSink: Send + Sync + 'static {
    /// Post a new message; returns its Telegram message id.
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i64, DispatchError>;

    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str)
        -> Result<(), DispatchError>;
}

/// Who receives mesh-originated notifications.
#[derive(Debug, Clone, Default)]
pub struct Audience {
    pub group_chat_id: Option<i64>,
    /// Default user recipients, before policy filtering.
    pub users: Vec<i64>,
    pub notify_users: bool,
    pub policy: AccessPolicy,
}

impl Audience {
    /// `notify_user_ids` when set, else the allow-list.
    pub fn from_config(cfg: &TelegramConfig) -> Self {
        let users = if cfg.notify_user_ids.is_empty() {
            cfg.allowed_user_ids.clone()
        } else {
            cfg.notify_user_ids.clone()
        };
        Self {
            group_chat_id: cfg.group_chat_id,
            users,
            notify_users: cfg.notify_users,
            policy: AccessPolicy::new(cfg.allowed_user_ids.iter().copied()),
        }
    }

    /// Destination chat ids for `n`: the group first, then users, without duplicates.
    pub fn resolve(&self, n: &OutboundNotification) -> Vec<i64> {
        let mut chats = Vec::new();
        if n.to_group {
            if let Some(group) = self.group_chat_id {
                chats.push(group);
            }
        }
        let users = match &n.recipients {
            Some(explicit) => self.policy.filter(explicit),
            None if self.notify_users => self.policy.filter(&self.users),
            None => Vec::new(),
        };
        for user in users {
            if !chats.contains(&user) {
                chats.push(user);
            }
        }
        chats
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    text: Arc<str>,
    packet: Option<PacketKey>,
    edit: bool,
}

struct Worker {
    tx: mpsc::Sender<Delivery>,
    task: JoinHandle<()>,
}

/// Per-chat delivery workers on top of a [`TelegramSink`].
pub struct Dispatcher<S: TelegramSink> {
    sink: Arc<S>,
    audience: Audience,
    workers: HashMap<i64, Worker>,
}

impl<S: TelegramSink> Dispatcher<S> {
    pub fn new(sink: Arc<S>, audience: Audience) -> Self {
        Self {
            sink,
            audience,
            workers: HashMap::new(),
        }
    }

    pub fn audience(&self) -> &Audience {
        &self.audience
    }

    /// Queue `n` for every destination. Returns the number of chats it was queued for.
    pub fn dispatch(&mut self, n: &OutboundNotification) -> usize {
        let delivery = Delivery {
            text: Arc::from(n.text.as_str()),
            packet: n.packet.clone(),
            edit: n.edit,
        };
        let mut queued = 0;
        for chat_id in self.audience.resolve(n) {
            match self.worker(chat_id).tx.try_send(delivery.clone()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::inc_telegram_dropped();
                    warn!("telegram chat={} queue full; notification dropped", chat_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    metrics::inc_telegram_dropped();
                    warn!("telegram chat={} worker stopped; notification dropped", chat_id);
                    self.workers.remove(&chat_id);
                }
            }
        }
        queued
    }

    fn worker(&mut self, chat_id: i64) -> &Worker {
        let sink = &self.sink;
        self.workers.entry(chat_id).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(CHAT_QUEUE);
            let task = tokio::spawn(deliver(sink.clone(), chat_id, rx));
            Worker { tx, task }
        })
    }

    /// Stop accepting work and let workers finish their queues, bounded by `grace`.
    pub async fn close_within(self, grace: Duration) {
        let tasks: Vec<JoinHandle<()>> = self
            .workers
            .into_values()
            .map(|w| {
                drop(w.tx);
                w.task
            })
            .collect();
        let all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, all).await.is_err() {
            warn!("telegram delivery did not finish within {:?}", grace);
        }
    }

    pub async fn close(self) {
        self.close_within(Duration::from_secs(5)).await
    }
}

/// Telegram message ids of recently sent packet notifications, oldest evicted first.
#[derive(Debug, Default)]
struct SentMessages {
    ids: HashMap<PacketKey, i64>,
    order: VecDeque<PacketKey>,
}

impl SentMessages {
    fn remember(&mut self, key: PacketKey, message_id: i64) {
        if self.ids.insert(key.clone(), message_id).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > EDITABLE_MESSAGES {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn get(&self, key: &PacketKey) -> Option<i64> {
        self.ids.get(key).copied()
    }
}

async fn deliver<S: TelegramSink>(sink: Arc<S>, chat_id: i64, mut rx: mpsc::Receiver<Delivery>) {
    let mut sent = SentMessages::default();
    while let Some(d) = rx.recv().await {
        if d.edit {
            let Some(message_id) = d.packet.as_ref().and_then(|k| sent.get(k)) else {
                debug!("telegram chat={} has nothing to edit for {:?}", chat_id, d.packet);
                continue;
            };
            match sink.edit_text(chat_id, message_id, &d.text).await {
                Ok(()) => metrics::inc_telegram_edited(),
                Err(e) => {
                    metrics::inc_telegram_failed();
                    warn!("telegram edit of chat={} message={} failed: {}", chat_id, message_id, e);
                }
            }
            continue;
        }
        match sink.send_text(chat_id, &d.text).await {
            Ok(message_id) => {
                metrics::inc_telegram_sent();
                if let Some(key) = d.packet {
                    sent.remember(key, message_id);
                }
            }
            Err(e) => {
                metrics::inc_telegram_failed();
                warn!("telegram send to chat={} failed: {}", chat_id, e);
            }
        }
    }
    debug!("telegram worker chat={} stopped", chat_id);
}

/// Format grouped events and dispatch them until `events` closes.
pub fn spawn_notifier<S: TelegramSink>(
    mut events: mpsc::Receiver<MeshEvent>,
    formatter: Formatter,
    mut dispatcher: Dispatcher<S>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(notification) = formatter.format(&event) else {
                continue;
            };
            metrics::inc_notifications_emitted();
            if dispatcher.dispatch(&notification) == 0 {
                debug!("no destination for notification about {}", event.node_id());
            }
        }
        dispatcher.close().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audience(users: Vec<i64>, allowed: Vec<i64>) -> Audience {
        Audience {
            group_chat_id: Some(-100),
            users,
            notify_users: true,
            policy: AccessPolicy::new(allowed),
        }
    }

    #[test]
    fn group_comes_first_and_users_are_filtered() {
        let a = audience(vec![1, 2, 3], vec![1, 3]);
        assert_eq!(a.resolve(&OutboundNotification::for_group("x")), vec![-100, 1, 3]);
    }

    #[test]
    fn explicit_recipients_still_pass_the_policy() {
        let a = audience(vec![1], vec![1, 2]);
        let n = OutboundNotification {
            text: "x".into(),
            to_group: false,
            recipients: Some(vec![2, 9]),
            packet: None,
            edit: false,
        };
        assert_eq!(a.resolve(&n), vec![2]);
    }

    #[test]
    fn group_route_skips_notify_users() {
        let a = audience(vec![1, 2], vec![]);
        let n = OutboundNotification::routed("x", crate::mesh::Route::Group);
        assert_eq!(a.resolve(&n), vec![-100]);
    }

    #[test]
    fn sent_messages_forget_the_oldest() {
        let mut sent = SentMessages::default();
        let key = |i: u32| (crate::mesh::NodeId::from_num(1), i);
        for i in 0..(EDITABLE_MESSAGES as u32 + 1) {
            sent.remember(key(i), i as i64 + 100);
        }
        assert_eq!(sent.get(&key(0)), None);
        assert_eq!(sent.get(&key(1)), Some(101));
        assert_eq!(sent.ids.len(), EDITABLE_MESSAGES);
    }

    #[test]
    fn notify_users_off_keeps_group_only() {
        let mut a = audience(vec![1, 2], vec![]);
        a.notify_users = false;
        assert_eq!(a.resolve(&OutboundNotification::for_group("x")), vec![-100]);
    }

    #[test]
    fn audience_defaults_to_allow_list() {
        let cfg = TelegramConfig {
            allowed_user_ids: vec![5, 6],
            ..Default::default()
        };
        assert_eq!(Audience::from_config(&cfg).users, vec![5, 6]);

        let cfg = TelegramConfig {
            allowed_user_ids: vec![5, 6],
            notify_user_ids: vec![6],
            ..Default::default()
        };
        assert_eq!(Audience::from_config(&cfg).users, vec![6]);
    }
}
