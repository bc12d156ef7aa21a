//! Process-wide pipeline counters.
//! Plain relaxed atomics; read through [`snapshot`] by `/status` and tests.
use std::sync::atomic::{AtomicU64, Ordering};

static MQTT_RECEIVED: AtomicU64 = AtomicU64::new(0);
static PARSE_ERRORS: AtomicU64 = AtomicU64::new(0);
static NOTIFICATIONS_EMITTED: AtomicU64 = AtomicU64::new(0);
static TELEGRAM_SENT: AtomicU64 = AtomicU64::new(0);
static TELEGRAM_EDITED: AtomicU64 = AtomicU64::new(0);
static TELEGRAM_FAILED: AtomicU64 = AtomicU64::new(0);
static TELEGRAM_DROPPED: AtomicU64 = AtomicU64::new(0);
static PROXY_FORWARDED: AtomicU64 = AtomicU64::new(0);
static PROXY_DROPPED: AtomicU64 = AtomicU64::new(0);

pub fn inc_mqtt_received() {
    MQTT_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_parse_errors() {
    PARSE_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_notifications_emitted() {
    NOTIFICATIONS_EMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_telegram_sent() {
    TELEGRAM_SENT.fetch_add(1, Ordering::Relaxed);
}
/// Sent message updated with a further gateway reception.
pub fn inc_telegram_edited() {
    TELEGRAM_EDITED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_telegram_failed() {
    TELEGRAM_FAILED.fetch_add(1, Ordering::Relaxed);
}
/// Notification discarded because a chat's delivery queue was full.
pub fn inc_telegram_dropped() {
    TELEGRAM_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_proxy_forwarded() {
    PROXY_FORWARDED.fetch_add(1, Ordering::Relaxed);
}
/// Message not republished to a target (disconnected, queue full, publish error).
pub fn inc_proxy_dropped() {
    PROXY_DROPPED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub mqtt_received: u64,
    pub parse_errors: u64,
    pub notifications_emitted: u64,
    pub telegram_sent: u64,
    pub telegram_edited: u64,
    pub telegram_failed: u64,
    pub telegram_dropped: u64,
    pub proxy_forwarded: u64,
    pub proxy_dropped: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        mqtt_received: MQTT_RECEIVED.load(Ordering::Relaxed),
        parse_errors: PARSE_ERRORS.load(Ordering::Relaxed),
        notifications_emitted: NOTIFICATIONS_EMITTED.load(Ordering::Relaxed),
        telegram_sent: TELEGRAM_SENT.load(Ordering::Relaxed),
        telegram_edited: TELEGRAM_EDITED.load(Ordering::Relaxed),
        telegram_failed: TELEGRAM_FAILED.load(Ordering::Relaxed),
        telegram_dropped: TELEGRAM_DROPPED.load(Ordering::Relaxed),
        proxy_forwarded: PROXY_FORWARDED.load(Ordering::Relaxed),
        proxy_dropped: PROXY_DROPPED.load(Ordering::Relaxed),
    }
}
