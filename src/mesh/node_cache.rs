//! # Node Cache
//!
//! Last-known identity and location of every mesh node the bridge has heard.
//! Used only for name resolution in notifications, so entries are advisory and
//! never evicted.
//!
//! ## Concurrency
//!
//! All access goes through one [`RwLock`]. [`NodeCache::upsert`] performs the whole
//! read-merge-write under the write guard, so two concurrent partial updates for the
//! same node both land and readers only ever see fully merged records.
//!
//! ## Persistence
//!
//! A JSON snapshot can be loaded at startup and written back with
//! [`NodeCache::save_to_file`], which uses a temp file + rename so a crash never
//! leaves a truncated cache behind.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{MeshMessage, MeshPayload, NodeId, Position};

/// Cached metadata for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    #[serde(default)]
    pub long_name: Option<String>,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub hardware: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl NodeRecord {
    fn new(node_id: NodeId, at: DateTime<Utc>) -> Self {
        Self {
            node_id,
            long_name: None,
            short_name: None,
            hardware: None,
            position: None,
            first_seen: at,
            last_seen: at,
        }
    }

    /// Best human-readable name: long name, then short name, then the raw id.
    pub fn display_name(&self) -> &str {
        self.long_name
            .as_deref()
            .or(self.short_name.as_deref())
            .unwrap_or(self.node_id.as_str())
    }

    /// True when a non-id name is known.
    pub fn has_name(&self) -> bool {
        self.long_name.is_some() || self.short_name.is_some()
    }

    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_seen) > max_age
    }

    fn apply(&mut self, update: NodeUpdate) {
        if update.long_name.is_some() {
            self.long_name = update.long_name;
        }
        if update.short_name.is_some() {
            self.short_name = update.short_name;
        }
        if update.hardware.is_some() {
            self.hardware = update.hardware;
        }
        if update.position.is_some() {
            self.position = update.position;
        }
        if let Some(seen) = update.seen_at {
            if seen > self.last_seen {
                self.last_seen = seen;
            }
        }
    }
}

/// Partial record: `None` fields leave the cached value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hardware: Option<String>,
    pub position: Option<Position>,
    pub seen_at: Option<DateTime<Utc>>,
}

impl NodeUpdate {
    /// Extract the cache-relevant fields of a message, if it creates records.
    pub fn from_message(msg: &MeshMessage) -> Option<Self> {
        let mut update = NodeUpdate {
            seen_at: Some(msg.received_at),
            ..Default::default()
        };
        match &msg.payload {
            MeshPayload::NodeInfo(info) => {
                update.long_name = info.long_name.clone();
                update.short_name = info.short_name.clone();
                update.hardware = info.hardware.clone();
            }
            MeshPayload::Position(pos) => update.position = Some(*pos),
            _ => return None,
        }
        Some(update)
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    saved_at: DateTime<Utc>,
    nodes: BTreeMap<NodeId, NodeRecord>,
}

/// Shared node-id -> [`NodeRecord`] map.
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: RwLock<HashMap<NodeId, NodeRecord>>,
    dirty: AtomicBool,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, NodeRecord>> {
        self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, NodeRecord>> {
        self.nodes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merge `update` into the record for `node_id`, creating it if needed.
    /// Returns the merged record.
    pub fn upsert(&self, node_id: &NodeId, update: NodeUpdate) -> NodeRecord {
        let at = update.seen_at.unwrap_or_else(Utc::now);
        let mut nodes = self.write();
        let record = nodes
            .entry(node_id.clone())
            .or_insert_with(|| NodeRecord::new(node_id.clone(), at));
        record.apply(update);
        self.dirty.store(true, Ordering::Relaxed);
        record.clone()
    }

    /// Refresh `last_seen` of an existing record. Returns false if the node is unknown.
    pub fn touch(&self, node_id: &NodeId, at: DateTime<Utc>) -> bool {
        let mut nodes = self.write();
        match nodes.get_mut(node_id) {
            Some(record) => {
                if at > record.last_seen {
                    record.last_seen = at;
                    self.dirty.store(true, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    /// Apply a decoded message: nodeinfo/position upsert, anything else only
    /// refreshes an existing record.
    pub fn record_message(&self, msg: &MeshMessage) {
        match NodeUpdate::from_message(msg) {
            Some(update) => {
                self.upsert(&msg.node_id, update);
            }
            None => {
                self.touch(&msg.node_id, msg.received_at);
            }
        }
    }

    pub fn lookup(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.read().get(node_id).cloned()
    }

    /// Display name for `node_id`, falling back to the id itself.
    pub fn display_name(&self, node_id: &NodeId) -> String {
        self.read()
            .get(node_id)
            .map(|r| r.display_name().to_string())
            .unwrap_or_else(|| node_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn stale_count(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        self.read()
            .values()
            .filter(|r| r.is_stale(max_age, now))
            .count()
    }

    /// True if anything changed since the last successful save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Load a snapshot. A missing file yields an empty cache.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        // Guard against leading NULs left by a partial write on some filesystems
        let cleaned = content.trim_start_matches('\0');
        let file: CacheFile = serde_json::from_str(cleaned)?;
        Ok(Self {
            nodes: RwLock::new(file.nodes.into_iter().collect()),
            dirty: AtomicBool::new(false),
        })
    }

    /// Write a snapshot atomically: temp file in the same directory, rename, fsync dir.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        use std::fs::{self as sfs, File, OpenOptions};
        use std::io::Write;
        let path_ref = path.as_ref();

        self.dirty.store(false, Ordering::Relaxed);
        let snapshot = CacheFile {
            saved_at: Utc::now(),
            nodes: self
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let result = (|| -> anyhow::Result<()> {
            let content = serde_json::to_string_pretty(&snapshot)?;
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    sfs::create_dir_all(parent)?;
                }
            }
            let dir = match path_ref.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let base = path_ref
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("node_cache.json");
            let mut counter = 0u32;
            let tmp_path = loop {
                let candidate =
                    dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
                match OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&candidate)
                {
                    Ok(mut tmp) => {
                        tmp.write_all(content.as_bytes())?;
                        tmp.flush()?;
                        let _ = tmp.sync_all();
                        break candidate;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        counter = counter.saturating_add(1);
                    }
                    Err(e) => {
                        return Err(anyhow::anyhow!(
                            "failed to create temp file for node cache: {}",
                            e
                        ))
                    }
                }
            };
            sfs::rename(&tmp_path, path_ref)?;
            if let Ok(dir_file) = File::open(dir) {
                let _ = dir_file.sync_all();
            }
            Ok(())
        })();
        if result.is_err() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    #[test]
    fn upsert_merges_instead_of_replacing() {
        let cache = NodeCache::new();
        cache.upsert(
            &id("!1"),
            NodeUpdate {
                long_name: Some("Base".into()),
                hardware: Some("TBEAM".into()),
                ..Default::default()
            },
        );
        let merged = cache.upsert(
            &id("!1"),
            NodeUpdate {
                short_name: Some("BS".into()),
                ..Default::default()
            },
        );
        assert_eq!(merged.long_name.as_deref(), Some("Base"));
        assert_eq!(merged.short_name.as_deref(), Some("BS"));
        assert_eq!(merged.hardware.as_deref(), Some("TBEAM"));
    }

    #[test]
    fn touch_never_creates_records() {
        let cache = NodeCache::new();
        assert!(!cache.touch(&id("!2"), Utc::now()));
        assert!(cache.lookup(&id("!2")).is_none());
        assert!(!cache.is_dirty());
    }

    #[test]
    fn last_seen_only_moves_forward() {
        let cache = NodeCache::new();
        let t0 = Utc::now();
        cache.upsert(
            &id("!3"),
            NodeUpdate {
                short_name: Some("N3".into()),
                seen_at: Some(t0),
                ..Default::default()
            },
        );
        cache.touch(&id("!3"), t0 - Duration::seconds(30));
        assert_eq!(cache.lookup(&id("!3")).unwrap().last_seen, t0);
    }

    #[test]
    fn display_name_preference() {
        let mut rec = NodeRecord::new(id("!4"), Utc::now());
        assert_eq!(rec.display_name(), "!4");
        rec.short_name = Some("N4".into());
        assert_eq!(rec.display_name(), "N4");
        rec.long_name = Some("Node Four".into());
        assert_eq!(rec.display_name(), "Node Four");
    }

    #[test]
    fn staleness() {
        let now = Utc::now();
        let rec = NodeRecord::new(id("!5"), now - Duration::hours(30));
        assert!(rec.is_stale(Duration::hours(24), now));
        assert!(!rec.is_stale(Duration::hours(48), now));
    }
}
