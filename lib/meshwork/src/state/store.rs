//! Durable mirror behind the in-memory model.
//!
//! The relational deployments (SQLite, PostgreSQL, MySQL) implement this
//! trait outside the core, with schema owned by their migrations. In-tree
//! there are two backends with identical semantics: a volatile one for
//! tests and a serde_json snapshot file.

use crate::state::channel::ChannelEntry;
use crate::state::message::MessageLog;
use crate::state::node::Node;
use crate::state::settings::Settings;
use crate::state::telemetry::{NeighborLog, RouteSegmentLog, TelemetryLog, TracerouteLog};
use ferrite::NodeNum;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One entry in the automation audit trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unix milliseconds.
    pub timestamp: u64,
    pub task: String,
    pub target: Option<NodeNum>,
    pub outcome: String,
    pub detail: Option<String>,
}

/// Full persisted image of the mesh model.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: HashMap<NodeNum, Node>,
    pub local_node: Option<NodeNum>,
    pub channels: Vec<Option<ChannelEntry>>,
    pub messages: MessageLog,
    pub telemetry: TelemetryLog,
    pub traceroutes: TracerouteLog,
    pub route_segments: RouteSegmentLog,
    pub neighbor_info: NeighborLog,
    pub settings: Settings,
    pub audit_log: Vec<AuditEntry>,
    pub ignored_nodes: Vec<NodeNum>,
}

/// The durable mirror contract: hydrate on startup, persist on demand.
pub trait Store: Send {
    /// Loads the last persisted image, or `None` on first run.
    fn load(&mut self) -> StoreResult<Option<Snapshot>>;

    /// Persists a full image atomically.
    fn save(&mut self, snapshot: &Snapshot) -> StoreResult<()>;
}

/// Volatile store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Option<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore { snapshot: None }
    }
}

impl Store for MemoryStore {
    fn load(&mut self) -> StoreResult<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }

    fn save(&mut self, snapshot: &Snapshot) -> StoreResult<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }
}

/// Snapshot file on disk; writes go through a sibling temp file and an
/// atomic rename.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> JsonStore {
        JsonStore { path: path.into() }
    }
}

impl Store for JsonStore {
    fn load(&mut self) -> StoreResult<Option<Snapshot>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(serde_json::from_slice(&raw)?))
    }

    fn save(&mut self, snapshot: &Snapshot) -> StoreResult<()> {
        let encoded = serde_json::to_vec(snapshot)?;
        let tmp = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(&tmp, &encoded)?;
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("meshwork-{}-{}.json", name, process::id()))
    }

    fn sample_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::default();

        let mut node = Node::new(0x1234);
        node.long_name = Some("Gateway".into());
        snapshot.nodes.insert(node.num, node);
        snapshot.local_node = Some(0x1234);
        snapshot.channels = vec![Some(ChannelEntry::disabled(0)), None];
        snapshot.settings.set("auto_traceroute_enabled", true);
        snapshot.audit_log.push(AuditEntry {
            timestamp: 1,
            task: "traceroute".into(),
            target: Some(0x1234),
            outcome: "sent".into(),
            detail: None,
        });

        snapshot
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryStore::new();

        assert!(store.load().unwrap().is_none());

        store.save(&sample_snapshot()).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded.local_node, Some(0x1234));
        assert_eq!(loaded.nodes[&0x1234].long_name.as_deref(), Some("Gateway"));
    }

    #[test]
    fn test_json_store_roundtrip() {
        let path = scratch_path("roundtrip");
        let mut store = JsonStore::new(&path);

        assert!(store.load().unwrap().is_none());

        store.save(&sample_snapshot()).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded.local_node, Some(0x1234));
        assert_eq!(loaded.audit_log.len(), 1);
        assert!(loaded.settings.get_bool("auto_traceroute_enabled", false));

        drop(fs::remove_file(path));
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let path = scratch_path("garbage");
        fs::write(&path, b"not json").unwrap();

        let mut store = JsonStore::new(&path);
        assert!(store.load().is_err());

        drop(fs::remove_file(path));
    }
}
