//! Host notifications
//!
//! Structural changes made behind the host's back (scan results) or as a
//! side effect of a host call (create, remove, rename) are reported so that
//! kernel-level caches stay consistent.

use parking_lot::Mutex;
use tracing::debug;

use smbnet_core::NodeId;

pub trait HostNotifier: Send + Sync {
    /// `name` appeared in directory `dir` as node `id`
    fn entry_created(&self, dir: NodeId, name: &str, id: NodeId);

    /// `name` left directory `dir`
    fn entry_removed(&self, dir: NodeId, name: &str, id: NodeId);

    /// An entry moved; `id` is the identity it has now
    fn entry_moved(&self, from_dir: NodeId, from_name: &str, to_dir: NodeId, to_name: &str, id: NodeId);

    /// Node `id` no longer exists
    fn node_removed(&self, id: NodeId);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    EntryCreated {
        dir: NodeId,
        name: String,
        id: NodeId,
    },
    EntryRemoved {
        dir: NodeId,
        name: String,
        id: NodeId,
    },
    EntryMoved {
        from_dir: NodeId,
        from_name: String,
        to_dir: NodeId,
        to_name: String,
        id: NodeId,
    },
    NodeRemoved {
        id: NodeId,
    },
}

/// Logs notifications; used when the host keeps no caches to invalidate
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl HostNotifier for TracingNotifier {
    fn entry_created(&self, dir: NodeId, name: &str, id: NodeId) {
        debug!("entry created: {}/{} -> {}", dir, name, id);
    }

    fn entry_removed(&self, dir: NodeId, name: &str, id: NodeId) {
        debug!("entry removed: {}/{} ({})", dir, name, id);
    }

    fn entry_moved(&self, from_dir: NodeId, from_name: &str, to_dir: NodeId, to_name: &str, id: NodeId) {
        debug!("entry moved: {}/{} -> {}/{} ({})", from_dir, from_name, to_dir, to_name, id);
    }

    fn node_removed(&self, id: NodeId) {
        debug!("node removed: {}", id);
    }
}

/// Keeps every notification for inspection
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<HostEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }

    /// Return and clear the recorded notifications
    pub fn take(&self) -> Vec<HostEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push(&self, event: HostEvent) {
        self.events.lock().push(event);
    }
}

impl HostNotifier for RecordingNotifier {
    fn entry_created(&self, dir: NodeId, name: &str, id: NodeId) {
        self.push(HostEvent::EntryCreated {
            dir,
            name: name.to_string(),
            id,
        });
    }

    fn entry_removed(&self, dir: NodeId, name: &str, id: NodeId) {
        self.push(HostEvent::EntryRemoved {
            dir,
            name: name.to_string(),
            id,
        });
    }

    fn entry_moved(&self, from_dir: NodeId, from_name: &str, to_dir: NodeId, to_name: &str, id: NodeId) {
        self.push(HostEvent::EntryMoved {
            from_dir,
            from_name: from_name.to_string(),
            to_dir,
            to_name: to_name.to_string(),
            id,
        });
    }

    fn node_removed(&self, id: NodeId) {
        self.push(HostEvent::NodeRemoved { id });
    }
}
