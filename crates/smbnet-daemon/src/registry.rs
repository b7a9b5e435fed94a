//! Node registry
//!
//! Owns every live node in an arena keyed by identity, plus a URL index
//! pointing back into the arena. Parents are stored as identities and
//! resolved through the arena.
//!
//! The registry has no lock of its own: the volume keeps it behind a single
//! mutex so callers can batch several operations in one critical section.

use std::collections::HashMap;
use std::time::SystemTime;

use tracing::{debug, trace};

use smbnet_core::url::NETWORK_URL;
use smbnet_core::{
    FsError, FsResult, NodeId, NodeKind, FIRST_USER_NODE_ID, INVALID_NODE_ID, NETWORK_NODE_ID,
};

/// Lifecycle of an entry in a discovery directory
///
/// `Live -> Gone` when nobody has the directory open, otherwise
/// `Live -> MarkedRemoved -> Gone` once the last iterator closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Live,
    /// Removed at the given directory generation, still visible to
    /// iterators opened before it
    MarkedRemoved { at: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntrySlot {
    pub id: NodeId,
    pub name: String,
    pub state: EntryState,
}

impl EntrySlot {
    /// Whether an iterator opened at `generation` lists this entry
    pub fn visible_at(&self, generation: u64) -> bool {
        match self.state {
            EntryState::Live => true,
            EntryState::MarkedRemoved { at } => generation < at,
        }
    }
}

/// Outcome of removing an entry from a discovery directory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    /// Directory is open; the entry stays until the last close
    Marked(NodeId),
    /// Entry left the directory immediately
    Gone(NodeId),
}

/// Entry list of a discovery directory
#[derive(Debug, Default)]
pub struct DiscoveryDir {
    entries: Vec<EntrySlot>,
    open_count: u32,
    generation: u64,
}

impl DiscoveryDir {
    pub fn entries(&self) -> &[EntrySlot] {
        &self.entries
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn add_entry(&mut self, id: NodeId, name: &str) {
        self.entries.push(EntrySlot {
            id,
            name: name.to_string(),
            state: EntryState::Live,
        });
    }

    pub fn find_live(&self, name: &str) -> Option<NodeId> {
        self.entries
            .iter()
            .find(|e| e.state == EntryState::Live && e.name == name)
            .map(|e| e.id)
    }

    /// Make a marked entry live again; false if `id` has no marked slot
    pub fn revive(&mut self, id: NodeId) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.id == id && e.state != EntryState::Live)
        {
            Some(entry) => {
                entry.state = EntryState::Live;
                true
            }
            None => false,
        }
    }

    pub fn remove_entry(&mut self, name: &str) -> Option<Removal> {
        let index = self
            .entries
            .iter()
            .position(|e| e.state == EntryState::Live && e.name == name)?;

        if self.open_count > 0 {
            self.generation += 1;
            let entry = &mut self.entries[index];
            entry.state = EntryState::MarkedRemoved {
                at: self.generation,
            };
            Some(Removal::Marked(entry.id))
        } else {
            Some(Removal::Gone(self.entries.remove(index).id))
        }
    }

    /// Register an iterator; true for the first concurrent opener
    pub fn open(&mut self) -> bool {
        self.open_count += 1;
        self.open_count == 1
    }

    /// Unregister an iterator; on the last close returns the purged entries
    pub fn close(&mut self) -> Option<Vec<NodeId>> {
        debug_assert!(self.open_count > 0, "discovery directory closed more often than opened");
        self.open_count = self.open_count.saturating_sub(1);
        if self.open_count > 0 {
            return None;
        }

        let mut purged = Vec::new();
        self.entries.retain(|e| match e.state {
            EntryState::Live => true,
            EntryState::MarkedRemoved { .. } => {
                purged.push(e.id);
                false
            }
        });
        Some(purged)
    }
}

/// Backing state by node kind
#[derive(Debug)]
pub enum Backing {
    Discovery(DiscoveryDir),
    /// Share nodes carry nothing beyond their URL
    Share,
}

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub url: String,
    name_len: usize,
    pub comment: String,
    pub kind: NodeKind,
    pub parent: NodeId,
    pub backing: Backing,
    pub created: SystemTime,
}

impl Node {
    /// The namespace root; its own parent
    pub fn network() -> Self {
        Self {
            id: NETWORK_NODE_ID,
            url: NETWORK_URL.to_string(),
            name_len: 0,
            comment: String::new(),
            kind: NodeKind::Network,
            parent: NETWORK_NODE_ID,
            backing: Backing::Discovery(DiscoveryDir::default()),
            created: SystemTime::now(),
        }
    }

    /// A workgroup, server or share found by a scan
    pub fn discovered(
        id: NodeId,
        url: String,
        name: &str,
        comment: &str,
        kind: NodeKind,
        parent: NodeId,
    ) -> Self {
        let backing = if kind.is_discovery() {
            Backing::Discovery(DiscoveryDir::default())
        } else {
            Backing::Share
        };
        Self {
            id,
            name_len: name.len(),
            url,
            comment: comment.to_string(),
            kind,
            parent,
            backing,
            created: SystemTime::now(),
        }
    }

    /// A directory or file inside a share
    pub fn share_entry(id: NodeId, url: String, name: &str, is_dir: bool, parent: NodeId) -> Self {
        let kind = if is_dir {
            NodeKind::ShareDirectory
        } else {
            NodeKind::ShareFile
        };
        Self::discovered(id, url, name, "", kind, parent)
    }

    pub fn name(&self) -> &str {
        &self.url[self.url.len() - self.name_len..]
    }

    pub fn discovery_dir(&self) -> Option<&DiscoveryDir> {
        match &self.backing {
            Backing::Discovery(dir) => Some(dir),
            Backing::Share => None,
        }
    }

    pub fn discovery_dir_mut(&mut self) -> Option<&mut DiscoveryDir> {
        match &mut self.backing {
            Backing::Discovery(dir) => Some(dir),
            Backing::Share => None,
        }
    }
}

/// Identity and URL indexes over the live nodes
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, Node>,
    by_url: HashMap<String, NodeId>,
    next_id: NodeId,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            by_url: HashMap::new(),
            next_id: FIRST_USER_NODE_ID,
        }
    }

    /// Registry holding only the namespace root
    pub fn with_network_root() -> Self {
        let mut registry = Self::new();
        registry.memorize(Node::network());
        registry
    }

    /// Hand out a fresh identity
    ///
    /// # Panics
    /// Panics when the identity space is exhausted.
    pub fn allocate_identity(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id = match id.checked_add(1) {
            Some(next) => next,
            None => panic!("node identity space exhausted"),
        };
        id
    }

    /// Insert a node into both indexes
    ///
    /// # Panics
    /// Panics if the node has no identity, or if its URL or identity is
    /// already registered.
    pub fn memorize(&mut self, node: Node) {
        assert!(node.id != INVALID_NODE_ID, "memorizing {} without an identity", node.url);
        assert!(
            !self.by_url.contains_key(&node.url),
            "{} memorized twice",
            node.url
        );
        assert!(
            !self.nodes.contains_key(&node.id),
            "identity {} memorized twice",
            node.id
        );

        trace!("memorize {} as {}", node.url, node.id);
        self.by_url.insert(node.url.clone(), node.id);
        self.nodes.insert(node.id, node);
    }

    pub fn recall(&self, url: &str) -> Option<&Node> {
        self.by_url.get(url).and_then(|id| self.nodes.get(id))
    }

    pub fn recall_id(&self, url: &str) -> Option<NodeId> {
        self.by_url.get(url).copied()
    }

    /// Remove a node from both indexes
    pub fn forget(&mut self, url: &str) -> FsResult<Node> {
        let id = self.by_url.remove(url).ok_or(FsError::NotFound)?;
        let node = self.nodes.remove(&id);
        assert!(node.is_some(), "{} indexed without a node", url);
        trace!("forget {} ({})", url, id);
        node.ok_or(FsError::NotFound)
    }

    /// Forget a node and everything below it; returns the forgotten
    /// identities, top first
    pub fn forget_subtree(&mut self, id: NodeId) -> Vec<NodeId> {
        let doomed = self.subtree(id);
        for &doomed_id in &doomed {
            if let Some(node) = self.nodes.remove(&doomed_id) {
                self.by_url.remove(&node.url);
            }
        }
        if !doomed.is_empty() {
            debug!("forgot {} node(s) below and including {}", doomed.len(), id);
        }
        doomed
    }

    /// Identities of a node and its descendants in breadth-first order
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        if !self.nodes.contains_key(&id) {
            return Vec::new();
        }
        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in self.nodes.values() {
            if node.parent != node.id {
                children.entry(node.parent).or_default().push(node.id);
            }
        }

        let mut out = vec![id];
        let mut next = 0;
        while next < out.len() {
            if let Some(kids) = children.get(&out[next]) {
                out.extend_from_slice(kids);
            }
            next += 1;
        }
        out
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check that both indexes describe the same set of nodes
    pub fn is_consistent(&self) -> bool {
        self.nodes.len() == self.by_url.len()
            && self
                .by_url
                .iter()
                .all(|(url, id)| self.nodes.get(id).is_some_and(|n| &n.url == url && n.id == *id))
    }
}
