//! Scratch tree of the discovered network namespace
//!
//! A scan walks the browse namespace breadth-first and records workgroups,
//! servers and file shares. The tree carries no identities; it only exists
//! to be diffed against the previous scan.

use std::cmp::Ordering;
use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use smbnet_core::url::{entry_url, NETWORK_URL};
use smbnet_core::{Errno, NodeKind};

use crate::remote::{RemoteDirEntry, RemoteEntryKind, RemoteLock};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeNode {
    pub kind: NodeKind,
    pub name: String,
    pub comment: String,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Empty namespace root
    pub fn network() -> Self {
        Self::new(NodeKind::Network, "", "")
    }

    pub fn new(kind: NodeKind, name: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            comment: comment.into(),
            children: Vec::new(),
        }
    }

    pub fn workgroup(name: &str) -> Self {
        Self::new(NodeKind::Workgroup, name, "")
    }

    pub fn server(name: &str, comment: &str) -> Self {
        Self::new(NodeKind::Server, name, comment)
    }

    pub fn share(name: &str, comment: &str) -> Self {
        Self::new(NodeKind::Share, name, comment)
    }

    pub fn with_children(mut self, children: Vec<TreeNode>) -> Self {
        self.children = children;
        self
    }

    pub fn add_child(&mut self, child: TreeNode) -> &mut TreeNode {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Sibling order used by the reconciler: name, then comment
    pub fn order(&self, other: &TreeNode) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.comment.cmp(&other.comment))
    }

    /// Sort every level recursively
    pub fn sort(&mut self) {
        self.children.sort_by(|a, b| a.order(b));
        for child in &mut self.children {
            child.sort();
        }
    }

    pub fn is_sorted(&self) -> bool {
        self.children
            .windows(2)
            .all(|pair| pair[0].order(&pair[1]) != Ordering::Greater)
            && self.children.iter().all(TreeNode::is_sorted)
    }

    /// Number of nodes below this one
    pub fn descendant_count(&self) -> usize {
        self.children
            .iter()
            .map(|c| 1 + c.descendant_count())
            .sum()
    }

    /// Child reached by following names from this node
    pub fn find(&self, path: &[&str]) -> Option<&TreeNode> {
        match path.split_first() {
            None => Some(self),
            Some((name, rest)) => self
                .children
                .iter()
                .find(|c| c.name == *name)
                .and_then(|c| c.find(rest)),
        }
    }

    fn child_at_mut(&mut self, path: &[usize]) -> &mut TreeNode {
        path.iter()
            .fold(self, |node, &index| &mut node.children[index])
    }
}

/// Tree kind for a browse entry, or `None` for entries a scan ignores
fn classify(entry: &RemoteDirEntry) -> Option<NodeKind> {
    match entry.kind {
        RemoteEntryKind::Workgroup => Some(NodeKind::Workgroup),
        RemoteEntryKind::Server => Some(NodeKind::Server),
        RemoteEntryKind::FileShare => Some(NodeKind::Share),
        _ => None,
    }
}

/// Walk the browse namespace breadth-first and return the sorted tree
///
/// Directories that fail to open or enumerate are logged and skipped. The
/// remote lock is held for one directory at a time.
pub fn scan_network(remote: &RemoteLock) -> TreeNode {
    let mut root = TreeNode::network();
    let mut queue: VecDeque<(Vec<usize>, String)> = VecDeque::new();
    queue.push_back((Vec::new(), NETWORK_URL.to_string()));

    while let Some((path, url)) = queue.pop_front() {
        let entries = match list_browse_dir(remote, &url) {
            Ok(entries) => entries,
            Err(errno) => {
                warn!("scan: skipping {}: {}", url, errno);
                continue;
            }
        };

        let dir = root.child_at_mut(&path);
        let dir_kind = dir.kind;
        for entry in entries {
            let Some(kind) = classify(&entry) else {
                trace!("scan: ignoring {} in {} ({:?})", entry.name, url, entry.kind);
                continue;
            };
            let child_url = entry_url(&url, dir_kind, &entry.name);
            dir.add_child(TreeNode::new(kind, entry.name, entry.comment));

            if kind != NodeKind::Share {
                let mut child_path = path.clone();
                child_path.push(dir.children.len() - 1);
                queue.push_back((child_path, child_url));
            }
        }
    }

    root.sort();
    debug!("scan: found {} resource(s)", root.descendant_count());
    root
}

fn list_browse_dir(remote: &RemoteLock, url: &str) -> Result<Vec<RemoteDirEntry>, Errno> {
    let mut client = remote.lock();
    let dir = client.open_dir(url)?;
    let mut entries = Vec::new();
    let result = loop {
        match client.read_dir_entry(dir) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => break Ok(entries),
            Err(errno) => break Err(errno),
        }
    };
    if let Err(errno) = client.close_dir(dir) {
        debug!("scan: closing {} failed: {}", url, errno);
    }
    result
}
