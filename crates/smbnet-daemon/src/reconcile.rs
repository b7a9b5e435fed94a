//! Diff between two discovery scans
//!
//! Both trees are sorted by name then comment at every level, so each level
//! is diffed with a single two-cursor merge. Additions are emitted parent
//! first, whole subtree included; a removal is emitted once for the top of
//! the removed subtree.

use std::cmp::Ordering;

use smbnet_core::url::{entry_url, NETWORK_URL};
use smbnet_core::{NodeKind, ResourceFound, ResourceLost, ScannerEvent};

use crate::discovery_tree::TreeNode;

/// Events that turn `old` into `new`
pub fn reconcile(old: &TreeNode, new: &TreeNode) -> Vec<ScannerEvent> {
    let mut events = Vec::new();
    diff_level(
        NETWORK_URL,
        NodeKind::Network,
        &old.children,
        &new.children,
        &mut events,
    );
    events
}

fn diff_level(
    dir_url: &str,
    dir_kind: NodeKind,
    old: &[TreeNode],
    new: &[TreeNode],
    out: &mut Vec<ScannerEvent>,
) {
    let (mut i, mut j) = (0, 0);

    while i < old.len() && j < new.len() {
        let (before, after) = (&old[i], &new[j]);

        // Same entry name with new metadata: replace it, removal first
        if before.name == after.name && (before.comment != after.comment || before.kind != after.kind)
        {
            emit_lost(dir_url, before, out);
            emit_found(dir_url, dir_kind, after, out);
            i += 1;
            j += 1;
            continue;
        }

        match before.order(after) {
            Ordering::Less => {
                emit_lost(dir_url, before, out);
                i += 1;
            }
            Ordering::Greater => {
                emit_found(dir_url, dir_kind, after, out);
                j += 1;
            }
            Ordering::Equal => {
                let url = entry_url(dir_url, dir_kind, &before.name);
                diff_level(&url, before.kind, &before.children, &after.children, out);
                i += 1;
                j += 1;
            }
        }
    }

    for before in &old[i..] {
        emit_lost(dir_url, before, out);
    }
    for after in &new[j..] {
        emit_found(dir_url, dir_kind, after, out);
    }
}

fn emit_lost(dir_url: &str, node: &TreeNode, out: &mut Vec<ScannerEvent>) {
    out.push(ScannerEvent::ResourceLost(ResourceLost {
        dir_url: dir_url.to_string(),
        name: node.name.clone(),
    }));
}

fn emit_found(dir_url: &str, dir_kind: NodeKind, node: &TreeNode, out: &mut Vec<ScannerEvent>) {
    out.push(ScannerEvent::ResourceFound(ResourceFound {
        kind: node.kind,
        dir_url: dir_url.to_string(),
        name: node.name.clone(),
        comment: node.comment.clone(),
    }));

    let url = entry_url(dir_url, dir_kind, &node.name);
    for child in &node.children {
        emit_found(&url, node.kind, child, out);
    }
}
