//! Behaviour shared by share directories and share files

use tracing::{trace, warn};

use smbnet_core::{FileAttr, FileType, FsError, FsResult, NodeId, OpenFlags, SetAttr};

use super::NodeHandle;
use crate::registry::{Node, NodeRegistry};
use crate::remote::{RemoteFile, RemoteGuard};
use crate::volume::Volume;

/// Attributes of a share entry as the host sees them
pub(super) fn read_stat(volume: &Volume, handle: &NodeHandle) -> FsResult<FileAttr> {
    let stat = volume.remote().stat(&handle.url)?;
    let file_type = if stat.is_dir {
        FileType::Directory
    } else {
        FileType::File
    };

    let mut attr = FileAttr::with_times(handle.id, file_type, stat.size, stat.atime, stat.mtime);
    attr.mode = stat.mode & 0o7777;
    if !stat.is_dir {
        attr.mode &= !FileAttr::EXEC_BITS;
    }
    if volume.is_read_only() {
        attr.mode &= !0o222;
    }
    (attr.uid, attr.gid) = volume.owner();
    Ok(attr)
}

/// Apply size and modification time changes on the remote side
pub(super) fn write_stat(volume: &Volume, handle: &NodeHandle, changes: &SetAttr) -> FsResult<()> {
    if changes.is_empty() {
        return Ok(());
    }
    if volume.is_read_only() {
        return Err(FsError::ReadOnly);
    }

    let mut remote = volume.remote();
    if let Some(size) = changes.size {
        let file = remote.open(&handle.url, OpenFlags::WRITE_ONLY)?;
        let truncated = remote.truncate(file, size);
        let closed = remote.close(file);
        truncated?;
        closed?;
    }
    if let Some(mtime) = changes.mtime {
        remote.set_mtime(&handle.url, mtime)?;
    }
    Ok(())
}

/// Node for a share entry known to exist remotely, created on first use
///
/// Returns the identity and whether a new node was memorized. An entry whose
/// kind changed behind our back is replaced.
pub(super) fn materialize(
    volume: &Volume,
    registry: &mut NodeRegistry,
    parent: NodeId,
    url: &str,
    name: &str,
    is_dir: bool,
) -> (NodeId, bool) {
    if let Some(node) = registry.recall(url) {
        if node.kind.is_directory() == is_dir {
            return (node.id, false);
        }
        let stale = node.id;
        warn!("{} changed kind, replacing node {}", url, stale);
        for id in registry.forget_subtree(stale) {
            volume.notifier().node_removed(id);
        }
    }

    let id = registry.allocate_identity();
    registry.memorize(Node::share_entry(id, url.to_string(), name, is_dir, parent));
    trace!("materialized {} as {}", url, id);
    (id, true)
}

/// Drop the node for a removed entry, if one was ever handed out
pub(super) fn forget_entry(
    volume: &Volume,
    registry: &mut NodeRegistry,
    dir: NodeId,
    url: &str,
    name: &str,
) {
    let Some(id) = registry.recall_id(url) else {
        return;
    };
    let forgotten = registry.forget_subtree(id);
    let notifier = volume.notifier();
    notifier.entry_removed(dir, name, id);
    for id in forgotten {
        notifier.node_removed(id);
    }
}

/// Close a remote file, logging instead of failing
pub(super) fn close_quietly(remote: &mut RemoteGuard<'_>, url: &str, file: RemoteFile) {
    if let Err(e) = remote.close(file) {
        warn!("closing {} failed: {}", url, e);
    }
}
