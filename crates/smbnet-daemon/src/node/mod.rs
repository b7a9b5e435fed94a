//! Node dispatch
//!
//! Every node kind implements [`FsNode`]; operations a kind does not support
//! fall back to the kind-appropriate error. The volume resolves an identity
//! to a [`NodeView`], a short-lived snapshot of the node bound to the volume,
//! and dispatches through it without holding the registry lock.

mod discovery;
mod share;
mod share_dir;
mod share_file;

use smbnet_core::{
    DirEntry, FileAttr, FsError, FsResult, NodeId, NodeKind, OpenFlags, SetAttr,
};

use crate::registry::Node;
use crate::remote::{RemoteDir, RemoteFile};
use crate::volume::Volume;

pub(crate) use discovery::DiscoveryNode;
pub(crate) use share_dir::ShareDirectoryNode;
pub(crate) use share_file::ShareFileNode;

/// Snapshot of the registry fields an operation needs
#[derive(Clone, Debug)]
pub(crate) struct NodeHandle {
    pub id: NodeId,
    pub url: String,
    pub kind: NodeKind,
    pub parent: NodeId,
}

impl From<&Node> for NodeHandle {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id,
            url: node.url.clone(),
            kind: node.kind,
            parent: node.parent,
        }
    }
}

/// Open file handed out by `open` and `create`
#[derive(Debug)]
pub struct FileCookie {
    node: NodeId,
    pub(crate) state: FileState,
}

#[derive(Debug)]
pub(crate) enum FileState {
    /// Directories open as files carry nothing
    Directory,
    ShareFile { file: Option<RemoteFile> },
}

impl FileCookie {
    pub(crate) fn new(node: NodeId, state: FileState) -> Self {
        Self { node, state }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }
}

/// Directory iterator handed out by `open_dir`
#[derive(Debug)]
pub struct DirCookie {
    node: NodeId,
    open: bool,
    pub(crate) cursor: DirCursor,
}

#[derive(Debug)]
pub(crate) enum DirCursor {
    /// Position 0 and 1 are the dot entries, then the entry slots
    Discovery { position: usize, generation: u64 },
    /// Position 0 and 1 are the dot entries, then the remote listing,
    /// opened on first read
    Share {
        position: usize,
        remote: Option<RemoteDir>,
    },
}

impl DirCookie {
    pub(crate) fn new(node: NodeId, cursor: DirCursor) -> Self {
        Self {
            node,
            open: true,
            cursor,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn ensure_open(&self) -> FsResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(FsError::CookieClosed)
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.open = false;
    }
}

/// Operations the host can invoke on a node
pub(crate) trait FsNode {
    fn read_stat(&self) -> FsResult<FileAttr>;

    fn write_stat(&self, changes: &SetAttr) -> FsResult<()>;

    fn open(&self, flags: OpenFlags) -> FsResult<FileCookie>;

    fn close(&self, _cookie: &mut FileCookie) -> FsResult<()> {
        Ok(())
    }

    fn free_cookie(&self, _cookie: FileCookie) -> FsResult<()> {
        Ok(())
    }

    fn read(&self, _cookie: &mut FileCookie, _offset: i64, _size: usize) -> FsResult<Vec<u8>> {
        Err(FsError::IsADirectory)
    }

    fn write(&self, _cookie: &mut FileCookie, _offset: i64, _data: &[u8]) -> FsResult<usize> {
        Err(FsError::IsADirectory)
    }

    fn lookup(&self, _name: &str) -> FsResult<NodeId> {
        Err(FsError::NotADirectory)
    }

    fn create(&self, _name: &str, _flags: OpenFlags, _mode: u32) -> FsResult<(NodeId, FileCookie)> {
        Err(FsError::NotADirectory)
    }

    fn remove(&self, _name: &str) -> FsResult<()> {
        Err(FsError::NotADirectory)
    }

    fn rename(&self, _from_name: &str, _to_dir: &NodeHandle, _to_name: &str) -> FsResult<()> {
        Err(FsError::NotADirectory)
    }

    fn create_dir(&self, _name: &str, _mode: u32) -> FsResult<NodeId> {
        Err(FsError::NotADirectory)
    }

    fn remove_dir(&self, _name: &str) -> FsResult<()> {
        Err(FsError::NotADirectory)
    }

    fn open_dir(&self) -> FsResult<DirCookie> {
        Err(FsError::NotADirectory)
    }

    fn close_dir(&self, _cookie: &mut DirCookie) -> FsResult<()> {
        Err(FsError::NotADirectory)
    }

    fn read_dir(&self, _cookie: &mut DirCookie, _max: usize) -> FsResult<Vec<DirEntry>> {
        Err(FsError::NotADirectory)
    }

    fn rewind_dir(&self, _cookie: &mut DirCookie) -> FsResult<()> {
        Err(FsError::NotADirectory)
    }

    fn free_dir_cookie(&self, _cookie: DirCookie) -> FsResult<()> {
        Err(FsError::NotADirectory)
    }
}

/// A node bound to its volume, tagged by kind
pub(crate) enum NodeView<'v> {
    Discovery(DiscoveryNode<'v>),
    ShareDirectory(ShareDirectoryNode<'v>),
    ShareFile(ShareFileNode<'v>),
}

impl<'v> NodeView<'v> {
    pub(crate) fn new(volume: &'v Volume, handle: NodeHandle) -> Self {
        match handle.kind {
            NodeKind::Network | NodeKind::Workgroup | NodeKind::Server => {
                NodeView::Discovery(DiscoveryNode::new(volume, handle))
            }
            NodeKind::Share | NodeKind::ShareDirectory => {
                NodeView::ShareDirectory(ShareDirectoryNode::new(volume, handle))
            }
            NodeKind::ShareFile => NodeView::ShareFile(ShareFileNode::new(volume, handle)),
        }
    }

    pub(crate) fn node(&self) -> &dyn FsNode {
        match self {
            NodeView::Discovery(node) => node,
            NodeView::ShareDirectory(node) => node,
            NodeView::ShareFile(node) => node,
        }
    }
}
