//! Core type definitions for the SMB network filesystem
//!
//! These types are shared by the registry, the node variants and the
//! filesystem adapter.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{BLOCK_SIZE, IO_SIZE, NOMINAL_CAPACITY};

/// Stable identity of a node, unique among live nodes
pub type NodeId = u64;

/// Never assigned to a node
pub const INVALID_NODE_ID: NodeId = 0;

/// Identity of the namespace root (`smb://`)
pub const NETWORK_NODE_ID: NodeId = 1;

/// First identity handed out by the registry
pub const FIRST_USER_NODE_ID: NodeId = 2;

/// Kind of a node in the network namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeKind {
    Network = 1,
    Workgroup = 2,
    Server = 3,
    Share = 4,
    ShareDirectory = 5,
    ShareFile = 6,
}

impl NodeKind {
    /// Discovery kinds are virtual, read-only directories
    pub fn is_discovery(self) -> bool {
        matches!(self, NodeKind::Network | NodeKind::Workgroup | NodeKind::Server)
    }

    pub fn is_directory(self) -> bool {
        !matches!(self, NodeKind::ShareFile)
    }

    pub fn file_type(self) -> FileType {
        if self.is_directory() {
            FileType::Directory
        } else {
            FileType::File
        }
    }

    /// Kind of the entries a discovery scan finds below this kind
    pub fn discovered_child(self) -> Option<NodeKind> {
        match self {
            NodeKind::Network => Some(NodeKind::Workgroup),
            NodeKind::Workgroup => Some(NodeKind::Server),
            NodeKind::Server => Some(NodeKind::Share),
            _ => None,
        }
    }
}

/// Type of filesystem entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    File = 0,
    Directory = 1,
}

/// Node attributes (similar to struct stat)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    pub id: NodeId,
    pub file_type: FileType,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub atime_nsec: u32,
    pub mtime: u64,
    pub mtime_nsec: u32,
    pub ctime: u64,
    pub ctime_nsec: u32,
}

impl FileAttr {
    /// Permissions of discovery directories (r-xr-xr-x)
    pub const DISCOVERY_DIR_MODE: u32 = 0o555;
    /// Execute bits, never reported for share entries
    pub const EXEC_BITS: u32 = 0o111;

    /// Attributes of a discovery directory created at `created`
    pub fn discovery_dir(id: NodeId, uid: u32, gid: u32, created: SystemTime) -> Self {
        let mut attr =
            Self::with_times(id, FileType::Directory, BLOCK_SIZE as u64, created, created);
        attr.mode = Self::DISCOVERY_DIR_MODE;
        attr.nlink = 2;
        attr.uid = uid;
        attr.gid = gid;
        attr
    }

    /// Attributes with the given access and modification times
    pub fn with_times(
        id: NodeId,
        file_type: FileType,
        size: u64,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> Self {
        let (asecs, ansecs) = split_time(atime);
        let (msecs, mnsecs) = split_time(mtime);
        Self {
            id,
            file_type,
            size,
            mode: 0,
            nlink: if file_type == FileType::Directory { 2 } else { 1 },
            uid: 0,
            gid: 0,
            atime: asecs,
            atime_nsec: ansecs,
            mtime: msecs,
            mtime_nsec: mnsecs,
            ctime: msecs,
            ctime_nsec: mnsecs,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Number of 512-byte blocks, as stat reports them
    pub fn blocks(&self) -> u64 {
        self.size.div_ceil(512)
    }
}

fn split_time(t: SystemTime) -> (u64, u32) {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    (d.as_secs(), d.subsec_nanos())
}

/// Directory entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub id: NodeId,
    pub file_type: FileType,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, id: NodeId, file_type: FileType) -> Self {
        Self {
            name: name.into(),
            id,
            file_type,
        }
    }
}

/// Open mode flags, carried as the host's `open(2)` flag word
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    pub const WRITE_ONLY: OpenFlags = OpenFlags(libc::O_WRONLY);
    pub const READ_WRITE: OpenFlags = OpenFlags(libc::O_RDWR);

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn with(self, other: i32) -> Self {
        OpenFlags(self.0 | other)
    }

    fn access_mode(self) -> i32 {
        self.0 & libc::O_ACCMODE
    }

    /// True if the mode permits writing or truncates
    pub fn writes(self) -> bool {
        self.access_mode() != libc::O_RDONLY || self.truncates()
    }

    pub fn reads(self) -> bool {
        self.access_mode() != libc::O_WRONLY
    }

    pub fn truncates(self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }

    pub fn exclusive(self) -> bool {
        self.0 & libc::O_EXCL != 0
    }
}

/// Attribute changes requested through `write_stat`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
}

impl SetAttr {
    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.mtime.is_none()
    }
}

/// Volume information (similar to struct statvfs)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub block_size: u32,
    pub io_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_nodes: u64,
    pub free_nodes: u64,
    pub volume_name: String,
    pub read_only: bool,
}

impl FsInfo {
    pub fn new(volume_name: impl Into<String>, read_only: bool) -> Self {
        let total_blocks = NOMINAL_CAPACITY / BLOCK_SIZE as u64;
        Self {
            block_size: BLOCK_SIZE,
            io_size: IO_SIZE,
            total_blocks,
            free_blocks: total_blocks,
            total_nodes: i64::MAX as u64,
            free_nodes: i64::MAX as u64,
            volume_name: volume_name.into(),
            read_only,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_kinds() {
        assert!(NodeKind::Network.is_discovery());
        assert!(NodeKind::Server.is_discovery());
        assert!(!NodeKind::Share.is_discovery());
        assert!(NodeKind::Share.is_directory());
        assert!(!NodeKind::ShareFile.is_directory());
        assert_eq!(NodeKind::ShareFile.file_type(), FileType::File);
    }

    #[test]
    fn test_discovered_child_levels() {
        assert_eq!(NodeKind::Network.discovered_child(), Some(NodeKind::Workgroup));
        assert_eq!(NodeKind::Workgroup.discovered_child(), Some(NodeKind::Server));
        assert_eq!(NodeKind::Server.discovered_child(), Some(NodeKind::Share));
        assert_eq!(NodeKind::Share.discovered_child(), None);
    }

    #[test]
    fn test_open_flags() {
        assert!(!OpenFlags::READ_ONLY.writes());
        assert!(OpenFlags::WRITE_ONLY.writes());
        assert!(!OpenFlags::WRITE_ONLY.reads());
        assert!(OpenFlags::READ_WRITE.reads());
        assert!(OpenFlags::READ_ONLY.with(libc::O_TRUNC).writes());
        assert!(OpenFlags::READ_WRITE.with(libc::O_EXCL).exclusive());
    }

    #[test]
    fn test_discovery_dir_attr() {
        let created = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let attr = FileAttr::discovery_dir(NETWORK_NODE_ID, 1000, 100, created);
        assert!(attr.is_dir());
        assert_eq!(attr.mode, 0o555);
        assert_eq!(attr.size, 4096);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.blocks(), 8);
        assert_eq!(attr.mtime, 1_700_000_000);
    }

    #[test]
    fn test_fs_info() {
        let info = FsInfo::new("SMB Network", true);
        assert_eq!(info.block_size, 4096);
        assert_eq!(info.total_blocks * 4096, NOMINAL_CAPACITY);
        assert_eq!(info.free_blocks, info.total_blocks);
        assert!(info.read_only);
    }
}
