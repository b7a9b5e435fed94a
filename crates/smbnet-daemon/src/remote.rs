//! Remote share client seam
//!
//! The file-sharing protocol client is an external, blocking and
//! non-reentrant API. It is only reachable through [`RemoteLock`], so every
//! call is made while holding the process-wide remote lock.
//!
//! Lock order: the remote lock is always taken before the registry lock.

use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use smbnet_core::{Errno, OpenFlags};

/// Open file on the remote side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RemoteFile(pub u64);

/// Open directory or browse listing on the remote side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RemoteDir(pub u64);

/// Classification of a remote directory entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteEntryKind {
    Workgroup,
    Server,
    FileShare,
    File,
    Directory,
    /// Printer queues, IPC shares and anything else not browsable as files
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub name: String,
    pub comment: String,
    pub kind: RemoteEntryKind,
}

impl RemoteDirEntry {
    pub fn new(name: impl Into<String>, kind: RemoteEntryKind) -> Self {
        Self {
            name: name.into(),
            comment: String::new(),
            kind,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Attributes returned by a remote stat
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteStat {
    pub is_dir: bool,
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
}

/// Blocking remote file-sharing client
///
/// Paths are full `smb://` URLs. Implementations keep session state and must
/// not be entered concurrently; [`RemoteLock`] enforces that.
pub trait RemoteShareClient: Send {
    fn stat(&mut self, url: &str) -> Result<RemoteStat, Errno>;

    fn open(&mut self, url: &str, flags: OpenFlags) -> Result<RemoteFile, Errno>;
    /// Create or truncate a file and open it for writing
    fn create(&mut self, url: &str, mode: u32) -> Result<RemoteFile, Errno>;
    fn close(&mut self, file: RemoteFile) -> Result<(), Errno>;
    fn seek(&mut self, file: RemoteFile, offset: u64) -> Result<u64, Errno>;
    fn read(&mut self, file: RemoteFile, buf: &mut [u8]) -> Result<usize, Errno>;
    fn write(&mut self, file: RemoteFile, data: &[u8]) -> Result<usize, Errno>;
    fn truncate(&mut self, file: RemoteFile, size: u64) -> Result<(), Errno>;
    fn set_mtime(&mut self, url: &str, mtime: SystemTime) -> Result<(), Errno>;

    fn unlink(&mut self, url: &str) -> Result<(), Errno>;
    fn rename(&mut self, from: &str, to: &str) -> Result<(), Errno>;
    fn mkdir(&mut self, url: &str, mode: u32) -> Result<(), Errno>;
    fn rmdir(&mut self, url: &str) -> Result<(), Errno>;

    /// Open a share directory, or a browse level of the network namespace
    fn open_dir(&mut self, url: &str) -> Result<RemoteDir, Errno>;
    /// Next entry, `None` at the end of the listing
    fn read_dir_entry(&mut self, dir: RemoteDir) -> Result<Option<RemoteDirEntry>, Errno>;
    fn seek_dir(&mut self, dir: RemoteDir, position: u64) -> Result<(), Errno>;
    fn close_dir(&mut self, dir: RemoteDir) -> Result<(), Errno>;
}

/// Held remote lock; derefs to the client
pub type RemoteGuard<'a> = MutexGuard<'a, Box<dyn RemoteShareClient>>;

/// The process-wide remote lock and the only owner of the client
pub struct RemoteLock {
    client: Mutex<Box<dyn RemoteShareClient>>,
}

impl RemoteLock {
    pub fn new(client: impl RemoteShareClient + 'static) -> Self {
        Self {
            client: Mutex::new(Box::new(client)),
        }
    }

    pub fn lock(&self) -> RemoteGuard<'_> {
        self.client.lock()
    }
}

impl std::fmt::Debug for RemoteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLock")
            .field("locked", &self.client.is_locked())
            .finish()
    }
}
