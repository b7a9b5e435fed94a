//! FUSE adapter
//!
//! Maps kernel requests onto volume operations. Node identities are used as
//! inode numbers directly; the network root is inode 1. File and directory
//! cookies live in handle tables keyed by the `fh` returned to the kernel.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr as FuserAttr, FileType as FuserFileType, Filesystem, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow,
};
use tracing::{debug, error, trace, warn};

use smbnet_core::{
    DirEntry, FileAttr, FileType, FsError, NodeId, OpenFlags, SetAttr, MAX_FILENAME_LEN,
};

use crate::node::{DirCookie, FileCookie};
use crate::volume::Volume;

struct OpenDir {
    cookie: DirCookie,
    /// Listing taken when the kernel reads from offset 0
    snapshot: Vec<DirEntry>,
}

/// SMB network namespace as a FUSE filesystem
pub struct SmbNetworkFs {
    volume: Arc<Volume>,
    ttl: Duration,
    files: HashMap<u64, FileCookie>,
    dirs: HashMap<u64, OpenDir>,
    next_fh: u64,
}

impl SmbNetworkFs {
    pub fn new(volume: Arc<Volume>, ttl: Duration) -> Self {
        Self {
            volume,
            ttl,
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_fh: 1,
        }
    }

    fn allocate_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    fn to_fuser_kind(file_type: FileType) -> FuserFileType {
        match file_type {
            FileType::File => FuserFileType::RegularFile,
            FileType::Directory => FuserFileType::Directory,
        }
    }

    /// Convert our FileAttr to fuser's FileAttr
    fn to_fuser_attr(attr: &FileAttr) -> FuserAttr {
        FuserAttr {
            ino: attr.id,
            size: attr.size,
            blocks: attr.blocks(),
            atime: UNIX_EPOCH + Duration::new(attr.atime, attr.atime_nsec),
            mtime: UNIX_EPOCH + Duration::new(attr.mtime, attr.mtime_nsec),
            ctime: UNIX_EPOCH + Duration::new(attr.ctime, attr.ctime_nsec),
            crtime: UNIX_EPOCH,
            kind: Self::to_fuser_kind(attr.file_type),
            perm: attr.mode as u16,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    /// Close and free a file cookie the kernel will never release
    fn discard_file(&self, op: &str, id: NodeId, mut cookie: FileCookie) {
        if let Err(e) = self.volume.close(id, &mut cookie) {
            warn!("{}: closing {} failed: {}", op, id, e);
        }
        if let Err(e) = self.volume.free_cookie(id, cookie) {
            warn!("{}: freeing cookie of {} failed: {}", op, id, e);
        }
    }

    fn discard_dir(&self, op: &str, id: NodeId, mut cookie: DirCookie) {
        if cookie.is_open() {
            if let Err(e) = self.volume.close_dir(id, &mut cookie) {
                warn!("{}: closing directory {} failed: {}", op, id, e);
            }
        }
        if let Err(e) = self.volume.free_dir_cookie(id, cookie) {
            warn!("{}: freeing directory cookie of {} failed: {}", op, id, e);
        }
    }

    fn reply_entry(&self, op: &str, id: NodeId, reply: ReplyEntry) {
        match self.volume.read_stat(id) {
            Ok(attr) => reply.entry(&self.ttl, &Self::to_fuser_attr(&attr), 0),
            Err(e) => {
                log_failure(op, e);
                reply.error(e.to_errno());
            }
        }
    }
}

fn log_failure(op: &str, e: FsError) {
    match e {
        FsError::NotFound => trace!("{}: not found", op),
        FsError::Remote(_) => error!("{} error: {}", op, e),
        _ => debug!("{} failed: {}", op, e),
    }
}

fn system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for SmbNetworkFs {
    fn destroy(&mut self) {
        debug!(
            "unmounting with {} open file(s), {} open dir(s)",
            self.files.len(),
            self.dirs.len()
        );
        for (_, dir) in std::mem::take(&mut self.dirs) {
            self.discard_dir("destroy", dir.cookie.node(), dir.cookie);
        }
        for (_, cookie) in std::mem::take(&mut self.files) {
            self.discard_file("destroy", cookie.node(), cookie);
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        trace!("lookup: parent={}, name={}", parent, name);

        match self.volume.lookup(parent, name) {
            Ok(id) => self.reply_entry("lookup", id, reply),
            Err(e) => {
                log_failure("lookup", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!("getattr: ino={}", ino);
        match self.volume.read_stat(ino) {
            Ok(attr) => reply.attr(&self.ttl, &Self::to_fuser_attr(&attr)),
            Err(e) => {
                log_failure("getattr", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr: ino={}, mode={:?}, size={:?}", ino, mode, size);

        // Permissions are owned by the server; only size and mtime go through
        let changes = SetAttr {
            size,
            mtime: mtime.map(system_time),
        };
        let result = self
            .volume
            .write_stat(ino, &changes)
            .and_then(|()| self.volume.read_stat(ino));
        match result {
            Ok(attr) => reply.attr(&self.ttl, &Self::to_fuser_attr(&attr)),
            Err(e) => {
                log_failure("setattr", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let info = self.volume.fs_info();
        reply.statfs(
            info.total_blocks,
            info.free_blocks,
            info.free_blocks,
            info.total_nodes,
            info.free_nodes,
            info.block_size,
            MAX_FILENAME_LEN as u32,
            info.block_size,
        );
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!("open: ino={}, flags={:#o}", ino, flags);
        match self.volume.open(ino, OpenFlags(flags)) {
            Ok(cookie) => {
                let fh = self.allocate_fh();
                self.files.insert(fh, cookie);
                reply.opened(fh, 0);
            }
            Err(e) => {
                log_failure("open", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read: ino={}, offset={}, size={}", ino, offset, size);
        let Some(cookie) = self.files.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match self.volume.read(ino, cookie, offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                log_failure("read", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write: ino={}, offset={}, size={}", ino, offset, data.len());
        let Some(cookie) = self.files.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match self.volume.write(ino, cookie, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                log_failure("write", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!("release: ino={}, fh={}", ino, fh);
        let Some(mut cookie) = self.files.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let closed = self.volume.close(ino, &mut cookie);
        if let Err(e) = self.volume.free_cookie(ino, cookie) {
            warn!("release: freeing cookie of {} failed: {}", ino, e);
        }
        match closed {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("release", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!("opendir: ino={}", ino);
        match self.volume.open_dir(ino) {
            Ok(cookie) => {
                let fh = self.allocate_fh();
                self.dirs.insert(
                    fh,
                    OpenDir {
                        cookie,
                        snapshot: Vec::new(),
                    },
                );
                reply.opened(fh, 0);
            }
            Err(e) => {
                log_failure("opendir", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: ino={}, offset={}", ino, offset);
        let Some(dir) = self.dirs.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        if offset == 0 {
            let listing = self
                .volume
                .rewind_dir(ino, &mut dir.cookie)
                .and_then(|()| self.volume.read_dir(ino, &mut dir.cookie, usize::MAX));
            match listing {
                Ok(entries) => dir.snapshot = entries,
                Err(e) => {
                    log_failure("readdir", e);
                    reply.error(e.to_errno());
                    return;
                }
            }
        }

        let start = usize::try_from(offset).unwrap_or(0);
        for (i, entry) in dir.snapshot.iter().enumerate().skip(start) {
            let kind = Self::to_fuser_kind(entry.file_type);
            if reply.add(entry.id, (i + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        trace!("releasedir: ino={}, fh={}", ino, fh);
        let Some(mut dir) = self.dirs.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let closed = self.volume.close_dir(ino, &mut dir.cookie);
        if let Err(e) = self.volume.free_dir_cookie(ino, dir.cookie) {
            warn!("releasedir: freeing cookie of {} failed: {}", ino, e);
        }
        match closed {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("releasedir", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("create: parent={}, name={}, mode={:o}", parent, name, mode);

        let flags = OpenFlags(flags).with(libc::O_CREAT);
        let (id, cookie) = match self.volume.create(parent, name, flags, mode & 0o7777) {
            Ok(created) => created,
            Err(e) => {
                log_failure("create", e);
                reply.error(e.to_errno());
                return;
            }
        };
        match self.volume.read_stat(id) {
            Ok(attr) => {
                let fh = self.allocate_fh();
                self.files.insert(fh, cookie);
                reply.created(&self.ttl, &Self::to_fuser_attr(&attr), 0, fh, 0);
            }
            Err(e) => {
                log_failure("create", e);
                self.discard_file("create", id, cookie);
                reply.error(e.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("mkdir: parent={}, name={}, mode={:o}", parent, name, mode);

        match self.volume.create_dir(parent, name, mode & 0o7777) {
            Ok(id) => self.reply_entry("mkdir", id, reply),
            Err(e) => {
                log_failure("mkdir", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("unlink: parent={}, name={}", parent, name);

        match self.volume.remove(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("unlink", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("rmdir: parent={}, name={}", parent, name);

        match self.volume.remove_dir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("rmdir", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("rename: {}/{} -> {}/{}", parent, name, newparent, newname);

        match self.volume.rename(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("rename", e);
                reply.error(e.to_errno());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_attr_conversion() {
        let created = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let attr = FileAttr::discovery_dir(7, 1000, 100, created);
        let fuser_attr = SmbNetworkFs::to_fuser_attr(&attr);

        assert_eq!(fuser_attr.ino, 7);
        assert_eq!(fuser_attr.perm, 0o555);
        assert_eq!(fuser_attr.uid, 1000);
        assert_eq!(fuser_attr.gid, 100);
        assert_eq!(fuser_attr.mtime, created);
        assert!(matches!(fuser_attr.kind, FuserFileType::Directory));
    }

    #[test]
    fn test_file_attr_conversion() {
        let now = SystemTime::now();
        let mut attr = FileAttr::with_times(42, FileType::File, 1025, now, now);
        attr.mode = 0o644;
        let fuser_attr = SmbNetworkFs::to_fuser_attr(&attr);

        assert_eq!(fuser_attr.ino, 42);
        assert_eq!(fuser_attr.size, 1025);
        assert_eq!(fuser_attr.blocks, 3);
        assert_eq!(fuser_attr.perm, 0o644);
        assert!(matches!(fuser_attr.kind, FuserFileType::RegularFile));
    }

    #[test]
    fn test_destroy_releases_open_cookies() {
        use crate::memory_remote::MemoryNetwork;
        use crate::notify::TracingNotifier;
        use crate::remote::RemoteLock;
        use crate::volume::VolumeOptions;
        use smbnet_core::NETWORK_NODE_ID;

        let network = MemoryNetwork::new();
        network.add_share("NAS", "media", "");
        network.add_file("smb://NAS/media/a.txt", b"alpha");
        let remote = Arc::new(RemoteLock::new(network.clone()));
        let volume = Arc::new(Volume::new(
            VolumeOptions::default(),
            remote,
            Arc::new(TracingNotifier),
        ));
        volume.apply_event(smbnet_core::ScannerEvent::ResourceFound(
            smbnet_core::ResourceFound {
                kind: smbnet_core::NodeKind::Workgroup,
                dir_url: "smb://".into(),
                name: "WG".into(),
                comment: String::new(),
            },
        ));
        volume.apply_event(smbnet_core::ScannerEvent::ResourceFound(
            smbnet_core::ResourceFound {
                kind: smbnet_core::NodeKind::Server,
                dir_url: "smb://WG".into(),
                name: "NAS".into(),
                comment: String::new(),
            },
        ));
        volume.apply_event(smbnet_core::ScannerEvent::ResourceFound(
            smbnet_core::ResourceFound {
                kind: smbnet_core::NodeKind::Share,
                dir_url: "smb://NAS".into(),
                name: "media".into(),
                comment: String::new(),
            },
        ));

        let media = volume.recall("smb://NAS/media").unwrap();
        let file = volume.lookup(media, "a.txt").unwrap();
        let mut fs = SmbNetworkFs::new(volume.clone(), Duration::from_secs(1));

        let fh = fs.allocate_fh();
        fs.files.insert(fh, volume.open(file, OpenFlags::READ_ONLY).unwrap());
        let mut listing = volume.open_dir(media).unwrap();
        volume.read_dir(media, &mut listing, 3).unwrap();
        let fh = fs.allocate_fh();
        fs.dirs.insert(fh, OpenDir { cookie: listing, snapshot: Vec::new() });
        let fh = fs.allocate_fh();
        let root = volume.open_dir(NETWORK_NODE_ID).unwrap();
        fs.dirs.insert(fh, OpenDir { cookie: root, snapshot: Vec::new() });
        assert_eq!(network.open_handles(), (1, 1));

        fs.destroy();
        assert!(fs.files.is_empty() && fs.dirs.is_empty());
        assert_eq!(network.open_handles(), (0, 0));
    }

    #[test]
    fn test_time_or_now() {
        let t = UNIX_EPOCH + Duration::from_secs(5);
        assert_eq!(system_time(TimeOrNow::SpecificTime(t)), t);
        assert!(system_time(TimeOrNow::Now) > t);
    }
}
