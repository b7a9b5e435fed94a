//! Directories inside a share, including the share root itself

use tracing::{debug, warn};

use smbnet_core::url::checked_entry_url;
use smbnet_core::{
    DirEntry, FileAttr, FileType, FsError, FsResult, NodeId, NodeKind, OpenFlags, SetAttr,
};

use super::{share, DirCookie, DirCursor, FileCookie, FileState, FsNode, NodeHandle};
use crate::registry::Node;
use crate::remote::RemoteEntryKind;
use crate::volume::Volume;

pub(crate) struct ShareDirectoryNode<'v> {
    volume: &'v Volume,
    handle: NodeHandle,
}

impl<'v> ShareDirectoryNode<'v> {
    pub(crate) fn new(volume: &'v Volume, handle: NodeHandle) -> Self {
        Self { volume, handle }
    }

    fn child_url(&self, name: &str) -> FsResult<String> {
        checked_entry_url(&self.handle.url, self.handle.kind, name)
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.volume.is_read_only() {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl FsNode for ShareDirectoryNode<'_> {
    fn read_stat(&self) -> FsResult<FileAttr> {
        share::read_stat(self.volume, &self.handle)
    }

    fn write_stat(&self, changes: &SetAttr) -> FsResult<()> {
        if changes.size.is_some() {
            return Err(FsError::IsADirectory);
        }
        share::write_stat(self.volume, &self.handle, changes)
    }

    fn open(&self, flags: OpenFlags) -> FsResult<FileCookie> {
        if flags.writes() {
            return Err(FsError::IsADirectory);
        }
        let stat = self.volume.remote().stat(&self.handle.url)?;
        if !stat.is_dir {
            return Err(FsError::NotADirectory);
        }
        Ok(FileCookie::new(self.handle.id, FileState::Directory))
    }

    fn lookup(&self, name: &str) -> FsResult<NodeId> {
        match name {
            "." => return Ok(self.handle.id),
            ".." => return Ok(self.handle.parent),
            _ => {}
        }

        let url = self.child_url(name)?;
        let mut remote = self.volume.remote();
        let stat = remote.stat(&url)?;
        let mut registry = self.volume.registry();
        let (id, _) =
            share::materialize(self.volume, &mut registry, self.handle.id, &url, name, stat.is_dir);
        Ok(id)
    }

    fn create(&self, name: &str, flags: OpenFlags, mode: u32) -> FsResult<(NodeId, FileCookie)> {
        self.check_writable()?;
        let url = self.child_url(name)?;

        let mut remote = self.volume.remote();
        let (file, created) = match remote.stat(&url) {
            Ok(_) if flags.exclusive() => return Err(FsError::AlreadyExists),
            Ok(stat) if stat.is_dir => return Err(FsError::IsADirectory),
            Ok(_) => (remote.open(&url, flags)?, false),
            Err(errno) => match FsError::from(errno) {
                FsError::NotFound => (remote.create(&url, mode)?, true),
                e => return Err(e),
            },
        };

        let mut registry = self.volume.registry();
        let (id, fresh) =
            share::materialize(self.volume, &mut registry, self.handle.id, &url, name, false);
        if created || fresh {
            self.volume.notifier().entry_created(self.handle.id, name, id);
        }
        debug!("create {} -> {} (new file: {})", url, id, created);

        Ok((id, FileCookie::new(id, FileState::ShareFile { file: Some(file) })))
    }

    fn remove(&self, name: &str) -> FsResult<()> {
        self.check_writable()?;
        let url = self.child_url(name)?;

        let mut remote = self.volume.remote();
        remote.unlink(&url)?;
        let mut registry = self.volume.registry();
        share::forget_entry(self.volume, &mut registry, self.handle.id, &url, name);
        Ok(())
    }

    fn rename(&self, from_name: &str, to_dir: &NodeHandle, to_name: &str) -> FsResult<()> {
        self.check_writable()?;
        match to_dir.kind {
            NodeKind::Share | NodeKind::ShareDirectory => {}
            NodeKind::ShareFile => return Err(FsError::NotADirectory),
            NodeKind::Network | NodeKind::Workgroup | NodeKind::Server => {
                return Err(FsError::PermissionDenied)
            }
        }
        let from_url = self.child_url(from_name)?;
        let to_url = checked_entry_url(&to_dir.url, to_dir.kind, to_name)?;
        if from_url == to_url {
            return Ok(());
        }

        let mut remote = self.volume.remote();
        remote.rename(&from_url, &to_url)?;

        let mut registry = self.volume.registry();
        let notifier = self.volume.notifier();

        if let Some(clobbered) = registry.recall_id(&to_url) {
            let forgotten = registry.forget_subtree(clobbered);
            notifier.entry_removed(to_dir.id, to_name, clobbered);
            for id in forgotten {
                notifier.node_removed(id);
            }
        }

        let Some(old) = registry.recall(&from_url) else {
            // Never looked up, so the host holds nothing to move
            return Ok(());
        };
        let old_id = old.id;
        let is_dir = old.kind == NodeKind::ShareDirectory;
        let forgotten = registry.forget_subtree(old_id);

        let new_id = registry.allocate_identity();
        registry.memorize(Node::share_entry(new_id, to_url.clone(), to_name, is_dir, to_dir.id));
        debug!("rename {} ({}) -> {} ({})", from_url, old_id, to_url, new_id);

        for id in forgotten {
            notifier.node_removed(id);
        }
        notifier.entry_moved(self.handle.id, from_name, to_dir.id, to_name, new_id);
        Ok(())
    }

    fn create_dir(&self, name: &str, mode: u32) -> FsResult<NodeId> {
        self.check_writable()?;
        let url = self.child_url(name)?;

        let mut remote = self.volume.remote();
        remote.mkdir(&url, mode)?;
        let mut registry = self.volume.registry();
        let (id, _) =
            share::materialize(self.volume, &mut registry, self.handle.id, &url, name, true);
        self.volume.notifier().entry_created(self.handle.id, name, id);
        Ok(id)
    }

    fn remove_dir(&self, name: &str) -> FsResult<()> {
        self.check_writable()?;
        let url = self.child_url(name)?;

        let mut remote = self.volume.remote();
        remote.rmdir(&url)?;
        let mut registry = self.volume.registry();
        share::forget_entry(self.volume, &mut registry, self.handle.id, &url, name);
        Ok(())
    }

    fn open_dir(&self) -> FsResult<DirCookie> {
        let stat = self.volume.remote().stat(&self.handle.url)?;
        if !stat.is_dir {
            return Err(FsError::NotADirectory);
        }
        Ok(DirCookie::new(
            self.handle.id,
            DirCursor::Share {
                position: 0,
                remote: None,
            },
        ))
    }

    fn close_dir(&self, cookie: &mut DirCookie) -> FsResult<()> {
        cookie.ensure_open()?;
        cookie.mark_closed();
        if let DirCursor::Share { remote: dir, .. } = &mut cookie.cursor {
            if let Some(dir) = dir.take() {
                self.volume.remote().close_dir(dir)?;
            }
        }
        Ok(())
    }

    fn read_dir(&self, cookie: &mut DirCookie, max: usize) -> FsResult<Vec<DirEntry>> {
        cookie.ensure_open()?;
        let DirCursor::Share {
            position,
            remote: listing,
        } = &mut cookie.cursor
        else {
            return Err(FsError::BadHandle);
        };

        let mut out = Vec::new();
        while out.len() < max && *position < 2 {
            if *position == 0 {
                out.push(DirEntry::new(".", self.handle.id, FileType::Directory));
            } else {
                out.push(DirEntry::new("..", self.handle.parent, FileType::Directory));
            }
            *position += 1;
        }
        if out.len() >= max {
            return Ok(out);
        }

        let mut remote = self.volume.remote();
        let dir = match *listing {
            Some(dir) => dir,
            None => {
                let dir = remote.open_dir(&self.handle.url)?;
                *listing = Some(dir);
                dir
            }
        };

        while out.len() < max {
            let Some(entry) = remote.read_dir_entry(dir)? else {
                break;
            };
            *position += 1;
            if entry.is_dot() {
                continue;
            }
            let is_dir = match entry.kind {
                RemoteEntryKind::File => false,
                RemoteEntryKind::Directory => true,
                _ => continue,
            };
            let url = match self.child_url(&entry.name) {
                Ok(url) => url,
                Err(e) => {
                    warn!("skipping {:?} in {}: {}", entry.name, self.handle.url, e);
                    continue;
                }
            };

            let mut registry = self.volume.registry();
            let (id, _) = share::materialize(
                self.volume,
                &mut registry,
                self.handle.id,
                &url,
                &entry.name,
                is_dir,
            );
            let file_type = if is_dir {
                FileType::Directory
            } else {
                FileType::File
            };
            out.push(DirEntry::new(entry.name, id, file_type));
        }
        Ok(out)
    }

    fn rewind_dir(&self, cookie: &mut DirCookie) -> FsResult<()> {
        cookie.ensure_open()?;
        if let DirCursor::Share { position, remote } = &mut cookie.cursor {
            *position = 0;
            if let Some(dir) = remote {
                self.volume.remote().seek_dir(*dir, 0)?;
            }
        }
        Ok(())
    }

    fn free_dir_cookie(&self, mut cookie: DirCookie) -> FsResult<()> {
        if let DirCursor::Share { remote: Some(dir), .. } = &mut cookie.cursor {
            let dir = *dir;
            if let Err(e) = self.volume.remote().close_dir(dir) {
                warn!("closing listing of {} failed: {}", self.handle.url, e);
            }
        }
        Ok(())
    }
}
