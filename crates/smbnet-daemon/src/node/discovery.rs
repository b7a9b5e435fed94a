//! Workgroup, server and network root directories
//!
//! Discovery directories are read-only views of the last scan. Their entries
//! are maintained by the volume as scan events arrive; host calls only list
//! and look them up.

use tracing::{debug, trace};

use smbnet_core::{
    DirEntry, FileAttr, FileType, FsError, FsResult, NodeId, OpenFlags, SetAttr,
};

use super::{DirCookie, DirCursor, FileCookie, FileState, FsNode, NodeHandle};
use crate::volume::Volume;

pub(crate) struct DiscoveryNode<'v> {
    volume: &'v Volume,
    handle: NodeHandle,
}

impl<'v> DiscoveryNode<'v> {
    pub(crate) fn new(volume: &'v Volume, handle: NodeHandle) -> Self {
        Self { volume, handle }
    }

    /// Release one iterator; on the last one, drop the entries removed while
    /// the directory was open and ask for a fresh scan
    fn release(&self, cookie: &mut DirCookie) {
        cookie.mark_closed();

        let purged = {
            let mut registry = self.volume.registry();
            let Some(dir) = registry
                .get_mut(self.handle.id)
                .and_then(|node| node.discovery_dir_mut())
            else {
                return;
            };
            match dir.close() {
                Some(ids) => ids
                    .into_iter()
                    .flat_map(|id| registry.forget_subtree(id))
                    .collect::<Vec<NodeId>>(),
                None => return,
            }
        };

        if !purged.is_empty() {
            debug!("{}: purged {} node(s) after last close", self.handle.url, purged.len());
        }
        let notifier = self.volume.notifier();
        for id in purged {
            notifier.node_removed(id);
        }
        self.volume.network_scan();
    }
}

impl FsNode for DiscoveryNode<'_> {
    fn read_stat(&self) -> FsResult<FileAttr> {
        let registry = self.volume.registry();
        let node = registry.get(self.handle.id).ok_or(FsError::NotFound)?;
        let (uid, gid) = self.volume.owner();
        Ok(FileAttr::discovery_dir(node.id, uid, gid, node.created))
    }

    fn write_stat(&self, _changes: &SetAttr) -> FsResult<()> {
        Err(FsError::PermissionDenied)
    }

    fn open(&self, flags: OpenFlags) -> FsResult<FileCookie> {
        if flags.writes() {
            return Err(FsError::PermissionDenied);
        }
        Ok(FileCookie::new(self.handle.id, FileState::Directory))
    }

    fn lookup(&self, name: &str) -> FsResult<NodeId> {
        match name {
            "." => return Ok(self.handle.id),
            ".." => return Ok(self.handle.parent),
            _ => {}
        }

        let registry = self.volume.registry();
        let dir = registry
            .get(self.handle.id)
            .and_then(|node| node.discovery_dir())
            .ok_or(FsError::NotFound)?;
        let id = dir.find_live(name).ok_or(FsError::NotFound)?;
        assert!(
            registry.get(id).is_some(),
            "{} lists {} as {} but the node was never memorized",
            self.handle.url,
            name,
            id
        );
        trace!("lookup {} in {} -> {}", name, self.handle.url, id);
        Ok(id)
    }

    fn create(&self, _name: &str, _flags: OpenFlags, _mode: u32) -> FsResult<(NodeId, FileCookie)> {
        Err(FsError::PermissionDenied)
    }

    fn remove(&self, _name: &str) -> FsResult<()> {
        Err(FsError::PermissionDenied)
    }

    fn rename(&self, _from_name: &str, _to_dir: &NodeHandle, _to_name: &str) -> FsResult<()> {
        Err(FsError::PermissionDenied)
    }

    fn create_dir(&self, _name: &str, _mode: u32) -> FsResult<NodeId> {
        Err(FsError::PermissionDenied)
    }

    fn remove_dir(&self, _name: &str) -> FsResult<()> {
        Err(FsError::PermissionDenied)
    }

    fn open_dir(&self) -> FsResult<DirCookie> {
        let (first, generation) = {
            let mut registry = self.volume.registry();
            let dir = registry
                .get_mut(self.handle.id)
                .and_then(|node| node.discovery_dir_mut())
                .ok_or(FsError::NotFound)?;
            (dir.open(), dir.generation())
        };

        if first {
            self.volume.network_scan();
        }

        Ok(DirCookie::new(
            self.handle.id,
            DirCursor::Discovery {
                position: 0,
                generation,
            },
        ))
    }

    fn close_dir(&self, cookie: &mut DirCookie) -> FsResult<()> {
        cookie.ensure_open()?;
        self.release(cookie);
        Ok(())
    }

    fn read_dir(&self, cookie: &mut DirCookie, max: usize) -> FsResult<Vec<DirEntry>> {
        cookie.ensure_open()?;
        let DirCursor::Discovery {
            position,
            generation,
        } = &mut cookie.cursor
        else {
            return Err(FsError::BadHandle);
        };

        let registry = self.volume.registry();
        let dir = registry
            .get(self.handle.id)
            .and_then(|node| node.discovery_dir())
            .ok_or(FsError::NotFound)?;

        let mut out = Vec::new();
        while out.len() < max {
            match *position {
                0 => out.push(DirEntry::new(".", self.handle.id, FileType::Directory)),
                1 => out.push(DirEntry::new("..", self.handle.parent, FileType::Directory)),
                n => {
                    let Some(slot) = dir.entries().get(n - 2) else {
                        break;
                    };
                    if slot.visible_at(*generation) {
                        out.push(DirEntry::new(slot.name.clone(), slot.id, FileType::Directory));
                    }
                }
            }
            *position += 1;
        }
        Ok(out)
    }

    fn rewind_dir(&self, cookie: &mut DirCookie) -> FsResult<()> {
        cookie.ensure_open()?;
        let current = self
            .volume
            .registry()
            .get(self.handle.id)
            .and_then(|node| node.discovery_dir())
            .map(|dir| dir.generation())
            .ok_or(FsError::NotFound)?;

        if let DirCursor::Discovery {
            position,
            generation,
        } = &mut cookie.cursor
        {
            *position = 0;
            *generation = current;
        }
        Ok(())
    }

    fn free_dir_cookie(&self, mut cookie: DirCookie) -> FsResult<()> {
        if cookie.is_open() {
            self.release(&mut cookie);
        }
        Ok(())
    }
}
