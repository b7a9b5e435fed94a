//! The mounted volume
//!
//! Owns the node registry and the remote client lock, applies scanner events
//! to the discovery directories and routes host calls to the node they name.
//!
//! Locks are always taken remote first, registry second. The scan gate and
//! the status slot are leaf locks.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use smbnet_core::url::entry_url;
use smbnet_core::{
    Config, DirEntry, FileAttr, FsError, FsInfo, FsResult, NodeId, NodeKind, OpenFlags,
    ProtocolError, ResourceFound, ResourceLost, ScannerEvent, ScannerRequest, SetAttr,
    StatusReport, NETWORK_NODE_ID,
};

use crate::channel::{FrameReceiver, FrameSender};
use crate::node::{DirCookie, FileCookie, NodeHandle, NodeView};
use crate::notify::HostNotifier;
use crate::registry::{EntryState, Node, NodeRegistry, Removal};
use crate::remote::{RemoteGuard, RemoteLock};
use crate::scheduler::ScanScheduler;

/// Volume settings taken from the configuration
#[derive(Clone, Debug)]
pub struct VolumeOptions {
    pub volume_name: String,
    pub read_only: bool,
    /// Owner reported for every node
    pub uid: u32,
    pub gid: u32,
    /// Minimum time between a finished scan and the next scan request
    pub request_interval: Duration,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl VolumeOptions {
    pub fn from_config(config: &Config) -> Self {
        // SAFETY: getuid and getgid cannot fail and touch no memory
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            volume_name: config.mount.volume_name.clone(),
            read_only: config.mount.read_only,
            uid,
            gid,
            request_interval: config.scan.request_interval(),
        }
    }
}

pub struct Volume {
    registry: Mutex<NodeRegistry>,
    remote: Arc<RemoteLock>,
    notifier: Arc<dyn HostNotifier>,
    scan_gate: Mutex<ScanScheduler>,
    scanner: Option<FrameSender<ScannerRequest>>,
    info: FsInfo,
    uid: u32,
    gid: u32,
    last_status: Mutex<Option<StatusReport>>,
}

impl Volume {
    pub fn new(
        options: VolumeOptions,
        remote: Arc<RemoteLock>,
        notifier: Arc<dyn HostNotifier>,
    ) -> Self {
        info!(
            "volume {:?} ({})",
            options.volume_name,
            if options.read_only { "read-only" } else { "read-write" }
        );
        Self {
            registry: Mutex::new(NodeRegistry::with_network_root()),
            remote,
            notifier,
            scan_gate: Mutex::new(ScanScheduler::new(options.request_interval)),
            scanner: None,
            info: FsInfo::new(options.volume_name, options.read_only),
            uid: options.uid,
            gid: options.gid,
            last_status: Mutex::new(None),
        }
    }

    /// Send scan requests to a scanner
    pub fn with_scanner(mut self, requests: FrameSender<ScannerRequest>) -> Self {
        self.scanner = Some(requests);
        self
    }

    pub fn fs_info(&self) -> FsInfo {
        let mut info = self.info.clone();
        let nodes = self.node_count() as u64;
        info.total_nodes = info.total_nodes.max(nodes);
        info.free_nodes = info.total_nodes - nodes;
        info
    }

    pub fn is_read_only(&self) -> bool {
        self.info.read_only
    }

    pub fn node_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Identity currently registered for a URL
    pub fn recall(&self, url: &str) -> Option<NodeId> {
        self.registry.lock().recall_id(url)
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, NodeRegistry> {
        self.registry.lock()
    }

    pub(crate) fn remote(&self) -> RemoteGuard<'_> {
        self.remote.lock()
    }

    pub(crate) fn notifier(&self) -> &dyn HostNotifier {
        self.notifier.as_ref()
    }

    pub(crate) fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    // ---- scanning ----

    /// Ask the scanner for a fresh scan unless one finished recently
    pub fn network_scan(&self) {
        let Some(scanner) = &self.scanner else {
            return;
        };
        if !self.scan_gate.lock().is_due(Instant::now()) {
            trace!("scan request suppressed");
            return;
        }
        match scanner.send(&ScannerRequest::ScanRequested) {
            Ok(()) => debug!("scan requested"),
            Err(ProtocolError::Full) => trace!("scan request queue full"),
            Err(e) => warn!("failed to request scan: {}", e),
        }
    }

    /// Ask the scanner for a status report, answered through the event stream
    pub fn request_status(&self) -> Result<(), ProtocolError> {
        match &self.scanner {
            Some(scanner) => scanner.send(&ScannerRequest::Status),
            None => Err(ProtocolError::Disconnected),
        }
    }

    /// Tell the scanner thread to exit
    pub fn stop_scanner(&self) -> Result<(), ProtocolError> {
        match &self.scanner {
            Some(scanner) => scanner.send(&ScannerRequest::Quit),
            None => Ok(()),
        }
    }

    pub fn last_status(&self) -> Option<StatusReport> {
        self.last_status.lock().clone()
    }

    /// Apply one scanner event to the namespace
    pub fn apply_event(&self, event: ScannerEvent) {
        match event {
            ScannerEvent::ResourceFound(found) => self.resource_found(found),
            ScannerEvent::ResourceLost(lost) => self.resource_lost(lost),
            ScannerEvent::ScanFinished => {
                debug!("scan finished");
                self.scan_gate.lock().complete(Instant::now());
            }
            ScannerEvent::Status(report) => {
                *self.last_status.lock() = Some(report);
            }
        }
    }

    /// Apply every event already queued; returns how many were applied
    pub fn pump_events(&self, events: &FrameReceiver<ScannerEvent>) -> Result<usize, ProtocolError> {
        let mut applied = 0;
        while let Some(event) = events.try_recv()? {
            self.apply_event(event);
            applied += 1;
        }
        Ok(applied)
    }

    /// Apply events on a background thread until the scanner goes away
    pub fn spawn_event_pump(
        self: Arc<Self>,
        events: FrameReceiver<ScannerEvent>,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("smbnet-events".into())
            .spawn(move || loop {
                match events.recv() {
                    Ok(event) => self.apply_event(event),
                    Err(ProtocolError::Disconnected) => {
                        debug!("event stream closed");
                        break;
                    }
                    Err(e) => warn!("dropping malformed event: {}", e),
                }
            })
    }

    fn resource_found(&self, found: ResourceFound) {
        // Shares must be reachable before they are shown
        if found.kind == NodeKind::Share {
            let url = entry_url(&found.dir_url, NodeKind::Server, &found.name);
            if let Err(e) = self.remote().stat(&url) {
                warn!("skipping unreachable share {}: {}", url, e);
                return;
            }
        }

        let mut registry = self.registry();
        let Some(parent) = registry.recall(&found.dir_url) else {
            panic!("{} found under unknown directory {}", found.name, found.dir_url);
        };
        let parent_id = parent.id;
        let url = entry_url(&found.dir_url, parent.kind, &found.name);

        // Marked slots of nodes forgotten by a workgroup change never revive
        let slot = registry
            .get(parent_id)
            .and_then(Node::discovery_dir)
            .and_then(|dir| {
                dir.entries()
                    .iter()
                    .find(|e| e.name == found.name && registry.get(e.id).is_some())
            })
            .map(|slot| (slot.id, slot.state));

        match slot {
            Some((id, EntryState::MarkedRemoved { .. })) => {
                if let Some(dir) = registry
                    .get_mut(parent_id)
                    .and_then(|node| node.discovery_dir_mut())
                {
                    dir.revive(id);
                }
                if let Some(node) = registry.get_mut(id) {
                    node.comment = found.comment;
                }
                let retired = retire_entries(&mut registry, id);
                debug!("revived {} as {}", url, id);
                drop(registry);
                self.notify_retired(id, retired);
                self.notifier.entry_created(parent_id, &found.name, id);
            }
            Some((id, EntryState::Live)) => {
                warn!("{} already listed as {}", url, id);
            }
            None => {
                // Server URLs do not name their workgroup, so a server that
                // changed workgroups is still registered under the old one
                let moved = registry.recall(&url).map(|stale| (stale.id, stale.parent));
                let detached = moved.map(|(stale, old_parent)| {
                    debug!("{} moved out of {}", url, old_parent);
                    let removal = registry
                        .get_mut(old_parent)
                        .and_then(|node| node.discovery_dir_mut())
                        .and_then(|dir| dir.remove_entry(&found.name));
                    let forgotten = registry.forget_subtree(stale);
                    (old_parent, stale, removal.is_some(), forgotten)
                });

                let id = registry.allocate_identity();
                registry.memorize(Node::discovered(
                    id,
                    url.clone(),
                    &found.name,
                    &found.comment,
                    found.kind,
                    parent_id,
                ));
                if let Some(dir) = registry
                    .get_mut(parent_id)
                    .and_then(|node| node.discovery_dir_mut())
                {
                    dir.add_entry(id, &found.name);
                }
                debug!("found {} as {}", url, id);
                drop(registry);

                if let Some((old_parent, stale, listed, forgotten)) = detached {
                    if listed {
                        self.notifier.entry_removed(old_parent, &found.name, stale);
                    }
                    for id in forgotten {
                        self.notifier.node_removed(id);
                    }
                }
                self.notifier.entry_created(parent_id, &found.name, id);
            }
        }
    }

    /// Report the entries taken out of a revived directory
    fn notify_retired(&self, dir: NodeId, retired: Retired) {
        for (name, id) in retired.removed {
            self.notifier.entry_removed(dir, &name, id);
        }
        for id in retired.forgotten {
            self.notifier.node_removed(id);
        }
    }

    fn resource_lost(&self, lost: ResourceLost) {
        let mut registry = self.registry();
        let Some(parent_id) = registry.recall_id(&lost.dir_url) else {
            warn!("{} lost from unknown directory {}", lost.name, lost.dir_url);
            return;
        };
        let removal = registry
            .get_mut(parent_id)
            .and_then(|node| node.discovery_dir_mut())
            .and_then(|dir| dir.remove_entry(&lost.name));

        match removal {
            Some(Removal::Marked(id)) => {
                debug!("{} in {} marked removed", lost.name, lost.dir_url);
                drop(registry);
                self.notifier.entry_removed(parent_id, &lost.name, id);
            }
            Some(Removal::Gone(id)) => {
                let forgotten = registry.forget_subtree(id);
                debug!("{} in {} removed", lost.name, lost.dir_url);
                drop(registry);
                self.notifier.entry_removed(parent_id, &lost.name, id);
                for id in forgotten {
                    self.notifier.node_removed(id);
                }
            }
            None => warn!("{} lost but not listed in {}", lost.name, lost.dir_url),
        }
    }

    // ---- host operations ----

    fn handle(&self, id: NodeId) -> FsResult<NodeHandle> {
        self.registry()
            .get(id)
            .map(NodeHandle::from)
            .ok_or(FsError::NotFound)
    }

    fn view(&self, id: NodeId) -> FsResult<NodeView<'_>> {
        Ok(NodeView::new(self, self.handle(id)?))
    }

    fn owned(id: NodeId, cookie_node: NodeId) -> FsResult<()> {
        if id == cookie_node {
            Ok(())
        } else {
            Err(FsError::BadHandle)
        }
    }

    pub fn root(&self) -> NodeId {
        NETWORK_NODE_ID
    }

    pub fn read_stat(&self, id: NodeId) -> FsResult<FileAttr> {
        self.view(id)?.node().read_stat()
    }

    pub fn write_stat(&self, id: NodeId, changes: &SetAttr) -> FsResult<()> {
        self.view(id)?.node().write_stat(changes)
    }

    pub fn lookup(&self, dir: NodeId, name: &str) -> FsResult<NodeId> {
        self.view(dir)?.node().lookup(name)
    }

    pub fn open(&self, id: NodeId, flags: OpenFlags) -> FsResult<FileCookie> {
        self.view(id)?.node().open(flags)
    }

    pub fn close(&self, id: NodeId, cookie: &mut FileCookie) -> FsResult<()> {
        Self::owned(id, cookie.node())?;
        self.view(id)?.node().close(cookie)
    }

    pub fn free_cookie(&self, id: NodeId, cookie: FileCookie) -> FsResult<()> {
        Self::owned(id, cookie.node())?;
        self.view(id)?.node().free_cookie(cookie)
    }

    pub fn read(
        &self,
        id: NodeId,
        cookie: &mut FileCookie,
        offset: i64,
        size: usize,
    ) -> FsResult<Vec<u8>> {
        Self::owned(id, cookie.node())?;
        self.view(id)?.node().read(cookie, offset, size)
    }

    pub fn write(
        &self,
        id: NodeId,
        cookie: &mut FileCookie,
        offset: i64,
        data: &[u8],
    ) -> FsResult<usize> {
        Self::owned(id, cookie.node())?;
        self.view(id)?.node().write(cookie, offset, data)
    }

    pub fn create(
        &self,
        dir: NodeId,
        name: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> FsResult<(NodeId, FileCookie)> {
        self.view(dir)?.node().create(name, flags, mode)
    }

    pub fn remove(&self, dir: NodeId, name: &str) -> FsResult<()> {
        self.view(dir)?.node().remove(name)
    }

    pub fn rename(
        &self,
        from_dir: NodeId,
        from_name: &str,
        to_dir: NodeId,
        to_name: &str,
    ) -> FsResult<()> {
        let target = self.handle(to_dir)?;
        self.view(from_dir)?.node().rename(from_name, &target, to_name)
    }

    pub fn create_dir(&self, dir: NodeId, name: &str, mode: u32) -> FsResult<NodeId> {
        self.view(dir)?.node().create_dir(name, mode)
    }

    pub fn remove_dir(&self, dir: NodeId, name: &str) -> FsResult<()> {
        self.view(dir)?.node().remove_dir(name)
    }

    pub fn open_dir(&self, id: NodeId) -> FsResult<DirCookie> {
        self.view(id)?.node().open_dir()
    }

    pub fn close_dir(&self, id: NodeId, cookie: &mut DirCookie) -> FsResult<()> {
        Self::owned(id, cookie.node())?;
        self.view(id)?.node().close_dir(cookie)
    }

    pub fn read_dir(
        &self,
        id: NodeId,
        cookie: &mut DirCookie,
        max: usize,
    ) -> FsResult<Vec<DirEntry>> {
        Self::owned(id, cookie.node())?;
        self.view(id)?.node().read_dir(cookie, max)
    }

    pub fn rewind_dir(&self, id: NodeId, cookie: &mut DirCookie) -> FsResult<()> {
        Self::owned(id, cookie.node())?;
        self.view(id)?.node().rewind_dir(cookie)
    }

    pub fn free_dir_cookie(&self, id: NodeId, cookie: DirCookie) -> FsResult<()> {
        Self::owned(id, cookie.node())?;
        self.view(id)?.node().free_dir_cookie(cookie)
    }
}

/// Entries taken out of a directory by [`retire_entries`]
#[derive(Debug, Default)]
struct Retired {
    removed: Vec<(String, NodeId)>,
    forgotten: Vec<NodeId>,
}

/// Remove every live entry of a revived discovery directory
///
/// Open iterators keep seeing the entries until their last close. Entries
/// still on the network are found again by the same scan and revived with
/// their identity while they are marked.
fn retire_entries(registry: &mut NodeRegistry, dir_id: NodeId) -> Retired {
    let names: Vec<String> = registry
        .get(dir_id)
        .and_then(Node::discovery_dir)
        .map(|dir| {
            dir.entries()
                .iter()
                .filter(|e| e.state == EntryState::Live)
                .map(|e| e.name.clone())
                .collect()
        })
        .unwrap_or_default();

    let mut retired = Retired::default();
    for name in names {
        let removal = registry
            .get_mut(dir_id)
            .and_then(|node| node.discovery_dir_mut())
            .and_then(|dir| dir.remove_entry(&name));
        match removal {
            Some(Removal::Marked(id)) => retired.removed.push((name, id)),
            Some(Removal::Gone(id)) => {
                retired.forgotten.extend(registry.forget_subtree(id));
                retired.removed.push((name, id));
            }
            None => {}
        }
    }
    retired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{event_channel, request_channel};
    use crate::memory_remote::MemoryNetwork;
    use crate::notify::{HostEvent, RecordingNotifier};
    use crate::scanner::Scanner;
    use smbnet_core::FileType;

    struct Harness {
        network: MemoryNetwork,
        volume: Volume,
        notifier: Arc<RecordingNotifier>,
        scanner: Scanner,
        events: FrameReceiver<ScannerEvent>,
    }

    impl Harness {
        fn new(read_only: bool) -> Self {
            let network = MemoryNetwork::new();
            network.add_server("WG", "NAS", "storage");
            network.add_share("NAS", "media", "");
            network.add_dir("smb://NAS/media/photos");
            network.add_file("smb://NAS/media/a.txt", b"alpha");
            network.add_file("smb://NAS/media/b.txt", b"bravo");

            let remote = Arc::new(RemoteLock::new(network.clone()));
            let notifier = Arc::new(RecordingNotifier::new());
            let options = VolumeOptions {
                volume_name: "test".into(),
                read_only,
                uid: 1000,
                gid: 1000,
                request_interval: Duration::from_secs(60),
            };
            let volume = Volume::new(options, remote.clone(), notifier.clone());
            let (tx, events) = event_channel();
            let scanner = Scanner::new(remote, tx, Duration::ZERO);

            let harness = Self {
                network,
                volume,
                notifier,
                scanner,
                events,
            };
            harness.rescan();
            harness
        }

        fn rescan(&self) {
            self.scanner.request_scan().unwrap();
            self.volume.pump_events(&self.events).unwrap();
        }

        fn resolve(&self, path: &[&str]) -> FsResult<NodeId> {
            let mut id = self.volume.root();
            for name in path {
                id = self.volume.lookup(id, name)?;
            }
            Ok(id)
        }

        fn names(&self, id: NodeId, cookie: &mut DirCookie) -> Vec<String> {
            self.volume
                .read_dir(id, cookie, usize::MAX)
                .unwrap()
                .into_iter()
                .map(|e| e.name)
                .collect()
        }
    }

    #[test]
    fn test_scan_populates_namespace() {
        let h = Harness::new(false);
        let wg = h.resolve(&["WG"]).unwrap();
        let nas = h.resolve(&["WG", "NAS"]).unwrap();
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();

        assert_eq!(h.volume.recall("smb://NAS"), Some(nas));
        assert!(h.volume.read_stat(media).unwrap().is_dir());

        let attr = h.volume.read_stat(wg).unwrap();
        assert_eq!(attr.mode, FileAttr::DISCOVERY_DIR_MODE);
        assert_eq!(attr.uid, 1000);

        let created: Vec<NodeId> = h
            .notifier
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::EntryCreated { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(created, vec![wg, nas, media]);
    }

    #[test]
    fn test_discovery_listing_has_dots_first() {
        let h = Harness::new(false);
        let wg = h.resolve(&["WG"]).unwrap();
        let mut cookie = h.volume.open_dir(wg).unwrap();
        let entries = h.volume.read_dir(wg, &mut cookie, 16).unwrap();

        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[0].id, wg);
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[1].id, NETWORK_NODE_ID);
        assert_eq!(entries[2].name, "NAS");
        assert_eq!(entries.len(), 3);
        h.volume.close_dir(wg, &mut cookie).unwrap();
    }

    #[test]
    fn test_removal_deferred_while_directory_open() {
        let h = Harness::new(false);
        let wg = h.resolve(&["WG"]).unwrap();
        let nas = h.resolve(&["WG", "NAS"]).unwrap();

        let mut early = h.volume.open_dir(wg).unwrap();
        h.network.remove_server("NAS");
        h.rescan();

        assert_eq!(h.volume.lookup(wg, "NAS"), Err(FsError::NotFound));
        assert!(h.names(wg, &mut early).contains(&"NAS".to_string()));

        let mut late = h.volume.open_dir(wg).unwrap();
        assert!(!h.names(wg, &mut late).contains(&"NAS".to_string()));

        h.volume.close_dir(wg, &mut early).unwrap();
        assert_eq!(h.volume.recall("smb://NAS"), Some(nas));

        h.volume.close_dir(wg, &mut late).unwrap();
        assert_eq!(h.volume.recall("smb://NAS"), None);
        assert_eq!(h.volume.read_stat(nas), Err(FsError::NotFound));
        assert!(h.notifier.events().contains(&HostEvent::NodeRemoved { id: nas }));
    }

    #[test]
    fn test_removal_immediate_when_closed() {
        let h = Harness::new(false);
        let nas = h.resolve(&["WG", "NAS"]).unwrap();
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();

        h.network.remove_server("NAS");
        h.rescan();

        assert_eq!(h.volume.recall("smb://NAS"), None);
        assert_eq!(h.volume.recall("smb://NAS/media"), None);
        let events = h.notifier.events();
        assert!(events.contains(&HostEvent::NodeRemoved { id: nas }));
        assert!(events.contains(&HostEvent::NodeRemoved { id: media }));
    }

    #[test]
    fn test_refound_entry_is_revived() {
        let h = Harness::new(false);
        let wg = h.resolve(&["WG"]).unwrap();
        let nas = h.resolve(&["WG", "NAS"]).unwrap();

        let mut cookie = h.volume.open_dir(wg).unwrap();
        h.network.remove_server("NAS");
        h.rescan();
        h.network.add_server("WG", "NAS", "storage");
        h.network.add_share("NAS", "media", "");
        h.rescan();

        assert_eq!(h.resolve(&["WG", "NAS"]), Ok(nas));
        assert!(h.resolve(&["WG", "NAS", "media"]).is_ok());
        h.volume.close_dir(wg, &mut cookie).unwrap();
        assert_eq!(h.volume.recall("smb://NAS"), Some(nas));
    }

    #[test]
    fn test_revive_keeps_children_seen_by_open_iterator() {
        let h = Harness::new(false);
        let wg = h.resolve(&["WG"]).unwrap();
        let nas = h.resolve(&["WG", "NAS"]).unwrap();

        let mut root = h.volume.open_dir(NETWORK_NODE_ID).unwrap();
        let mut cookie = h.volume.open_dir(wg).unwrap();
        h.network.remove_workgroup("WG");
        h.rescan();
        h.network.add_server("WG", "NAS", "storage");
        h.rescan();

        assert_eq!(h.names(wg, &mut cookie), vec![".", "..", "NAS"]);
        assert_eq!(h.volume.lookup(wg, "NAS"), Ok(nas));
        assert!(h.volume.read_stat(nas).unwrap().is_dir());
        assert!(h.resolve(&["WG", "NAS", "media"]).is_ok());

        h.volume.close_dir(wg, &mut cookie).unwrap();
        h.volume.close_dir(NETWORK_NODE_ID, &mut root).unwrap();
        assert_eq!(h.volume.recall("smb://NAS"), Some(nas));
        assert!(h.volume.registry().is_consistent());
    }

    #[test]
    fn test_revive_drops_children_gone_from_network() {
        let h = Harness::new(false);
        let wg = h.resolve(&["WG"]).unwrap();
        let nas = h.resolve(&["WG", "NAS"]).unwrap();

        let mut root = h.volume.open_dir(NETWORK_NODE_ID).unwrap();
        let mut cookie = h.volume.open_dir(wg).unwrap();
        h.network.remove_workgroup("WG");
        h.rescan();
        h.network.add_server("WG", "BOX", "");
        h.rescan();

        assert_eq!(h.volume.lookup(wg, "NAS"), Err(FsError::NotFound));
        assert!(h.volume.lookup(wg, "BOX").is_ok());
        // Still listed for the iterator opened before the rescan
        assert_eq!(h.volume.recall("smb://NAS"), Some(nas));

        h.volume.close_dir(wg, &mut cookie).unwrap();
        assert_eq!(h.volume.recall("smb://NAS"), None);
        assert!(h.notifier.events().contains(&HostEvent::NodeRemoved { id: nas }));
        h.volume.close_dir(NETWORK_NODE_ID, &mut root).unwrap();
    }

    #[test]
    fn test_server_moved_to_other_workgroup() {
        let h = Harness::new(false);
        let old_wg = h.resolve(&["WG"]).unwrap();
        let old_nas = h.resolve(&["WG", "NAS"]).unwrap();
        h.notifier.take();

        // The new workgroup sorts first, so the server is found before it is lost
        h.network.add_server("ALPHA", "NAS", "storage");
        h.network.remove_workgroup("WG");
        h.rescan();

        let nas = h.resolve(&["ALPHA", "NAS"]).unwrap();
        assert_ne!(nas, old_nas);
        assert_eq!(h.volume.recall("smb://NAS"), Some(nas));
        assert_eq!(h.volume.read_stat(old_nas), Err(FsError::NotFound));
        assert_eq!(h.volume.lookup(NETWORK_NODE_ID, "WG"), Err(FsError::NotFound));
        assert!(h.resolve(&["ALPHA", "NAS", "media"]).is_ok());

        let events = h.notifier.take();
        assert!(events.contains(&HostEvent::EntryRemoved {
            dir: old_wg,
            name: "NAS".into(),
            id: old_nas,
        }));
        assert!(events.contains(&HostEvent::NodeRemoved { id: old_nas }));

        h.network.add_share("NAS", "backup", "");
        h.rescan();
        assert!(h.resolve(&["ALPHA", "NAS", "backup"]).is_ok());
        assert!(h.volume.registry().is_consistent());
    }

    #[test]
    fn test_server_moves_back_while_old_workgroup_open() {
        let h = Harness::new(false);
        let wg = h.resolve(&["WG"]).unwrap();
        let first = h.resolve(&["WG", "NAS"]).unwrap();

        let mut cookie = h.volume.open_dir(wg).unwrap();
        h.network.remove_server("NAS");
        h.network.add_server("ALPHA", "NAS", "storage");
        h.network.add_share("NAS", "media", "");
        h.network.add_workgroup("WG", "");
        h.rescan();
        let moved = h.resolve(&["ALPHA", "NAS"]).unwrap();
        assert_eq!(h.volume.lookup(wg, "NAS"), Err(FsError::NotFound));

        h.network.remove_workgroup("ALPHA");
        h.network.add_server("WG", "NAS", "storage");
        h.rescan();

        let back = h.volume.lookup(wg, "NAS").unwrap();
        assert_ne!(back, first);
        assert_ne!(back, moved);
        assert_eq!(h.volume.recall("smb://NAS"), Some(back));
        assert!(h.resolve(&["WG", "NAS", "media"]).is_ok());

        h.volume.close_dir(wg, &mut cookie).unwrap();
        assert_eq!(h.volume.lookup(wg, "NAS"), Ok(back));
        assert!(h.volume.registry().is_consistent());
    }

    #[test]
    fn test_unreachable_share_is_hidden() {
        let h = Harness::new(false);
        h.network.add_share("NAS", "backup", "");
        h.network.fail_path("smb://NAS/backup");
        h.rescan();
        assert_eq!(h.resolve(&["WG", "NAS", "backup"]), Err(FsError::NotFound));
        assert!(h.resolve(&["WG", "NAS", "media"]).is_ok());
    }

    #[test]
    fn test_discovery_nodes_reject_mutation() {
        let h = Harness::new(false);
        let wg = h.resolve(&["WG"]).unwrap();

        assert_eq!(
            h.volume.create(wg, "x", OpenFlags::READ_WRITE, 0o644).err(),
            Some(FsError::PermissionDenied)
        );
        assert_eq!(h.volume.create_dir(wg, "x", 0o755), Err(FsError::PermissionDenied));
        assert_eq!(h.volume.remove(wg, "NAS"), Err(FsError::PermissionDenied));
        assert_eq!(h.volume.remove_dir(wg, "NAS"), Err(FsError::PermissionDenied));
        assert_eq!(
            h.volume.write_stat(wg, &SetAttr { size: None, mtime: Some(std::time::SystemTime::now()) }),
            Err(FsError::PermissionDenied)
        );
        assert_eq!(
            h.volume.open(wg, OpenFlags::WRITE_ONLY).err(),
            Some(FsError::PermissionDenied)
        );

        let mut cookie = h.volume.open(wg, OpenFlags::READ_ONLY).unwrap();
        assert_eq!(h.volume.read(wg, &mut cookie, 0, 16), Err(FsError::IsADirectory));
    }

    #[test]
    fn test_closed_dir_cookie_is_rejected() {
        let h = Harness::new(false);
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();

        let mut cookie = h.volume.open_dir(media).unwrap();
        h.volume.close_dir(media, &mut cookie).unwrap();
        assert_eq!(h.volume.read_dir(media, &mut cookie, 8), Err(FsError::CookieClosed));
        assert_eq!(h.volume.close_dir(media, &mut cookie), Err(FsError::CookieClosed));
        assert_eq!(h.volume.rewind_dir(media, &mut cookie), Err(FsError::CookieClosed));
    }

    #[test]
    fn test_cookie_of_another_node_is_rejected() {
        let h = Harness::new(false);
        let wg = h.resolve(&["WG"]).unwrap();
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();

        let mut cookie = h.volume.open_dir(media).unwrap();
        assert_eq!(h.volume.read_dir(wg, &mut cookie, 8), Err(FsError::BadHandle));
        h.volume.free_dir_cookie(media, cookie).unwrap();
    }

    #[test]
    fn test_share_listing_materializes_entries() {
        let h = Harness::new(false);
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();

        let mut cookie = h.volume.open_dir(media).unwrap();
        let entries = h.volume.read_dir(media, &mut cookie, usize::MAX).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "a.txt", "b.txt", "photos"]);

        let photos = entries.iter().find(|e| e.name == "photos").unwrap();
        assert_eq!(photos.file_type, FileType::Directory);
        assert_eq!(h.volume.lookup(media, "photos"), Ok(photos.id));

        h.volume.rewind_dir(media, &mut cookie).unwrap();
        assert_eq!(h.volume.read_dir(media, &mut cookie, 3).unwrap().len(), 3);
        h.volume.close_dir(media, &mut cookie).unwrap();
        assert_eq!(h.network.open_handles(), (0, 0));
    }

    #[test]
    fn test_file_io_roundtrip() {
        let h = Harness::new(false);
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();

        let (id, mut cookie) = h
            .volume
            .create(media, "new.txt", OpenFlags::READ_WRITE.with(libc::O_CREAT), 0o644)
            .unwrap();
        assert_eq!(h.volume.write(id, &mut cookie, 0, b"hello world"), Ok(11));
        assert_eq!(h.volume.write(id, &mut cookie, 6, b"there"), Ok(5));
        h.volume.close(id, &mut cookie).unwrap();
        h.volume.free_cookie(id, cookie).unwrap();

        assert!(h
            .notifier
            .events()
            .contains(&HostEvent::EntryCreated { dir: media, name: "new.txt".into(), id }));

        let mut cookie = h.volume.open(id, OpenFlags::READ_ONLY).unwrap();
        assert_eq!(h.volume.read(id, &mut cookie, 0, 64).unwrap(), b"hello there");
        assert_eq!(h.volume.read(id, &mut cookie, 6, 3).unwrap(), b"the");
        assert_eq!(h.volume.read(id, &mut cookie, -1, 3), Err(FsError::InvalidArgument));
        h.volume.close(id, &mut cookie).unwrap();
        assert_eq!(h.volume.read(id, &mut cookie, 0, 3), Err(FsError::BadHandle));

        h.volume
            .write_stat(id, &SetAttr { size: Some(5), mtime: None })
            .unwrap();
        assert_eq!(h.network.file_contents("smb://NAS/media/new.txt").unwrap(), b"hello");
        assert_eq!(h.volume.read_stat(id).unwrap().size, 5);
        assert_eq!(h.network.open_handles(), (0, 0));
    }

    #[test]
    fn test_exclusive_create_of_existing_file() {
        let h = Harness::new(false);
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();
        let flags = OpenFlags::READ_WRITE.with(libc::O_CREAT | libc::O_EXCL);
        assert_eq!(
            h.volume.create(media, "a.txt", flags, 0o644).err(),
            Some(FsError::AlreadyExists)
        );
    }

    #[test]
    fn test_exec_bits_masked_on_files() {
        let h = Harness::new(false);
        h.network
            .add_file_with_mode("smb://NAS/media/run.sh", b"#!/bin/sh", 0o755);
        let id = h.resolve(&["WG", "NAS", "media", "run.sh"]).unwrap();
        assert_eq!(h.volume.read_stat(id).unwrap().mode & 0o777, 0o644);
    }

    #[test]
    fn test_rename_onto_existing_file() {
        let h = Harness::new(false);
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();
        let a = h.volume.lookup(media, "a.txt").unwrap();
        let b = h.volume.lookup(media, "b.txt").unwrap();
        h.notifier.take();

        h.volume.rename(media, "a.txt", media, "b.txt").unwrap();

        let events = h.notifier.take();
        let removed: Vec<&HostEvent> = events
            .iter()
            .filter(|e| matches!(e, HostEvent::EntryRemoved { .. }))
            .collect();
        assert_eq!(
            removed,
            vec![&HostEvent::EntryRemoved { dir: media, name: "b.txt".into(), id: b }]
        );

        let moved: Vec<NodeId> = events
            .iter()
            .filter_map(|e| match e {
                HostEvent::EntryMoved { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(moved.len(), 1);
        assert_ne!(moved[0], a);
        assert_ne!(moved[0], b);

        assert_eq!(h.volume.lookup(media, "a.txt"), Err(FsError::NotFound));
        assert_eq!(h.volume.lookup(media, "b.txt"), Ok(moved[0]));
        assert_eq!(h.network.file_contents("smb://NAS/media/b.txt").unwrap(), b"alpha");
    }

    #[test]
    fn test_rename_of_unseen_file_reports_no_move() {
        let h = Harness::new(false);
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();
        let b = h.volume.lookup(media, "b.txt").unwrap();
        let before = h.volume.node_count();
        h.notifier.take();

        h.volume.rename(media, "a.txt", media, "b.txt").unwrap();

        assert_eq!(
            h.notifier.take(),
            vec![
                HostEvent::EntryRemoved { dir: media, name: "b.txt".into(), id: b },
                HostEvent::NodeRemoved { id: b },
            ]
        );
        assert_eq!(h.volume.node_count(), before - 1);
        assert_eq!(h.network.file_contents("smb://NAS/media/b.txt").unwrap(), b"alpha");
        assert_ne!(h.volume.lookup(media, "b.txt").unwrap(), b);
    }

    #[test]
    fn test_rename_into_discovery_dir_denied() {
        let h = Harness::new(false);
        let wg = h.resolve(&["WG"]).unwrap();
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();
        assert_eq!(
            h.volume.rename(media, "a.txt", wg, "a.txt"),
            Err(FsError::PermissionDenied)
        );
        assert!(h.network.exists("smb://NAS/media/a.txt"));
    }

    #[test]
    fn test_remove_and_rmdir() {
        let h = Harness::new(false);
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();
        let a = h.volume.lookup(media, "a.txt").unwrap();

        h.volume.remove(media, "a.txt").unwrap();
        assert!(!h.network.exists("smb://NAS/media/a.txt"));
        assert_eq!(h.volume.read_stat(a), Err(FsError::NotFound));

        let sub = h.volume.create_dir(media, "sub", 0o755).unwrap();
        assert!(h.volume.read_stat(sub).unwrap().is_dir());
        h.network.add_file("smb://NAS/media/sub/x", b"");
        assert_eq!(h.volume.remove_dir(media, "sub"), Err(FsError::NotEmpty));
        h.volume.remove(sub, "x").unwrap();
        h.volume.remove_dir(media, "sub").unwrap();
        assert_eq!(h.volume.recall("smb://NAS/media/sub"), None);
    }

    #[test]
    fn test_read_only_volume() {
        let h = Harness::new(true);
        let media = h.resolve(&["WG", "NAS", "media"]).unwrap();
        let a = h.volume.lookup(media, "a.txt").unwrap();

        assert_eq!(
            h.volume.create(media, "c.txt", OpenFlags::READ_WRITE, 0o644).err(),
            Some(FsError::ReadOnly)
        );
        assert_eq!(h.volume.open(a, OpenFlags::WRITE_ONLY).err(), Some(FsError::ReadOnly));
        assert_eq!(h.volume.remove(media, "a.txt"), Err(FsError::ReadOnly));
        assert_eq!(h.volume.read_stat(a).unwrap().mode & 0o222, 0);
        assert!(h.volume.fs_info().read_only);
    }

    #[test]
    fn test_first_open_requests_scan_once() {
        let (tx, rx) = request_channel();
        let remote = Arc::new(RemoteLock::new(MemoryNetwork::new()));
        let volume = Volume::new(VolumeOptions::default(), remote, Arc::new(RecordingNotifier::new()))
            .with_scanner(tx);

        let mut first = volume.open_dir(NETWORK_NODE_ID).unwrap();
        let mut second = volume.open_dir(NETWORK_NODE_ID).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Some(ScannerRequest::ScanRequested));
        assert_eq!(rx.try_recv().unwrap(), None);

        volume.apply_event(ScannerEvent::ScanFinished);
        volume.close_dir(NETWORK_NODE_ID, &mut first).unwrap();
        volume.close_dir(NETWORK_NODE_ID, &mut second).unwrap();
        // Last close asks again, but the gate holds until the interval passes
        assert_eq!(rx.try_recv().unwrap(), None);
    }
}
