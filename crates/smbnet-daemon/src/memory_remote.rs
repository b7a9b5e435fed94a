//! In-memory network for tests and offline mounts
//!
//! `MemoryNetwork` implements [`RemoteShareClient`] over a simulated browse
//! namespace (workgroups, servers, shares) and per-share file trees. Clones
//! share the same state, so a test can keep a handle and mutate the network
//! while the scanner and the volume use another one behind the remote lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

use smbnet_core::url::NETWORK_URL;
use smbnet_core::{Errno, OpenFlags};

use crate::remote::{
    RemoteDir, RemoteDirEntry, RemoteEntryKind, RemoteFile, RemoteShareClient, RemoteStat,
};

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug)]
enum Object {
    File {
        data: Vec<u8>,
        mode: u32,
        mtime: SystemTime,
    },
    Directory {
        mode: u32,
        mtime: SystemTime,
    },
}

#[derive(Debug)]
struct ShareInfo {
    comment: String,
    kind: RemoteEntryKind,
}

#[derive(Debug, Default)]
struct ServerInfo {
    comment: String,
    shares: BTreeMap<String, ShareInfo>,
}

#[derive(Debug, Default)]
struct WorkgroupInfo {
    comment: String,
    servers: BTreeSet<String>,
}

#[derive(Debug)]
struct OpenFile {
    url: String,
    position: u64,
    flags: OpenFlags,
}

#[derive(Debug)]
struct OpenListing {
    entries: Vec<RemoteDirEntry>,
    position: usize,
}

#[derive(Debug, Default)]
struct NetworkState {
    workgroups: BTreeMap<String, WorkgroupInfo>,
    servers: BTreeMap<String, ServerInfo>,
    objects: BTreeMap<String, Object>,
    files: HashMap<u64, OpenFile>,
    listings: HashMap<u64, OpenListing>,
    next_handle: u64,
    failing: BTreeSet<String>,
    /// Share root URL to the users allowed in; absent means open to all
    restricted: BTreeMap<String, BTreeSet<String>>,
    user: String,
    calls: HashMap<&'static str, usize>,
}

impl NetworkState {
    fn count(&mut self, call: &'static str) {
        *self.calls.entry(call).or_insert(0) += 1;
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_reachable(&self, url: &str) -> Result<(), Errno> {
        if self.failing.contains(url) {
            return Err(Errno::EIO);
        }
        let denied = self.restricted.iter().any(|(root, users)| {
            let inside = url
                .strip_prefix(root.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
            inside && !users.contains(&self.user)
        });
        if denied {
            return Err(Errno::EACCES);
        }
        Ok(())
    }

    fn require_parent_dir(&self, url: &str) -> Result<(), Errno> {
        match parent_url(url).and_then(|p| self.objects.get(p)) {
            Some(Object::Directory { .. }) => Ok(()),
            Some(Object::File { .. }) => Err(Errno::ENOTDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn has_children(&self, url: &str) -> bool {
        let prefix = format!("{}/", url);
        self.objects
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    fn listing(&self, url: &str) -> Result<Vec<RemoteDirEntry>, Errno> {
        self.check_reachable(url)?;

        if url == NETWORK_URL {
            return Ok(self
                .workgroups
                .iter()
                .map(|(name, wg)| {
                    RemoteDirEntry::new(name.clone(), RemoteEntryKind::Workgroup)
                        .with_comment(wg.comment.clone())
                })
                .collect());
        }

        if let Some(name) = browse_name(url) {
            if let Some(wg) = self.workgroups.get(name) {
                return Ok(wg
                    .servers
                    .iter()
                    .map(|server| {
                        let comment = self
                            .servers
                            .get(server)
                            .map(|s| s.comment.clone())
                            .unwrap_or_default();
                        RemoteDirEntry::new(server.clone(), RemoteEntryKind::Server)
                            .with_comment(comment)
                    })
                    .collect());
            }
            if let Some(server) = self.servers.get(name) {
                return Ok(server
                    .shares
                    .iter()
                    .map(|(share, info)| {
                        RemoteDirEntry::new(share.clone(), info.kind)
                            .with_comment(info.comment.clone())
                    })
                    .collect());
            }
            return Err(Errno::ENOENT);
        }

        match self.objects.get(url) {
            Some(Object::Directory { .. }) => {}
            Some(Object::File { .. }) => return Err(Errno::ENOTDIR),
            None => return Err(Errno::ENOENT),
        }

        let mut entries = vec![
            RemoteDirEntry::new(".", RemoteEntryKind::Directory),
            RemoteDirEntry::new("..", RemoteEntryKind::Directory),
        ];
        let prefix = format!("{}/", url);
        for (key, object) in self.objects.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            if rest.contains('/') {
                continue;
            }
            let kind = match object {
                Object::File { .. } => RemoteEntryKind::File,
                Object::Directory { .. } => RemoteEntryKind::Directory,
            };
            entries.push(RemoteDirEntry::new(rest, kind));
        }
        Ok(entries)
    }

    fn open_file(&mut self, file: RemoteFile) -> Result<&mut OpenFile, Errno> {
        self.files.get_mut(&file.0).ok_or(Errno::EBADF)
    }
}

/// URL of the containing directory, for paths inside a share
fn parent_url(url: &str) -> Option<&str> {
    let rest = url.strip_prefix(NETWORK_URL)?;
    let (parent, _) = rest.rsplit_once('/')?;
    Some(&url[..NETWORK_URL.len() + parent.len()])
}

/// Workgroup or server name for a top-level browse URL
fn browse_name(url: &str) -> Option<&str> {
    url.strip_prefix(NETWORK_URL)
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

/// Simulated network shared between clones
#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_workgroup(&self, name: &str, comment: &str) {
        let mut state = self.state.lock();
        state.workgroups.entry(name.to_string()).or_default().comment = comment.to_string();
    }

    /// Add a server to a workgroup, creating the workgroup if needed
    pub fn add_server(&self, workgroup: &str, name: &str, comment: &str) {
        let mut state = self.state.lock();
        state
            .workgroups
            .entry(workgroup.to_string())
            .or_default()
            .servers
            .insert(name.to_string());
        state.servers.entry(name.to_string()).or_default().comment = comment.to_string();
    }

    pub fn add_share(&self, server: &str, name: &str, comment: &str) {
        self.add_share_of_kind(server, name, comment, RemoteEntryKind::FileShare);
    }

    pub fn add_share_of_kind(&self, server: &str, name: &str, comment: &str, kind: RemoteEntryKind) {
        let mut state = self.state.lock();
        state.servers.entry(server.to_string()).or_default().shares.insert(
            name.to_string(),
            ShareInfo {
                comment: comment.to_string(),
                kind,
            },
        );
        if kind == RemoteEntryKind::FileShare {
            state
                .objects
                .entry(format!("{}{}/{}", NETWORK_URL, server, name))
                .or_insert(Object::Directory {
                    mode: DEFAULT_DIR_MODE,
                    mtime: SystemTime::now(),
                });
        }
    }

    pub fn set_server_comment(&self, server: &str, comment: &str) {
        if let Some(info) = self.state.lock().servers.get_mut(server) {
            info.comment = comment.to_string();
        }
    }

    pub fn remove_workgroup(&self, name: &str) {
        self.state.lock().workgroups.remove(name);
    }

    /// Drop a server from every workgroup, together with its shares
    pub fn remove_server(&self, name: &str) {
        let mut state = self.state.lock();
        for wg in state.workgroups.values_mut() {
            wg.servers.remove(name);
        }
        state.servers.remove(name);
        let prefix = format!("{}{}/", NETWORK_URL, name);
        state.objects.retain(|url, _| !url.starts_with(&prefix));
    }

    pub fn remove_share(&self, server: &str, name: &str) {
        let mut state = self.state.lock();
        if let Some(info) = state.servers.get_mut(server) {
            info.shares.remove(name);
        }
        let root = format!("{}{}/{}", NETWORK_URL, server, name);
        let prefix = format!("{}/", root);
        state
            .objects
            .retain(|url, _| url != &root && !url.starts_with(&prefix));
    }

    pub fn add_dir(&self, url: &str) {
        self.state.lock().objects.insert(
            url.to_string(),
            Object::Directory {
                mode: DEFAULT_DIR_MODE,
                mtime: SystemTime::now(),
            },
        );
    }

    pub fn add_file(&self, url: &str, data: &[u8]) {
        self.add_file_with_mode(url, data, DEFAULT_FILE_MODE);
    }

    pub fn add_file_with_mode(&self, url: &str, data: &[u8], mode: u32) {
        self.state.lock().objects.insert(
            url.to_string(),
            Object::File {
                data: data.to_vec(),
                mode,
                mtime: SystemTime::now(),
            },
        );
    }

    pub fn file_contents(&self, url: &str) -> Option<Vec<u8>> {
        match self.state.lock().objects.get(url) {
            Some(Object::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, url: &str) -> bool {
        self.state.lock().objects.contains_key(url)
    }

    /// Make stat and listing calls on `url` fail with EIO
    pub fn fail_path(&self, url: &str) {
        self.state.lock().failing.insert(url.to_string());
    }

    pub fn heal_path(&self, url: &str) {
        self.state.lock().failing.remove(url);
    }

    /// Only let `users` into a share; everyone else gets EACCES
    pub fn restrict_share(&self, server: &str, share: &str, users: &[&str]) {
        let root = format!("{}{}/{}", NETWORK_URL, server, share);
        let users = users.iter().map(|u| u.to_string()).collect();
        self.state.lock().restricted.insert(root, users);
    }

    /// User the client authenticates as
    pub fn login(&self, username: &str) {
        debug!("memory network: logged in as {:?}", username);
        self.state.lock().user = username.to_string();
    }

    /// Number of calls made to a client operation, by name
    pub fn call_count(&self, call: &str) -> usize {
        self.state.lock().calls.get(call).copied().unwrap_or(0)
    }

    /// Number of listings opened on the namespace root, one per scan
    pub fn root_listings(&self) -> usize {
        self.call_count("browse_root")
    }

    /// Open (files, directories) handles
    pub fn open_handles(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.files.len(), state.listings.len())
    }
}

impl RemoteShareClient for MemoryNetwork {
    fn stat(&mut self, url: &str) -> Result<RemoteStat, Errno> {
        let mut state = self.state.lock();
        state.count("stat");
        state.check_reachable(url)?;
        match state.objects.get(url) {
            Some(Object::File { data, mode, mtime }) => Ok(RemoteStat {
                is_dir: false,
                size: data.len() as u64,
                mode: *mode,
                atime: *mtime,
                mtime: *mtime,
            }),
            Some(Object::Directory { mode, mtime }) => Ok(RemoteStat {
                is_dir: true,
                size: 0,
                mode: *mode,
                atime: *mtime,
                mtime: *mtime,
            }),
            None => Err(Errno::ENOENT),
        }
    }

    fn open(&mut self, url: &str, flags: OpenFlags) -> Result<RemoteFile, Errno> {
        let mut state = self.state.lock();
        state.count("open");
        state.check_reachable(url)?;
        match state.objects.get_mut(url) {
            Some(Object::File { data, mtime, .. }) => {
                if flags.truncates() {
                    data.clear();
                    *mtime = SystemTime::now();
                }
            }
            Some(Object::Directory { .. }) => return Err(Errno::EISDIR),
            None if flags.bits() & libc::O_CREAT != 0 => {
                state.require_parent_dir(url)?;
                state.objects.insert(
                    url.to_string(),
                    Object::File {
                        data: Vec::new(),
                        mode: DEFAULT_FILE_MODE,
                        mtime: SystemTime::now(),
                    },
                );
            }
            None => return Err(Errno::ENOENT),
        }
        let handle = state.handle();
        state.files.insert(
            handle,
            OpenFile {
                url: url.to_string(),
                position: 0,
                flags,
            },
        );
        trace!("memory open {} -> {}", url, handle);
        Ok(RemoteFile(handle))
    }

    fn create(&mut self, url: &str, mode: u32) -> Result<RemoteFile, Errno> {
        let mut state = self.state.lock();
        state.count("create");
        state.require_parent_dir(url)?;
        if let Some(Object::Directory { .. }) = state.objects.get(url) {
            return Err(Errno::EISDIR);
        }
        state.objects.insert(
            url.to_string(),
            Object::File {
                data: Vec::new(),
                mode: mode & 0o777,
                mtime: SystemTime::now(),
            },
        );
        let handle = state.handle();
        state.files.insert(
            handle,
            OpenFile {
                url: url.to_string(),
                position: 0,
                flags: OpenFlags::READ_WRITE,
            },
        );
        Ok(RemoteFile(handle))
    }

    fn close(&mut self, file: RemoteFile) -> Result<(), Errno> {
        let mut state = self.state.lock();
        state.count("close");
        state.files.remove(&file.0).map(|_| ()).ok_or(Errno::EBADF)
    }

    fn seek(&mut self, file: RemoteFile, offset: u64) -> Result<u64, Errno> {
        let mut state = self.state.lock();
        let open = state.open_file(file)?;
        open.position = offset;
        Ok(offset)
    }

    fn read(&mut self, file: RemoteFile, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut state = self.state.lock();
        state.count("read");
        let open = state.files.get(&file.0).ok_or(Errno::EBADF)?;
        if !open.flags.reads() {
            return Err(Errno::EBADF);
        }
        let (url, position) = (open.url.clone(), open.position);
        let data = match state.objects.get(&url) {
            Some(Object::File { data, .. }) => data,
            _ => return Err(Errno::ENOENT),
        };
        let start = (position as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        state.open_file(file)?.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, file: RemoteFile, input: &[u8]) -> Result<usize, Errno> {
        let mut state = self.state.lock();
        state.count("write");
        let open = state.files.get(&file.0).ok_or(Errno::EBADF)?;
        if !open.flags.writes() {
            return Err(Errno::EBADF);
        }
        let (url, position) = (open.url.clone(), open.position as usize);
        match state.objects.get_mut(&url) {
            Some(Object::File { data, mtime, .. }) => {
                let end = position + input.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[position..end].copy_from_slice(input);
                *mtime = SystemTime::now();
            }
            _ => return Err(Errno::ENOENT),
        }
        state.open_file(file)?.position += input.len() as u64;
        Ok(input.len())
    }

    fn truncate(&mut self, file: RemoteFile, size: u64) -> Result<(), Errno> {
        let mut state = self.state.lock();
        state.count("truncate");
        let open = state.files.get(&file.0).ok_or(Errno::EBADF)?;
        if !open.flags.writes() {
            return Err(Errno::EBADF);
        }
        let url = open.url.clone();
        match state.objects.get_mut(&url) {
            Some(Object::File { data, mtime, .. }) => {
                data.resize(size as usize, 0);
                *mtime = SystemTime::now();
                Ok(())
            }
            _ => Err(Errno::ENOENT),
        }
    }

    fn set_mtime(&mut self, url: &str, new_mtime: SystemTime) -> Result<(), Errno> {
        let mut state = self.state.lock();
        state.count("set_mtime");
        match state.objects.get_mut(url) {
            Some(Object::File { mtime, .. }) | Some(Object::Directory { mtime, .. }) => {
                *mtime = new_mtime;
                Ok(())
            }
            None => Err(Errno::ENOENT),
        }
    }

    fn unlink(&mut self, url: &str) -> Result<(), Errno> {
        let mut state = self.state.lock();
        state.count("unlink");
        match state.objects.get(url) {
            Some(Object::File { .. }) => {
                state.objects.remove(url);
                Ok(())
            }
            Some(Object::Directory { .. }) => Err(Errno::EISDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), Errno> {
        let mut state = self.state.lock();
        state.count("rename");
        let from_is_dir = match state.objects.get(from) {
            Some(Object::Directory { .. }) => true,
            Some(Object::File { .. }) => false,
            None => return Err(Errno::ENOENT),
        };
        if from == to {
            return Ok(());
        }
        if to.starts_with(&format!("{}/", from)) {
            return Err(Errno::EINVAL);
        }
        state.require_parent_dir(to)?;
        match state.objects.get(to) {
            Some(Object::Directory { .. }) if !from_is_dir => return Err(Errno::EISDIR),
            Some(Object::File { .. }) if from_is_dir => return Err(Errno::ENOTDIR),
            Some(Object::Directory { .. }) if state.has_children(to) => {
                return Err(Errno::ENOTEMPTY)
            }
            _ => {}
        }
        state.objects.remove(to);

        let prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .objects
            .keys()
            .filter(|k| k.as_str() == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(object) = state.objects.remove(&key) {
                let new_key = format!("{}{}", to, &key[from.len()..]);
                state.objects.insert(new_key, object);
            }
        }
        debug!("memory rename {} -> {}", from, to);
        Ok(())
    }

    fn mkdir(&mut self, url: &str, mode: u32) -> Result<(), Errno> {
        let mut state = self.state.lock();
        state.count("mkdir");
        if state.objects.contains_key(url) {
            return Err(Errno::EEXIST);
        }
        state.require_parent_dir(url)?;
        state.objects.insert(
            url.to_string(),
            Object::Directory {
                mode: mode & 0o777,
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn rmdir(&mut self, url: &str) -> Result<(), Errno> {
        let mut state = self.state.lock();
        state.count("rmdir");
        match state.objects.get(url) {
            Some(Object::Directory { .. }) => {}
            Some(Object::File { .. }) => return Err(Errno::ENOTDIR),
            None => return Err(Errno::ENOENT),
        }
        if state.has_children(url) {
            return Err(Errno::ENOTEMPTY);
        }
        state.objects.remove(url);
        Ok(())
    }

    fn open_dir(&mut self, url: &str) -> Result<RemoteDir, Errno> {
        let mut state = self.state.lock();
        state.count("open_dir");
        if url == NETWORK_URL {
            state.count("browse_root");
        }
        let entries = state.listing(url)?;
        let handle = state.handle();
        state.listings.insert(
            handle,
            OpenListing {
                entries,
                position: 0,
            },
        );
        Ok(RemoteDir(handle))
    }

    fn read_dir_entry(&mut self, dir: RemoteDir) -> Result<Option<RemoteDirEntry>, Errno> {
        let mut state = self.state.lock();
        let listing = state.listings.get_mut(&dir.0).ok_or(Errno::EBADF)?;
        let entry = listing.entries.get(listing.position).cloned();
        if entry.is_some() {
            listing.position += 1;
        }
        Ok(entry)
    }

    fn seek_dir(&mut self, dir: RemoteDir, position: u64) -> Result<(), Errno> {
        let mut state = self.state.lock();
        let listing = state.listings.get_mut(&dir.0).ok_or(Errno::EBADF)?;
        listing.position = position as usize;
        Ok(())
    }

    fn close_dir(&mut self, dir: RemoteDir) -> Result<(), Errno> {
        let mut state = self.state.lock();
        state.count("close_dir");
        state.listings.remove(&dir.0).map(|_| ()).ok_or(Errno::EBADF)
    }
}

// === Fixtures ===

/// Network layout loaded from TOML
///
/// ```toml
/// [[workgroup]]
/// name = "WORKGROUP"
///
/// [[workgroup.server]]
/// name = "NAS"
/// comment = "file server"
///
/// [[workgroup.server.share]]
/// name = "media"
/// files = { "music/a.txt" = "hello" }
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NetworkFixture {
    pub workgroup: Vec<WorkgroupFixture>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WorkgroupFixture {
    pub name: String,
    pub comment: String,
    pub server: Vec<ServerFixture>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerFixture {
    pub name: String,
    pub comment: String,
    pub share: Vec<ShareFixture>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ShareFixture {
    pub name: String,
    pub comment: String,
    /// Users allowed into the share; empty means everyone
    pub users: Vec<String>,
    /// Relative path to file contents; intermediate directories are implied
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("failed to read fixture: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid fixture: {0}")]
    Parse(#[from] toml::de::Error),
}

impl NetworkFixture {
    pub fn load(path: &Path) -> Result<Self, FixtureError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, FixtureError> {
        Ok(toml::from_str(content)?)
    }

    pub fn build(&self) -> MemoryNetwork {
        let network = MemoryNetwork::new();
        for wg in &self.workgroup {
            network.add_workgroup(&wg.name, &wg.comment);
            for server in &wg.server {
                network.add_server(&wg.name, &server.name, &server.comment);
                for share in &server.share {
                    network.add_share(&server.name, &share.name, &share.comment);
                    if !share.users.is_empty() {
                        let users: Vec<&str> = share.users.iter().map(String::as_str).collect();
                        network.restrict_share(&server.name, &share.name, &users);
                    }
                    let root = format!("{}{}/{}", NETWORK_URL, server.name, share.name);
                    for (path, contents) in &share.files {
                        let mut dir = root.clone();
                        let mut components: Vec<&str> =
                            path.split('/').filter(|c| !c.is_empty()).collect();
                        let Some(file) = components.pop() else {
                            continue;
                        };
                        for component in components {
                            dir = format!("{}/{}", dir, component);
                            if !network.exists(&dir) {
                                network.add_dir(&dir);
                            }
                        }
                        network.add_file(&format!("{}/{}", dir, file), contents.as_bytes());
                    }
                }
            }
        }
        network
    }
}
