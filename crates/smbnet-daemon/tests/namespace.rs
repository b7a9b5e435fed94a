//! End-to-end behaviour of the scanner, channels and volume running on
//! their own threads over a simulated network.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use smbnet_core::{
    FsError, NodeKind, ResourceFound, ScannerEvent, StatusReport, NETWORK_NODE_ID,
};
use smbnet_daemon::{
    event_channel, request_channel, HostEvent, MemoryNetwork, NetworkFixture, RecordingNotifier,
    RemoteLock, Scanner, Volume, VolumeOptions,
};

struct Mounted {
    volume: Arc<Volume>,
    notifier: Arc<RecordingNotifier>,
    threads: Vec<JoinHandle<()>>,
}

impl Mounted {
    fn start(network: MemoryNetwork) -> Self {
        let remote = Arc::new(RemoteLock::new(network));
        let (request_tx, request_rx) = request_channel();
        let (event_tx, event_rx) = event_channel();

        let scanner = Scanner::new(remote.clone(), event_tx, Duration::ZERO);
        let notifier = Arc::new(RecordingNotifier::new());
        let options = VolumeOptions {
            request_interval: Duration::ZERO,
            ..VolumeOptions::default()
        };
        let volume = Arc::new(
            Volume::new(options, remote, notifier.clone()).with_scanner(request_tx),
        );

        let threads = vec![
            scanner.spawn(request_rx).unwrap(),
            volume.clone().spawn_event_pump(event_rx).unwrap(),
        ];
        Self {
            volume,
            notifier,
            threads,
        }
    }

    /// Open and close the root, which asks for a scan, then wait for the
    /// namespace to reach the expected state
    fn scan_until(&self, mut done: impl FnMut(&Volume) -> bool) {
        let mut cookie = self.volume.open_dir(NETWORK_NODE_ID).unwrap();
        self.volume.close_dir(NETWORK_NODE_ID, &mut cookie).unwrap();
        wait_for(|| done(&self.volume));
    }

    fn stop(self) {
        self.volume.stop_scanner().unwrap();
        let Mounted { volume, threads, .. } = self;
        drop(volume);
        for thread in threads {
            thread.join().unwrap();
        }
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn listing(volume: &Volume, id: u64) -> Vec<String> {
    let mut cookie = volume.open_dir(id).unwrap();
    let names = volume
        .read_dir(id, &mut cookie, usize::MAX)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .filter(|n| n != "." && n != "..")
        .collect();
    volume.close_dir(id, &mut cookie).unwrap();
    names
}

const FIXTURE: &str = r#"
[[workgroup]]
name = "HOME"

[[workgroup.server]]
name = "NAS"
comment = "storage"

[[workgroup.server.share]]
name = "media"
files = { "music/song.txt" = "la la la", "notes.txt" = "remember" }
"#;

#[test]
fn test_browse_and_read_through_fixture() {
    let network = NetworkFixture::from_toml(FIXTURE).unwrap().build();
    let mounted = Mounted::start(network);
    mounted.scan_until(|v| v.recall("smb://NAS/media").is_some());

    let volume = &mounted.volume;
    let home = volume.lookup(NETWORK_NODE_ID, "HOME").unwrap();
    let nas = volume.lookup(home, "NAS").unwrap();
    let media = volume.lookup(nas, "media").unwrap();
    assert_eq!(listing(volume, NETWORK_NODE_ID), vec!["HOME"]);
    assert_eq!(listing(volume, media), vec!["music", "notes.txt"]);

    let music = volume.lookup(media, "music").unwrap();
    let song = volume.lookup(music, "song.txt").unwrap();
    let mut cookie = volume
        .open(song, smbnet_core::OpenFlags::READ_ONLY)
        .unwrap();
    assert_eq!(volume.read(song, &mut cookie, 3, 100).unwrap(), b"la la");
    volume.close(song, &mut cookie).unwrap();

    mounted.stop();
}

#[test]
fn test_fixture_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("network.toml");
    std::fs::write(&path, FIXTURE).unwrap();

    let network = NetworkFixture::load(&path).unwrap().build();
    assert!(network.exists("smb://NAS/media/music"));
    assert_eq!(
        network.file_contents("smb://NAS/media/notes.txt").unwrap(),
        b"remember"
    );

    std::fs::write(&path, "[[workgroup]]\nname = 3\n").unwrap();
    assert!(NetworkFixture::load(&path).is_err());
    assert!(NetworkFixture::load(&dir.path().join("missing.toml")).is_err());
}

#[test]
fn test_rescan_reports_changes_to_host() {
    let network = MemoryNetwork::new();
    network.add_server("WORKGROUP-A", "SERVER-1", "");
    let mounted = Mounted::start(network.clone());
    mounted.scan_until(|v| v.recall("smb://SERVER-1").is_some());

    mounted.notifier.take();
    network.add_server("WORKGROUP-A", "SERVER-2", "");
    network.add_workgroup("WORKGROUP-B", "");
    mounted.scan_until(|v| v.recall("smb://WORKGROUP-B").is_some());

    let wg_a = mounted.volume.recall("smb://WORKGROUP-A").unwrap();
    let created: Vec<(u64, String)> = mounted
        .notifier
        .take()
        .into_iter()
        .filter_map(|e| match e {
            HostEvent::EntryCreated { dir, name, .. } => Some((dir, name)),
            HostEvent::EntryRemoved { name, .. } => panic!("unexpected removal of {}", name),
            _ => None,
        })
        .collect();
    assert_eq!(
        created,
        vec![
            (wg_a, "SERVER-2".to_string()),
            (NETWORK_NODE_ID, "WORKGROUP-B".to_string()),
        ]
    );

    network.remove_server("SERVER-1");
    mounted.scan_until(|v| v.recall("smb://SERVER-1").is_none());
    assert_eq!(mounted.volume.lookup(wg_a, "SERVER-1"), Err(FsError::NotFound));

    mounted.stop();
}

#[test]
fn test_status_round_trip() {
    let network = MemoryNetwork::new();
    network.add_server("WG", "NAS", "");
    let mounted = Mounted::start(network);
    mounted.scan_until(|v| v.recall("smb://NAS").is_some());

    mounted.volume.request_status().unwrap();
    wait_for(|| mounted.volume.last_status().is_some());
    let StatusReport {
        scans_completed,
        known_resources,
        ..
    } = mounted.volume.last_status().unwrap();
    assert!(scans_completed >= 1);
    assert_eq!(known_resources, 2);

    mounted.stop();
}

#[test]
fn test_scanner_events_for_added_resources() {
    let network = MemoryNetwork::new();
    network.add_server("WORKGROUP-A", "SERVER-1", "");
    let remote = Arc::new(RemoteLock::new(network.clone()));
    let (tx, rx) = event_channel();
    let scanner = Scanner::new(remote, tx, Duration::ZERO);
    scanner.request_scan().unwrap();
    while rx.try_recv().unwrap().is_some() {}

    network.add_server("WORKGROUP-A", "SERVER-2", "");
    network.add_workgroup("WORKGROUP-B", "");
    scanner.request_scan().unwrap();

    let mut events = Vec::new();
    while let Some(event) = rx.try_recv().unwrap() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            ScannerEvent::ResourceFound(ResourceFound {
                kind: NodeKind::Server,
                dir_url: "smb://WORKGROUP-A".into(),
                name: "SERVER-2".into(),
                comment: String::new(),
            }),
            ScannerEvent::ResourceFound(ResourceFound {
                kind: NodeKind::Workgroup,
                dir_url: "smb://".into(),
                name: "WORKGROUP-B".into(),
                comment: String::new(),
            }),
            ScannerEvent::ScanFinished,
        ]
    );
}
