//! Discovery scanner
//!
//! Owns the last scanned tree and runs scan cycles: walk the network,
//! diff against the previous tree, publish the differences followed by
//! `ScanFinished`. The previous tree stays authoritative until a cycle has
//! published everything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use smbnet_core::{ProtocolError, ScannerEvent, ScannerRequest, StatusReport};

use crate::channel::{FrameReceiver, FrameSender};
use crate::discovery_tree::{scan_network, TreeNode};
use crate::reconcile::reconcile;
use crate::remote::RemoteLock;
use crate::scheduler::ScanScheduler;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Rate limited or another scan in flight
    Skipped,
    Completed { added: usize, removed: usize },
}

pub struct Scanner {
    remote: Arc<RemoteLock>,
    events: FrameSender<ScannerEvent>,
    scheduler: Mutex<ScanScheduler>,
    last_tree: Mutex<TreeNode>,
    scans_completed: AtomicU64,
}

impl Scanner {
    pub fn new(
        remote: Arc<RemoteLock>,
        events: FrameSender<ScannerEvent>,
        min_interval: Duration,
    ) -> Self {
        Self {
            remote,
            events,
            scheduler: Mutex::new(ScanScheduler::new(min_interval)),
            last_tree: Mutex::new(TreeNode::network()),
            scans_completed: AtomicU64::new(0),
        }
    }

    /// Run one scan cycle unless rate limited
    pub fn request_scan(&self) -> Result<ScanOutcome, ProtocolError> {
        if !self.scheduler.lock().begin(Instant::now()) {
            debug!("scan request ignored: rate limited or in flight");
            return Ok(ScanOutcome::Skipped);
        }

        info!("scanning network");
        let tree = scan_network(&self.remote);

        let mut last = self.last_tree.lock();
        let events = reconcile(&last, &tree);
        let (mut added, mut removed) = (0, 0);
        for event in events.iter().chain(std::iter::once(&ScannerEvent::ScanFinished)) {
            match event {
                ScannerEvent::ResourceFound(_) => added += 1,
                ScannerEvent::ResourceLost(_) => removed += 1,
                _ => {}
            }
            if let Err(e) = self.events.send(event) {
                self.scheduler.lock().abandon();
                return Err(e);
            }
        }
        *last = tree;
        drop(last);

        self.scheduler.lock().complete(Instant::now());
        self.scans_completed.fetch_add(1, Ordering::Relaxed);
        info!("scan finished: {} added, {} removed", added, removed);
        Ok(ScanOutcome::Completed { added, removed })
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            scans_completed: self.scans_completed.load(Ordering::Relaxed),
            known_resources: self.last_tree.lock().descendant_count(),
            last_scan_age_secs: self
                .scheduler
                .lock()
                .last_scan()
                .map(|t| t.elapsed().as_secs()),
        }
    }

    /// Serve requests until `Quit` or until the volume hangs up
    pub fn run(self, requests: FrameReceiver<ScannerRequest>) {
        info!("scanner started");
        loop {
            match requests.recv() {
                Ok(ScannerRequest::ScanRequested) => match self.request_scan() {
                    Ok(_) => {}
                    Err(ProtocolError::Disconnected) => break,
                    Err(e) => warn!("scan cycle failed: {}", e),
                },
                Ok(ScannerRequest::Status) => {
                    if self.events.send(&ScannerEvent::Status(self.status())).is_err() {
                        break;
                    }
                }
                Ok(ScannerRequest::Quit) => break,
                Err(ProtocolError::Disconnected) => break,
                Err(e) => warn!("dropping malformed request: {}", e),
            }
        }
        info!("scanner stopped");
    }

    pub fn spawn(self, requests: FrameReceiver<ScannerRequest>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("smbnet-scanner".into())
            .spawn(move || self.run(requests))
    }
}
