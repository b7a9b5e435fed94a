//! SMB network daemon - discovery scanner, node registry and FUSE adapter
//!
//! This crate provides:
//! - A scanner that walks workgroups, servers and shares and publishes the
//!   differences between consecutive scans
//! - A volume that turns those events into a browsable namespace and
//!   forwards share access to a remote file-sharing client
//! - A FUSE adapter exposing the volume on Unix
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │              Filesystem Thread (FUSE callbacks)              │
//! │  lookup / readdir / read / write -> Volume -> node dispatch  │
//! └──────────────┬──────────────────────────────▲────────────────┘
//!                │ scan-requested               │ resource-found / -lost
//!                │ (bounded, lossy)             │ scan-finished
//!                ▼                              │ (unbounded, ordered)
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Scanner Thread                            │
//! │  walk network -> sort -> diff against last tree -> publish   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both sides reach the network through one `RemoteLock`; the volume takes
//! it before its registry lock, never after.

pub mod channel;
pub mod discovery_tree;
pub mod memory_remote;
mod node;
pub mod notify;
pub mod reconcile;
pub mod registry;
pub mod remote;
pub mod scanner;
pub mod scheduler;
pub mod volume;

// FUSE adapter (Unix-only)
#[cfg(unix)]
pub mod fuse;

pub use channel::{event_channel, request_channel, FrameReceiver, FrameSender};
pub use discovery_tree::{scan_network, TreeNode};
pub use memory_remote::{FixtureError, MemoryNetwork, NetworkFixture};
pub use node::{DirCookie, FileCookie};
pub use notify::{HostEvent, HostNotifier, RecordingNotifier, TracingNotifier};
pub use reconcile::reconcile;
pub use registry::{Node, NodeRegistry};
pub use remote::{RemoteDirEntry, RemoteEntryKind, RemoteLock, RemoteShareClient, RemoteStat};
pub use scanner::{ScanOutcome, Scanner};
pub use scheduler::ScanScheduler;
pub use volume::{Volume, VolumeOptions};

#[cfg(unix)]
pub use fuse::SmbNetworkFs;
