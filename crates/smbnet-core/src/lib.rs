//! SMB Network Core - Shared types, notification protocol, and configuration
//!
//! This crate contains the foundational types used by the scanner, the
//! node registry and the filesystem adapter. It has no dependencies on the
//! remote client or on filesystem code.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
pub mod url;

pub use config::{Config, ConfigError, MountConfig, RemoteConfig, ScanConfig};
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Maximum URL length in bytes
pub const MAX_URL_LEN: usize = 4096;

/// Maximum entry name length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Maximum notification frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Reported block size
pub const BLOCK_SIZE: u32 = 4096;

/// Preferred I/O size (128 KB)
pub const IO_SIZE: u32 = 128 * 1024;

/// Nominal volume capacity reported to the host (100 GB)
pub const NOMINAL_CAPACITY: u64 = 100 * 1024 * 1024 * 1024;

/// Default TTL for attributes and entries in seconds
pub const DEFAULT_ATTR_TTL_SECS: u64 = 1;
