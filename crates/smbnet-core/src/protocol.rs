//! Notification channel messages
//!
//! The volume and the discovery scanner talk over a pair of ordered
//! channels. Messages are serialized with bincode and prefixed with a
//! 4-byte little-endian length.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::NodeKind;
use crate::MAX_FRAME_SIZE;

/// Messages sent to the discovery scanner
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerRequest {
    /// Rescan the network if the scanner's own interval allows it
    ScanRequested,
    /// Ask for a `StatusReport`
    Status,
    /// Stop the scanner thread
    Quit,
}

/// Messages sent by the discovery scanner
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerEvent {
    /// A scan cycle finished and all its resource events were sent
    ScanFinished,
    ResourceFound(ResourceFound),
    ResourceLost(ResourceLost),
    Status(StatusReport),
}

/// A resource appeared in directory `dir_url`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFound {
    pub kind: NodeKind,
    pub dir_url: String,
    pub name: String,
    pub comment: String,
}

/// A resource disappeared from directory `dir_url`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLost {
    pub dir_url: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub scans_completed: u64,
    pub known_resources: usize,
    /// Seconds since the last completed scan, if any
    pub last_scan_age_secs: Option<u64>,
}

// === Serialization ===

/// Serialize a message with length prefix
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = bincode::serialize(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u32;

    let mut result = Vec::with_capacity(4 + payload.len());
    result.extend_from_slice(&len.to_le_bytes());
    result.extend_from_slice(&payload);

    Ok(result)
}

/// Deserialize one length-prefixed message, returning it and the bytes consumed
pub fn decode_frame<T: DeserializeOwned>(data: &[u8]) -> Result<(T, usize), ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::Truncated {
            needed: 4,
            available: data.len(),
        });
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let end = 4 + len;
    if data.len() < end {
        return Err(ProtocolError::Truncated {
            needed: end,
            available: data.len(),
        });
    }
    let msg = bincode::deserialize(&data[4..end])?;
    Ok((msg, end))
}
