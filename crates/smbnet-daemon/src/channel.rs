//! Notification channel transport
//!
//! ```text
//! Volume (host threads)                Scanner thread
//! ─────────────────────                ──────────────
//!     │   ScannerRequest frames             │
//!     ├────────────────────────────────────►│
//!     │   (crossbeam bounded, try_send)     │
//!     │                                     │
//!     │◄────────────────────────────────────┤
//!     │   ScannerEvent frames               │
//!     │   (crossbeam unbounded, ordered)    │
//! ```
//!
//! Messages cross the channel as length-prefixed bincode frames, the same
//! bytes a port between separate processes would carry. Requests are
//! dropped when the queue is full since scans coalesce anyway; events are
//! never dropped.

use std::marker::PhantomData;
use std::time::Duration;

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{trace, warn};

use smbnet_core::{decode_frame, encode_frame, ProtocolError, ScannerEvent, ScannerRequest};

/// Pending scanner requests before new ones are dropped
pub const REQUEST_QUEUE_DEPTH: usize = 16;

/// Sending half of a typed frame channel
pub struct FrameSender<T> {
    tx: Sender<Vec<u8>>,
    lossy: bool,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for FrameSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            lossy: self.lossy,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + std::fmt::Debug> FrameSender<T> {
    pub fn send(&self, msg: &T) -> Result<(), ProtocolError> {
        let frame = encode_frame(msg)?;
        trace!("send frame {:?} ({} bytes)", msg, frame.len());

        if !self.lossy {
            return self.tx.send(frame).map_err(|_| ProtocolError::Disconnected);
        }

        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("channel full, dropping {:?}", msg);
                Err(ProtocolError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(ProtocolError::Disconnected),
        }
    }
}

/// Receiving half of a typed frame channel
pub struct FrameReceiver<T> {
    rx: Receiver<Vec<u8>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> FrameReceiver<T> {
    /// Block until the next message
    pub fn recv(&self) -> Result<T, ProtocolError> {
        let frame = self.rx.recv().map_err(|_| ProtocolError::Disconnected)?;
        Self::decode(&frame)
    }

    /// Next message if one is waiting
    pub fn try_recv(&self) -> Result<Option<T>, ProtocolError> {
        match self.rx.try_recv() {
            Ok(frame) => Self::decode(&frame).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ProtocolError::Disconnected),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, ProtocolError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Self::decode(&frame).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ProtocolError::Disconnected),
        }
    }

    fn decode(frame: &[u8]) -> Result<T, ProtocolError> {
        let (msg, used) = decode_frame(frame)?;
        if used != frame.len() {
            return Err(ProtocolError::Deserialization(format!(
                "{} trailing bytes after frame",
                frame.len() - used
            )));
        }
        Ok(msg)
    }
}

/// Volume -> scanner requests
pub fn request_channel() -> (FrameSender<ScannerRequest>, FrameReceiver<ScannerRequest>) {
    let (tx, rx) = bounded(REQUEST_QUEUE_DEPTH);
    (
        FrameSender {
            tx,
            lossy: true,
            _marker: PhantomData,
        },
        FrameReceiver {
            rx,
            _marker: PhantomData,
        },
    )
}

/// Scanner -> volume events
pub fn event_channel() -> (FrameSender<ScannerEvent>, FrameReceiver<ScannerEvent>) {
    let (tx, rx) = unbounded();
    (
        FrameSender {
            tx,
            lossy: false,
            _marker: PhantomData,
        },
        FrameReceiver {
            rx,
            _marker: PhantomData,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use smbnet_core::{NodeKind, ResourceFound};

    #[test]
    fn test_events_arrive_in_order() {
        let (tx, rx) = event_channel();
        for name in ["A", "B", "C"] {
            tx.send(&ScannerEvent::ResourceFound(ResourceFound {
                kind: NodeKind::Workgroup,
                dir_url: "smb://".into(),
                name: name.into(),
                comment: String::new(),
            }))
            .unwrap();
        }
        tx.send(&ScannerEvent::ScanFinished).unwrap();

        let mut names = Vec::new();
        while let Some(event) = rx.try_recv().unwrap() {
            match event {
                ScannerEvent::ResourceFound(f) => names.push(f.name),
                ScannerEvent::ScanFinished => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_full_request_queue_drops() {
        let (tx, rx) = request_channel();
        for _ in 0..REQUEST_QUEUE_DEPTH {
            tx.send(&ScannerRequest::ScanRequested).unwrap();
        }
        assert_eq!(tx.send(&ScannerRequest::ScanRequested), Err(ProtocolError::Full));
        assert_eq!(rx.recv().unwrap(), ScannerRequest::ScanRequested);
    }

    #[test]
    fn test_disconnected() {
        let (tx, rx) = request_channel();
        drop(rx);
        assert_eq!(tx.send(&ScannerRequest::Quit), Err(ProtocolError::Disconnected));

        let (tx, rx) = event_channel();
        drop(tx);
        assert_eq!(rx.try_recv(), Err(ProtocolError::Disconnected));
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(1)),
            Err(ProtocolError::Disconnected)
        );
    }
}
