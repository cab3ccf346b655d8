//! The narrow raw-byte transport contract (spec.md §6.2) and one
//! in-process implementation standing in for the real shared-memory
//! mailbox, which is an external collaborator out of this crate's scope
//! (spec.md §1).
//!
//! A `Transport` delivers opaque byte buffers: ordered, reliable, and
//! message-buffer-granular from the caller's point of view (one transport
//! buffer in, one transport buffer out — the framing lives one layer up,
//! in `channel::MessageChannel`).

use std::sync::mpsc::{Receiver, RecvTimeoutError, SendError, Sender, TryRecvError};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::TransportError;

/// How long a `Transport` call should block before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block indefinitely.
    Forever,
    /// Block for at most the given duration.
    After(Duration),
}

impl Timeout {
    /// Remaining time until `deadline`, clipped to zero (spec.md §4.2's
    /// "deadline computation uses a monotonic clock" contract).
    pub fn remaining(deadline: Option<Instant>) -> Duration {
        match deadline {
            None => Duration::MAX,
            Some(d) => d.saturating_duration_since(Instant::now()),
        }
    }

    /// Compute an absolute deadline from `Instant::now()`, or `None` for
    /// `Forever`.
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Forever => None,
            Timeout::After(d) => Some(Instant::now() + d),
        }
    }
}

/// The transport surface the messaging core depends on: send at most N
/// bytes with a timeout, receive at most N bytes with a timeout, and
/// report the maximum single-buffer size.
pub trait Transport {
    /// Send exactly `bytes` as a single transport buffer.
    fn send(&self, bytes: &[u8], timeout: Timeout) -> Result<(), TransportError>;

    /// Receive the next transport buffer into `buf`, returning the number
    /// of bytes written. May return fewer bytes than `buf.len()`; callers
    /// must reframe (spec.md §6.2).
    fn receive(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize, TransportError>;

    /// The largest single buffer this transport will carry.
    fn max_buffer_size(&self) -> usize;
}

/// An in-process stand-in for the shared-memory mailbox: two bounded
/// `mpsc` queues, one per direction, each message a single `Vec<u8>`
/// buffer. Ordered and reliable, matching the real transport's contract,
/// without claiming to model actual shared-memory semantics.
pub struct LoopbackTransport {
    max_buffer_size: usize,
    outgoing: Sender<Vec<u8>>,
    incoming: Mutex<Receiver<Vec<u8>>>,
}

impl LoopbackTransport {
    /// Build one connected pair: `(app_side, mcu_side)`. Bytes sent on one
    /// end arrive, in order, as buffers on the other.
    pub fn pair(max_buffer_size: usize) -> (LoopbackTransport, LoopbackTransport) {
        let (app_tx, app_rx) = std::sync::mpsc::channel();
        let (mcu_tx, mcu_rx) = std::sync::mpsc::channel();
        let app_side = LoopbackTransport {
            max_buffer_size,
            outgoing: app_tx,
            incoming: Mutex::new(mcu_rx),
        };
        let mcu_side = LoopbackTransport {
            max_buffer_size,
            outgoing: mcu_tx,
            incoming: Mutex::new(app_rx),
        };
        (app_side, mcu_side)
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, bytes: &[u8], _timeout: Timeout) -> Result<(), TransportError> {
        if bytes.len() > self.max_buffer_size {
            return Err(TransportError::Io(format!(
                "buffer of {} bytes exceeds max_buffer_size {}",
                bytes.len(),
                self.max_buffer_size
            )));
        }
        self.outgoing
            .send(bytes.to_vec())
            .map_err(|SendError(_)| TransportError::Io("peer disconnected".into()))
    }

    fn receive(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize, TransportError> {
        let rx = self.incoming.lock().expect("loopback transport mutex poisoned");
        let buffer = match timeout {
            Timeout::Forever => rx.recv().map_err(|_| TransportError::Io("peer disconnected".into())),
            Timeout::After(d) => match rx.recv_timeout(d) {
                Ok(buffer) => Ok(buffer),
                Err(RecvTimeoutError::Timeout) => Err(TransportError::TimedOut),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(TransportError::Io("peer disconnected".into()))
                }
            },
        }?;
        let n = buffer.len().min(buf.len());
        buf[..n].copy_from_slice(&buffer[..n]);
        Ok(n)
    }

    fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }
}

/// Drain any buffer currently queued without blocking. Used by tests to
/// assert "nothing else was sent" after an expected exchange.
pub fn try_drain(rx: &Receiver<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(v) => out.push(v),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    out
}
