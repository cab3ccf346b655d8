//! Message-granular framing over a raw `Transport` (spec.md §4.2).
//!
//! A `MessageChannel` owns two buffers: a send scratch buffer sized to
//! `max_message_length`, and a receive ring sized to `8 ×
//! max_message_length`. The ring holds a partial-plus-complete sequence of
//! encoded messages so that a transport delivery spanning several
//! messages — or a message split across several deliveries — can be
//! de-aggregated without an allocation per message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ChannelError, CodecError};
use crate::proto::codec::{self, Decoded};
use crate::proto::{AppMessage, McuMessage};
use crate::transport::{Timeout, Transport};

/// A growable-but-bounded byte ring, holding bytes `[head, head+len)` of a
/// backing `Vec` sized once at construction (spec.md §4.2's "ring buffer,
/// not a plain growable queue").
struct RingBuffer {
    data: Vec<u8>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity], head: 0, len: 0 }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn available_write(&self) -> usize {
        self.capacity() - self.len
    }

    /// Contiguous slice of currently buffered bytes, compacting first if
    /// the logical range wraps. Simpler than a true circular buffer and
    /// correct given messages are drained in full before more are read —
    /// the transport never delivers faster than the channel decodes here.
    fn make_contiguous(&mut self) {
        if self.head == 0 {
            return;
        }
        self.data.copy_within(self.head..self.head + self.len, 0);
        self.head = 0;
    }

    fn as_slice(&self) -> &[u8] {
        &self.data[self.head..self.head + self.len]
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.head += n;
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
    }

    /// Append up to `buf.len()` bytes, compacting if needed to make room.
    fn push_back(&mut self, buf: &[u8]) {
        if buf.len() > self.available_write() {
            self.make_contiguous();
        }
        debug_assert!(buf.len() <= self.available_write());
        let start = self.head + self.len;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        self.len += buf.len();
    }
}

/// Owns a `Transport` and converts its raw byte-buffer surface into
/// message-granular `send`/`receive` (spec.md §4.2).
pub struct MessageChannel<T: Transport> {
    transport: T,
    max_message_length: usize,
    send_scratch: Vec<u8>,
    recv_ring: RingBuffer,
}

impl<T: Transport> MessageChannel<T> {
    pub fn new(transport: T, max_message_length: usize) -> Self {
        Self {
            transport,
            max_message_length,
            send_scratch: vec![0u8; max_message_length],
            recv_ring: RingBuffer::new(max_message_length * crate::config::RING_BUFFER_MULTIPLE),
        }
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    /// Encode and send one app→mcu message. At-most-once: a timeout or I/O
    /// error mid-write leaves the channel usable but the message is
    /// considered not delivered (spec.md §4.2 "Send contract").
    pub fn send_app(&mut self, msg: &AppMessage, timeout: Timeout) -> Result<(), ChannelError> {
        send(&self.transport, &mut self.send_scratch, self.max_message_length, timeout, |dst| {
            codec::store_app(msg, dst)
        }, codec::packed_size_app(msg))
    }

    /// Encode and send one mcu→app message. Mirror of `send_app`.
    pub fn send_mcu(&mut self, msg: &McuMessage, timeout: Timeout) -> Result<(), ChannelError> {
        send(&self.transport, &mut self.send_scratch, self.max_message_length, timeout, |dst| {
            codec::store_mcu(msg, dst)
        }, codec::packed_size_mcu(msg))
    }

    /// Receive one mcu→app message, de-aggregating from the ring if a
    /// complete message is already buffered before touching the transport
    /// again (spec.md §4.2 "Receive contract").
    pub fn receive_mcu(&mut self, timeout: Timeout) -> Result<McuMessage, ChannelError> {
        receive(&self.transport, self.max_message_length, &mut self.recv_ring, timeout, codec::load_mcu)
    }

    /// Receive one app→mcu message. Mirror of `receive_mcu`, used by the
    /// MCU-side of the crate.
    pub fn receive_app(&mut self, timeout: Timeout) -> Result<AppMessage, ChannelError> {
        receive(&self.transport, self.max_message_length, &mut self.recv_ring, timeout, codec::load_app)
    }

    /// Split into independent send/receive halves sharing the same
    /// transport, so `send_loop` and `recv_loop` can each own a disjoint
    /// half without contending on a shared mutex (spec.md §4.3 "Threads",
    /// §5 "`channel`: exclusively owned by the device; `send_loop` and
    /// `recv_loop` use disjoint halves of it").
    pub fn split(self) -> (SendHalf<T>, RecvHalf<T>) {
        let transport = Arc::new(self.transport);
        (
            SendHalf {
                transport: transport.clone(),
                max_message_length: self.max_message_length,
                send_scratch: self.send_scratch,
            },
            RecvHalf {
                transport,
                max_message_length: self.max_message_length,
                recv_ring: self.recv_ring,
            },
        )
    }
}

/// The send-only half of a split `MessageChannel`.
pub struct SendHalf<T: Transport> {
    transport: Arc<T>,
    max_message_length: usize,
    send_scratch: Vec<u8>,
}

impl<T: Transport> SendHalf<T> {
    pub fn send_app(&mut self, msg: &AppMessage, timeout: Timeout) -> Result<(), ChannelError> {
        send(&*self.transport, &mut self.send_scratch, self.max_message_length, timeout, |dst| {
            codec::store_app(msg, dst)
        }, codec::packed_size_app(msg))
    }

    pub fn send_mcu(&mut self, msg: &McuMessage, timeout: Timeout) -> Result<(), ChannelError> {
        send(&*self.transport, &mut self.send_scratch, self.max_message_length, timeout, |dst| {
            codec::store_mcu(msg, dst)
        }, codec::packed_size_mcu(msg))
    }
}

/// The receive-only half of a split `MessageChannel`.
pub struct RecvHalf<T: Transport> {
    transport: Arc<T>,
    max_message_length: usize,
    recv_ring: RingBuffer,
}

impl<T: Transport> RecvHalf<T> {
    pub fn receive_mcu(&mut self, timeout: Timeout) -> Result<McuMessage, ChannelError> {
        receive(&*self.transport, self.max_message_length, &mut self.recv_ring, timeout, codec::load_mcu)
    }

    pub fn receive_app(&mut self, timeout: Timeout) -> Result<AppMessage, ChannelError> {
        receive(&*self.transport, self.max_message_length, &mut self.recv_ring, timeout, codec::load_app)
    }
}

fn send<T: Transport>(
    transport: &T,
    scratch: &mut [u8],
    max_message_length: usize,
    timeout: Timeout,
    store: impl FnOnce(&mut [u8]) -> Result<usize, CodecError>,
    size: usize,
) -> Result<(), ChannelError> {
    if size > max_message_length {
        return Err(ChannelError::OutOfBounds { size, max: max_message_length });
    }
    let written = store(scratch).map_err(ChannelError::from)?;
    transport.send(&scratch[..written], timeout)?;
    Ok(())
}

fn receive<T: Transport, M>(
    transport: &T,
    max_message_length: usize,
    recv_ring: &mut RingBuffer,
    timeout: Timeout,
    decode: impl Fn(&[u8]) -> Result<Decoded<M>, CodecError>,
) -> Result<M, ChannelError> {
    let deadline = timeout.deadline();
    // A message already sitting in the ring from a prior aggregated
    // delivery is drained with one non-blocking transport poll before
    // falling back to the caller's real timeout (spec.md §4.2).
    let mut first_attempt = recv_ring.len > 0;

    loop {
        match decode(recv_ring.as_slice()) {
            Ok(Decoded { message, bytes_consumed }) => {
                recv_ring.consume(bytes_consumed);
                return Ok(message);
            }
            Err(CodecError::NeedMoreData) => {
                // fall through to read more bytes below
            }
            Err(CodecError::Parse(msg)) => {
                // The channel resyncs by draining the whole ring: the next
                // call starts decoding fresh from whatever the transport
                // delivers next (spec.md §4.2 "re-synchronization policy").
                recv_ring.consume(recv_ring.len);
                return Err(ChannelError::Parse(msg));
            }
            Err(CodecError::ShortBuffer { .. }) => unreachable!("load never returns ShortBuffer"),
        }

        let read_timeout = if first_attempt {
            Timeout::After(Duration::ZERO)
        } else {
            match deadline {
                None => Timeout::Forever,
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ChannelError::TimedOut);
                    }
                    Timeout::After(remaining)
                }
            }
        };
        first_attempt = false;

        let mut scratch = vec![0u8; max_message_length];
        match transport.receive(&mut scratch, read_timeout) {
            Ok(n) => recv_ring.push_back(&scratch[..n]),
            Err(crate::error::TransportError::TimedOut) => {
                // The initial non-blocking poll finding nothing is
                // routine; fall through to a real blocking wait next
                // iteration instead of giving up immediately.
                if read_timeout == Timeout::After(Duration::ZERO) {
                    continue;
                }
                return Err(ChannelError::TimedOut);
            }
            Err(e) => return Err(ChannelError::Fatal(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    #[test]
    fn frame_de_aggregation_across_chunks() {
        // spec.md §8 testable property 2: a concatenation of several
        // well-formed messages delivered across arbitrarily many transport
        // chunks decodes to exactly that sequence, in order.
        let (app_side, mcu_side) = LoopbackTransport::pair(512);
        let mut app_ch = MessageChannel::new(app_side, 512);

        let messages = vec![
            McuMessage::Debug { message: "hello world!".into() },
            McuMessage::AdcVal { values: [1, 2, 3, 4, 5, 6] },
            McuMessage::DacWfReq,
        ];

        // Encode all three into one raw buffer and deliver it as a single
        // transport chunk, exercising de-aggregation without per-message
        // transport hops.
        let mut raw = Vec::new();
        for m in &messages {
            let mut buf = vec![0u8; codec::packed_size_mcu(m)];
            let n = codec::store_mcu(m, &mut buf).unwrap();
            raw.extend_from_slice(&buf[..n]);
        }
        mcu_side.send(&raw, Timeout::Forever).unwrap();

        for expected in &messages {
            let got = app_ch.receive_mcu(Timeout::After(Duration::from_millis(100))).unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[test]
    fn oversized_send_rejected_without_touching_transport() {
        let (app_side, mcu_side) = LoopbackTransport::pair(8);
        let mut app_ch = MessageChannel::new(app_side, 8);
        let big = AppMessage::DacWf { elements: vec![0; 100] };
        let err = app_ch.send_app(&big, Timeout::Forever).unwrap_err();
        assert!(matches!(err, ChannelError::OutOfBounds { .. }));

        let mut buf = [0u8; 8];
        let res = mcu_side.receive(&mut buf, Timeout::After(Duration::from_millis(5)));
        assert!(res.is_err(), "nothing should have been sent");
    }

    #[test]
    fn receive_times_out_cleanly_with_no_data() {
        let (app_side, _mcu_side) = LoopbackTransport::pair(64);
        let mut app_ch = MessageChannel::new(app_side, 64);
        let err = app_ch.receive_mcu(Timeout::After(Duration::from_millis(5))).unwrap_err();
        assert_eq!(err, ChannelError::TimedOut);
    }

    #[test]
    fn parse_error_poisons_then_resyncs() {
        let (app_side, mcu_side) = LoopbackTransport::pair(64);
        let mut app_ch = MessageChannel::new(app_side, 64);

        // Unknown tag, followed by a well-formed message.
        mcu_side.send(&[0x7F], Timeout::Forever).unwrap();
        let err = app_ch.receive_mcu(Timeout::After(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, ChannelError::Parse(_)));

        mcu_side.send(&[0x10], Timeout::Forever).unwrap(); // DacWfReq
        let got = app_ch.receive_mcu(Timeout::After(Duration::from_millis(50))).unwrap();
        assert_eq!(got, McuMessage::DacWfReq);
    }

    #[test]
    fn send_then_receive_single_message() {
        let (app_side, mcu_side) = LoopbackTransport::pair(64);
        let mut app_ch = MessageChannel::new(app_side, 64);
        let mut mcu_ch = MessageChannel::new(mcu_side, 64);

        app_ch.send_app(&AppMessage::Start, Timeout::Forever).unwrap();
        let got = mcu_ch.receive_app(Timeout::After(Duration::from_millis(100))).unwrap();
        assert_eq!(got, AppMessage::Start);
    }

    #[test]
    fn split_halves_share_one_transport() {
        let (app_side, mcu_side) = LoopbackTransport::pair(64);
        let (mut send_half, mut recv_half) = MessageChannel::new(app_side, 64).split();
        let mcu_ch = MessageChannel::new(mcu_side, 64);

        send_half.send_app(&AppMessage::AdcReq, Timeout::Forever).unwrap();
        let (_unused_send, mut mcu_recv) = mcu_ch.split();
        let got = mcu_recv.receive_app(Timeout::After(Duration::from_millis(100))).unwrap();
        assert_eq!(got, AppMessage::AdcReq);

        // The recv half still works independently of the send half.
        drop(recv_half.receive_app(Timeout::After(Duration::from_millis(5))));
    }
}
