//! Error taxonomy at each component boundary (spec.md §7).
//!
//! Retries live at call sites, never inside the codec or the channel.
//! `TimedOut` is routine and silent; `Parse` errors are logged and counted
//! by the caller, never retried transparently.

use thiserror::Error;

/// Errors from `proto::codec::{store, load_app, load_mcu}`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// `store` was asked to write more bytes than the destination buffer holds.
    #[error("short buffer: need {needed} bytes, have {available}")]
    ShortBuffer { needed: usize, available: usize },

    /// The buffer does not yet contain a complete message. Not an error in
    /// the usual sense: callers must leave the stream position unchanged
    /// and wait for more bytes (spec.md §4.1).
    #[error("incomplete message")]
    NeedMoreData,

    /// Malformed or unrecognized message. The caller must treat the stream
    /// as poisoned and drain it (spec.md §4.1).
    #[error("parse error: {0}")]
    Parse(String),
}

/// Errors from the `Transport` contract (spec.md §6.2, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Deadline expired before the operation completed.
    #[error("timed out")]
    TimedOut,

    /// Any other I/O failure. Unrecoverable in the current design — an MCU
    /// reset implies re-bootstrapping the whole pairing (spec.md §4.3).
    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors from `channel::MessageChannel::{send, receive}` (spec.md §4.2, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Deadline expired; caller may retry.
    #[error("timed out")]
    TimedOut,

    /// Caller tried to send a message longer than the channel's maximum.
    #[error("message of {size} bytes exceeds channel maximum of {max}")]
    OutOfBounds { size: usize, max: usize },

    /// Malformed message; the channel is now poisoned and the ring has
    /// been drained.
    #[error("parse error: {0}")]
    Parse(String),

    /// Any non-timeout transport I/O failure. Unrecoverable: the app-side
    /// core abandons operation and surfaces this to the embedder.
    #[error("fatal transport failure: {0}")]
    Fatal(#[from] TransportError),
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::ShortBuffer { needed, available } => {
                ChannelError::OutOfBounds { size: needed, max: available }
            }
            // Callers must never route NeedMoreData through this path; the
            // channel's receive loop handles it explicitly before falling
            // back to this conversion for genuine errors.
            CodecError::NeedMoreData => ChannelError::Parse("unexpected NeedMoreData".into()),
            CodecError::Parse(msg) => ChannelError::Parse(msg),
        }
    }
}

/// Errors from the MCU-side SPI transfer (spec.md §4.4, §6.3, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpiError {
    /// CRC mismatch on the incoming frame. Non-fatal: the sample is still
    /// applied to last/min/max stats; only the accumulator skips it
    /// (spec.md §4.4 step 4, §9).
    #[error("CRC mismatch on SPI frame")]
    Crc,

    /// The underlying bus or pin returned an error.
    #[error("SPI/GPIO bus error: {0}")]
    Bus(String),
}
