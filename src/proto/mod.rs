//! Inter-processor message taxonomy (spec.md §3.1, §6.1).
//!
//! Two disjoint alphabets flow over the same framed transport: messages
//! the app sends to the MCU (`AppMessage`) and messages the MCU sends to
//! the app (`McuMessage`). Every message is one byte-tag followed by a
//! type-specific payload; variable-length payloads carry an explicit
//! length so partial reads are bounded.
//!
//! String payloads (`Error.message`, `Debug.message`) are length-prefixed
//! UTF-8 with no NUL terminator — see SPEC_FULL.md §3 for why this
//! resolves the distilled spec's NUL-vs-length-prefix inconsistency.

pub mod codec;

use crate::config::N_ADC;

/// Wire tags for `AppMessage` variants (spec.md §6.1, app→mcu table).
pub mod app_tag {
    pub const NONE: u8 = 0x00;
    pub const START: u8 = 0x01;
    pub const STOP: u8 = 0x02;
    pub const DAC_SET: u8 = 0x10;
    pub const DAC_WF: u8 = 0x11;
    pub const DOUT_SET: u8 = 0x12;
    pub const ADC_REQ: u8 = 0x20;
}

/// Wire tags for `McuMessage` variants (spec.md §6.1, mcu→app table).
pub mod mcu_tag {
    pub const NONE: u8 = 0x00;
    pub const DAC_WF_REQ: u8 = 0x10;
    pub const ADC_VAL: u8 = 0x20;
    pub const DIN_VAL: u8 = 0x21;
    pub const ADC_WF: u8 = 0x22;
    pub const ERROR: u8 = 0xE0;
    pub const DEBUG: u8 = 0xE1;
}

/// A message sent from the application to the MCU.
#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    /// No-op placeholder tag. Never sent by the device proxy itself.
    None,
    /// Handshake opener; the MCU replies with `Debug("hello world!")`
    /// (spec.md §4.3 "Handshake", §8 "Boot handshake").
    Start,
    /// Stop all operation. Present in the wire table (spec.md §6.1) though
    /// absent from the §3.1 prose enumeration; the wire table governs tags.
    Stop,
    /// Set the DAC setpoint. 24-bit-signed-meaningful value zero-extended
    /// into an `i32` wire container (spec.md §3.1's "Integer width").
    DacSet { value: i32 },
    /// A chunk of the outgoing DAC waveform. An empty `elements` is legal
    /// and means "no waveform data this burst" (spec.md §4.1 edge case).
    DacWf { elements: Vec<i32> },
    /// Set the digital-output word. Only the low 4 bits are meaningful;
    /// masking happens before this message is built (spec.md §8 boundary).
    DoutSet { bits: u8 },
    /// Request the MCU's latest per-channel ADC accumulator read-out.
    AdcReq,
}

/// A message sent from the MCU to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum McuMessage {
    /// No-op placeholder tag.
    None,
    /// The MCU's outgoing DAC waveform ring has dropped below its
    /// low-water mark; the app should send one `DacWf` chunk in reply.
    DacWfReq,
    /// Latest per-channel ADC read-out, one value per channel (`N_ADC = 6`).
    AdcVal { values: [i32; N_ADC] },
    /// Latest digital-input word.
    DinVal { bits: u8 },
    /// A chunk of accumulated ADC waveform samples for one channel.
    AdcWf { index: u8, elements: Vec<i32> },
    /// An error report: a numeric code plus a human-readable message.
    Error { code: u8, message: String },
    /// A free-form debug string (used for the boot handshake reply).
    Debug { message: String },
}
