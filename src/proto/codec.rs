//! Pack/unpack `AppMessage`/`McuMessage` to and from the wire format
//! (spec.md §4.1).
//!
//! `store` writes exactly `packed_size` bytes or fails without touching
//! the destination beyond what it already wrote. `load` either returns a
//! decoded message plus the byte count consumed, or a distinguished
//! "need more data" condition that leaves interpretation of the stream
//! position to the caller (the channel never advances past a
//! `NeedMoreData` result).

use super::{app_tag, mcu_tag, AppMessage, McuMessage};
use crate::error::CodecError;

/// A successfully decoded message together with how many bytes it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<M> {
    pub message: M,
    pub bytes_consumed: usize,
}

const TAG_LEN: usize = 1;
const I32_LEN: usize = 4;
const U16_LEN: usize = 2;

fn write_string(dst: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    if s.len() > u8::MAX as usize {
        return Err(CodecError::Parse(format!(
            "string of {} bytes exceeds the 255-byte length prefix",
            s.len()
        )));
    }
    dst.push(s.len() as u8);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Read a length-prefixed UTF-8 string starting at `src[0]`. Returns the
/// string and the number of bytes consumed (1 + length).
fn read_string(src: &[u8]) -> Result<(String, usize), CodecError> {
    let len = *src.first().ok_or(CodecError::NeedMoreData)? as usize;
    let end = TAG_LEN.checked_add(len).ok_or(CodecError::Parse("string length overflow".into()))?;
    if src.len() < end {
        return Err(CodecError::NeedMoreData);
    }
    let body = &src[TAG_LEN..end];
    let s = std::str::from_utf8(body)
        .map_err(|_| CodecError::Parse("string payload is not valid UTF-8".into()))?
        .to_owned();
    Ok((s, end))
}

// ---------------------------------------------------------------------
// AppMessage
// ---------------------------------------------------------------------

/// Exact byte count a `store` of this message would emit.
pub fn packed_size_app(msg: &AppMessage) -> usize {
    TAG_LEN
        + match msg {
            AppMessage::None | AppMessage::Start | AppMessage::Stop | AppMessage::AdcReq => 0,
            AppMessage::DacSet { .. } => I32_LEN,
            AppMessage::DacWf { elements } => U16_LEN + elements.len() * I32_LEN,
            AppMessage::DoutSet { .. } => 1,
        }
}

/// Serialize `msg` into `dst`. Fails with `ShortBuffer` without writing
/// anything if `dst` is too small.
pub fn store_app(msg: &AppMessage, dst: &mut [u8]) -> Result<usize, CodecError> {
    let needed = packed_size_app(msg);
    if dst.len() < needed {
        return Err(CodecError::ShortBuffer { needed, available: dst.len() });
    }

    let (tag, body): (u8, Vec<u8>) = match msg {
        AppMessage::None => (app_tag::NONE, Vec::new()),
        AppMessage::Start => (app_tag::START, Vec::new()),
        AppMessage::Stop => (app_tag::STOP, Vec::new()),
        AppMessage::DacSet { value } => (app_tag::DAC_SET, value.to_le_bytes().to_vec()),
        AppMessage::DacWf { elements } => {
            let mut body = Vec::with_capacity(U16_LEN + elements.len() * I32_LEN);
            let len: u16 = elements.len().try_into().map_err(|_| {
                CodecError::Parse(format!("waveform of {} elements exceeds u16 length", elements.len()))
            })?;
            body.extend_from_slice(&len.to_le_bytes());
            for e in elements {
                body.extend_from_slice(&e.to_le_bytes());
            }
            (app_tag::DAC_WF, body)
        }
        AppMessage::DoutSet { bits } => (app_tag::DOUT_SET, vec![*bits]),
        AppMessage::AdcReq => (app_tag::ADC_REQ, Vec::new()),
    };

    dst[0] = tag;
    dst[TAG_LEN..TAG_LEN + body.len()].copy_from_slice(&body);
    Ok(TAG_LEN + body.len())
}

/// Decode one `AppMessage` from the front of `src`.
pub fn load_app(src: &[u8]) -> Result<Decoded<AppMessage>, CodecError> {
    let tag = *src.first().ok_or(CodecError::NeedMoreData)?;
    let rest = &src[TAG_LEN..];

    let (message, body_len) = match tag {
        app_tag::NONE => (AppMessage::None, 0),
        app_tag::START => (AppMessage::Start, 0),
        app_tag::STOP => (AppMessage::Stop, 0),
        app_tag::DAC_SET => {
            if rest.len() < I32_LEN {
                return Err(CodecError::NeedMoreData);
            }
            let value = i32::from_le_bytes(rest[..I32_LEN].try_into().unwrap());
            (AppMessage::DacSet { value }, I32_LEN)
        }
        app_tag::DAC_WF => {
            if rest.len() < U16_LEN {
                return Err(CodecError::NeedMoreData);
            }
            let len = u16::from_le_bytes(rest[..U16_LEN].try_into().unwrap()) as usize;
            let total = U16_LEN + len * I32_LEN;
            if rest.len() < total {
                return Err(CodecError::NeedMoreData);
            }
            let mut elements = Vec::with_capacity(len);
            for i in 0..len {
                let off = U16_LEN + i * I32_LEN;
                elements.push(i32::from_le_bytes(rest[off..off + I32_LEN].try_into().unwrap()));
            }
            (AppMessage::DacWf { elements }, total)
        }
        app_tag::DOUT_SET => {
            let bits = *rest.first().ok_or(CodecError::NeedMoreData)?;
            (AppMessage::DoutSet { bits }, 1)
        }
        app_tag::ADC_REQ => (AppMessage::AdcReq, 0),
        other => return Err(CodecError::Parse(format!("unknown app message tag 0x{other:02x}"))),
    };

    Ok(Decoded { message, bytes_consumed: TAG_LEN + body_len })
}

// ---------------------------------------------------------------------
// McuMessage
// ---------------------------------------------------------------------

/// Exact byte count a `store` of this message would emit.
pub fn packed_size_mcu(msg: &McuMessage) -> usize {
    TAG_LEN
        + match msg {
            McuMessage::None | McuMessage::DacWfReq => 0,
            McuMessage::AdcVal { values } => values.len() * I32_LEN,
            McuMessage::DinVal { .. } => 1,
            McuMessage::AdcWf { elements, .. } => 1 + U16_LEN + elements.len() * I32_LEN,
            McuMessage::Error { message, .. } => 1 + 1 + message.len(),
            McuMessage::Debug { message } => 1 + message.len(),
        }
}

/// Serialize `msg` into `dst`. Fails with `ShortBuffer` without writing
/// anything if `dst` is too small.
pub fn store_mcu(msg: &McuMessage, dst: &mut [u8]) -> Result<usize, CodecError> {
    let needed = packed_size_mcu(msg);
    if dst.len() < needed {
        return Err(CodecError::ShortBuffer { needed, available: dst.len() });
    }

    let (tag, body): (u8, Vec<u8>) = match msg {
        McuMessage::None => (mcu_tag::NONE, Vec::new()),
        McuMessage::DacWfReq => (mcu_tag::DAC_WF_REQ, Vec::new()),
        McuMessage::AdcVal { values } => {
            let mut body = Vec::with_capacity(values.len() * I32_LEN);
            for v in values {
                body.extend_from_slice(&v.to_le_bytes());
            }
            (mcu_tag::ADC_VAL, body)
        }
        McuMessage::DinVal { bits } => (mcu_tag::DIN_VAL, vec![*bits]),
        McuMessage::AdcWf { index, elements } => {
            let mut body = Vec::with_capacity(1 + U16_LEN + elements.len() * I32_LEN);
            let len: u16 = elements.len().try_into().map_err(|_| {
                CodecError::Parse(format!("waveform of {} elements exceeds u16 length", elements.len()))
            })?;
            body.push(*index);
            body.extend_from_slice(&len.to_le_bytes());
            for e in elements {
                body.extend_from_slice(&e.to_le_bytes());
            }
            (mcu_tag::ADC_WF, body)
        }
        McuMessage::Error { code, message } => {
            let mut body = Vec::with_capacity(1 + 1 + message.len());
            body.push(*code);
            write_string(&mut body, message)?;
            (mcu_tag::ERROR, body)
        }
        McuMessage::Debug { message } => {
            let mut body = Vec::with_capacity(1 + message.len());
            write_string(&mut body, message)?;
            (mcu_tag::DEBUG, body)
        }
    };

    dst[0] = tag;
    dst[TAG_LEN..TAG_LEN + body.len()].copy_from_slice(&body);
    Ok(TAG_LEN + body.len())
}

/// Decode one `McuMessage` from the front of `src`.
pub fn load_mcu(src: &[u8]) -> Result<Decoded<McuMessage>, CodecError> {
    let tag = *src.first().ok_or(CodecError::NeedMoreData)?;
    let rest = &src[TAG_LEN..];

    let (message, body_len) = match tag {
        mcu_tag::NONE => (McuMessage::None, 0),
        mcu_tag::DAC_WF_REQ => (McuMessage::DacWfReq, 0),
        mcu_tag::ADC_VAL => {
            let total = crate::config::N_ADC * I32_LEN;
            if rest.len() < total {
                return Err(CodecError::NeedMoreData);
            }
            let mut values = [0i32; crate::config::N_ADC];
            for (i, v) in values.iter_mut().enumerate() {
                let off = i * I32_LEN;
                *v = i32::from_le_bytes(rest[off..off + I32_LEN].try_into().unwrap());
            }
            (McuMessage::AdcVal { values }, total)
        }
        mcu_tag::DIN_VAL => {
            let bits = *rest.first().ok_or(CodecError::NeedMoreData)?;
            (McuMessage::DinVal { bits }, 1)
        }
        mcu_tag::ADC_WF => {
            if rest.len() < 1 + U16_LEN {
                return Err(CodecError::NeedMoreData);
            }
            let index = rest[0];
            let len = u16::from_le_bytes(rest[1..1 + U16_LEN].try_into().unwrap()) as usize;
            let total = 1 + U16_LEN + len * I32_LEN;
            if rest.len() < total {
                return Err(CodecError::NeedMoreData);
            }
            let mut elements = Vec::with_capacity(len);
            for i in 0..len {
                let off = 1 + U16_LEN + i * I32_LEN;
                elements.push(i32::from_le_bytes(rest[off..off + I32_LEN].try_into().unwrap()));
            }
            (McuMessage::AdcWf { index, elements }, total)
        }
        mcu_tag::ERROR => {
            let code = *rest.first().ok_or(CodecError::NeedMoreData)?;
            let (message, str_len) = read_string(&rest[1..])?;
            (McuMessage::Error { code, message }, 1 + str_len)
        }
        mcu_tag::DEBUG => {
            let (message, str_len) = read_string(rest)?;
            (McuMessage::Debug { message }, str_len)
        }
        other => return Err(CodecError::Parse(format!("unknown mcu message tag 0x{other:02x}"))),
    };

    Ok(Decoded { message, bytes_consumed: TAG_LEN + body_len })
}
