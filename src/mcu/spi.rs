//! The 26-byte SPI frame to the analog I/O board and its CRC16 (spec.md
//! §4.4 step 3, §6.3, §9).
//!
//! Built over `embedded_hal::spi::SpiBus<u8>` rather than a concrete chip
//! driver so the framing and CRC logic is host-testable without real
//! hardware, the same boundary `us-irs-vorago-shared-hal` draws around its
//! peripherals.

use embedded_hal::spi::SpiBus;

use crate::config::{N_ADC, SPI_FRAME_LEN};
use crate::error::SpiError;

const MAGIC: [u8; 2] = [0x55, 0xAA];
const ADC_DATA_LEN: usize = N_ADC * 4;

/// CRC-16, polynomial 0x8005, initial value 0, input bits processed
/// LSB-first, output bits reversed (spec.md §4.4 "CRC").
pub fn crc16(data: &[u8]) -> u16 {
    let mut out: u16 = 0;
    for &byte in data {
        for bit in 0..8 {
            let carry = (out >> 15) & 1;
            out <<= 1;
            out |= ((byte >> bit) & 1) as u16;
            if carry != 0 {
                out ^= 0x8005;
            }
        }
    }
    for _ in 0..16 {
        let carry = (out >> 15) & 1;
        out <<= 1;
        if carry != 0 {
            out ^= 0x8005;
        }
    }
    out.reverse_bits()
}

/// Result of one completed SPI transfer: the `N_ADC` sampled values plus
/// whether the incoming CRC checked out. A CRC mismatch does not discard
/// the values — the caller still applies them to last/min/max and only
/// skips the running accumulator (spec.md §4.4 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampledFrame {
    pub values: [i32; N_ADC],
    pub crc_ok: bool,
}

fn build_outgoing(dac: i32) -> [u8; SPI_FRAME_LEN] {
    let mut tx = [0u8; SPI_FRAME_LEN];
    tx[0] = MAGIC[0];
    tx[1] = MAGIC[1];
    let dac_bytes = (dac as i16).to_le_bytes();
    tx[2] = dac_bytes[0];
    tx[3] = dac_bytes[1];
    let crc = crc16(&tx[..4]).to_le_bytes();
    tx[4] = crc[0];
    tx[5] = crc[1];
    tx
}

fn parse_incoming(rx: &[u8; SPI_FRAME_LEN]) -> SampledFrame {
    let mut values = [0i32; N_ADC];
    for (i, value) in values.iter_mut().enumerate() {
        let start = i * 4;
        *value = i32::from_le_bytes(rx[start..start + 4].try_into().unwrap());
    }
    let calc = crc16(&rx[..ADC_DATA_LEN]);
    let recv = u16::from_le_bytes([rx[ADC_DATA_LEN], rx[ADC_DATA_LEN + 1]]);
    SampledFrame { values, crc_ok: calc == recv }
}

/// Issue one full-duplex 26-byte transfer: write `dac` as the outgoing
/// setpoint, read back `N_ADC` values plus their CRC (spec.md §4.4 step 3,
/// §6.3).
pub fn transfer<B: SpiBus<u8>>(bus: &mut B, dac: i32) -> Result<SampledFrame, SpiError> {
    let mut buf = build_outgoing(dac);
    bus.transfer_in_place(&mut buf).map_err(|_| SpiError::Bus("spi transfer failed".into()))?;
    Ok(parse_incoming(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_of_empty_is_zero() {
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn outgoing_frame_has_magic_and_self_consistent_crc() {
        let frame = build_outgoing(0x1234);
        assert_eq!(&frame[..2], &MAGIC);
        let crc = crc16(&frame[..4]);
        assert_eq!(frame[4..6], crc.to_le_bytes());
        assert!(frame[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn well_formed_incoming_frame_reports_crc_ok() {
        let values = [1, -2, 3, -4, 5, -6];
        let mut rx = [0u8; SPI_FRAME_LEN];
        for (i, v) in values.iter().enumerate() {
            rx[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        let crc = crc16(&rx[..ADC_DATA_LEN]).to_le_bytes();
        rx[ADC_DATA_LEN] = crc[0];
        rx[ADC_DATA_LEN + 1] = crc[1];

        let frame = parse_incoming(&rx);
        assert!(frame.crc_ok);
        assert_eq!(frame.values, values);
    }

    #[test]
    fn corrupted_incoming_frame_reports_crc_mismatch_but_still_parses() {
        let mut rx = [0u8; SPI_FRAME_LEN];
        rx[0..4].copy_from_slice(&42i32.to_le_bytes());
        rx[ADC_DATA_LEN] = 0xFF;
        rx[ADC_DATA_LEN + 1] = 0xFF;

        let frame = parse_incoming(&rx);
        assert!(!frame.crc_ok);
        assert_eq!(frame.values[0], 42);
    }

    struct LoopbackBus;

    impl embedded_hal::spi::ErrorType for LoopbackBus {
        type Error = std::convert::Infallible;
    }

    impl SpiBus<u8> for LoopbackBus {
        fn read(&mut self, _words: &mut [u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn write(&mut self, _words: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn transfer(&mut self, _read: &mut [u8], _write: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
            // Echo the outgoing magic/dac/crc back as if ADC channel 0
            // equalled the dac setpoint and the rest read zero.
            let dac_lo = words[2];
            let dac_hi = words[3];
            for w in words.iter_mut() {
                *w = 0;
            }
            words[0] = dac_lo;
            words[1] = dac_hi;
            let crc = crc16(&words[..ADC_DATA_LEN]).to_le_bytes();
            words[ADC_DATA_LEN] = crc[0];
            words[ADC_DATA_LEN + 1] = crc[1];
            Ok(())
        }
        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[test]
    fn transfer_round_trips_through_a_bus() {
        let mut bus = LoopbackBus;
        let frame = transfer(&mut bus, 300).unwrap();
        assert!(frame.crc_ok);
        assert_eq!(frame.values[0], 300);
    }
}
