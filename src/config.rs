//! Tunable constants shared by the app and MCU sides.
//!
//! None of these are discovered at runtime from a config file — spec.md
//! §6.4 is explicit that supervisory-point names resolve by string prefix,
//! not configuration, and the same holds for the handful of numeric knobs
//! collected here. `Config` exists so a demo binary (or an embedder) can
//! override the defaults without reaching into module internals.

use std::time::Duration;

/// Number of ADC channels sampled per SPI transfer. Compile-time fixed.
pub const N_ADC: usize = 6;

/// Default transport buffer / message size ceiling (spec.md §3.2).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;

/// Ring buffer capacity multiplier over `max_message_size` (spec.md §4.2).
pub const RING_BUFFER_MULTIPLE: usize = 8;

/// Byte length of the SPI frame to the analog board (spec.md §4.4, §6.3).
pub const SPI_FRAME_LEN: usize = 26;

/// Fixed backing capacity of the MCU-side outgoing DAC waveform ring
/// (`heapless::Deque`, no_std-friendly and sized generously over any
/// `Config::dac_wf_ring_capacity` a caller configures at runtime).
pub const DAC_WF_RING_MAX_CAPACITY: usize = 1024;

/// Lower bound of the scan-frequency clamp range, in Hz (spec.md §4.5, §8).
pub const SCAN_FREQ_MIN_HZ: u8 = 1;

/// Upper bound of the scan-frequency clamp range, in Hz (spec.md §4.5, §8).
pub const SCAN_FREQ_MAX_HZ: u8 = 10;

/// Runtime-tunable knobs for both the device proxy and the MCU sampling loop.
///
/// `Config::default()` mirrors the grounding source's defaults; individual
/// fields are exposed as `clap` flags on the demo binary (`src/main.rs`)
/// but `Config` itself carries no CLI dependency.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ceiling on a single encoded message, and the channel's send-buffer size.
    pub max_message_size: usize,
    /// Cadence at which the app's send thread polls for an ADC sample (1-10 Hz).
    pub adc_req_hz: u8,
    /// `recv_loop`'s blocking-receive tick, used to notice `stop()` promptly.
    pub recv_tick_timeout: Duration,
    /// Fixed settle delay between the sample-ready edge and the SPI transfer.
    pub sample_settle_delay: Duration,
    /// On-duration of the read-ready GPIO pulse issued after each transfer.
    pub read_ready_pulse: Duration,
    /// Capacity of the MCU-side outgoing DAC waveform ring.
    pub dac_wf_ring_capacity: usize,
    /// Threshold below which the MCU emits `DacWfReq` (spec.md §9, resolved
    /// to half of `dac_wf_ring_capacity` by default).
    pub dac_wf_low_water_mark: usize,
}

impl Config {
    /// Clamp a requested scan frequency into the legal `[1, 10]` Hz range
    /// (spec.md §4.5, tested boundary behavior in spec.md §8).
    pub fn clamp_scan_freq(hz: u8) -> u8 {
        hz.clamp(SCAN_FREQ_MIN_HZ, SCAN_FREQ_MAX_HZ)
    }

    /// Period corresponding to `adc_req_hz`.
    pub fn adc_req_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.adc_req_hz.max(1)))
    }
}

impl Default for Config {
    fn default() -> Self {
        let dac_wf_ring_capacity = 256;
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            adc_req_hz: 10,
            recv_tick_timeout: Duration::from_millis(10),
            sample_settle_delay: Duration::from_micros(0),
            read_ready_pulse: Duration::from_micros(10),
            dac_wf_ring_capacity,
            dac_wf_low_water_mark: dac_wf_ring_capacity / 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_freq_clamps_to_range() {
        assert_eq!(Config::clamp_scan_freq(0), 1);
        assert_eq!(Config::clamp_scan_freq(1), 1);
        assert_eq!(Config::clamp_scan_freq(10), 10);
        assert_eq!(Config::clamp_scan_freq(255), 10);
        assert_eq!(Config::clamp_scan_freq(5), 5);
    }

    #[test]
    fn default_low_water_mark_is_half_capacity() {
        let cfg = Config::default();
        assert_eq!(cfg.dac_wf_low_water_mark, cfg.dac_wf_ring_capacity / 2);
    }
}
