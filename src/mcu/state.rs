//! Cross-task MCU state (spec.md §3.4).
//!
//! The sampling task is the sole writer of the accumulator and statistics;
//! the RPMSG-analogue task is the sole writer of `dac_setpoint` and
//! `dout_bits` and the sole reader/resetter of the accumulator. Every field
//! is a platform atomic so cross-task access needs no mutex (spec.md §4.4
//! "Concurrency").

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU8, Ordering};

use crate::config::N_ADC;

const ORDER: Ordering = Ordering::SeqCst;

/// Running sum plus last/min/max for one ADC channel, reset each time the
/// RPMSG task drains it for an `AdcVal` read-out.
struct ChannelAccum {
    sum: AtomicI64,
    last: AtomicI32,
    min: AtomicI32,
    max: AtomicI32,
}

impl ChannelAccum {
    fn new() -> Self {
        Self {
            sum: AtomicI64::new(0),
            last: AtomicI32::new(0),
            min: AtomicI32::new(0),
            max: AtomicI32::new(0),
        }
    }
}

/// All state shared between the MCU's sampling task and its RPMSG-analogue
/// task (spec.md §3.4). Brought to a well-defined zero at construction and
/// never torn down during normal operation (spec.md §3.5).
pub struct McuState {
    dac_setpoint: AtomicI32,
    dout_bits: AtomicU8,
    accum: [ChannelAccum; N_ADC],
    sample_count: AtomicU32,
    intr_count: AtomicU32,
    crc_error_count: AtomicU32,
}

impl McuState {
    pub fn new() -> Self {
        Self {
            dac_setpoint: AtomicI32::new(0),
            dout_bits: AtomicU8::new(0),
            accum: std::array::from_fn(|_| ChannelAccum::new()),
            sample_count: AtomicU32::new(0),
            intr_count: AtomicU32::new(0),
            crc_error_count: AtomicU32::new(0),
        }
    }

    // --- RPMSG-task side: dac_setpoint / dout_bits ---

    pub fn set_dac_setpoint(&self, value: i32) {
        self.dac_setpoint.store(value, ORDER);
    }

    pub fn dac_setpoint(&self) -> i32 {
        self.dac_setpoint.load(ORDER)
    }

    pub fn set_dout_bits(&self, bits: u8) {
        self.dout_bits.store(bits, ORDER);
    }

    pub fn dout_bits(&self) -> u8 {
        self.dout_bits.load(ORDER)
    }

    /// Drain the running per-channel averages and reset the accumulator,
    /// as the RPMSG task does when it builds an `AdcVal` reply
    /// (`main.c`'s `task_rpmsg` `IPP_APP_MSG_ADC_REQ` handler).
    pub fn take_adc_averages(&self) -> [i32; N_ADC] {
        let count = self.sample_count.swap(0, ORDER);
        std::array::from_fn(|i| {
            let sum = self.accum[i].sum.swap(0, ORDER);
            if count > 0 { (sum / count as i64) as i32 } else { sum as i32 }
        })
    }

    pub fn last_min_max(&self, channel: usize) -> (i32, i32, i32) {
        let ch = &self.accum[channel];
        (ch.last.load(ORDER), ch.min.load(ORDER), ch.max.load(ORDER))
    }

    pub fn interrupts_per_sample(&self) -> u32 {
        self.intr_count.swap(0, ORDER)
    }

    pub fn crc_error_count(&self) -> u32 {
        self.crc_error_count.load(ORDER)
    }

    // --- sampling-task side ---

    pub fn note_interrupt(&self) {
        self.intr_count.fetch_add(1, ORDER);
    }

    pub fn note_crc_error(&self) {
        self.crc_error_count.fetch_add(1, ORDER);
    }

    /// Apply one freshly sampled frame of `N_ADC` values. `accumulate`
    /// is `false` on a CRC-mismatched frame: the value still updates
    /// last/min/max but is excluded from the running sum (spec.md §4.4
    /// step 4).
    pub fn apply_sample(&self, values: [i32; N_ADC], accumulate: bool) {
        if accumulate {
            // First sample since the last drain overwrites rather than
            // adds, matching `g_sample_count == 0` in the original loop.
            let first = self.sample_count.fetch_add(1, ORDER) == 0;
            for (ch, value) in self.accum.iter().zip(values) {
                if first {
                    ch.sum.store(value as i64, ORDER);
                } else {
                    ch.sum.fetch_add(value as i64, ORDER);
                }
            }
        }
        for (ch, value) in self.accum.iter().zip(values) {
            ch.last.store(value, ORDER);
            ch.min.fetch_min(value, ORDER);
            ch.max.fetch_max(value, ORDER);
        }
    }
}

impl Default for McuState {
    fn default() -> Self {
        Self::new()
    }
}
