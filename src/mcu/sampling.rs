//! The sampling task: ISR-to-task handoff, one SPI transfer per
//! sample-ready edge, and the read-ready GPIO pulse (spec.md §4.4).
//!
//! The ISR itself is out of this crate's scope — the real GPIO5 combined
//! IRQ handler lives in the board support package. What the ISR does is
//! exactly one thing this module depends on: post to a binary semaphore.
//! `SampleReadySignal` models that semaphore so the sampling loop is
//! host-testable without real interrupts.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::error::SpiError;
use crate::mcu::spi::{self, SampledFrame};
use crate::mcu::state::McuState;

/// Binary semaphore the sample-ready ISR posts to and the sampling task
/// waits on (`xSemaphoreGiveFromISR` / `xSemaphoreTake` in the original
/// loop). `notify` is safe to call from interrupt context: it only takes an
/// uncontended mutex, bumps the debug interrupt counter, and does a condvar
/// wake (spec.md §4.4 step 1 "increments an interrupt counter").
#[derive(Clone)]
pub struct SampleReadySignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
    state: Arc<McuState>,
}

impl SampleReadySignal {
    pub fn new(state: Arc<McuState>) -> Self {
        Self { inner: Arc::new((Mutex::new(false), Condvar::new())), state }
    }

    /// Called from the sample-ready edge handler.
    pub fn notify(&self) {
        self.state.note_interrupt();
        let (lock, cvar) = &*self.inner;
        let mut ready = lock.lock().expect("sample ready mutex poisoned");
        *ready = true;
        cvar.notify_one();
    }

    /// Blocks until `notify` has been called, or `timeout` elapses.
    /// Returns `false` on timeout, mirroring `xSemaphoreTake`'s `pdFALSE`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().expect("sample ready mutex poisoned");
        let (mut guard, result) = cvar
            .wait_timeout_while(guard, timeout, |ready| !*ready)
            .expect("sample ready mutex poisoned");
        if !result.timed_out() {
            *guard = false;
            true
        } else {
            false
        }
    }
}

/// Drives one SPI transfer per sample-ready edge: a settle delay to reduce
/// ADC noise, the 26-byte transfer, and a read-ready pulse that latches the
/// board's outputs (spec.md §4.4 steps 2-3, §6.3).
pub struct Sampler<B, P> {
    bus: B,
    read_ready_pin: P,
    settle_delay: Duration,
    pulse_width: Duration,
}

impl<B: SpiBus<u8>, P: OutputPin> Sampler<B, P> {
    pub fn new(bus: B, read_ready_pin: P, settle_delay: Duration, pulse_width: Duration) -> Self {
        Self { bus, read_ready_pin, settle_delay, pulse_width }
    }

    /// Run one full sample-ready cycle against `state`: wait for the
    /// settle delay, transfer, apply the result to `state`, pulse
    /// read-ready. A CRC mismatch is counted in `state` and returned to the
    /// caller as `Ok(Some(SpiError::Crc))` so it can be logged without
    /// losing the cycle; only a genuine bus/pin failure is `Err` (spec.md
    /// §4.4 step 4).
    pub fn run_one(&mut self, state: &McuState) -> Result<Option<SpiError>, SpiError> {
        if !self.settle_delay.is_zero() {
            std::thread::sleep(self.settle_delay);
        }

        let SampledFrame { values, crc_ok } = spi::transfer(&mut self.bus, state.dac_setpoint())?;
        state.apply_sample(values, crc_ok);
        let crc_error = if crc_ok {
            None
        } else {
            state.note_crc_error();
            Some(SpiError::Crc)
        };

        self.read_ready_pin.set_high().map_err(|_| SpiError::Bus("read-ready pin".into()))?;
        if !self.pulse_width.is_zero() {
            std::thread::sleep(self.pulse_width);
        }
        self.read_ready_pin.set_low().map_err(|_| SpiError::Bus("read-ready pin".into()))?;

        Ok(crc_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::N_ADC;
    use std::convert::Infallible;
    use std::thread;

    #[test]
    fn signal_wakes_a_waiting_thread() {
        let signal = SampleReadySignal::new(Arc::new(McuState::new()));
        let waiter = signal.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        signal.notify();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn signal_times_out_with_no_notify() {
        let signal = SampleReadySignal::new(Arc::new(McuState::new()));
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn notify_increments_interrupt_counter() {
        let state = Arc::new(McuState::new());
        let signal = SampleReadySignal::new(state.clone());
        signal.notify();
        signal.notify();
        assert_eq!(state.interrupts_per_sample(), 2);
    }

    struct FakeBus;
    impl embedded_hal::spi::ErrorType for FakeBus {
        type Error = Infallible;
    }
    impl SpiBus<u8> for FakeBus {
        fn read(&mut self, _w: &mut [u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn write(&mut self, _w: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn transfer(&mut self, _r: &mut [u8], _w: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
            for w in words.iter_mut() {
                *w = 0;
            }
            Ok(())
        }
        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    struct FakePin {
        high: bool,
    }
    impl embedded_hal::digital::ErrorType for FakePin {
        type Error = Infallible;
    }
    impl OutputPin for FakePin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.high = false;
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.high = true;
            Ok(())
        }
    }

    #[test]
    fn run_one_applies_sample_and_leaves_pin_low() {
        let state = McuState::new();
        let pin = FakePin { high: false };
        let mut sampler = Sampler::new(FakeBus, pin, Duration::ZERO, Duration::ZERO);
        let crc_error = sampler.run_one(&state).unwrap();
        assert!(crc_error.is_none());
        assert_eq!(state.take_adc_averages(), [0; N_ADC]);
        assert!(!sampler.read_ready_pin.high);
    }

    struct CrcMismatchBus;
    impl embedded_hal::spi::ErrorType for CrcMismatchBus {
        type Error = Infallible;
    }
    impl SpiBus<u8> for CrcMismatchBus {
        fn read(&mut self, _w: &mut [u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn write(&mut self, _w: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn transfer(&mut self, _r: &mut [u8], _w: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
            // An all-zero payload (whose correct CRC is 0) with the
            // trailing CRC bytes forced to 0xFFFF: guaranteed mismatch.
            let len = words.len();
            for w in words.iter_mut() {
                *w = 0;
            }
            words[len - 2] = 0xFF;
            words[len - 1] = 0xFF;
            Ok(())
        }
        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[test]
    fn run_one_reports_crc_mismatch_without_erroring() {
        let state = McuState::new();
        let pin = FakePin { high: false };
        let mut sampler = Sampler::new(CrcMismatchBus, pin, Duration::ZERO, Duration::ZERO);
        let crc_error = sampler.run_one(&state).unwrap();
        assert_eq!(crc_error, Some(SpiError::Crc));
        assert_eq!(state.crc_error_count(), 1);
    }
}
