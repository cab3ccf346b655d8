//! Supervisory-point adapters: the bridge between a named record-layer I/O
//! point and one `Device` setter/getter (spec.md §4.5, §6.4).

use std::sync::Arc;

use log::warn;

use crate::app::device::Device;
use crate::config::{N_ADC, SCAN_FREQ_MAX_HZ, SCAN_FREQ_MIN_HZ};

/// What the record framework calls on an output point, or arms on an
/// input point. Every handler declares whether it needs asynchronous
/// processing; all handlers here are synchronous (spec.md §4.5) except
/// `ScanFreqPoint`, whose synchronicity is trivial to begin with.
pub trait Handler: Send + Sync {
    /// For an output point: push the record's current value to the device.
    fn write(&self, value: i32) {
        let _ = value;
    }

    /// For an input point: return the device's current value.
    fn read(&self) -> i32 {
        0
    }

    /// Arm a notify callback that re-triggers record processing when the
    /// device stores a new value for this point.
    fn set_read_request(&self, _callback: Arc<dyn Fn() + Send + Sync>) {}

    /// Whether `process()` should be split into start + completion
    /// callback by the framework (spec.md §4.5).
    fn needs_async(&self) -> bool {
        false
    }
}

/// `ao0` — DAC setpoint, scalar out.
pub struct DacPoint {
    device: Arc<Device>,
}

impl DacPoint {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

impl Handler for DacPoint {
    fn write(&self, value: i32) {
        self.device.set_dac(value);
    }
}

/// `aiN` — one ADC channel, scalar in.
pub struct AdcPoint {
    device: Arc<Device>,
    index: usize,
}

impl AdcPoint {
    pub fn new(device: Arc<Device>, index: usize) -> Self {
        assert!(index < N_ADC, "ADC channel index out of range: {index}");
        Self { device, index }
    }
}

impl Handler for AdcPoint {
    fn read(&self) -> i32 {
        self.device.read_adc(self.index)
    }

    fn set_read_request(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.device.on_adc_update(self.index, callback);
    }
}

/// `do0` — digital-output nibble, scalar out. Only the low 4 bits are
/// meaningful; higher bits are dropped with a warning (spec.md §8
/// boundary behavior).
pub struct DoutPoint {
    device: Arc<Device>,
}

impl DoutPoint {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

impl Handler for DoutPoint {
    fn write(&self, value: i32) {
        let bits = value as u8;
        if bits & 0xF0 != 0 {
            warn!("do0 write {bits:#x} has bits outside the low nibble, dropping them");
        }
        self.device.set_dout(bits & 0x0F);
    }
}

/// `di0` — digital-input nibble, scalar in.
pub struct DinPoint {
    device: Arc<Device>,
}

impl DinPoint {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

impl Handler for DinPoint {
    fn read(&self) -> i32 {
        self.device.read_din() as i32
    }

    fn set_read_request(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.device.on_din_update(callback);
    }
}

/// `scan_freq` — ADC-request frequency, scalar out, clamped 1-10 Hz
/// (spec.md §4.5).
pub struct ScanFreqPoint {
    device: Arc<Device>,
}

impl ScanFreqPoint {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

impl Handler for ScanFreqPoint {
    fn write(&self, value: i32) {
        let hz = value.clamp(i32::from(SCAN_FREQ_MIN_HZ), i32::from(SCAN_FREQ_MAX_HZ)) as u8;
        self.device.set_scan_freq(hz);
    }
}

/// `aao*` — outgoing DAC waveform, array out.
pub struct DacWfPoint {
    device: Arc<Device>,
}

impl DacWfPoint {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    pub fn write_elements(&self, elements: Vec<i32>, cyclic: bool) {
        self.device.write_dac_wf(elements, cyclic);
    }
}

impl Handler for DacWfPoint {}

/// `aaiN` — one channel's accumulated ADC waveform, array in.
pub struct AdcWfPoint {
    device: Arc<Device>,
    index: usize,
}

impl AdcWfPoint {
    pub fn new(device: Arc<Device>, index: usize, window_size: usize) -> Self {
        assert!(index < N_ADC, "ADC waveform channel index out of range: {index}");
        device.set_adc_wf_window(index, window_size);
        Self { device, index }
    }

    pub fn drain(&self) -> Vec<i32> {
        self.device.drain_adc_wf(self.index)
    }
}

impl Handler for AdcWfPoint {
    fn set_read_request(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        self.device.on_adc_wf_ready(self.index, callback);
    }
}

/// Resolve a supervisory point name to its handler kind by string prefix,
/// per the canonical table in spec.md §4.5 / §6.4. Returns `None` for an
/// unrecognized name; the caller decides whether that's fatal.
pub enum Bound {
    Dac(DacPoint),
    Adc(AdcPoint),
    Dout(DoutPoint),
    Din(DinPoint),
    ScanFreq(ScanFreqPoint),
    DacWf(DacWfPoint),
    AdcWf(AdcWfPoint),
}

pub fn bind(name: &str, device: Arc<Device>) -> Option<Bound> {
    if name == "ao0" {
        return Some(Bound::Dac(DacPoint::new(device)));
    }
    if name == "do0" {
        return Some(Bound::Dout(DoutPoint::new(device)));
    }
    if name == "di0" {
        return Some(Bound::Din(DinPoint::new(device)));
    }
    if name == "scan_freq" {
        return Some(Bound::ScanFreq(ScanFreqPoint::new(device)));
    }
    if let Some(n) = name.strip_prefix("aai") {
        let index: usize = n.parse().ok()?;
        return Some(Bound::AdcWf(AdcWfPoint::new(device, index, device_default_window())));
    }
    if name.starts_with("aao") {
        return Some(Bound::DacWf(DacWfPoint::new(device)));
    }
    if let Some(n) = name.strip_prefix("ai") {
        let index: usize = n.parse().ok()?;
        return Some(Bound::Adc(AdcPoint::new(device, index)));
    }
    None
}

/// Default window size for an `aaiN` point bound without an explicit
/// configuration override. Chosen well under `max_message_size`'s
/// `AdcWf` element cap so a single `AdcReq`-style drain never needs
/// reassembly (spec.md §4.1 edge case on bounded `AdcWf.elements`).
fn device_default_window() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::device::Device;
    use crate::config::Config;
    use crate::transport::LoopbackTransport;

    fn test_device() -> Arc<Device> {
        let (app_side, _mcu_side) = LoopbackTransport::pair(512);
        Device::new(app_side, Config::default())
    }

    #[test]
    fn binds_scalar_points_by_exact_name() {
        let device = test_device();
        assert!(matches!(bind("ao0", device.clone()), Some(Bound::Dac(_))));
        assert!(matches!(bind("do0", device.clone()), Some(Bound::Dout(_))));
        assert!(matches!(bind("di0", device.clone()), Some(Bound::Din(_))));
        assert!(matches!(bind("scan_freq", device), Some(Bound::ScanFreq(_))));
    }

    #[test]
    fn binds_indexed_adc_points_by_prefix() {
        let device = test_device();
        match bind("ai3", device) {
            Some(Bound::Adc(p)) => assert_eq!(p.index, 3),
            _ => panic!("expected an Adc binding"),
        }
    }

    #[test]
    fn binds_array_points_by_prefix() {
        let device = test_device();
        assert!(matches!(bind("aao_burst", device.clone()), Some(Bound::DacWf(_))));
        match bind("aai2", device) {
            Some(Bound::AdcWf(p)) => assert_eq!(p.index, 2),
            _ => panic!("expected an AdcWf binding"),
        }
    }

    #[test]
    fn unrecognized_name_binds_to_nothing() {
        let device = test_device();
        assert!(bind("not_a_real_point", device).is_none());
    }

    #[test]
    fn dout_point_masks_high_nibble() {
        let device = test_device();
        let point = DoutPoint::new(device.clone());
        point.write(0xFF);
        assert_eq!(device.dout_bits(), 0x0F);
    }
}
