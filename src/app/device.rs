//! The application-side device proxy: owns the message channel, runs the
//! two long-lived threads (`recv_loop`, `send_loop`), and republishes
//! incoming values to the supervisory layer via per-point notify callbacks
//! (spec.md §4.3, §5).

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::channel::{MessageChannel, RecvHalf, SendHalf};
use crate::config::{Config, N_ADC};
use crate::error::ChannelError;
use crate::proto::{AppMessage, McuMessage};
use crate::transport::{Timeout, Transport};

const ORDER: Ordering = Ordering::SeqCst;

/// Per-point notify callback, invoked by `recv_loop` without holding any
/// device lock (spec.md §4.3).
pub type Notify = Arc<dyn Fn() + Send + Sync>;

struct AdcChannel {
    value: AtomicI32,
    notify: Mutex<Option<Notify>>,
}

struct AdcWindow {
    data: Vec<i32>,
    window_size: usize,
    notify: Option<Notify>,
}

struct SendState {
    dac: i32,
    dac_dirty: bool,
    dout: u8,
    dout_dirty: bool,
    /// Sticky: set by `recv_loop` on `DacWfReq`, cleared by `send_loop`
    /// once it has scheduled the reply — multiple requests before the
    /// send thread wakes still yield exactly one `DacWf` (spec.md §4.3
    /// "sent at most once per `DacWfReq`").
    has_dac_wf_req: bool,
}

struct DacWaveform {
    front: Vec<i32>,
    back: Vec<i32>,
    pos: usize,
    swap_ready: bool,
    armed: bool,
    cyclic: bool,
}

/// Parse-error and timeout counters the embedder can poll for health
/// monitoring; not part of the wire protocol.
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub parse_errors: AtomicU32,
    pub recv_timeouts: AtomicU32,
}

struct DeviceThreads {
    recv: JoinHandle<()>,
    send: JoinHandle<()>,
}

/// Owns one `MessageChannel`'s split halves across its two threads. See
/// spec.md §4.3 for the full responsibility statement.
pub struct Device {
    send_mutex: Mutex<SendState>,
    send_cv: Condvar,
    dac_wf: Mutex<DacWaveform>,
    dac_wf_chunk_cap: usize,
    adcs: [AdcChannel; N_ADC],
    din: AtomicU8,
    din_notify: Mutex<Option<Notify>>,
    adc_wfs: [Mutex<AdcWindow>; N_ADC],
    adc_req_period: Mutex<Duration>,
    recv_tick_timeout: Duration,
    done: AtomicBool,
    pub stats: DeviceStats,
    fault_tx: Sender<ChannelError>,
    fault_rx: Mutex<Option<Receiver<ChannelError>>>,
    threads: Mutex<Option<DeviceThreads>>,
}

impl Device {
    /// Build the device, split the channel, and start `recv_loop` and
    /// `send_loop` immediately — a `Device` is constructed once and is
    /// live from that point on (spec.md §3.5).
    pub fn new<T>(transport: T, config: Config) -> Arc<Device>
    where
        T: Transport + Send + Sync + 'static,
    {
        let channel = MessageChannel::new(transport, config.max_message_size);
        let (send_half, recv_half) = channel.split();
        let dac_wf_chunk_cap = config.max_message_size.saturating_sub(3) / 4;
        let (fault_tx, fault_rx) = mpsc::channel();

        let device = Arc::new(Device {
            send_mutex: Mutex::new(SendState { dac: 0, dac_dirty: false, dout: 0, dout_dirty: false, has_dac_wf_req: false }),
            send_cv: Condvar::new(),
            dac_wf: Mutex::new(DacWaveform {
                front: Vec::new(),
                back: Vec::new(),
                pos: 0,
                swap_ready: false,
                armed: false,
                cyclic: false,
            }),
            dac_wf_chunk_cap,
            adcs: std::array::from_fn(|_| AdcChannel { value: AtomicI32::new(0), notify: Mutex::new(None) }),
            din: AtomicU8::new(0),
            din_notify: Mutex::new(None),
            adc_wfs: std::array::from_fn(|_| Mutex::new(AdcWindow { data: Vec::new(), window_size: 64, notify: None })),
            adc_req_period: Mutex::new(config.adc_req_period()),
            recv_tick_timeout: config.recv_tick_timeout,
            done: AtomicBool::new(false),
            stats: DeviceStats::default(),
            fault_tx,
            fault_rx: Mutex::new(Some(fault_rx)),
            threads: Mutex::new(None),
        });

        let recv_device = device.clone();
        let recv_tick_timeout = device.recv_tick_timeout;
        let recv_handle = thread::spawn(move || recv_loop(recv_device, recv_half, recv_tick_timeout));

        let send_device = device.clone();
        let send_handle = thread::spawn(move || send_loop(send_device, send_half));

        *device.threads.lock().expect("device threads mutex poisoned") =
            Some(DeviceThreads { recv: recv_handle, send: send_handle });

        device
    }

    /// Take ownership of the fault channel; returns `None` if already
    /// taken. A `ChannelError::Fatal` observed by either thread is sent
    /// here once before that thread exits (spec.md §4.3 "Failure").
    pub fn take_fault_receiver(&self) -> Option<Receiver<ChannelError>> {
        self.fault_rx.lock().expect("fault receiver mutex poisoned").take()
    }

    /// Stop both threads. Idempotent (spec.md §4.3 "Cancellation").
    pub fn stop(&self) {
        if self.done.swap(true, ORDER) {
            return;
        }
        self.send_cv.notify_all();
        if let Some(threads) = self.threads.lock().expect("device threads mutex poisoned").take() {
            let _ = threads.recv.join();
            let _ = threads.send.join();
        }
    }

    // --- supervisory-facing setters ---

    pub fn set_dac(&self, value: i32) {
        let mut s = self.send_mutex.lock().expect("send mutex poisoned");
        s.dac = value;
        s.dac_dirty = true;
        drop(s);
        self.send_cv.notify_all();
    }

    pub fn set_dout(&self, bits: u8) {
        let masked = bits & 0x0F;
        let mut s = self.send_mutex.lock().expect("send mutex poisoned");
        s.dout = masked;
        s.dout_dirty = true;
        drop(s);
        self.send_cv.notify_all();
    }

    /// Last digital-output word handed to `set_dout`, independent of
    /// whether it has been sent to the MCU yet.
    pub fn dout_bits(&self) -> u8 {
        self.send_mutex.lock().expect("send mutex poisoned").dout
    }

    pub fn set_scan_freq(&self, hz: u8) {
        let hz = Config::clamp_scan_freq(hz);
        *self.adc_req_period.lock().expect("adc_req_period mutex poisoned") =
            Duration::from_secs_f64(1.0 / f64::from(hz));
    }

    /// Install or replace a waveform. If none is currently armed, it
    /// becomes the front buffer immediately; otherwise it queues as the
    /// back buffer for the next exhaustion-triggered swap (spec.md §4.3
    /// "dac_wf double-buffering").
    pub fn write_dac_wf(&self, elements: Vec<i32>, cyclic: bool) {
        let mut wf = self.dac_wf.lock().expect("dac_wf mutex poisoned");
        if !wf.armed {
            wf.front = elements;
            wf.pos = 0;
            wf.cyclic = cyclic;
            wf.armed = true;
        } else {
            wf.back = elements;
            wf.cyclic = cyclic;
            wf.swap_ready = true;
        }
    }

    pub fn set_adc_wf_window(&self, index: usize, window_size: usize) {
        self.adc_wfs[index].lock().expect("adc_wf mutex poisoned").window_size = window_size;
    }

    /// Drain exactly `window_size` elements (or fewer if not enough have
    /// accumulated yet) from one channel's ADC waveform buffer (spec.md
    /// §4.3 "Reads drain exactly `window_size` elements").
    pub fn drain_adc_wf(&self, index: usize) -> Vec<i32> {
        let mut win = self.adc_wfs[index].lock().expect("adc_wf mutex poisoned");
        let n = win.window_size.min(win.data.len());
        win.data.drain(..n).collect()
    }

    // --- supervisory-facing getters / notify registration ---

    pub fn read_adc(&self, index: usize) -> i32 {
        self.adcs[index].value.load(ORDER)
    }

    pub fn on_adc_update(&self, index: usize, callback: Notify) {
        *self.adcs[index].notify.lock().expect("adc notify mutex poisoned") = Some(callback);
    }

    pub fn read_din(&self) -> u8 {
        self.din.load(ORDER)
    }

    pub fn on_din_update(&self, callback: Notify) {
        *self.din_notify.lock().expect("din notify mutex poisoned") = Some(callback);
    }

    pub fn on_adc_wf_ready(&self, index: usize, callback: Notify) {
        self.adc_wfs[index].lock().expect("adc_wf mutex poisoned").notify = Some(callback);
    }

    // --- internal: driven by recv_loop / send_loop ---

    fn handle_mcu_message(&self, msg: McuMessage) {
        match msg {
            McuMessage::None => {}
            McuMessage::DacWfReq => {
                let mut s = self.send_mutex.lock().expect("send mutex poisoned");
                s.has_dac_wf_req = true;
                drop(s);
                self.send_cv.notify_all();
            }
            McuMessage::AdcVal { values } => {
                for (channel, value) in self.adcs.iter().zip(values) {
                    channel.value.store(value, ORDER);
                    let notify = channel.notify.lock().expect("adc notify mutex poisoned").clone();
                    if let Some(cb) = notify {
                        cb();
                    }
                }
            }
            McuMessage::DinVal { bits } => {
                self.din.store(bits, ORDER);
                let notify = self.din_notify.lock().expect("din notify mutex poisoned").clone();
                if let Some(cb) = notify {
                    cb();
                }
            }
            McuMessage::AdcWf { index, elements } => self.append_adc_wf(index as usize, elements),
            McuMessage::Error { code, message } => warn!("MCU reported error {code}: {message}"),
            McuMessage::Debug { message } => debug!("MCU debug: {message}"),
        }
    }

    fn append_adc_wf(&self, index: usize, elements: Vec<i32>) {
        let Some(win_mutex) = self.adc_wfs.get(index) else {
            warn!("AdcWf for out-of-range channel {index}, dropping");
            return;
        };
        let mut win = win_mutex.lock().expect("adc_wf mutex poisoned");
        let was_below = win.data.len() < win.window_size;
        win.data.extend(elements);
        let now_at_or_above = win.data.len() >= win.window_size;
        let notify = if was_below && now_at_or_above { win.notify.clone() } else { None };
        drop(win);
        if let Some(cb) = notify {
            cb();
        }
    }

    /// Produce the next outgoing `DacWf` chunk, handling buffer swap and
    /// cyclic replay, bounded by `dac_wf_chunk_cap` elements per message
    /// (spec.md §4.1 edge case, §4.3 double-buffering invariant).
    fn next_dac_wf_chunk(&self) -> Vec<i32> {
        let mut wf = self.dac_wf.lock().expect("dac_wf mutex poisoned");
        if wf.pos >= wf.front.len() {
            if wf.swap_ready {
                std::mem::swap(&mut wf.front, &mut wf.back);
                wf.back.clear();
                wf.pos = 0;
                wf.swap_ready = false;
            } else if wf.cyclic && !wf.front.is_empty() {
                wf.pos = 0;
            } else {
                wf.armed = false;
                return Vec::new();
            }
        }
        let remaining = wf.front.len() - wf.pos;
        let take = remaining.min(self.dac_wf_chunk_cap);
        let chunk = wf.front[wf.pos..wf.pos + take].to_vec();
        wf.pos += take;
        if wf.pos >= wf.front.len() && !wf.cyclic && !wf.swap_ready {
            wf.armed = false;
        }
        chunk
    }
}

fn recv_loop<T: Transport>(device: Arc<Device>, mut recv: RecvHalf<T>, tick_timeout: Duration) {
    loop {
        if device.done.load(ORDER) {
            return;
        }
        match recv.receive_mcu(Timeout::After(tick_timeout)) {
            Ok(msg) => device.handle_mcu_message(msg),
            Err(ChannelError::TimedOut) => {
                device.stats.recv_timeouts.fetch_add(1, ORDER);
                trace!("recv_loop tick timeout, no message");
            }
            Err(ChannelError::Parse(_)) => {
                device.stats.parse_errors.fetch_add(1, ORDER);
                warn!("recv_loop: parse error, channel resynchronizing");
            }
            Err(ChannelError::OutOfBounds { size, max }) => {
                warn!("recv_loop: impossible OutOfBounds on receive ({size} > {max})");
            }
            Err(ChannelError::Fatal(e)) => {
                warn!("recv_loop: fatal transport failure: {e}");
                let _ = device.fault_tx.send(ChannelError::Fatal(e));
                device.done.store(true, ORDER);
                device.send_cv.notify_all();
                return;
            }
        }
    }
}

fn send_loop<T: Transport>(device: Arc<Device>, mut send: SendHalf<T>) {
    if send.send_app(&AppMessage::Start, Timeout::Forever).is_err() {
        warn!("send_loop: failed to send initial Start, aborting");
        return;
    }

    let mut next_wake = Instant::now() + *device.adc_req_period.lock().expect("adc_req_period mutex poisoned");

    loop {
        if device.done.load(ORDER) {
            return;
        }

        let wait_for = next_wake.saturating_duration_since(Instant::now());
        let state = device.send_mutex.lock().expect("send mutex poisoned");
        let (mut state, _result) = device
            .send_cv
            .wait_timeout_while(state, wait_for, |s| {
                !device.done.load(ORDER) && !s.dac_dirty && !s.dout_dirty && !s.has_dac_wf_req && Instant::now() < next_wake
            })
            .expect("send mutex poisoned");

        if device.done.load(ORDER) {
            return;
        }

        if state.dac_dirty {
            let value = state.dac;
            state.dac_dirty = false;
            drop(state);
            if fatal(&device, send.send_app(&AppMessage::DacSet { value }, Timeout::After(Duration::from_millis(50)))) {
                return;
            }
            state = device.send_mutex.lock().expect("send mutex poisoned");
        }

        if state.dout_dirty {
            let bits = state.dout;
            state.dout_dirty = false;
            drop(state);
            if fatal(&device, send.send_app(&AppMessage::DoutSet { bits }, Timeout::After(Duration::from_millis(50)))) {
                return;
            }
            state = device.send_mutex.lock().expect("send mutex poisoned");
        }

        if state.has_dac_wf_req {
            state.has_dac_wf_req = false;
            drop(state);
            let elements = device.next_dac_wf_chunk();
            if fatal(&device, send.send_app(&AppMessage::DacWf { elements }, Timeout::After(Duration::from_millis(50)))) {
                return;
            }
        } else {
            drop(state);
        }

        if Instant::now() >= next_wake {
            if fatal(&device, send.send_app(&AppMessage::AdcReq, Timeout::After(Duration::from_millis(50)))) {
                return;
            }
            // Scheduled relative to the previous wake, not to `now`, so a
            // late wake does not cause a burst of catch-up sends.
            next_wake += *device.adc_req_period.lock().expect("adc_req_period mutex poisoned");
        }
    }
}

fn fatal(device: &Device, result: Result<(), ChannelError>) -> bool {
    match result {
        Ok(()) => false,
        Err(ChannelError::TimedOut) => {
            trace!("send_loop: send timed out, will retry next wake");
            false
        }
        Err(ChannelError::Fatal(e)) => {
            warn!("send_loop: fatal transport failure: {e}");
            let _ = device.fault_tx.send(ChannelError::Fatal(e));
            device.done.store(true, ORDER);
            true
        }
        Err(e) => {
            warn!("send_loop: unexpected send error: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::AtomicUsize;

    fn expect_tag(app_side: &LoopbackTransport, tag: u8, timeout: Duration) {
        let mut buf = [0u8; 64];
        let n = app_side.receive(&mut buf, Timeout::After(timeout)).expect("expected a message");
        assert_eq!(buf[0], tag, "unexpected tag, got {:?}", &buf[..n]);
    }

    #[test]
    fn device_sends_start_handshake_on_construction() {
        let (app_side, mcu_side) = LoopbackTransport::pair(512);
        let mut cfg = Config::default();
        cfg.adc_req_hz = 10;
        let device = Device::new(app_side, cfg);
        expect_tag(&mcu_side, 0x01, Duration::from_millis(200));
        device.stop();
    }

    #[test]
    fn dac_set_is_coalesced_and_eventually_sent() {
        let (app_side, mcu_side) = LoopbackTransport::pair(512);
        let device = Device::new(app_side, Config::default());
        expect_tag(&mcu_side, 0x01, Duration::from_millis(200)); // handshake Start

        device.set_dac(10);
        device.set_dac(20);
        device.set_dac(30);

        let mut buf = [0u8; 64];
        let n = mcu_side.receive(&mut buf, Timeout::After(Duration::from_millis(200))).unwrap();
        assert_eq!(buf[0], 0x10);
        assert_eq!(i32::from_le_bytes(buf[1..5].try_into().unwrap()), 30);
        let _ = n;
        device.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let (app_side, _mcu_side) = LoopbackTransport::pair(512);
        let device = Device::new(app_side, Config::default());
        device.stop();
        device.stop();
    }

    #[test]
    fn adc_update_fires_notify_without_holding_device_lock() {
        let (app_side, mcu_side) = LoopbackTransport::pair(512);
        let device = Device::new(app_side, Config::default());
        expect_tag(&mcu_side, 0x01, Duration::from_millis(200));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_cb = seen.clone();
        let device_in_cb = device.clone();
        device.on_adc_update(
            0,
            Arc::new(move || {
                // Re-entering the device from the callback must not
                // deadlock (spec.md §4.3: "without holding any device lock").
                let _ = device_in_cb.read_adc(0);
                seen_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut payload = vec![0x20u8];
        for v in [7i32, 0, 0, 0, 0, 0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        mcu_side.send(&payload, Timeout::Forever).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(device.read_adc(0), 7);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        device.stop();
    }

    #[test]
    fn dac_waveform_replies_exactly_once_per_request() {
        let (app_side, mcu_side) = LoopbackTransport::pair(512);
        let device = Device::new(app_side, Config::default());
        expect_tag(&mcu_side, 0x01, Duration::from_millis(200));

        device.write_dac_wf(vec![1, 2, 3], false);
        mcu_side.send(&[0x10], Timeout::Forever).unwrap(); // DacWfReq
        mcu_side.send(&[0x10], Timeout::Forever).unwrap(); // a second, before send_loop wakes

        let mut buf = [0u8; 64];
        let n = mcu_side.receive(&mut buf, Timeout::After(Duration::from_millis(200))).unwrap();
        assert_eq!(buf[0], 0x11);
        let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        assert_eq!(len, 3);
        let _ = n;
        device.stop();
    }
}
