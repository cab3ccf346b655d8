//! The MCU's message-dispatch task: the RPMSG-analogue loop from the
//! grounding source's `task_rpmsg`, generalized from its single
//! `DacSet`/`AdcReq` pair to the full wire table (spec.md §4.4, §6.1, §8).

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::channel::MessageChannel;
use crate::config::DAC_WF_RING_MAX_CAPACITY;
use crate::error::ChannelError;
use crate::mcu::state::McuState;
use crate::proto::{AppMessage, McuMessage};
use crate::transport::{Timeout, Transport};

/// Dispatches app→mcu traffic against `McuState` and answers with mcu→app
/// replies. Owns a local ring of pending DAC-waveform samples, fed by
/// `AppMessage::DacWf` chunks sent in response to `McuMessage::DacWfReq`
/// (spec.md §4.4 "DAC waveform request cadence").
pub struct McuNode<T: Transport> {
    channel: MessageChannel<T>,
    state: Arc<McuState>,
    dac_wf_ring: heapless::Deque<i32, DAC_WF_RING_MAX_CAPACITY>,
    ring_capacity: usize,
    low_water_mark: usize,
    dac_wf_requested: bool,
}

impl<T: Transport> McuNode<T> {
    /// `ring_capacity` is a runtime-enforced logical limit over the fixed
    /// `DAC_WF_RING_MAX_CAPACITY` backing storage; panics if it doesn't fit,
    /// a construction-time configuration error rather than a runtime fault.
    pub fn new(
        transport: T,
        max_message_length: usize,
        state: Arc<McuState>,
        ring_capacity: usize,
        low_water_mark: usize,
    ) -> Self {
        assert!(
            ring_capacity <= DAC_WF_RING_MAX_CAPACITY,
            "ring_capacity {ring_capacity} exceeds fixed backing capacity {DAC_WF_RING_MAX_CAPACITY}"
        );
        Self {
            channel: MessageChannel::new(transport, max_message_length),
            state,
            dac_wf_ring: heapless::Deque::new(),
            ring_capacity,
            low_water_mark,
            dac_wf_requested: false,
        }
    }

    pub fn state(&self) -> &Arc<McuState> {
        &self.state
    }

    /// Block for the boot handshake: receive `Start`, reply
    /// `Debug("hello world!")`. Any other message observed here is a
    /// protocol violation from the app side (spec.md §8 "Boot handshake").
    pub fn run_handshake(&mut self) -> Result<(), ChannelError> {
        match self.channel.receive_app(Timeout::Forever)? {
            AppMessage::Start => {
                info!("Start message received");
                self.channel.send_mcu(
                    &McuMessage::Debug { message: "hello world!".into() },
                    Timeout::Forever,
                )?;
                Ok(())
            }
            other => {
                let msg = format!("unexpected message during handshake: {other:?}");
                Err(ChannelError::Parse(msg))
            }
        }
    }

    /// Receive and act on exactly one app→mcu message, replying inline
    /// where the wire table calls for it (`AdcReq` → `AdcVal`). Returns
    /// cleanly on a routine receive timeout so callers can interleave this
    /// with sampling-task ticks.
    pub fn dispatch_one(&mut self, timeout: Timeout) -> Result<(), ChannelError> {
        let msg = match self.channel.receive_app(timeout) {
            Ok(msg) => msg,
            Err(ChannelError::TimedOut) => return Ok(()),
            Err(e) => return Err(e),
        };

        match msg {
            AppMessage::None => {}
            AppMessage::Start => warn!("redundant Start received post-handshake, ignoring"),
            AppMessage::Stop => info!("Stop received"),
            AppMessage::DacSet { value } => {
                debug!("DacSet {value}");
                self.state.set_dac_setpoint(value);
            }
            AppMessage::DoutSet { bits } => {
                let bits = bits & 0x0F;
                debug!("DoutSet {bits:#x}");
                self.state.set_dout_bits(bits);
            }
            AppMessage::DacWf { elements } => self.accept_dac_wf(elements),
            AppMessage::AdcReq => {
                let values = self.state.take_adc_averages();
                self.channel.send_mcu(&McuMessage::AdcVal { values }, Timeout::After(Duration::from_millis(50)))?;
            }
        }
        Ok(())
    }

    fn accept_dac_wf(&mut self, elements: Vec<i32>) {
        self.dac_wf_requested = false;
        let room = self.ring_capacity.saturating_sub(self.dac_wf_ring.len());
        if elements.len() > room {
            warn!(
                "DacWf chunk of {} elements overflows ring (room {}), dropping the excess",
                elements.len(),
                room
            );
        }
        for value in elements.into_iter().take(room) {
            let _ = self.dac_wf_ring.push_back(value);
        }
    }

    /// Advance DAC-waveform playback by one sample: consume the next
    /// queued element into `dac_setpoint`, or hold the last value on
    /// underflow (spec.md §4.4). Requests more data once the ring falls
    /// below the low-water mark, at most once per reply (spec.md §4.4
    /// "DAC waveform request cadence").
    pub fn service_dac_waveform(&mut self) -> Result<(), ChannelError> {
        if let Some(value) = self.dac_wf_ring.pop_front() {
            self.state.set_dac_setpoint(value);
        }

        if !self.dac_wf_requested && self.dac_wf_ring.len() < self.low_water_mark {
            self.channel.send_mcu(&McuMessage::DacWfReq, Timeout::After(Duration::ZERO))?;
            self.dac_wf_requested = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn node_pair(ring_capacity: usize, low_water_mark: usize) -> (McuNode<LoopbackTransport>, LoopbackTransport) {
        let (app_side, mcu_side) = LoopbackTransport::pair(512);
        let node = McuNode::new(mcu_side, 512, Arc::new(McuState::new()), ring_capacity, low_water_mark);
        (node, app_side)
    }

    #[test]
    fn handshake_replies_with_hello_world() {
        let (mut node, app_side) = node_pair(8, 4);
        app_side.send(&[0x01], Timeout::Forever).unwrap();
        node.run_handshake().unwrap();

        let mut buf = [0u8; 32];
        let n = app_side.receive(&mut buf, Timeout::After(Duration::from_millis(50))).unwrap();
        assert_eq!(&buf[..n], b"\xE1\x0chello world!");
    }

    #[test]
    fn handshake_rejects_non_start_message() {
        let (mut node, app_side) = node_pair(8, 4);
        app_side.send(&[0x20], Timeout::Forever).unwrap(); // AdcReq
        let err = node.run_handshake().unwrap_err();
        assert!(matches!(err, ChannelError::Parse(_)));
    }

    #[test]
    fn dac_set_updates_state() {
        let (mut node, app_side) = node_pair(8, 4);
        let mut buf = vec![0u8; 5];
        buf[0] = 0x10; // DacSet
        buf[1..5].copy_from_slice(&77i32.to_le_bytes());
        app_side.send(&buf, Timeout::Forever).unwrap();
        node.dispatch_one(Timeout::After(Duration::from_millis(50))).unwrap();
        assert_eq!(node.state().dac_setpoint(), 77);
    }

    #[test]
    fn adc_req_replies_with_current_average() {
        let (mut node, app_side) = node_pair(8, 4);
        node.state().apply_sample([1, 2, 3, 4, 5, 6], true);
        app_side.send(&[0x20], Timeout::Forever).unwrap(); // AdcReq
        node.dispatch_one(Timeout::After(Duration::from_millis(50))).unwrap();

        let mut buf = [0u8; 32];
        let n = app_side.receive(&mut buf, Timeout::After(Duration::from_millis(50))).unwrap();
        assert_eq!(buf[0], 0x20);
        assert_eq!(n, 25);
    }

    #[test]
    fn dac_waveform_drains_and_requests_more_below_low_water_mark() {
        let (mut node, app_side) = node_pair(4, 2);
        node.accept_dac_wf(vec![11, 22, 33]);

        node.service_dac_waveform().unwrap();
        assert_eq!(node.state().dac_setpoint(), 11);

        // Ring now holds {22, 33}, len 2 >= low_water_mark 2: no request yet.
        let mut buf = [0u8; 8];
        assert!(app_side.receive(&mut buf, Timeout::After(Duration::from_millis(5))).is_err());

        node.service_dac_waveform().unwrap();
        assert_eq!(node.state().dac_setpoint(), 22);
        // Ring now holds {33}, len 1 < low_water_mark 2: DacWfReq sent.
        let n = app_side.receive(&mut buf, Timeout::After(Duration::from_millis(50))).unwrap();
        assert_eq!(&buf[..n], &[0x10]);
    }

    #[test]
    fn dac_waveform_holds_last_value_on_underflow() {
        let (mut node, _app_side) = node_pair(4, 2);
        node.state.set_dac_setpoint(5);
        node.service_dac_waveform().ok();
        assert_eq!(node.state().dac_setpoint(), 5);
    }
}
