//! Demo binary: wires one `app::device::Device` to one `mcu::task::McuNode`
//! over an in-process `LoopbackTransport` pair and drives them through the
//! boot handshake and a few seconds of simulated traffic. Stands in for the
//! real shared-memory mailbox and analog front end, neither of which this
//! crate owns (spec.md §1).

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use ipp_core::app::device::Device;
use ipp_core::config::{Config, N_ADC};
use ipp_core::mcu::state::McuState;
use ipp_core::mcu::task::McuNode;
use ipp_core::transport::{LoopbackTransport, Timeout};

#[derive(Parser, Debug)]
#[command(name = "ipp-core")]
#[command(about = "Demo loopback run of the inter-processor messaging core")]
struct Args {
    /// ADC request cadence in Hz, clamped to [1, 10].
    #[arg(long, default_value_t = Config::default().adc_req_hz)]
    adc_req_hz: u8,

    /// Message size ceiling in bytes.
    #[arg(long, default_value_t = Config::default().max_message_size)]
    max_message_size: usize,

    /// How long to run the demo before tearing everything down.
    #[arg(long, default_value_t = 2000)]
    run_millis: u64,
}

fn main() -> std::process::ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    eprintln!("[ipp-core] starting loopback demo");
    eprintln!("[ipp-core] adc_req_hz={} max_message_size={}", args.adc_req_hz, args.max_message_size);

    let mut config = Config::default();
    config.adc_req_hz = Config::clamp_scan_freq(args.adc_req_hz);
    config.max_message_size = args.max_message_size;

    let (app_side, mcu_side) = LoopbackTransport::pair(config.max_message_size);

    let mcu_state = Arc::new(McuState::new());
    let mcu_done = Arc::new(AtomicBool::new(false));
    let mcu_state_for_thread = mcu_state.clone();
    let mcu_done_for_thread = mcu_done.clone();
    let ring_capacity = config.dac_wf_ring_capacity;
    let low_water_mark = config.dac_wf_low_water_mark;
    let max_message_size = config.max_message_size;

    let mcu_thread = thread::spawn(move || {
        let mut node = McuNode::new(mcu_side, max_message_size, mcu_state_for_thread, ring_capacity, low_water_mark);
        if let Err(e) = node.run_handshake() {
            eprintln!("[mcu] handshake failed: {e}");
            return;
        }
        eprintln!("[mcu] handshake complete");

        let mut tick: u32 = 0;
        while !mcu_done_for_thread.load(Ordering::Relaxed) {
            // No real SPI bus in this demo: synthesize an ADC sample per
            // tick instead of driving `mcu::sampling::Sampler`.
            let values = [0i32; N_ADC].map(|_| i32::from(tick as u16));
            node.state().apply_sample(values, true);
            tick = tick.wrapping_add(1);

            if let Err(e) = node.dispatch_one(Timeout::After(Duration::from_millis(20))) {
                eprintln!("[mcu] dispatch error: {e}");
                break;
            }
            if let Err(e) = node.service_dac_waveform() {
                eprintln!("[mcu] dac waveform service error: {e}");
                break;
            }
        }
        eprintln!("[mcu] shutting down");
    });

    let device = Device::new(app_side, config);
    eprintln!("[app] device proxy started");

    device.write_dac_wf(vec![100, 200, 300, 400], false);
    device.set_scan_freq(args.adc_req_hz);

    thread::sleep(Duration::from_millis(args.run_millis));

    eprintln!("[app] adc0 = {}", device.read_adc(0));
    eprintln!("[app] dout = {:#x}", device.dout_bits());

    mcu_done.store(true, Ordering::Relaxed);
    device.stop();
    mcu_thread.join().map_err(|_| "mcu thread panicked")?;

    eprintln!("[ipp-core] demo finished");
    Ok(())
}
