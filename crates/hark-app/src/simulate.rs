//! `hark simulate`: a scripted wake session over mock collaborators.
//!
//! Each cycle: the trigger detects the voice model, the standard engine
//! starts recognizing, a few capture buffers flow, the adapter confirms, and
//! the caller reads one frame of capture before stopping. With `--with-call`
//! a phone call is held first and the detection attempt is suppressed.

use std::thread;
use std::time::{Duration, Instant};

use hark_core::{EngineKind, HarkConfig, HarkEvent, ModelUuid};
use hark_engine::{AdapterEvent, EngineState, WakeEngine, WAKEUP_SOURCE_CHANNEL};
use hark_service::{MockCollaborators, ServiceContext};
use hark_trigger::{SignalUpdate, TriggerConnector, TriggerModel};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

const STATE_WAIT: Duration = Duration::from_secs(3);

pub fn run(config: HarkConfig, opts: &crate::cli::SimulateArgs) -> AppResult<()> {
    let mocks = MockCollaborators::new();
    mocks
        .connector
        .set_params(WAKEUP_SOURCE_CHANNEL, &opts.channels.to_string())?;

    let frame_bytes = config.capture.min_buffer_size as usize * usize::from(opts.channels.max(1));
    let service = ServiceContext::new(config, mocks.collaborators())?;
    let printer = spawn_printer(service.subscribe());

    service.start()?;
    let engine = service
        .engines()
        .engine(EngineKind::Standard)
        .ok_or("standard engine did not come up")?;
    wait_for(&engine, EngineState::Initialized)?;

    let uuid = ModelUuid::VOICE_WAKEUP;
    service.enable_wakeup(TriggerModel::new(uuid, 1, b"hey hark".to_vec()))?;

    for cycle in 1..=opts.cycles {
        info!(cycle, "Simulation cycle");
        if opts.with_call {
            mocks.telephony.emit(SignalUpdate::CallActive(true));
            let running = service.trigger().arbiter().is_started(uuid);
            info!(cycle, running, "Detection during call");
            mocks.telephony.emit(SignalUpdate::CallActive(false));
        }
        run_cycle(&service, &mocks, &engine, uuid, frame_bytes, opts.channels)?;
    }

    service.disable_wakeup(uuid);
    service.shutdown();
    if printer.join().is_err() {
        warn!("Event printer panicked");
    }
    Ok(())
}

fn run_cycle(
    service: &ServiceContext,
    mocks: &MockCollaborators,
    engine: &WakeEngine,
    uuid: ModelUuid,
    frame_bytes: usize,
    channels: u8,
) -> AppResult<()> {
    let handle = service
        .trigger()
        .arbiter()
        .model_state(uuid)
        .and_then(|state| state.handle())
        .ok_or("voice model is not loaded")?;
    wait_until(|| mocks.connector.is_started(handle))?;

    mocks.connector.detect(handle);
    wait_for(engine, EngineState::Recognizing)?;

    for n in 0..3u8 {
        mocks.capture.push(&pcm_frame(frame_bytes, n));
    }
    mocks
        .adapters
        .adapter(EngineKind::Standard)
        .fire(AdapterEvent::recognize_complete(0, "hey hark"));
    wait_for(engine, EngineState::Recognized)?;

    let mask = if channels > 1 { 0b0010 } else { 0b0001 };
    engine.start_capturer(mask)?;
    let frame = engine.read()?;
    info!(bytes = frame.len(), "Read capture frame");
    engine.stop_capturer()?;
    wait_for(engine, EngineState::Initialized)
}

/// Interleaved 16-bit little-endian ramp.
fn pcm_frame(bytes: usize, seed: u8) -> Vec<u8> {
    (0..bytes / 2)
        .flat_map(|i| ((i as i16).wrapping_mul(97).wrapping_add(i16::from(seed))).to_le_bytes())
        .collect()
}

fn wait_for(engine: &WakeEngine, state: EngineState) -> AppResult<()> {
    wait_until(|| engine.state() == state)
        .map_err(|_| format!("engine stuck in {} waiting for {state}", engine.state()).into())
}

fn wait_until(mut condition: impl FnMut() -> bool) -> AppResult<()> {
    let deadline = Instant::now() + STATE_WAIT;
    while Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(5));
    }
    Err("timed out".into())
}

/// Print events as JSON lines until the service reports it stopped.
fn spawn_printer(mut events: broadcast::Receiver<HarkEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        match events.blocking_recv() {
            Ok(event) => {
                let last = matches!(event, HarkEvent::ServiceStopped { .. });
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                }
                if last {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    })
}
