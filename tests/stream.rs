//! End-to-end stream scenarios driven through the host-service bridge
//! backend with a mock service standing in for the platform glue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aural::host::bridge::{AudioService, Bridge, Endpoint, OpenReply, OpenRequest};
use aural::traits::Api;
use aural::{
    CallbackResult, Error, SampleFormat, StreamMode, StreamOptions, StreamParameters, StreamState,
};

#[derive(Default)]
struct ServiceState {
    endpoint: Option<Endpoint>,
    open_streams: Vec<i32>,
    next_id: i32,
}

struct MockService {
    state: Arc<Mutex<ServiceState>>,
    devices: Vec<String>,
    default_frames: u32,
    min_frames: u32,
}

impl AudioService for MockService {
    fn device_count(&mut self) -> u32 {
        self.devices.len() as u32
    }

    fn device_property(&mut self, device: u32) -> Result<String, Error> {
        self.devices
            .get(device as usize)
            .cloned()
            .ok_or_else(|| Error::InvalidUse("no such device".into()))
    }

    fn open_stream(&mut self, request: &OpenRequest) -> Result<OpenReply, Error> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.open_streams.push(id);
        let frames = if request.frames == 0 {
            if request.minimize_latency {
                self.min_frames
            } else {
                self.default_frames
            }
        } else {
            request.frames
        };
        Ok(OpenReply {
            stream: id,
            frames,
            latency: frames,
        })
    }

    fn start_stream(&mut self, _streams: &[i32], endpoint: Endpoint) -> Result<(), Error> {
        self.state.lock().unwrap().endpoint = Some(endpoint);
        Ok(())
    }

    fn stop_stream(&mut self, _streams: &[i32]) -> Result<Endpoint, Error> {
        self.state
            .lock()
            .unwrap()
            .endpoint
            .take()
            .ok_or_else(|| Error::Failed("the service holds no endpoint".into()))
    }

    fn close_stream(&mut self, stream: i32) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .open_streams
            .retain(|id| *id != stream);
        Ok(())
    }
}

struct Harness {
    api: Arc<Mutex<Bridge>>,
    state: Arc<Mutex<ServiceState>>,
}

fn harness(default_frames: u32) -> Harness {
    let state = Arc::new(Mutex::new(ServiceState::default()));
    let devices = vec![
        r#"{
            "name": "codec",
            "type": "output",
            "sample-rate": [44100, 48000],
            "channels": ["front-left", "front-right"],
            "format": ["int16"],
            "default": true
        }"#
        .to_string(),
        r#"{
            "name": "mic",
            "type": "input",
            "sample-rate": [44100, 48000],
            "channels": ["front-left"],
            "format": ["int16"],
            "default": true
        }"#
        .to_string(),
    ];
    let service = MockService {
        state: Arc::clone(&state),
        devices,
        default_frames,
        min_frames: 64,
    };
    Harness {
        api: Bridge::create(Box::new(service)),
        state,
    }
}

/// Runs one playback block on the service side, returning what the device
/// would have played, or `None` when the service holds no endpoint.
fn pump_playback(state: &Arc<Mutex<ServiceState>>, channels: usize, frames: usize) -> Option<Vec<i16>> {
    let mut guard = state.lock().unwrap();
    let endpoint = guard.endpoint.as_mut()?;
    let mut block = vec![0i16; channels * frames];
    endpoint.playback(&mut block);
    Some(block)
}

fn pump_record(state: &Arc<Mutex<ServiceState>>, block: &[i16]) -> bool {
    let mut guard = state.lock().unwrap();
    match guard.endpoint.as_mut() {
        Some(endpoint) => {
            endpoint.record(block);
            true
        }
        None => false,
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for the stream");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn output_params() -> StreamParameters {
    StreamParameters {
        device: 0,
        channels: 2,
        first_channel: 0,
    }
}

#[test]
fn playback_silence_advances_stream_time() {
    let h = harness(256);
    let callbacks = Arc::new(AtomicUsize::new(0));
    let xruns = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&callbacks);
    let xrun_count = Arc::clone(&xruns);

    let mut block = 256u32;
    {
        let mut api = h.api.lock().unwrap();
        api.open_stream(
            Some(&output_params()),
            None,
            SampleFormat::S16,
            48_000,
            &mut block,
            Box::new(move |mut io| {
                counted.fetch_add(1, Ordering::SeqCst);
                if !io.status.is_empty() {
                    xrun_count.fetch_add(1, Ordering::SeqCst);
                }
                let out = io.output.as_deref_mut().unwrap();
                out.as_slice_mut::<i16>().unwrap().fill(0);
                CallbackResult::Continue
            }),
            &StreamOptions::default(),
        )
        .unwrap();
        assert_eq!(block, 256);
        api.start_stream().unwrap();
    }

    for _ in 0..100 {
        let played = pump_playback(&h.state, 2, 256).unwrap();
        assert!(played.iter().all(|sample| *sample == 0));
    }

    let elapsed = h.api.lock().unwrap().stream_time().unwrap();
    let expected = Duration::from_secs_f64(100.0 * 256.0 / 48_000.0);
    let tolerance = Duration::from_secs_f64(1.0 / 48_000.0);
    assert!(
        elapsed >= expected.saturating_sub(tolerance) && elapsed <= expected + tolerance,
        "stream time {elapsed:?} not within one sample period of {expected:?}"
    );
    assert_eq!(callbacks.load(Ordering::SeqCst), 100);
    assert_eq!(xruns.load(Ordering::SeqCst), 0);

    let mut api = h.api.lock().unwrap();
    api.abort_stream().unwrap();
    api.close_stream().unwrap();
    assert!(h.state.lock().unwrap().open_streams.is_empty());
}

#[test]
fn capture_upconverts_to_the_user_format() {
    let h = harness(4);
    let captured: Arc<Mutex<Vec<Vec<f32>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);

    let mut block = 0u32;
    {
        let mut api = h.api.lock().unwrap();
        api.open_stream(
            None,
            Some(&StreamParameters {
                device: 1,
                channels: 1,
                first_channel: 0,
            }),
            SampleFormat::F32,
            44_100,
            &mut block,
            Box::new(move |io| {
                let input = io.input.unwrap();
                sink.lock()
                    .unwrap()
                    .push(input.as_slice::<f32>().unwrap().to_vec());
                CallbackResult::Continue
            }),
            &StreamOptions::default(),
        )
        .unwrap();
        assert_eq!(block, 4, "a zero request takes the service block size");
        api.start_stream().unwrap();
    }

    // The callback leads the capture by one block: the samples pushed in
    // cycle N reach the client in cycle N + 1.
    let device_block = [i16::MAX, 0, i16::MIN, 0];
    assert!(pump_record(&h.state, &device_block));
    assert!(pump_record(&h.state, &device_block));

    let blocks = captured.lock().unwrap();
    let last = blocks.last().unwrap();
    let expected = [1.0f32, 0.0, -1.0, 0.0];
    for (got, want) in last.iter().zip(expected) {
        assert!(
            (got - want).abs() <= 1.0 / 32_768.0,
            "captured {got} instead of {want}"
        );
    }
    drop(blocks);

    let mut api = h.api.lock().unwrap();
    api.stop_stream().unwrap();
    api.close_stream().unwrap();
}

#[test]
fn duplex_loopback_round_trips_within_quantization() {
    let h = harness(8);
    let mut block = 8u32;
    {
        let mut api = h.api.lock().unwrap();
        api.open_stream(
            Some(&output_params()),
            Some(&output_params()),
            SampleFormat::F32,
            48_000,
            &mut block,
            Box::new(|mut io| {
                let frames = io.frames;
                let input = io.input.unwrap().as_slice::<f32>().unwrap().to_owned();
                let out = io.output.as_deref_mut().unwrap();
                out.as_slice_mut::<f32>().unwrap()[..frames * 2]
                    .copy_from_slice(&input[..frames * 2]);
                CallbackResult::Continue
            }),
            &StreamOptions::default(),
        )
        .unwrap();
        assert_eq!(api.stream().mode(), StreamMode::Duplex);
        api.start_stream().unwrap();
    }

    let blocks: Arc<Mutex<Vec<(Vec<i16>, Vec<i16>)>>> = Arc::new(Mutex::new(Vec::new()));
    let pump_blocks = Arc::clone(&blocks);
    let pump_state = Arc::clone(&h.state);
    let pump = std::thread::spawn(move || {
        let mut index = 0i16;
        loop {
            let mut guard = pump_state.lock().unwrap();
            let Some(endpoint) = guard.endpoint.as_mut() else {
                break;
            };
            let src: Vec<i16> = (0..16).map(|s| index * 31 + s).collect();
            endpoint.record(&src);
            let mut dst = vec![0i16; 16];
            endpoint.playback(&mut dst);
            drop(guard);
            pump_blocks.lock().unwrap().push((src, dst));
            index += 1;
            std::thread::sleep(Duration::from_micros(200));
        }
    });

    wait_until(|| blocks.lock().unwrap().len() >= 12);
    h.api.lock().unwrap().stop_stream().unwrap();
    pump.join().unwrap();

    let blocks = blocks.lock().unwrap();
    // The loopback is one block behind: cycle N plays what cycle N - 1
    // recorded, exactly, because every i16 survives the f32 round trip.
    for n in 1..10 {
        let (previous_src, _) = &blocks[n - 1];
        let (_, dst) = &blocks[n];
        assert_eq!(dst, previous_src, "block {n} did not loop back");
    }
    drop(blocks);

    let mut api = h.api.lock().unwrap();
    api.close_stream().unwrap();
    assert!(h.state.lock().unwrap().open_streams.is_empty());
}

#[test]
fn drain_request_flushes_two_silent_blocks_then_stops() {
    let h = harness(32);
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);

    let mut block = 32u32;
    {
        let mut api = h.api.lock().unwrap();
        api.open_stream(
            Some(&StreamParameters {
                device: 0,
                channels: 1,
                first_channel: 0,
            }),
            None,
            SampleFormat::S16,
            48_000,
            &mut block,
            Box::new(move |mut io| {
                let invocation = counted.fetch_add(1, Ordering::SeqCst);
                let out = io.output.as_deref_mut().unwrap();
                out.as_slice_mut::<i16>().unwrap().fill(1_000);
                if invocation == 4 {
                    CallbackResult::Drain
                } else {
                    CallbackResult::Continue
                }
            }),
            &StreamOptions::default(),
        )
        .unwrap();
        api.start_stream().unwrap();
    }

    let mut played = Vec::new();
    loop {
        match pump_playback(&h.state, 1, 32) {
            Some(block) => played.push(block),
            None => break,
        }
        assert!(played.len() < 64, "drain never completed");
        std::thread::sleep(Duration::from_micros(200));
    }
    wait_until(|| !h.api.lock().unwrap().is_stream_running());

    // Block 4 carries the final callback data, then exactly two blocks of
    // flush silence reach the device before the stop.
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(played[4].iter().all(|sample| *sample == 1_000));
    assert!(played.len() >= 7);
    assert!(played[5].iter().all(|sample| *sample == 0));
    assert!(played[6].iter().all(|sample| *sample == 0));

    {
        let api = h.api.lock().unwrap();
        assert!(api.is_stream_open());
        assert_eq!(api.stream().state(), StreamState::Stopped);
    }
    let paused_at = h.api.lock().unwrap().stream_time().unwrap();
    assert!(paused_at > Duration::ZERO);

    // A stopped-by-drain stream restarts, and stream time resumes from its
    // paused value instead of resetting.
    h.api.lock().unwrap().start_stream().unwrap();
    assert!(pump_playback(&h.state, 1, 32).is_some());
    let resumed = h.api.lock().unwrap().stream_time().unwrap();
    assert!(resumed >= paused_at);
    assert!(calls.load(Ordering::SeqCst) > 5);

    let mut api = h.api.lock().unwrap();
    api.abort_stream().unwrap();
    api.close_stream().unwrap();
}

#[test]
fn an_xrun_is_reported_exactly_once() {
    let h = harness(16);
    let statuses: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);

    let mut block = 16u32;
    {
        let mut api = h.api.lock().unwrap();
        api.open_stream(
            Some(&output_params()),
            None,
            SampleFormat::S16,
            48_000,
            &mut block,
            Box::new(move |mut io| {
                sink.lock().unwrap().push(io.status.output_underflow);
                let out = io.output.as_deref_mut().unwrap();
                out.as_slice_mut::<i16>().unwrap().fill(0);
                CallbackResult::Continue
            }),
            &StreamOptions::default(),
        )
        .unwrap();
        api.start_stream().unwrap();
    }

    pump_playback(&h.state, 2, 16).unwrap();
    h.state
        .lock()
        .unwrap()
        .endpoint
        .as_mut()
        .unwrap()
        .report_xrun();
    pump_playback(&h.state, 2, 16).unwrap();
    pump_playback(&h.state, 2, 16).unwrap();

    assert_eq!(*statuses.lock().unwrap(), vec![false, true, false]);

    let mut api = h.api.lock().unwrap();
    api.abort_stream().unwrap();
    api.close_stream().unwrap();
}

#[test]
fn abort_discards_pending_output() {
    let h = harness(16);
    let mut block = 16u32;
    {
        let mut api = h.api.lock().unwrap();
        api.open_stream(
            Some(&output_params()),
            None,
            SampleFormat::S16,
            48_000,
            &mut block,
            Box::new(|mut io| {
                let out = io.output.as_deref_mut().unwrap();
                out.as_slice_mut::<i16>().unwrap().fill(7);
                CallbackResult::Continue
            }),
            &StreamOptions::default(),
        )
        .unwrap();
        api.start_stream().unwrap();
    }

    for _ in 0..3 {
        let played = pump_playback(&h.state, 2, 16).unwrap();
        assert!(played.iter().all(|sample| *sample == 7));
    }

    // Abort skips the drain handshake entirely: no pump is running and the
    // call must still return promptly, with the endpoint repossessed so no
    // further client samples can reach the device.
    h.api.lock().unwrap().abort_stream().unwrap();
    assert!(pump_playback(&h.state, 2, 16).is_none());
    assert!(!h.api.lock().unwrap().is_stream_running());

    let mut api = h.api.lock().unwrap();
    api.close_stream().unwrap();
}

#[test]
fn zero_block_requests_take_the_service_size() {
    let h = harness(512);
    let mut block = 0u32;
    let mut api = h.api.lock().unwrap();
    api.open_stream(
        Some(&output_params()),
        None,
        SampleFormat::S16,
        48_000,
        &mut block,
        Box::new(|_| CallbackResult::Continue),
        &StreamOptions::default(),
    )
    .unwrap();
    assert_eq!(block, 512);
    api.close_stream().unwrap();

    // With the latency flag the service answers with its smallest block.
    let mut block = 0u32;
    let mut options = StreamOptions::default();
    options.flags.minimize_latency = true;
    api.open_stream(
        Some(&output_params()),
        None,
        SampleFormat::S16,
        48_000,
        &mut block,
        Box::new(|_| CallbackResult::Continue),
        &options,
    )
    .unwrap();
    assert_eq!(block, 64);
    api.close_stream().unwrap();
}

#[test]
fn channel_range_overflow_is_rejected_without_side_effects() {
    let h = harness(128);
    let mut block = 128u32;
    let mut api = h.api.lock().unwrap();
    let err = api
        .open_stream(
            Some(&StreamParameters {
                device: 0,
                channels: 2,
                first_channel: 1,
            }),
            None,
            SampleFormat::S16,
            48_000,
            &mut block,
            Box::new(|_| CallbackResult::Continue),
            &StreamOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidUse(_)));
    assert_eq!(api.stream().state(), StreamState::Closed);
    assert!(h.state.lock().unwrap().open_streams.is_empty());
}

#[test]
fn cross_device_duplex_is_invalid_use() {
    let h = harness(128);
    let mut block = 128u32;
    let mut api = h.api.lock().unwrap();
    let err = api
        .open_stream(
            Some(&output_params()),
            Some(&StreamParameters {
                device: 1,
                channels: 1,
                first_channel: 0,
            }),
            SampleFormat::S16,
            48_000,
            &mut block,
            Box::new(|_| CallbackResult::Continue),
            &StreamOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidUse(_)));
    assert_eq!(api.stream().state(), StreamState::Closed);
}

#[test]
fn state_misuse_warns_and_leaves_the_stream_consistent() {
    let h = harness(64);
    let mut block = 64u32;
    let mut api = h.api.lock().unwrap();
    api.open_stream(
        Some(&output_params()),
        None,
        SampleFormat::S16,
        48_000,
        &mut block,
        Box::new(|_| CallbackResult::Continue),
        &StreamOptions::default(),
    )
    .unwrap();

    // A second open while one is up is a hard error.
    let err = api
        .open_stream(
            Some(&output_params()),
            None,
            SampleFormat::S16,
            48_000,
            &mut block,
            Box::new(|_| CallbackResult::Continue),
            &StreamOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidUse(_)));
    assert!(api.is_stream_open());

    // Redundant transitions are warnings.
    api.start_stream().unwrap();
    assert!(matches!(api.start_stream(), Err(Error::Warning(_))));
    api.abort_stream().unwrap();
    assert!(matches!(api.stop_stream(), Err(Error::Warning(_))));

    // Close is idempotent: the first call succeeds, the second warns, and
    // both leave the stream closed.
    api.close_stream().unwrap();
    assert_eq!(api.stream().state(), StreamState::Closed);
    assert!(matches!(api.close_stream(), Err(Error::Warning(_))));
    assert_eq!(api.stream().state(), StreamState::Closed);

    // With the stream closed every query is invalid use and no service
    // resources linger.
    assert!(matches!(api.stream_time(), Err(Error::InvalidUse(_))));
    assert!(matches!(api.stream_sample_rate(), Err(Error::InvalidUse(_))));
    assert!(h.state.lock().unwrap().open_streams.is_empty());
}

#[test]
fn open_then_close_without_start_releases_everything() {
    let h = harness(64);
    let mut block = 64u32;
    let mut api = h.api.lock().unwrap();
    api.open_stream(
        Some(&output_params()),
        None,
        SampleFormat::F32,
        44_100,
        &mut block,
        Box::new(|_| CallbackResult::Continue),
        &StreamOptions::default(),
    )
    .unwrap();
    assert_eq!(api.stream_sample_rate().unwrap(), 44_100);
    assert_eq!(api.stream_latency().unwrap(), 64);
    api.close_stream().unwrap();
    assert!(h.state.lock().unwrap().open_streams.is_empty());
    assert!(!api.is_stream_open());
}
