//! The stream engine shared by every backend.
//!
//! A stream is split across two halves with different owners:
//!
//! - [`StreamCore`] lives inside the backend (behind the stream mutex) and
//!   holds the configuration slots, the staged buffers and the state
//!   machine. Client-thread operations go through it.
//! - [`StreamProcess`] is the block handler. It owns the user buffers, the
//!   device scratch buffer and the client callback, and is handed to the
//!   backend's real-time context at start and returned at stop, so the
//!   audio thread can run without touching the stream mutex at all.
//!
//! The two halves meet in `SharedState`: a small set of atomics plus the
//! stop semaphore. `start` publishes every prior write with a release store
//! on the state; the audio thread's acquire load of the state is the other
//! half of that handshake.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::conversion::{byte_swap_buffer, convert_buffer, ConvertInfo};
use crate::interface::ApiObject;
use crate::{
    CallbackResult, SampleFormat, Samples, Side, StreamCallback, StreamData, StreamMode,
    StreamState, StreamStatus, Error,
};

pub(crate) const OUTPUT: usize = 0;
pub(crate) const INPUT: usize = 1;

/// What the backend's native callback should do after a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Control {
    Continue,
    Quit,
}

/// Byte storage aligned for any supported sample primitive, so the same
/// region can be viewed as `i16`, `f64`, or anything in between.
#[derive(Debug, Default)]
pub(crate) struct AlignedBuffer {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBuffer {
    pub(crate) fn new() -> AlignedBuffer {
        AlignedBuffer::default()
    }

    /// Reallocates to exactly `len` zeroed bytes.
    pub(crate) fn resize(&mut self, len: usize) {
        self.words = vec![0; len.div_ceil(8)];
        self.len = len;
    }

    /// Grows to at least `len` zeroed bytes, never shrinking.
    pub(crate) fn grow(&mut self, len: usize) {
        if len > self.len {
            self.resize(len);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast(), self.len) }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast(), self.len) }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut () {
        self.words.as_mut_ptr().cast()
    }
}

/// Single-permit semaphore for the stop handshake.
///
/// The audio thread posts, a stopping client thread waits. The internal
/// mutex is private to the semaphore and held only for the few
/// instructions around the counter, so posting from the audio thread stays
/// bounded.
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    permits: Mutex<u32>,
    ready: Condvar,
}

impl Semaphore {
    fn guard(&self) -> MutexGuard<'_, u32> {
        self.permits.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn post(&self) {
        *self.guard() += 1;
        self.ready.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut permits = self.guard();
        while *permits == 0 {
            permits = self.ready.wait(permits).unwrap_or_else(|e| e.into_inner());
        }
        *permits -= 1;
    }
}

/// Stream state every thread may touch without the stream mutex.
#[derive(Debug)]
pub(crate) struct SharedState {
    state: AtomicU8,
    /// Blocks processed since a stop was requested; see the drain protocol
    /// in `StreamProcess::cycle`.
    drain_counter: AtomicU32,
    /// Whether the drain was initiated by the callback rather than a
    /// client-thread stop.
    internal_drain: AtomicBool,
    xrun: [AtomicBool; 2],
    stream_nanos: AtomicU64,
    pub(crate) stop_gate: Semaphore,
}

impl SharedState {
    fn new() -> SharedState {
        SharedState {
            state: AtomicU8::new(StreamState::Closed as u8),
            drain_counter: AtomicU32::new(0),
            internal_drain: AtomicBool::new(false),
            xrun: [AtomicBool::new(false), AtomicBool::new(false)],
            stream_nanos: AtomicU64::new(0),
            stop_gate: Semaphore::default(),
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn drain(&self) -> u32 {
        self.drain_counter.load(Ordering::Acquire)
    }

    pub(crate) fn set_drain(&self, value: u32) {
        self.drain_counter.store(value, Ordering::Release);
    }

    pub(crate) fn bump_drain(&self) {
        self.drain_counter.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn internal_drain(&self) -> bool {
        self.internal_drain.load(Ordering::Acquire)
    }

    pub(crate) fn set_internal_drain(&self, value: bool) {
        self.internal_drain.store(value, Ordering::Release);
    }

    pub(crate) fn reset_drain(&self) {
        self.set_drain(0);
        self.set_internal_drain(false);
    }

    /// Records an xrun for the next callback to report.
    pub(crate) fn mark_xrun(&self, side: Side) {
        self.xrun[side.index()].store(true, Ordering::Release);
    }

    fn take_xrun(&self, side: Side) -> bool {
        self.xrun[side.index()].swap(false, Ordering::AcqRel)
    }

    pub(crate) fn clear_xruns(&self) {
        self.xrun[OUTPUT].store(false, Ordering::Release);
        self.xrun[INPUT].store(false, Ordering::Release);
    }

    /// Advances stream time by one block.
    pub(crate) fn tick(&self, frames: usize, sample_rate: u32) {
        if sample_rate == 0 {
            return;
        }
        let nanos = frames as u64 * 1_000_000_000 / sample_rate as u64;
        self.stream_nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    pub(crate) fn stream_time(&self) -> Duration {
        Duration::from_nanos(self.stream_nanos.load(Ordering::Acquire))
    }

    pub(crate) fn reset_time(&self) {
        self.stream_nanos.store(0, Ordering::Release);
    }
}

/// Configuration the engine tracks for one active side of a stream.
#[derive(Clone, Debug)]
pub(crate) struct SideSlot {
    pub device: u32,
    pub user_channels: usize,
    pub device_channels: usize,
    pub first_channel: usize,
    pub device_format: SampleFormat,
    pub device_interleaved: bool,
    pub byte_swap: bool,
    pub convert: bool,
    /// Frames of latency the backend reported for this side.
    pub latency: usize,
    pub convert_info: ConvertInfo,
}

impl SideSlot {
    pub(crate) fn new(
        device: u32,
        channels: usize,
        first_channel: usize,
        device_format: SampleFormat,
        device_interleaved: bool,
        byte_swap: bool,
        latency: usize,
    ) -> SideSlot {
        SideSlot {
            device,
            user_channels: channels,
            device_channels: channels,
            first_channel,
            device_format,
            device_interleaved,
            byte_swap,
            convert: false,
            latency,
            convert_info: ConvertInfo::default(),
        }
    }
}

/// The client-thread half of a stream: configuration slots, staged
/// buffers, and the state machine. Backends embed one of these and reach
/// it through [`Api::stream`](crate::traits::Api::stream).
pub struct StreamCore {
    pub(crate) mode: StreamMode,
    pub(crate) user_format: SampleFormat,
    pub(crate) user_interleaved: bool,
    pub(crate) sample_rate: u32,
    pub(crate) block_size: usize,
    pub(crate) buffer_count: u32,
    pub(crate) sides: [Option<SideSlot>; 2],
    user_buffer: [AlignedBuffer; 2],
    scratch: AlignedBuffer,
    process: Option<StreamProcess>,
    shared: Arc<SharedState>,
}

impl Default for StreamCore {
    fn default() -> StreamCore {
        StreamCore::new()
    }
}

impl StreamCore {
    pub(crate) fn new() -> StreamCore {
        StreamCore {
            mode: StreamMode::Unknown,
            user_format: SampleFormat::S16,
            user_interleaved: true,
            sample_rate: 0,
            block_size: 0,
            buffer_count: 0,
            sides: [None, None],
            user_buffer: [AlignedBuffer::new(), AlignedBuffer::new()],
            scratch: AlignedBuffer::new(),
            process: None,
            shared: Arc::new(SharedState::new()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Which directions the stream covers.
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// `true` unless the stream is closed.
    pub fn is_open(&self) -> bool {
        self.state() != StreamState::Closed
    }

    /// `true` while the backend is delivering callbacks.
    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    /// The sample rate in effect, captured at open.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// The block size in effect, captured at open.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Elapsed stream time: the sum of all delivered blocks, carried across
    /// stop/start and reset at close.
    pub fn stream_time(&self) -> Duration {
        self.shared.stream_time()
    }

    /// Total latency in frames across the active sides.
    pub fn latency(&self) -> usize {
        self.sides.iter().flatten().map(|slot| slot.latency).sum()
    }

    /// The device id one side was opened on, `None` for an inactive side.
    pub fn device(&self, side: Side) -> Option<u32> {
        self.sides[side.index()].as_ref().map(|slot| slot.device)
    }

    /// The suggested device buffer count recorded at open.
    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub(crate) fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    pub(crate) fn verify_open(&self) -> Result<(), Error> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::InvalidUse("no open stream".into()))
        }
    }

    /// Records a probed side. The first side fixes the stream's sample
    /// rate and block size; a second side must agree with both.
    pub(crate) fn install_side(
        &mut self,
        side: Side,
        slot: SideSlot,
        sample_rate: u32,
        block_size: usize,
    ) -> Result<(), Error> {
        let other_active = self.sides[1 - side.index()].is_some();
        if other_active {
            if self.sample_rate != sample_rate {
                return Err(Error::InvalidUse(
                    "duplex sides must share one sample rate".into(),
                ));
            }
            if self.block_size != block_size {
                return Err(Error::InvalidUse(
                    "duplex sides must share one block size".into(),
                ));
            }
        } else {
            self.sample_rate = sample_rate;
            self.block_size = block_size;
        }
        self.sides[side.index()] = Some(slot);
        self.mode = match (self.sides[OUTPUT].is_some(), self.sides[INPUT].is_some()) {
            (true, true) => StreamMode::Duplex,
            (true, false) => StreamMode::Output,
            (false, true) => StreamMode::Input,
            (false, false) => StreamMode::Unknown,
        };
        Ok(())
    }

    /// Decides the conversion flag, builds the routing table and allocates
    /// buffers for an installed side. `routing_offset` is the first-channel
    /// offset realized through the conversion table; backends that route
    /// channels natively (for example by picking ports) pass zero.
    pub(crate) fn finalize_side(&mut self, side: Side, routing_offset: usize) -> Result<(), Error> {
        let block = self.block_size;
        let user_format = self.user_format;
        let user_interleaved = self.user_interleaved;

        let (user_channels, buffer_bytes) = {
            let slot = self.sides[side.index()]
                .as_mut()
                .ok_or_else(|| Error::Failed("stream side was not probed".into()))?;
            slot.convert = user_format != slot.device_format
                || slot.byte_swap
                || slot.user_channels != slot.device_channels
                || (user_interleaved != slot.device_interleaved && slot.user_channels > 1);
            if slot.convert {
                slot.convert_info = build_convert_info(
                    side,
                    slot,
                    user_format,
                    user_interleaved,
                    block,
                    routing_offset,
                );
            }
            let sample_bytes = user_format
                .sample_size()
                .max(slot.device_format.sample_size());
            (slot.user_channels, slot.user_channels * block * sample_bytes)
        };
        debug_assert!(user_channels > 0);
        self.user_buffer[side.index()].resize(buffer_bytes);

        // The scratch buffer covers the device-shape needs of every
        // converting side, and always the output side so the drain path has
        // a silence source to scatter from.
        let mut scratch_bytes = 0;
        for (index, slot) in self.sides.iter().enumerate() {
            if let Some(slot) = slot {
                if slot.convert || index == OUTPUT {
                    scratch_bytes = scratch_bytes
                        .max(slot.device_channels * block * slot.device_format.sample_size());
                }
            }
        }
        self.scratch.grow(scratch_bytes);

        self.shared.set_state(StreamState::Stopped);
        Ok(())
    }

    /// Assembles the block handler from the staged buffers and the client
    /// callback. Called once, after every side has been probed.
    pub(crate) fn build_process(
        &mut self,
        callback: StreamCallback,
        api: Option<Weak<ApiObject>>,
    ) {
        let mut sides: [Option<ProcessSide>; 2] = [None, None];
        for index in 0..2 {
            if let Some(slot) = &self.sides[index] {
                sides[index] = Some(ProcessSide {
                    user_buffer: std::mem::take(&mut self.user_buffer[index]),
                    device_channels: slot.device_channels,
                    user_channels: slot.user_channels,
                    device_format: slot.device_format,
                    device_interleaved: slot.device_interleaved,
                    convert: slot.convert,
                    byte_swap: slot.byte_swap,
                    convert_info: slot.convert_info.clone(),
                });
            }
        }
        self.process = Some(StreamProcess {
            mode: self.mode,
            block_size: self.block_size,
            sample_rate: self.sample_rate,
            user_format: self.user_format,
            callback,
            sides,
            scratch: std::mem::take(&mut self.scratch),
            shared: Arc::clone(&self.shared),
            api,
        });
    }

    /// Hands the block handler to the backend for the duration of a run.
    pub(crate) fn take_process(&mut self) -> Option<StreamProcess> {
        self.process.take()
    }

    /// Returns the block handler after the backend deactivated, keeping the
    /// stream restartable.
    pub(crate) fn restore_process(&mut self, process: StreamProcess) {
        self.process = Some(process);
    }

    /// Releases everything and returns the state machine to closed. After
    /// this call the stream holds no buffers and stream time reads zero.
    pub(crate) fn clear_stream(&mut self) {
        self.mode = StreamMode::Unknown;
        self.sample_rate = 0;
        self.block_size = 0;
        self.buffer_count = 0;
        self.sides = [None, None];
        self.user_buffer = [AlignedBuffer::new(), AlignedBuffer::new()];
        self.scratch = AlignedBuffer::new();
        self.process = None;
        self.shared.reset_drain();
        self.shared.clear_xruns();
        self.shared.reset_time();
        self.shared.set_state(StreamState::Closed);
    }

    #[cfg(test)]
    pub(crate) fn scratch_len(&self) -> usize {
        self.scratch.len()
    }
}

/// Per-side state the audio thread works with.
struct ProcessSide {
    user_buffer: AlignedBuffer,
    device_channels: usize,
    user_channels: usize,
    device_format: SampleFormat,
    device_interleaved: bool,
    convert: bool,
    byte_swap: bool,
    convert_info: ConvertInfo,
}

/// The audio-thread half of a stream.
///
/// Owned by the backend's real-time context between start and stop. The
/// backend calls its `cycle` method once per native block with
/// closures that move bytes between the engine's device-shaped buffers and
/// the native ones; for a planar device each closure call carries one
/// channel, for an interleaved device a single call carries the whole
/// block.
pub struct StreamProcess {
    mode: StreamMode,
    block_size: usize,
    sample_rate: u32,
    user_format: SampleFormat,
    callback: StreamCallback,
    sides: [Option<ProcessSide>; 2],
    scratch: AlignedBuffer,
    shared: Arc<SharedState>,
    api: Option<Weak<ApiObject>>,
}

impl StreamProcess {
    /// Runs the engine's per-block protocol.
    ///
    /// `gather(channel, dst)` must fill `dst` with captured device bytes;
    /// `scatter(channel, src)` must deliver `src` to the device. Neither
    /// closure is called for a direction the stream does not cover.
    pub(crate) fn cycle<G, S>(&mut self, frames: usize, mut gather: G, mut scatter: S) -> Control
    where
        G: FnMut(usize, &mut [u8]),
        S: FnMut(usize, &[u8]),
    {
        match self.shared.state() {
            StreamState::Stopped | StreamState::Stopping => {
                if let Some(side) = self.sides[OUTPUT].as_ref() {
                    emit_silence(side, &mut self.scratch, frames, &mut scatter);
                }
                return Control::Continue;
            }
            StreamState::Closed => {
                log::error!("audio callback invoked on a closed stream");
                return Control::Quit;
            }
            StreamState::Running => {}
        }
        if frames != self.block_size {
            log::error!(
                "native block size changed mid-stream ({frames} frames, expected {})",
                self.block_size
            );
            return Control::Quit;
        }

        // Drain finished: hand control back to whoever asked for the stop.
        if self.shared.drain() > 3 {
            self.shared.set_state(StreamState::Stopping);
            if self.shared.internal_drain() {
                self.spawn_stop();
            } else {
                self.shared.stop_gate.post();
            }
            return Control::Continue;
        }

        if self.shared.drain() == 0 {
            let status = self.collect_status();
            let now = self.shared.stream_time();
            match self.invoke_callback(frames, now, status) {
                CallbackResult::Continue => {}
                CallbackResult::Drain => {
                    self.shared.set_drain(1);
                    self.shared.set_internal_drain(true);
                }
                CallbackResult::StopNow => {
                    self.shared.set_state(StreamState::Stopping);
                    self.shared.set_drain(2);
                    self.spawn_stop();
                    return Control::Continue;
                }
            }
        }

        if let Some(side) = self.sides[OUTPUT].as_mut() {
            if self.shared.drain() > 1 {
                emit_silence(side, &mut self.scratch, frames, &mut scatter);
            } else {
                write_output(side, &mut self.scratch, frames, &mut scatter);
            }
            if self.shared.drain() > 0 {
                // Draining: skip capture, keep the clock moving.
                self.shared.bump_drain();
                self.shared.tick(frames, self.sample_rate);
                return Control::Continue;
            }
        }

        if let Some(side) = self.sides[INPUT].as_mut() {
            read_input(side, &mut self.scratch, frames, &mut gather);
        }

        // An input-only drain has no output branch to advance the counter.
        if self.shared.drain() > 0 {
            self.shared.bump_drain();
        }

        self.shared.tick(frames, self.sample_rate);
        Control::Continue
    }

    fn collect_status(&self) -> StreamStatus {
        let mut status = StreamStatus::default();
        if self.mode != StreamMode::Input && self.shared.take_xrun(Side::Output) {
            status.output_underflow = true;
        }
        if self.mode != StreamMode::Output && self.shared.take_xrun(Side::Input) {
            status.input_overflow = true;
        }
        status
    }

    fn invoke_callback(
        &mut self,
        frames: usize,
        now: Duration,
        status: StreamStatus,
    ) -> CallbackResult {
        let user_format = self.user_format;
        let (output_sides, input_sides) = self.sides.split_at_mut(1);
        let mut output_view = output_sides[0].as_mut().map(|side| unsafe {
            Samples::from_parts(
                side.user_buffer.as_mut_ptr(),
                side.user_channels * frames,
                user_format,
            )
        });
        let input_view = input_sides[0].as_mut().map(|side| unsafe {
            Samples::from_parts(
                side.user_buffer.as_mut_ptr(),
                side.user_channels * frames,
                user_format,
            )
        });
        (self.callback)(StreamData {
            input: input_view.as_ref(),
            input_time: now,
            output: output_view.as_mut(),
            output_time: now,
            frames,
            status,
        })
    }

    /// Detaches a helper thread that performs the stop the audio thread
    /// itself must not execute.
    fn spawn_stop(&self) {
        let Some(weak) = self.api.clone() else {
            log::warn!("stream requested an asynchronous stop but no control handle is attached");
            return;
        };
        std::thread::spawn(move || {
            if let Some(api) = weak.upgrade() {
                let mut api = api.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(err) = api.stop_stream() {
                    if !err.is_warning() {
                        log::error!("asynchronous stop failed: {err}");
                    }
                }
            }
        });
    }
}

fn write_output<S>(side: &mut ProcessSide, scratch: &mut AlignedBuffer, frames: usize, scatter: &mut S)
where
    S: FnMut(usize, &[u8]),
{
    let channel_bytes = frames * side.device_format.sample_size();
    if side.convert {
        let needed = side.device_channels * channel_bytes;
        convert_buffer(
            &mut scratch.bytes_mut()[..needed],
            side.user_buffer.bytes(),
            &side.convert_info,
            frames,
        );
        if side.byte_swap {
            byte_swap_buffer(&mut scratch.bytes_mut()[..needed], side.device_format);
        }
        if side.device_interleaved {
            scatter(0, &scratch.bytes()[..needed]);
        } else {
            for ch in 0..side.device_channels {
                scatter(ch, &scratch.bytes()[ch * channel_bytes..(ch + 1) * channel_bytes]);
            }
        }
    } else if side.device_interleaved {
        scatter(0, &side.user_buffer.bytes()[..side.user_channels * channel_bytes]);
    } else {
        for ch in 0..side.user_channels {
            scatter(
                ch,
                &side.user_buffer.bytes()[ch * channel_bytes..(ch + 1) * channel_bytes],
            );
        }
    }
}

fn read_input<G>(side: &mut ProcessSide, scratch: &mut AlignedBuffer, frames: usize, gather: &mut G)
where
    G: FnMut(usize, &mut [u8]),
{
    let channel_bytes = frames * side.device_format.sample_size();
    if side.convert {
        let needed = side.device_channels * channel_bytes;
        if side.device_interleaved {
            gather(0, &mut scratch.bytes_mut()[..needed]);
        } else {
            for ch in 0..side.device_channels {
                gather(
                    ch,
                    &mut scratch.bytes_mut()[ch * channel_bytes..(ch + 1) * channel_bytes],
                );
            }
        }
        if side.byte_swap {
            byte_swap_buffer(&mut scratch.bytes_mut()[..needed], side.device_format);
        }
        convert_buffer(
            side.user_buffer.bytes_mut(),
            &scratch.bytes()[..needed],
            &side.convert_info,
            frames,
        );
    } else if side.device_interleaved {
        gather(0, &mut side.user_buffer.bytes_mut()[..side.user_channels * channel_bytes]);
    } else {
        for ch in 0..side.user_channels {
            gather(
                ch,
                &mut side.user_buffer.bytes_mut()[ch * channel_bytes..(ch + 1) * channel_bytes],
            );
        }
    }
}

fn emit_silence<S>(side: &ProcessSide, scratch: &mut AlignedBuffer, frames: usize, scatter: &mut S)
where
    S: FnMut(usize, &[u8]),
{
    let channel_bytes = frames * side.device_format.sample_size();
    let needed = side.device_channels * channel_bytes;
    scratch.bytes_mut()[..needed].fill(0);
    if side.device_interleaved {
        scatter(0, &scratch.bytes()[..needed]);
    } else {
        for ch in 0..side.device_channels {
            scatter(ch, &scratch.bytes()[ch * channel_bytes..(ch + 1) * channel_bytes]);
        }
    }
}

/// Routing table construction, shared by every backend.
///
/// Jumps start out as the interleaved channel counts of the two regions;
/// whichever region is planar gets its jump forced to one and its offsets
/// spaced a block apart. The device-side offsets absorb `routing_offset`
/// when the backend cannot route channels natively.
fn build_convert_info(
    side: Side,
    slot: &SideSlot,
    user_format: SampleFormat,
    user_interleaved: bool,
    block: usize,
    routing_offset: usize,
) -> ConvertInfo {
    let mut info = ConvertInfo::default();
    match side {
        Side::Output => {
            info.in_jump = slot.user_channels;
            info.out_jump = slot.device_channels;
            info.in_format = user_format;
            info.out_format = slot.device_format;
        }
        Side::Input => {
            info.in_jump = slot.device_channels;
            info.out_jump = slot.user_channels;
            info.in_format = slot.device_format;
            info.out_format = user_format;
        }
    }
    info.channels = info.in_jump.min(info.out_jump);

    if slot.device_interleaved != user_interleaved {
        let dest_interleaved = match side {
            Side::Output => slot.device_interleaved,
            Side::Input => user_interleaved,
        };
        if dest_interleaved {
            for ch in 0..info.channels {
                info.in_offset.push(ch * block);
                info.out_offset.push(ch);
            }
            info.in_jump = 1;
        } else {
            for ch in 0..info.channels {
                info.in_offset.push(ch);
                info.out_offset.push(ch * block);
            }
            info.out_jump = 1;
        }
    } else if user_interleaved {
        for ch in 0..info.channels {
            info.in_offset.push(ch);
            info.out_offset.push(ch);
        }
    } else {
        for ch in 0..info.channels {
            info.in_offset.push(ch * block);
            info.out_offset.push(ch * block);
        }
        info.in_jump = 1;
        info.out_jump = 1;
    }

    if routing_offset > 0 {
        let device_offsets = match side {
            Side::Output => &mut info.out_offset,
            Side::Input => &mut info.in_offset,
        };
        let step = if slot.device_interleaved {
            routing_offset
        } else {
            routing_offset * block
        };
        for offset in device_offsets.iter_mut() {
            *offset += step;
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(
        channels: usize,
        device_format: SampleFormat,
        device_interleaved: bool,
    ) -> SideSlot {
        SideSlot::new(0, channels, 0, device_format, device_interleaved, false, 0)
    }

    #[test]
    fn interleaved_user_to_planar_device() {
        let info = build_convert_info(
            Side::Output,
            &slot(2, SampleFormat::F32, false),
            SampleFormat::S16,
            true,
            4,
            0,
        );
        assert_eq!(info.channels, 2);
        assert_eq!(info.in_jump, 2);
        assert_eq!(info.out_jump, 1);
        assert_eq!(info.in_offset, vec![0, 1]);
        assert_eq!(info.out_offset, vec![0, 4]);
    }

    #[test]
    fn planar_device_to_interleaved_user() {
        let info = build_convert_info(
            Side::Input,
            &slot(2, SampleFormat::F32, false),
            SampleFormat::S16,
            true,
            4,
            0,
        );
        assert_eq!(info.in_jump, 1);
        assert_eq!(info.out_jump, 2);
        assert_eq!(info.in_offset, vec![0, 4]);
        assert_eq!(info.out_offset, vec![0, 1]);
    }

    #[test]
    fn matching_planar_layouts_keep_unit_jumps() {
        let info = build_convert_info(
            Side::Output,
            &slot(3, SampleFormat::F32, false),
            SampleFormat::F64,
            false,
            8,
            0,
        );
        assert_eq!(info.in_jump, 1);
        assert_eq!(info.out_jump, 1);
        assert_eq!(info.in_offset, vec![0, 8, 16]);
        assert_eq!(info.out_offset, vec![0, 8, 16]);
    }

    #[test]
    fn routing_offset_lands_on_the_device_side() {
        let planar = build_convert_info(
            Side::Input,
            &slot(2, SampleFormat::S16, false),
            SampleFormat::S16,
            false,
            4,
            2,
        );
        assert_eq!(planar.in_offset, vec![8, 12]);
        assert_eq!(planar.out_offset, vec![0, 4]);

        let interleaved = build_convert_info(
            Side::Output,
            &slot(2, SampleFormat::S16, true),
            SampleFormat::S16,
            true,
            4,
            2,
        );
        assert_eq!(interleaved.out_offset, vec![2, 3]);
    }

    #[test]
    fn zero_copy_tie_break() {
        let mut core = StreamCore::new();
        core.user_format = SampleFormat::F32;
        core.user_interleaved = false;
        core.install_side(
            Side::Output,
            slot(2, SampleFormat::F32, false),
            48_000,
            256,
        )
        .unwrap();
        core.finalize_side(Side::Output, 0).unwrap();
        let side = core.sides[OUTPUT].as_ref().unwrap();
        assert!(!side.convert);
        assert_eq!(core.state(), StreamState::Stopped);
    }

    #[test]
    fn format_mismatch_sets_the_convert_flag() {
        let mut core = StreamCore::new();
        core.user_format = SampleFormat::S16;
        core.install_side(Side::Output, slot(2, SampleFormat::F32, false), 48_000, 256)
            .unwrap();
        core.finalize_side(Side::Output, 0).unwrap();
        assert!(core.sides[OUTPUT].as_ref().unwrap().convert);
        // Scratch must cover the device shape of the converting side.
        assert!(core.scratch_len() >= 2 * 256 * 4);
    }

    #[test]
    fn duplex_rate_mismatch_is_invalid_use() {
        let mut core = StreamCore::new();
        core.install_side(Side::Output, slot(2, SampleFormat::F32, false), 48_000, 256)
            .unwrap();
        let err = core
            .install_side(Side::Input, slot(2, SampleFormat::F32, false), 44_100, 256)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUse(_)));
    }

    #[test]
    fn scratch_covers_the_larger_duplex_side() {
        let mut core = StreamCore::new();
        core.user_format = SampleFormat::F32;
        core.install_side(Side::Output, slot(2, SampleFormat::S16, false), 48_000, 128)
            .unwrap();
        core.finalize_side(Side::Output, 0).unwrap();
        core.install_side(Side::Input, slot(4, SampleFormat::S32, false), 48_000, 128)
            .unwrap();
        core.finalize_side(Side::Input, 0).unwrap();
        // Output side needs 2 * 128 * 2 bytes, input side 4 * 128 * 4.
        assert!(core.scratch_len() >= 4 * 128 * 4);
        assert_eq!(core.mode(), StreamMode::Duplex);
    }

    #[test]
    fn clear_returns_to_closed_and_resets_time() {
        let mut core = StreamCore::new();
        core.install_side(Side::Output, slot(2, SampleFormat::F32, false), 48_000, 64)
            .unwrap();
        core.finalize_side(Side::Output, 0).unwrap();
        core.shared().tick(64, 48_000);
        assert!(core.stream_time() > Duration::ZERO);
        core.clear_stream();
        assert_eq!(core.state(), StreamState::Closed);
        assert_eq!(core.stream_time(), Duration::ZERO);
        assert_eq!(core.latency(), 0);
    }

    #[test]
    fn semaphore_hands_off_across_threads() {
        let shared = Arc::new(SharedState::new());
        let poster = Arc::clone(&shared);
        let handle = std::thread::spawn(move || {
            poster.stop_gate.post();
        });
        shared.stop_gate.wait();
        handle.join().unwrap();
    }
}
