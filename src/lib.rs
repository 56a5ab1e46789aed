//! # aural
//!
//! A cross-platform real-time audio I/O runtime. One uniform streaming
//! interface is presented over several heterogeneous native audio
//! subsystems; a client opens a duplex, capture or playback stream on a
//! chosen device at a chosen sample rate and sample format, and the runtime
//! pumps fixed-size frame blocks through a client-supplied callback,
//! converting between the client's buffer shape and whatever the device
//! natively delivers.
//!
//! ## How to use it
//!
//! 1. Create an [`Interface`] and instantiate a backend, either by name or
//!    by letting the dispatcher pick the first one that comes up.
//! 2. Enumerate devices with [`Interface::enumerate`] and pick ids for the
//!    sides you want.
//! 3. Open a stream with [`Interface::open_stream`], passing a callback
//!    that fills the output block and/or consumes the input block.
//! 4. [`Interface::start_stream`] begins delivery; [`Interface::stop_stream`]
//!    drains pending output and stops; [`Interface::abort_stream`] stops
//!    without draining; [`Interface::close_stream`] releases the device.
//!
//! ```no_run
//! use aural::{CallbackResult, Interface, SampleFormat, StreamOptions, StreamParameters};
//!
//! let mut audio = Interface::new();
//! audio.instantiate(None).expect("no audio backend available");
//!
//! let output = StreamParameters {
//!     device: audio.default_output_device(),
//!     channels: 2,
//!     first_channel: 0,
//! };
//! let mut block_size = 256u32;
//! audio
//!     .open_stream(
//!         Some(&output),
//!         None,
//!         SampleFormat::F32,
//!         48_000,
//!         &mut block_size,
//!         Box::new(|mut io| {
//!             if let Some(out) = io.output.as_deref_mut() {
//!                 for sample in out.as_slice_mut::<f32>().unwrap() {
//!                     *sample = 0.0;
//!                 }
//!             }
//!             CallbackResult::Continue
//!         }),
//!         &StreamOptions::default(),
//!     )
//!     .unwrap();
//! audio.start_stream().unwrap();
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! audio.stop_stream().unwrap();
//! audio.close_stream().unwrap();
//! ```
//!
//! ## Callback contract
//!
//! The callback runs on the backend's real-time thread. It must not block,
//! must not allocate, and must return before the next block period. Its
//! return value steers the stream: [`CallbackResult::Continue`] keeps
//! going, [`CallbackResult::Drain`] lets two further blocks of silence
//! flush the device before stopping, and [`CallbackResult::StopNow`] stops
//! at the next block boundary without draining.

use std::time::Duration;

pub use error::Error;
pub use interface::{ApiFactory, ApiHandle, ApiObject, Interface};
pub use samples_formats::{FromSample, Sample, SampleFormat, SizedSample, I24};
pub use traits::Api;

pub(crate) mod conversion;
pub mod engine;
mod error;
pub mod host;
mod interface;
mod samples_formats;
pub mod traits;

/// Number of channels on one side of a stream.
pub type ChannelCount = u16;

/// The symbolic role of one channel in a device's channel list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ChannelTag {
    FrontLeft,
    FrontRight,
    FrontCenter,
    Lfe,
    RearLeft,
    RearRight,
    SideLeft,
    SideRight,
    /// The device did not say, or the role has no standard name.
    Unknown,
}

impl ChannelTag {
    /// The kebab-case name used in device property records.
    pub fn name(&self) -> &'static str {
        match *self {
            ChannelTag::FrontLeft => "front-left",
            ChannelTag::FrontRight => "front-right",
            ChannelTag::FrontCenter => "front-center",
            ChannelTag::Lfe => "lfe",
            ChannelTag::RearLeft => "rear-left",
            ChannelTag::RearRight => "rear-right",
            ChannelTag::SideLeft => "side-left",
            ChannelTag::SideRight => "side-right",
            ChannelTag::Unknown => "unknown",
        }
    }

    /// Parses a property-record name; anything unrecognized maps to
    /// [`ChannelTag::Unknown`].
    pub fn from_name(name: &str) -> ChannelTag {
        match name {
            "front-left" => ChannelTag::FrontLeft,
            "front-right" => ChannelTag::FrontRight,
            "front-center" => ChannelTag::FrontCenter,
            "lfe" => ChannelTag::Lfe,
            "rear-left" => ChannelTag::RearLeft,
            "rear-right" => ChannelTag::RearRight,
            "side-left" => ChannelTag::SideLeft,
            "side-right" => ChannelTag::SideRight,
            _ => ChannelTag::Unknown,
        }
    }
}

/// A point-in-time snapshot of one device's capabilities.
///
/// Obtained from a backend at query time; devices may appear, disappear or
/// change between queries. A device with `probed == false` could not be
/// fully examined — it may still be openable, but every other field is
/// advisory at best.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    /// Backend-assigned device id, valid until the next enumeration.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Longer human-readable description, possibly empty.
    pub description: String,
    /// `true` for a capture device, `false` for a playback device.
    pub is_input: bool,
    /// Ordered channel roles the device exposes.
    pub channels: Vec<ChannelTag>,
    /// Sample rates the device advertises.
    pub sample_rates: Vec<u32>,
    /// Formats the device can produce or consume natively.
    pub native_formats: Vec<SampleFormat>,
    /// Whether the backend considers this the default device for its
    /// direction.
    pub is_default: bool,
    /// Whether the capability query completed.
    pub probed: bool,
}

/// Which device to open on one side of a stream, and how much of it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamParameters {
    /// Device id, as reported by enumeration.
    pub device: u32,
    /// Number of channels to open. Must be at least one.
    pub channels: ChannelCount,
    /// Index of the first device channel to use, for opening a contiguous
    /// slice of a larger device.
    pub first_channel: ChannelCount,
}

/// Hints a client may pass when opening a stream.
///
/// Backends honor what they can and ignore the rest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// Ask for the smallest block size the device will accept.
    pub minimize_latency: bool,
    /// Ask for real-time scheduling of the audio thread where the backend
    /// controls it.
    pub schedule_realtime: bool,
    /// The client wants planar user buffers (all frames of channel 0, then
    /// channel 1, …) instead of interleaved ones.
    pub noninterleaved: bool,
    /// Ask for exclusive access to the device.
    pub hog_device: bool,
}

/// Options applied at [`open_stream`](crate::traits::Api::open_stream).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub flags: StreamFlags,
    /// Suggested number of device buffers; `0` lets the backend choose.
    pub buffer_count: u32,
    /// Suggested stream name, propagated where the backend supports it
    /// (for example as the JACK client name).
    pub name: String,
}

/// Lifecycle state of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// No device is held and no buffers are allocated.
    Closed = 0,
    /// Open but not delivering callbacks.
    Stopped = 1,
    /// The backend's audio thread is delivering callbacks.
    Running = 2,
    /// A stop was requested and the audio thread is finishing its drain.
    Stopping = 3,
}

impl StreamState {
    pub(crate) fn from_u8(raw: u8) -> StreamState {
        match raw {
            1 => StreamState::Stopped,
            2 => StreamState::Running,
            3 => StreamState::Stopping,
            _ => StreamState::Closed,
        }
    }
}

/// Which directions an open stream covers.
///
/// A stream opened first for output and then also for input is promoted to
/// [`StreamMode::Duplex`]. [`StreamMode::Master`] is reserved for linked
/// stream setups where one stream clocks another.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamMode {
    #[default]
    Unknown,
    Output,
    Input,
    Duplex,
    Master,
}

/// One half of a stream. Output is side `0`, input is side `1`, matching
/// the engine's side-indexed slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Output = 0,
    Input = 1,
}

impl Side {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Device trouble observed since the previous callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStatus {
    /// The device dropped capture data because the input side fell behind.
    pub input_overflow: bool,
    /// The device ran out of playback data because the output side fell
    /// behind.
    pub output_underflow: bool,
}

impl StreamStatus {
    /// `true` when no xrun occurred.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.input_overflow && !self.output_underflow
    }
}

/// What the client callback wants the stream to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackResult {
    /// Keep delivering blocks.
    Continue,
    /// The client has produced its last block; play two blocks of silence
    /// to flush the device, then stop.
    Drain,
    /// Stop at the next block boundary without draining.
    StopNow,
}

/// A block of samples in the stream's user format, viewed type-erased.
///
/// The concrete sample type is only known at run time, so the buffer
/// carries its [`SampleFormat`] and offers checked typed views. For the
/// packed 24-bit format there is no primitive view; use the byte
/// accessors.
#[derive(Debug)]
pub struct Samples {
    data: *mut (),
    len: usize,
    format: SampleFormat,
}

impl Samples {
    /// Builds a `Samples` from its raw parts.
    ///
    /// # Safety
    ///
    /// `data` must point to memory valid for reads and writes of
    /// `len * format.sample_size()` bytes, aligned for the primitive the
    /// format corresponds to, and must outlive the returned value.
    pub unsafe fn from_parts(data: *mut (), len: usize, format: SampleFormat) -> Samples {
        Samples { data, len, format }
    }

    /// Format of the samples in the buffer.
    #[inline]
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Number of samples (not frames, not bytes) in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw bytes of the buffer.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        let len = self.len * self.format.sample_size();
        unsafe { std::slice::from_raw_parts(self.data as *const u8, len) }
    }

    /// The raw bytes of the buffer, mutably.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len * self.format.sample_size();
        unsafe { std::slice::from_raw_parts_mut(self.data as *mut u8, len) }
    }

    /// A typed view of the buffer, or `None` when `T` does not match the
    /// buffer's format.
    #[inline]
    pub fn as_slice<T: SizedSample>(&self) -> Option<&[T]> {
        if T::FORMAT == self.format {
            Some(unsafe { std::slice::from_raw_parts(self.data as *const T, self.len) })
        } else {
            None
        }
    }

    /// A mutable typed view of the buffer, or `None` when `T` does not
    /// match the buffer's format.
    #[inline]
    pub fn as_slice_mut<T: SizedSample>(&mut self) -> Option<&mut [T]> {
        if T::FORMAT == self.format {
            Some(unsafe { std::slice::from_raw_parts_mut(self.data as *mut T, self.len) })
        } else {
            None
        }
    }
}

/// Everything handed to the client callback for one block.
#[derive(Debug)]
pub struct StreamData<'a> {
    /// Captured samples in user format and layout; `None` on an
    /// output-only stream.
    pub input: Option<&'a Samples>,
    /// Stream time of the first captured sample.
    pub input_time: Duration,
    /// Writable playback block in user format and layout; `None` on an
    /// input-only stream.
    pub output: Option<&'a mut Samples>,
    /// Stream time at which the first written sample will play.
    pub output_time: Duration,
    /// Number of frames in each present buffer.
    pub frames: usize,
    /// Xrun events recorded since the previous callback.
    pub status: StreamStatus,
}

/// The client's block callback.
///
/// Runs on the backend's real-time thread once per block; see the crate
/// docs for the contract it must uphold.
pub type StreamCallback = Box<dyn FnMut(StreamData<'_>) -> CallbackResult + Send + 'static>;
