//! Backend for host-managed audio services.
//!
//! Some platforms never hand the process an audio thread of its own.
//! Instead a host-owned service (the Android JVM audio layer is the
//! motivating case) owns the devices and pushes or pulls raw 16-bit blocks
//! at its own pace. This module fixes the engine-facing contract of that
//! glue: the host implements [`AudioService`], registers a [`factory`] with
//! the dispatcher, and drives the stream through the [`Endpoint`] it
//! receives at start. The FFI mechanics stay entirely on the host side.
//!
//! Every bridge device speaks signed 16-bit samples, planar per call, in
//! host byte order; the engine converts to and from whatever the client
//! asked for.

use std::sync::{Arc, Mutex, Weak};

use serde::Deserialize;

use crate::engine::{SharedState, SideSlot, StreamCore, StreamProcess, INPUT, OUTPUT};
use crate::interface::{ApiFactory, ApiHandle, ApiObject};
use crate::traits::Api;
use crate::{
    ChannelTag, DeviceInfo, Error, SampleFormat, Side, StreamMode, StreamOptions,
    StreamParameters, StreamState,
};

const BRIDGE_SAMPLE_FORMAT: SampleFormat = SampleFormat::S16;

/// What the backend asks the service to open.
#[derive(Clone, Copy, Debug)]
pub struct OpenRequest {
    /// Device id, as counted by [`AudioService::device_count`].
    pub device: u32,
    /// Which direction this request covers.
    pub side: Side,
    /// Channels to open.
    pub channels: u16,
    /// First device channel to use.
    pub first_channel: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Preferred block size in frames; zero asks for the service default.
    pub frames: u32,
    /// Prefer the smallest block the service supports.
    pub minimize_latency: bool,
    /// Ask for exclusive device access.
    pub hog_device: bool,
}

/// The service's answer to a successful open.
#[derive(Clone, Copy, Debug)]
pub struct OpenReply {
    /// Service-assigned stream id, quoted on every later call.
    pub stream: i32,
    /// Block size in frames the service will actually deliver.
    pub frames: u32,
    /// Frames of latency the service reports, zero when unknown.
    pub latency: u32,
}

/// The narrow interface a host platform implements to expose its audio
/// service to the engine.
///
/// Device properties are JSON records with the fields `name`, `type`
/// (`"output"` or `"input"`), `sample-rate` (array of Hz values),
/// `channels` (array of channel-tag names), `format` (array of format
/// names such as `"int16"` or `"float"`) and `default` (bool). Missing
/// fields are treated as empty.
pub trait AudioService: Send {
    /// Number of devices the host can currently see.
    fn device_count(&mut self) -> u32;

    /// The JSON property record for one device.
    fn device_property(&mut self, device: u32) -> Result<String, Error>;

    /// Opens one direction of a device and returns its stream id along
    /// with the block size the service settled on.
    fn open_stream(&mut self, request: &OpenRequest) -> Result<OpenReply, Error>;

    /// Begins block traffic for the given stream ids (both ids of a
    /// duplex pair arrive together). The service owns `endpoint` until the
    /// matching [`AudioService::stop_stream`]; if this call fails the
    /// endpoint is forfeit and the client has to close and reopen.
    fn start_stream(&mut self, streams: &[i32], endpoint: Endpoint) -> Result<(), Error>;

    /// Ends block traffic and hands the endpoint back.
    fn stop_stream(&mut self, streams: &[i32]) -> Result<Endpoint, Error>;

    /// Releases one stream id.
    fn close_stream(&mut self, stream: i32) -> Result<(), Error>;
}

/// The handle a service drives blocks through while a stream runs.
///
/// It owns the engine's block handler for the duration of the run, so the
/// push/pull path never touches the stream mutex.
pub struct Endpoint {
    process: StreamProcess,
    shared: Arc<SharedState>,
    out_channels: usize,
    in_channels: usize,
    staged_input: Vec<i16>,
    duplex: bool,
}

impl Endpoint {
    /// Pulls one playback block. `dst` holds `channels x frames` samples,
    /// planar (all frames of channel 0, then channel 1, …). On a duplex
    /// stream this call runs the engine cycle, consuming whatever the
    /// preceding [`Endpoint::record`] staged.
    pub fn playback(&mut self, dst: &mut [i16]) {
        let channels = self.out_channels.max(1);
        let frames = dst.len() / channels;
        let staged = &self.staged_input;
        self.process.cycle(
            frames,
            |ch, bytes| {
                let base = ch * frames;
                for (index, chunk) in bytes.chunks_exact_mut(2).enumerate() {
                    let sample = staged.get(base + index).copied().unwrap_or(0);
                    chunk.copy_from_slice(&sample.to_ne_bytes());
                }
            },
            |ch, bytes| {
                let base = ch * frames;
                for (index, chunk) in bytes.chunks_exact(2).enumerate() {
                    dst[base + index] = i16::from_ne_bytes([chunk[0], chunk[1]]);
                }
            },
        );
    }

    /// Pushes one capture block of `channels x frames` planar samples. On
    /// an input-only stream this runs the engine cycle; on a duplex stream
    /// the block is staged for the next [`Endpoint::playback`] so both
    /// directions share one callback invocation.
    pub fn record(&mut self, src: &[i16]) {
        if self.duplex {
            let n = src.len().min(self.staged_input.len());
            self.staged_input[..n].copy_from_slice(&src[..n]);
            return;
        }
        let channels = self.in_channels.max(1);
        let frames = src.len() / channels;
        self.process.cycle(
            frames,
            |ch, bytes| {
                let base = ch * frames;
                for (index, chunk) in bytes.chunks_exact_mut(2).enumerate() {
                    let sample = src.get(base + index).copied().unwrap_or(0);
                    chunk.copy_from_slice(&sample.to_ne_bytes());
                }
            },
            |_ch, _bytes| {},
        );
    }

    /// Records a device xrun; the next callback reports it once through
    /// its status flags.
    pub fn report_xrun(&mut self) {
        if self.out_channels > 0 {
            self.shared.mark_xrun(Side::Output);
        }
        if self.in_channels > 0 {
            self.shared.mark_xrun(Side::Input);
        }
    }
}

/// Builds a dispatcher factory from a service factory, for
/// [`Interface::add_api`](crate::Interface::add_api).
pub fn factory<F>(make_service: F) -> ApiFactory
where
    F: Fn() -> Result<Box<dyn AudioService>, Error> + Send + 'static,
{
    Box::new(move || {
        let service = make_service()?;
        let handle: ApiHandle = Bridge::create(service);
        Ok(handle)
    })
}

/// The bridge backend.
pub struct Bridge {
    core: StreamCore,
    service: Box<dyn AudioService>,
    streams: [Option<i32>; 2],
    self_handle: Weak<ApiObject>,
}

impl Bridge {
    /// Wraps a host service in a backend. The returned handle coerces to
    /// [`ApiHandle`] for the dispatcher; hosts keep the typed form so they
    /// can reach the service again.
    pub fn create(service: Box<dyn AudioService>) -> Arc<Mutex<Bridge>> {
        Arc::new_cyclic(|weak: &Weak<Mutex<Bridge>>| {
            let self_handle: Weak<ApiObject> = weak.clone();
            Mutex::new(Bridge {
                core: StreamCore::new(),
                service,
                streams: [None, None],
                self_handle,
            })
        })
    }

    fn stream_ids(&self) -> Vec<i32> {
        self.streams.iter().flatten().copied().collect()
    }
}

impl Api for Bridge {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn stream(&self) -> &StreamCore {
        &self.core
    }

    fn stream_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn self_handle(&self) -> Option<Weak<ApiObject>> {
        Some(self.self_handle.clone())
    }

    fn device_count(&mut self) -> u32 {
        self.service.device_count()
    }

    fn device_info(&mut self, device: u32) -> DeviceInfo {
        match self.service.device_property(device) {
            Ok(json) => parse_device_property(device, &json),
            Err(err) => {
                log::warn!("device {device}: property query failed: {err}");
                DeviceInfo {
                    id: device,
                    ..DeviceInfo::default()
                }
            }
        }
    }

    fn default_input_device(&mut self) -> u32 {
        default_device(self, true)
    }

    fn default_output_device(&mut self) -> u32 {
        default_device(self, false)
    }

    fn probe_open(
        &mut self,
        side: Side,
        params: &StreamParameters,
        sample_rate: u32,
        _format: SampleFormat,
        block_size: &mut u32,
        options: &StreamOptions,
    ) -> Result<(), Error> {
        // The record's `type` is the device's nominal direction; whether a
        // given direction can actually be opened is the service's call, so
        // only the advertised rates are checked here.
        let info = self.device_info(params.device);
        if info.probed && !info.sample_rates.is_empty() && !info.sample_rates.contains(&sample_rate)
        {
            return Err(Error::Failed(format!(
                "device {} does not support {sample_rate} Hz",
                params.device
            )));
        }

        let request = OpenRequest {
            device: params.device,
            side,
            channels: params.channels,
            first_channel: params.first_channel,
            sample_rate,
            frames: *block_size,
            minimize_latency: options.flags.minimize_latency,
            hog_device: options.flags.hog_device,
        };
        let reply = self.service.open_stream(&request)?;
        if reply.frames == 0 {
            let _ = self.service.close_stream(reply.stream);
            return Err(Error::SystemError(
                "service reported a zero block size".into(),
            ));
        }

        let slot = SideSlot::new(
            params.device,
            params.channels as usize,
            params.first_channel as usize,
            BRIDGE_SAMPLE_FORMAT,
            false,
            false,
            reply.latency as usize,
        );
        if let Err(err) = self
            .core
            .install_side(side, slot, sample_rate, reply.frames as usize)
            .and_then(|()| self.core.finalize_side(side, 0))
        {
            let _ = self.service.close_stream(reply.stream);
            return Err(err);
        }
        self.streams[side.index()] = Some(reply.stream);
        *block_size = reply.frames;
        Ok(())
    }

    fn start_stream(&mut self) -> Result<(), Error> {
        self.core.verify_open()?;
        if self.core.is_running() {
            log::warn!("the stream is already running");
            return Err(Error::Warning("the stream is already running".into()));
        }
        let process = self
            .core
            .take_process()
            .ok_or_else(|| Error::Failed("the stream has no block handler to start".into()))?;

        let out_channels = self.core.sides[OUTPUT]
            .as_ref()
            .map_or(0, |slot| slot.device_channels);
        let in_channels = self.core.sides[INPUT]
            .as_ref()
            .map_or(0, |slot| slot.device_channels);
        let duplex = self.core.mode() == StreamMode::Duplex;
        let endpoint = Endpoint {
            process,
            shared: self.core.shared(),
            out_channels,
            in_channels,
            staged_input: if duplex {
                vec![0; in_channels * self.core.block_size()]
            } else {
                Vec::new()
            },
            duplex,
        };

        let ids = self.stream_ids();
        let shared = self.core.shared();
        shared.reset_drain();
        shared.set_state(StreamState::Running);
        match self.service.start_stream(&ids, endpoint) {
            Ok(()) => Ok(()),
            Err(err) => {
                shared.set_state(StreamState::Stopped);
                Err(Error::SystemError(format!("service failed to start: {err}")))
            }
        }
    }

    fn stop_stream(&mut self) -> Result<(), Error> {
        self.core.verify_open()?;
        if self.core.state() == StreamState::Stopped {
            log::warn!("the stream is already stopped");
            return Err(Error::Warning("the stream is already stopped".into()));
        }
        let shared = self.core.shared();
        if matches!(self.core.mode(), StreamMode::Output | StreamMode::Duplex)
            && shared.drain() == 0
        {
            shared.set_drain(2);
            shared.stop_gate.wait();
        }
        let ids = self.stream_ids();
        let endpoint = self.service.stop_stream(&ids);
        shared.set_state(StreamState::Stopped);
        match endpoint {
            Ok(endpoint) => {
                self.core.restore_process(endpoint.process);
                Ok(())
            }
            Err(err) => Err(Error::SystemError(format!("service failed to stop: {err}"))),
        }
    }

    fn abort_stream(&mut self) -> Result<(), Error> {
        self.core.verify_open()?;
        if self.core.state() == StreamState::Stopped {
            log::warn!("the stream is already stopped");
            return Err(Error::Warning("the stream is already stopped".into()));
        }
        self.core.shared().set_drain(2);
        self.stop_stream()
    }

    fn close_stream(&mut self) -> Result<(), Error> {
        if !self.core.is_open() {
            log::warn!("no open stream to close");
            return Err(Error::Warning("no open stream to close".into()));
        }
        if matches!(
            self.core.state(),
            StreamState::Running | StreamState::Stopping
        ) {
            self.core.shared().set_drain(2);
            let _ = self.stop_stream();
        }
        for stream in self.streams.iter_mut() {
            if let Some(id) = stream.take() {
                let _ = self.service.close_stream(id);
            }
        }
        self.core.clear_stream();
        Ok(())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.core.is_open() {
            let _ = self.close_stream();
        }
    }
}

fn default_device(bridge: &mut Bridge, want_input: bool) -> u32 {
    let count = bridge.device_count();
    for device in 0..count {
        let info = bridge.device_info(device);
        if info.probed && info.is_default && info.is_input == want_input {
            return device;
        }
    }
    0
}

#[derive(Deserialize)]
struct DeviceProperty {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "type")]
    direction: String,
    #[serde(default, rename = "sample-rate")]
    sample_rates: Vec<u32>,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default, rename = "format")]
    formats: Vec<String>,
    #[serde(default)]
    default: bool,
}

fn parse_device_property(device: u32, json: &str) -> DeviceInfo {
    let property: DeviceProperty = match serde_json::from_str(json) {
        Ok(property) => property,
        Err(err) => {
            log::warn!("device {device}: malformed property record: {err}");
            return DeviceInfo {
                id: device,
                ..DeviceInfo::default()
            };
        }
    };
    DeviceInfo {
        id: device,
        name: property.name,
        description: property.description,
        is_input: property.direction == "input",
        channels: property
            .channels
            .iter()
            .map(|name| ChannelTag::from_name(name))
            .collect(),
        sample_rates: property.sample_rates,
        native_formats: property
            .formats
            .iter()
            .filter_map(|name| parse_format(name))
            .collect(),
        is_default: property.default,
        probed: true,
    }
}

fn parse_format(name: &str) -> Option<SampleFormat> {
    match name {
        "int8" | "s8" => Some(SampleFormat::S8),
        "int16" | "s16" => Some(SampleFormat::S16),
        "int24" | "s24" => Some(SampleFormat::S24),
        "int32" | "s32" => Some(SampleFormat::S32),
        "float" | "f32" => Some(SampleFormat::F32),
        "double" | "f64" => Some(SampleFormat::F64),
        _ => None,
    }
}
