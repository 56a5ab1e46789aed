//! The contract between the stream engine and its backends.
//!
//! A backend implements the required methods — device enumeration, a
//! per-side probe, and the native start/stop/abort/close — against one
//! audio subsystem. Everything that is the same for every subsystem
//! (argument validation, duplex coupling, conversion setup, rollback,
//! stream-time queries) is provided on top of the [`StreamCore`] each
//! backend embeds.

use std::sync::Weak;
use std::time::Duration;

use crate::engine::StreamCore;
use crate::interface::ApiObject;
use crate::{
    DeviceInfo, Error, SampleFormat, Side, StreamCallback, StreamOptions, StreamParameters,
    StreamState,
};

/// One audio backend.
///
/// Used as `Arc<Mutex<dyn Api + Send>>`; that mutex is the stream mutex
/// guarding state transitions. The audio thread never takes it — it works
/// on the engine's shared atomics and on the block handler it owns while
/// the stream runs.
pub trait Api: Send {
    /// The registry name of this backend.
    fn name(&self) -> &'static str;

    /// The engine half of the stream this backend drives.
    fn stream(&self) -> &StreamCore;
    fn stream_mut(&mut self) -> &mut StreamCore;

    /// A weak handle to this backend's own `Arc<Mutex<..>>`, captured at
    /// construction. The audio thread upgrades it when the stream must
    /// stop itself (callback request or subsystem shutdown); without one,
    /// self-initiated stops are logged and dropped.
    fn self_handle(&self) -> Option<Weak<ApiObject>> {
        None
    }

    /// Number of devices currently visible to the backend.
    fn device_count(&mut self) -> u32;

    /// Capability snapshot for one device. A backend that cannot examine
    /// the device returns a record with `probed == false` rather than an
    /// error.
    fn device_info(&mut self, device: u32) -> DeviceInfo;

    fn default_input_device(&mut self) -> u32 {
        0
    }

    fn default_output_device(&mut self) -> u32 {
        0
    }

    /// Probes and reserves the device for one side of the stream.
    ///
    /// Called by [`Api::open_stream`], once per requested side with the
    /// output side first, so a duplex open reaches the backend as two
    /// calls; on the second the backend attaches the input side to the
    /// already-reserved device instead of re-opening it. The probe
    /// negotiates the native format and block size, records the side in the
    /// engine's side slots, and
    /// writes the effective block size back through `block_size`. On error
    /// it must release anything it acquired during this call.
    fn probe_open(
        &mut self,
        side: Side,
        params: &StreamParameters,
        sample_rate: u32,
        format: SampleFormat,
        block_size: &mut u32,
        options: &StreamOptions,
    ) -> Result<(), Error>;

    /// Begins callback delivery. Fails with a warning if already running.
    fn start_stream(&mut self) -> Result<(), Error>;

    /// Stops delivery, draining pending output first on an output or
    /// duplex stream. Fails with a warning if already stopped.
    fn stop_stream(&mut self) -> Result<(), Error>;

    /// Stops delivery discarding pending output.
    fn abort_stream(&mut self) -> Result<(), Error>;

    /// Releases the device and every stream resource. Warns when the
    /// stream is already closed.
    fn close_stream(&mut self) -> Result<(), Error>;

    /// Snapshot of every visible device, in id order.
    ///
    /// Unprobeable devices are included (their record says so) and
    /// warned about.
    fn enumerate(&mut self) -> Vec<DeviceInfo> {
        (0..self.device_count())
            .map(|id| {
                let info = self.device_info(id);
                if !info.probed {
                    log::warn!("device {id} could not be probed");
                }
                info
            })
            .collect()
    }

    /// Opens a stream on this backend.
    ///
    /// At least one side must be given; a duplex request must name the
    /// same device on both sides. `block_size` carries the client's
    /// preferred block on the way in (zero for "whatever is smallest") and
    /// the effective block on the way out. On any failure the stream is
    /// rolled back to closed with nothing allocated and nothing reserved.
    #[allow(clippy::too_many_arguments)]
    fn open_stream(
        &mut self,
        output: Option<&StreamParameters>,
        input: Option<&StreamParameters>,
        format: SampleFormat,
        sample_rate: u32,
        block_size: &mut u32,
        callback: StreamCallback,
        options: &StreamOptions,
    ) -> Result<(), Error> {
        if self.stream().state() != StreamState::Closed {
            return Err(Error::InvalidUse("a stream is already open".into()));
        }
        if output.is_none() && input.is_none() {
            return Err(Error::InvalidUse(
                "at least one of the output and input sides must be requested".into(),
            ));
        }
        if sample_rate == 0 {
            return Err(Error::InvalidUse("sample rate must be non-zero".into()));
        }
        for params in [output, input].into_iter().flatten() {
            if params.channels == 0 {
                return Err(Error::InvalidUse(
                    "channel count must be at least one".into(),
                ));
            }
        }
        if let (Some(out), Some(inp)) = (output, input) {
            if out.device != inp.device {
                return Err(Error::InvalidUse(
                    "duplex streams must open both sides on one device".into(),
                ));
            }
        }
        let device_count = self.device_count();
        for params in [output, input].into_iter().flatten() {
            if params.device >= device_count {
                return Err(Error::InvalidUse(format!(
                    "device id {} is out of range ({device_count} devices)",
                    params.device
                )));
            }
            let info = self.device_info(params.device);
            if info.probed {
                let span = params.first_channel as usize + params.channels as usize;
                if span > info.channels.len() {
                    return Err(Error::InvalidUse(format!(
                        "channels {}..{span} exceed the {} channels of device {}",
                        params.first_channel,
                        info.channels.len(),
                        params.device
                    )));
                }
            }
        }

        {
            let core = self.stream_mut();
            core.user_format = format;
            core.user_interleaved = !options.flags.noninterleaved;
            core.buffer_count = options.buffer_count;
        }

        if let Some(params) = output {
            if let Err(err) =
                self.probe_open(Side::Output, params, sample_rate, format, block_size, options)
            {
                self.stream_mut().clear_stream();
                return Err(err);
            }
        }
        if let Some(params) = input {
            if let Err(err) =
                self.probe_open(Side::Input, params, sample_rate, format, block_size, options)
            {
                if output.is_some() {
                    // The output side already holds backend resources.
                    let _ = self.close_stream();
                } else {
                    self.stream_mut().clear_stream();
                }
                return Err(err);
            }
        }

        *block_size = self.stream().block_size() as u32;
        let handle = self.self_handle();
        self.stream_mut().build_process(callback, handle);
        Ok(())
    }

    /// `true` unless the stream is closed.
    fn is_stream_open(&self) -> bool {
        self.stream().is_open()
    }

    /// `true` while callbacks are being delivered.
    fn is_stream_running(&self) -> bool {
        self.stream().is_running()
    }

    /// Elapsed stream time. Monotonic within a run, carried across
    /// stop/start, zeroed by close.
    fn stream_time(&self) -> Result<Duration, Error> {
        self.stream().verify_open()?;
        Ok(self.stream().stream_time())
    }

    /// Total stream latency in frames, summed over the active sides as
    /// captured at open.
    fn stream_latency(&self) -> Result<usize, Error> {
        self.stream().verify_open()?;
        Ok(self.stream().latency())
    }

    /// The sample rate in effect, captured at open.
    fn stream_sample_rate(&self) -> Result<u32, Error> {
        self.stream().verify_open()?;
        Ok(self.stream().sample_rate())
    }
}
