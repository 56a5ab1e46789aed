//! JACK Audio Connection Kit backend.
//!
//! JACK "devices" are the port groups of the clients connected to the
//! server: each group appears twice in the device list, once as a capture
//! device (the group's output ports feed us) and once as a playback device
//! (we feed its input ports), with even ids for capture and odd ids for
//! playback. The server fixes the sample rate and block size; a stream
//! request that disagrees on the rate fails, and any requested block size
//! is overwritten with the server's.
//!
//! Device samples are always 32-bit float, planar, host byte order, so a
//! stream opened with any other user shape runs the engine's conversion
//! path.

use std::sync::{Arc, Mutex, Weak};

use crate::engine::{SideSlot, StreamCore, INPUT, OUTPUT};
use crate::interface::{ApiHandle, ApiObject};
use crate::traits::Api;
use crate::{
    ChannelTag, DeviceInfo, Error, SampleFormat, Side, StreamMode, StreamOptions,
    StreamParameters, StreamState,
};

mod stream;
use stream::{Notifications, ProcessHandler};

const JACK_SAMPLE_FORMAT: SampleFormat = SampleFormat::F32;
const DEFAULT_CLIENT_NAME: &str = "aural";

pub struct Jack {
    core: StreamCore,
    self_handle: Weak<ApiObject>,
    /// The stream's client, held between open and start and while stopped.
    client: Option<jack::Client>,
    /// The activated client while the stream runs.
    active: Option<jack::AsyncClient<Notifications, ProcessHandler>>,
    out_ports: Vec<jack::Port<jack::AudioOut>>,
    in_ports: Vec<jack::Port<jack::AudioIn>>,
    port_names: [Vec<String>; 2],
    device_names: [Option<String>; 2],
}

impl Jack {
    /// Constructs the backend, failing when no JACK server is reachable so
    /// the dispatcher's default instantiation can fall through.
    pub fn create() -> Result<ApiHandle, Error> {
        with_probe_client(&format!("{DEFAULT_CLIENT_NAME}-probe"), |_| ())?;
        let handle: ApiHandle = Arc::new_cyclic(|weak| {
            let self_handle: Weak<ApiObject> = weak.clone();
            Mutex::new(Jack {
                core: StreamCore::new(),
                self_handle,
                client: None,
                active: None,
                out_ports: Vec::new(),
                in_ports: Vec::new(),
                port_names: [Vec::new(), Vec::new()],
                device_names: [None, None],
            })
        });
        Ok(handle)
    }

    fn probe_side(
        &mut self,
        side: Side,
        params: &StreamParameters,
        sample_rate: u32,
        block_size: &mut u32,
        options: &StreamOptions,
    ) -> Result<(), Error> {
        // One client serves the whole stream; the first probed side creates
        // it, the second attaches.
        if self.client.is_none() {
            let name = if options.name.is_empty() {
                DEFAULT_CLIENT_NAME
            } else {
                options.name.as_str()
            };
            self.client = Some(open_client(name)?);
        }
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::Failed("the JACK client is unavailable".into()))?;

        let groups = port_groups(client);
        let group = groups
            .get((params.device / 2) as usize)
            .ok_or_else(|| Error::InvalidUse(format!("device id {} is invalid", params.device)))?
            .clone();

        // Our output side feeds the group's input ports and vice versa.
        let flags = match side {
            Side::Output => jack::PortFlags::IS_INPUT,
            Side::Input => jack::PortFlags::IS_OUTPUT,
        };
        let device_ports = client.ports(Some(&format!("^{group}:")), None, flags);
        let span = params.channels as usize + params.first_channel as usize;
        if device_ports.len() < span {
            return Err(Error::InvalidUse(format!(
                "requested channels {}..{span} exceed the {} ports of \"{group}\"",
                params.first_channel,
                device_ports.len()
            )));
        }

        let server_rate = client.sample_rate() as u32;
        if sample_rate != server_rate {
            return Err(Error::Failed(format!(
                "the requested sample rate ({sample_rate}) differs from the JACK server rate ({server_rate})"
            )));
        }

        let mut latency = 0usize;
        if let Some(port_name) = device_ports.get(params.first_channel as usize) {
            if let Some(port) = client.port_by_name(port_name) {
                let mode = match side {
                    Side::Output => jack::LatencyType::Playback,
                    Side::Input => jack::LatencyType::Capture,
                };
                let (min, _max) = port.get_latency_range(mode);
                latency = min as usize;
            }
        }

        // The server owns the block size; whatever was asked for is
        // overwritten.
        let server_block = client.buffer_size() as usize;

        let slot = SideSlot::new(
            params.device,
            params.channels as usize,
            params.first_channel as usize,
            JACK_SAMPLE_FORMAT,
            false,
            false,
            latency,
        );
        self.core.install_side(side, slot, server_rate, server_block)?;
        // Channel offsets are realized by picking device ports, not by the
        // conversion tables.
        self.core.finalize_side(side, 0)?;
        *block_size = server_block as u32;

        self.device_names[side.index()] = Some(group);
        let mut names = Vec::with_capacity(params.channels as usize);
        match side {
            Side::Output => {
                for index in 0..params.channels {
                    let port = self
                        .client
                        .as_ref()
                        .ok_or_else(|| Error::Failed("the JACK client is unavailable".into()))?
                        .register_port(&format!("out_{index}"), jack::AudioOut::default())
                        .map_err(|err| {
                            Error::SystemError(format!("could not register a JACK port: {err}"))
                        })?;
                    if let Ok(name) = port.name() {
                        names.push(name);
                    }
                    self.out_ports.push(port);
                }
            }
            Side::Input => {
                for index in 0..params.channels {
                    let port = self
                        .client
                        .as_ref()
                        .ok_or_else(|| Error::Failed("the JACK client is unavailable".into()))?
                        .register_port(&format!("in_{index}"), jack::AudioIn::default())
                        .map_err(|err| {
                            Error::SystemError(format!("could not register a JACK port: {err}"))
                        })?;
                    if let Ok(name) = port.name() {
                        names.push(name);
                    }
                    self.in_ports.push(port);
                }
            }
        }
        self.port_names[side.index()] = names;
        Ok(())
    }

    /// Wires our registered ports to the device's, honoring the
    /// first-channel offset. Only possible on an activated client.
    fn connect_ports(
        &self,
        active: &jack::AsyncClient<Notifications, ProcessHandler>,
    ) -> Result<(), Error> {
        let client = active.as_client();
        if let (Some(group), Some(slot)) = (&self.device_names[OUTPUT], &self.core.sides[OUTPUT]) {
            let dest = client.ports(Some(&format!("^{group}:")), None, jack::PortFlags::IS_INPUT);
            for (index, ours) in self.port_names[OUTPUT].iter().enumerate() {
                let theirs = dest.get(slot.first_channel + index).ok_or_else(|| {
                    Error::SystemError("output ports of the device disappeared".into())
                })?;
                client.connect_ports_by_name(ours, theirs).map_err(|err| {
                    Error::SystemError(format!("error connecting output ports: {err}"))
                })?;
            }
        }
        if let (Some(group), Some(slot)) = (&self.device_names[INPUT], &self.core.sides[INPUT]) {
            let src = client.ports(Some(&format!("^{group}:")), None, jack::PortFlags::IS_OUTPUT);
            for (index, ours) in self.port_names[INPUT].iter().enumerate() {
                let theirs = src.get(slot.first_channel + index).ok_or_else(|| {
                    Error::SystemError("capture ports of the device disappeared".into())
                })?;
                client.connect_ports_by_name(theirs, ours).map_err(|err| {
                    Error::SystemError(format!("error connecting input ports: {err}"))
                })?;
            }
        }
        Ok(())
    }
}

impl Api for Jack {
    fn name(&self) -> &'static str {
        "jack"
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
        match with_probe_client(&format!("{DEFAULT_CLIENT_NAME}-count"), |client| {
            port_groups(client).len() as u32 * 2
        }) {
            Ok(count) => count,
            Err(err) => {
                log::warn!("JACK device enumeration failed: {err}");
                0
            }
        }
    }

    fn device_info(&mut self, device: u32) -> DeviceInfo {
        let is_input = device % 2 == 0;
        let result = with_probe_client(&format!("{DEFAULT_CLIENT_NAME}-info"), |client| {
            let groups = port_groups(client);
            let Some(group) = groups.get((device / 2) as usize) else {
                log::warn!("JACK device id {device} is invalid");
                return DeviceInfo {
                    id: device,
                    is_input,
                    ..DeviceInfo::default()
                };
            };
            // Counting the group's output ports yields our capture
            // channels, and the other way around.
            let flags = if is_input {
                jack::PortFlags::IS_OUTPUT
            } else {
                jack::PortFlags::IS_INPUT
            };
            let channels = client
                .ports(Some(&format!("^{group}:")), None, flags)
                .len();
            DeviceInfo {
                id: device,
                name: group.clone(),
                description: String::new(),
                is_input,
                channels: vec![ChannelTag::Unknown; channels],
                sample_rates: vec![client.sample_rate() as u32],
                native_formats: vec![JACK_SAMPLE_FORMAT],
                is_default: device / 2 == 0,
                probed: channels > 0,
            }
        });
        match result {
            Ok(info) => info,
            Err(err) => {
                log::warn!("JACK device {device} could not be probed: {err}");
                DeviceInfo {
                    id: device,
                    is_input,
                    ..DeviceInfo::default()
                }
            }
        }
    }

    fn default_input_device(&mut self) -> u32 {
        0
    }

    fn default_output_device(&mut self) -> u32 {
        if self.device_count() > 1 {
            1
        } else {
            0
        }
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
        let result = self.probe_side(side, params, sample_rate, block_size, options);
        if result.is_err() && self.core.mode() == StreamMode::Unknown {
            // Nothing else holds the client; release what this call built.
            self.out_ports.clear();
            self.in_ports.clear();
            self.port_names = [Vec::new(), Vec::new()];
            self.device_names = [None, None];
            self.client = None;
        }
        result
    }

    fn start_stream(&mut self) -> Result<(), Error> {
        self.core.verify_open()?;
        if self.core.is_running() {
            log::warn!("the stream is already running");
            return Err(Error::Warning("the stream is already running".into()));
        }
        let client = self
            .client
            .take()
            .ok_or_else(|| Error::Failed("the stream has no JACK client to activate".into()))?;
        let process = self
            .core
            .take_process()
            .ok_or_else(|| Error::Failed("the stream has no block handler to start".into()))?;
        let shared = self.core.shared();
        let handler = ProcessHandler::new(
            process,
            std::mem::take(&mut self.out_ports),
            std::mem::take(&mut self.in_ports),
        );
        let notifications = Notifications::new(
            Arc::clone(&shared),
            self.self_handle.clone(),
            [
                self.core.sides[OUTPUT].is_some(),
                self.core.sides[INPUT].is_some(),
            ],
        );
        let active = client.activate_async(notifications, handler).map_err(|err| {
            Error::SystemError(format!("unable to activate the JACK client: {err}"))
        })?;

        if let Err(err) = self.connect_ports(&active) {
            match active.deactivate() {
                Ok((client, _notifications, handler)) => {
                    let (process, out_ports, in_ports) = handler.into_parts();
                    self.client = Some(client);
                    self.core.restore_process(process);
                    self.out_ports = out_ports;
                    self.in_ports = in_ports;
                }
                Err(err) => log::error!("deactivating after a failed port connection: {err}"),
            }
            return Err(err);
        }

        shared.reset_drain();
        shared.set_state(StreamState::Running);
        self.active = Some(active);
        Ok(())
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
            // Let the audio thread flush two blocks of silence first.
            shared.set_drain(2);
            shared.stop_gate.wait();
        }
        let Some(active) = self.active.take() else {
            shared.set_state(StreamState::Stopped);
            return Ok(());
        };
        match active.deactivate() {
            Ok((client, _notifications, handler)) => {
                let (process, out_ports, in_ports) = handler.into_parts();
                self.client = Some(client);
                self.core.restore_process(process);
                self.out_ports = out_ports;
                self.in_ports = in_ports;
                shared.set_state(StreamState::Stopped);
                Ok(())
            }
            Err(err) => {
                shared.set_state(StreamState::Stopped);
                Err(Error::SystemError(format!(
                    "unable to deactivate the JACK client: {err}"
                )))
            }
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
        self.active = None;
        self.out_ports.clear();
        self.in_ports.clear();
        self.port_names = [Vec::new(), Vec::new()];
        self.device_names = [None, None];
        self.client = None;
        self.core.clear_stream();
        Ok(())
    }
}

impl Drop for Jack {
    fn drop(&mut self) {
        if self.core.is_open() {
            let _ = self.close_stream();
        }
    }
}

fn with_probe_client<R>(name: &str, f: impl FnOnce(&jack::Client) -> R) -> Result<R, Error> {
    let (client, _status) = jack::Client::new(name, jack::ClientOptions::NO_START_SERVER)
        .map_err(|err| Error::SystemError(format!("could not reach the JACK server: {err}")))?;
    Ok(f(&client))
}

fn open_client(name: &str) -> Result<jack::Client, Error> {
    match jack::Client::new(name, jack::ClientOptions::NO_START_SERVER) {
        Ok((client, status)) => {
            if status.intersects(jack::ClientStatus::SERVER_ERROR) {
                return Err(Error::SystemError(
                    "there was an error communicating with the JACK server".into(),
                ));
            }
            if status.intersects(jack::ClientStatus::SERVER_FAILED) {
                return Err(Error::SystemError(
                    "could not connect to the JACK server".into(),
                ));
            }
            Ok(client)
        }
        Err(err) => Err(Error::SystemError(format!(
            "failed to open a JACK client: {err}"
        ))),
    }
}

/// Groups the server's port names by their client prefix, preserving first
/// appearance order. Each group is one device (twice: capture and
/// playback).
fn port_groups(client: &jack::Client) -> Vec<String> {
    let mut groups: Vec<String> = Vec::new();
    for port in client.ports(None, None, jack::PortFlags::empty()) {
        if let Some((group, _)) = port.split_once(':') {
            if !groups.iter().any(|existing| existing == group) {
                groups.push(group.to_string());
            }
        }
    }
    groups
}
