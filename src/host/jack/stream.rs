//! The JACK process and notification handlers.

use std::sync::{Arc, Weak};

use crate::engine::{Control, SharedState, StreamProcess, INPUT, OUTPUT};
use crate::interface::ApiObject;
use crate::traits::Api;
use crate::{Side, StreamState};

/// Runs the engine's block handler on the JACK process thread.
///
/// Owns the registered ports and the block handler for the duration of a
/// run; deactivation hands everything back to the backend so the stream
/// can be restarted.
pub(super) struct ProcessHandler {
    process: StreamProcess,
    out_ports: Vec<jack::Port<jack::AudioOut>>,
    in_ports: Vec<jack::Port<jack::AudioIn>>,
}

impl ProcessHandler {
    pub(super) fn new(
        process: StreamProcess,
        out_ports: Vec<jack::Port<jack::AudioOut>>,
        in_ports: Vec<jack::Port<jack::AudioIn>>,
    ) -> ProcessHandler {
        ProcessHandler {
            process,
            out_ports,
            in_ports,
        }
    }

    pub(super) fn into_parts(
        self,
    ) -> (
        StreamProcess,
        Vec<jack::Port<jack::AudioOut>>,
        Vec<jack::Port<jack::AudioIn>>,
    ) {
        (self.process, self.out_ports, self.in_ports)
    }
}

impl jack::ProcessHandler for ProcessHandler {
    fn process(&mut self, _: &jack::Client, scope: &jack::ProcessScope) -> jack::Control {
        let frames = scope.n_frames() as usize;
        let in_ports = &self.in_ports;
        let out_ports = &mut self.out_ports;
        // JACK buffers are per-channel f32 slices; the engine's device
        // format for this backend matches, so gather/scatter are plain
        // byte copies.
        let control = self.process.cycle(
            frames,
            |channel, dst| {
                let samples = in_ports[channel].as_slice(scope);
                let bytes = unsafe {
                    std::slice::from_raw_parts(samples.as_ptr().cast::<u8>(), samples.len() * 4)
                };
                dst.copy_from_slice(&bytes[..dst.len()]);
            },
            |channel, src| {
                let samples = out_ports[channel].as_mut_slice(scope);
                let bytes = unsafe {
                    std::slice::from_raw_parts_mut(
                        samples.as_mut_ptr().cast::<u8>(),
                        samples.len() * 4,
                    )
                };
                bytes[..src.len()].copy_from_slice(src);
            },
        );
        match control {
            Control::Continue => jack::Control::Continue,
            Control::Quit => jack::Control::Quit,
        }
    }
}

/// Receives out-of-band notifications from the JACK server.
pub(super) struct Notifications {
    shared: Arc<SharedState>,
    api: Weak<ApiObject>,
    sides: [bool; 2],
    saw_sample_rate: bool,
    saw_buffer_size: bool,
}

impl Notifications {
    pub(super) fn new(
        shared: Arc<SharedState>,
        api: Weak<ApiObject>,
        sides: [bool; 2],
    ) -> Notifications {
        Notifications {
            shared,
            api,
            sides,
            saw_sample_rate: false,
            saw_buffer_size: false,
        }
    }
}

impl jack::NotificationHandler for Notifications {
    fn shutdown(&mut self, _status: jack::ClientStatus, reason: &str) {
        // Deactivating our own client also lands here; only a shutdown
        // under a running stream means the server went away.
        if self.shared.state() != StreamState::Running {
            return;
        }
        log::error!("the JACK server is shutting this client down: {reason}");
        let weak = self.api.clone();
        std::thread::spawn(move || {
            if let Some(api) = weak.upgrade() {
                let mut api = api.lock().unwrap_or_else(|e| e.into_inner());
                if api.is_stream_open() {
                    let _ = api.close_stream();
                }
            }
        });
    }

    fn sample_rate(&mut self, _: &jack::Client, rate: jack::Frames) -> jack::Control {
        // One notification arrives when the client starts.
        if !self.saw_sample_rate {
            self.saw_sample_rate = true;
            return jack::Control::Continue;
        }
        log::error!("the JACK server changed its sample rate to {rate}; stopping");
        jack::Control::Quit
    }

    fn buffer_size(&mut self, _: &jack::Client, size: jack::Frames) -> jack::Control {
        if !self.saw_buffer_size {
            self.saw_buffer_size = true;
            return jack::Control::Continue;
        }
        // The block handler rejects mismatched cycles on its own.
        log::error!("the JACK server changed its buffer size to {size}");
        jack::Control::Continue
    }

    fn xrun(&mut self, _: &jack::Client) -> jack::Control {
        if self.sides[OUTPUT] {
            self.shared.mark_xrun(Side::Output);
        }
        if self.sides[INPUT] {
            self.shared.mark_xrun(Side::Input);
        }
        jack::Control::Continue
    }
}
