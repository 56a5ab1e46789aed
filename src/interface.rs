//! Backend selection and forwarding.
//!
//! An [`Interface`] owns a registry of backend factories and, once one is
//! instantiated, forwards every engine operation to it. Clients that know
//! exactly which backend they want name it; everyone else lets the
//! registry order decide (real subsystems first, the no-op backend last).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::traits::Api;
use crate::{
    DeviceInfo, Error, SampleFormat, StreamCallback, StreamOptions, StreamParameters,
};

/// A backend behind its stream mutex.
pub type ApiObject = Mutex<dyn Api + Send>;

/// A live, shared backend.
pub type ApiHandle = Arc<ApiObject>;

/// Constructs a backend, failing when its subsystem is unreachable.
pub type ApiFactory = Box<dyn Fn() -> Result<ApiHandle, Error> + Send>;

/// Selects one of the available audio backends and presents the uniform
/// streaming interface over it.
pub struct Interface {
    registry: Vec<(&'static str, ApiFactory)>,
    api: Option<ApiHandle>,
}

impl Default for Interface {
    fn default() -> Interface {
        Interface::new()
    }
}

impl Interface {
    /// Builds an interface with the backends compiled into this crate, in
    /// preference order.
    pub fn new() -> Interface {
        let mut registry: Vec<(&'static str, ApiFactory)> = Vec::new();
        #[cfg(all(
            any(
                target_os = "linux",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "macos",
                target_os = "windows"
            ),
            feature = "jack"
        ))]
        registry.push(("jack", Box::new(crate::host::jack::Jack::create)));
        registry.push(("dummy", Box::new(crate::host::dummy::Dummy::create)));
        Interface {
            registry,
            api: None,
        }
    }

    /// The registered backend names, in the order `instantiate(None)`
    /// tries them.
    pub fn available_apis(&self) -> Vec<&'static str> {
        self.registry.iter().map(|(name, _)| *name).collect()
    }

    /// Registers an additional backend factory.
    ///
    /// The factory is inserted ahead of the no-op backend so a default
    /// instantiation prefers it. This is how platform glue contributes
    /// backends the crate cannot construct on its own, such as the
    /// host-service bridge.
    pub fn add_api(&mut self, name: &'static str, factory: ApiFactory) {
        let at = self
            .registry
            .iter()
            .position(|(existing, _)| *existing == "dummy")
            .unwrap_or(self.registry.len());
        self.registry.insert(at, (name, factory));
    }

    /// Instantiates a backend, replacing any current one (its stream is
    /// closed first).
    ///
    /// With a name, that exact backend is constructed. Without one, the
    /// registry is walked in order and the first factory that succeeds
    /// wins.
    pub fn instantiate(&mut self, name: Option<&str>) -> Result<(), Error> {
        self.clear()?;
        match name {
            Some(name) => {
                let factory = self
                    .registry
                    .iter()
                    .find(|(existing, _)| *existing == name)
                    .map(|(_, factory)| factory)
                    .ok_or_else(|| Error::InvalidUse(format!("unknown backend \"{name}\"")))?;
                self.api = Some(factory()?);
                Ok(())
            }
            None => {
                for (name, factory) in &self.registry {
                    match factory() {
                        Ok(api) => {
                            self.api = Some(api);
                            return Ok(());
                        }
                        Err(err) => log::debug!("backend {name} unavailable: {err}"),
                    }
                }
                Err(Error::Failed("no audio backend could be instantiated".into()))
            }
        }
    }

    /// Closes any open stream and drops the instantiated backend.
    pub fn clear(&mut self) -> Result<(), Error> {
        if let Some(api) = self.api.take() {
            let mut api = api.lock().unwrap_or_else(|e| e.into_inner());
            if api.is_stream_open() {
                let _ = api.close_stream();
            }
        }
        Ok(())
    }

    /// Name of the instantiated backend, if any.
    pub fn current_api(&self) -> Option<&'static str> {
        self.api
            .as_ref()
            .map(|api| api.lock().unwrap_or_else(|e| e.into_inner()).name())
    }

    /// The shared handle of the instantiated backend, for callers that
    /// need to reach backend-specific surface.
    pub fn handle(&self) -> Option<ApiHandle> {
        self.api.clone()
    }

    fn with_api<R>(&self, op: impl FnOnce(&mut (dyn Api + Send)) -> R) -> Result<R, Error> {
        match &self.api {
            Some(api) => {
                let mut guard = api.lock().unwrap_or_else(|e| e.into_inner());
                Ok(op(&mut *guard))
            }
            None => Err(Error::InputNull("no backend instantiated".into())),
        }
    }

    /// Number of devices the backend can currently see.
    pub fn device_count(&self) -> u32 {
        self.with_api(|api| api.device_count()).unwrap_or(0)
    }

    /// Snapshot of every visible device.
    pub fn enumerate(&self) -> Vec<DeviceInfo> {
        self.with_api(|api| api.enumerate()).unwrap_or_default()
    }

    /// Capability snapshot of one device.
    pub fn device_info(&self, device: u32) -> DeviceInfo {
        self.with_api(|api| api.device_info(device))
            .unwrap_or_default()
    }

    pub fn default_input_device(&self) -> u32 {
        self.with_api(|api| api.default_input_device()).unwrap_or(0)
    }

    pub fn default_output_device(&self) -> u32 {
        self.with_api(|api| api.default_output_device()).unwrap_or(0)
    }

    /// Opens a stream; see [`Api::open_stream`].
    #[allow(clippy::too_many_arguments)]
    pub fn open_stream(
        &self,
        output: Option<&StreamParameters>,
        input: Option<&StreamParameters>,
        format: SampleFormat,
        sample_rate: u32,
        block_size: &mut u32,
        callback: StreamCallback,
        options: &StreamOptions,
    ) -> Result<(), Error> {
        self.with_api(|api| {
            api.open_stream(
                output,
                input,
                format,
                sample_rate,
                block_size,
                callback,
                options,
            )
        })?
    }

    /// Closes the stream; see [`Api::close_stream`].
    pub fn close_stream(&self) -> Result<(), Error> {
        self.with_api(|api| api.close_stream())?
    }

    /// Starts the stream; see [`Api::start_stream`].
    pub fn start_stream(&self) -> Result<(), Error> {
        self.with_api(|api| api.start_stream())?
    }

    /// Stops the stream after draining pending output; see
    /// [`Api::stop_stream`].
    pub fn stop_stream(&self) -> Result<(), Error> {
        self.with_api(|api| api.stop_stream())?
    }

    /// Stops the stream discarding pending output; see
    /// [`Api::abort_stream`].
    pub fn abort_stream(&self) -> Result<(), Error> {
        self.with_api(|api| api.abort_stream())?
    }

    /// `true` when a stream is open on the instantiated backend.
    pub fn is_stream_open(&self) -> bool {
        self.with_api(|api| api.is_stream_open()).unwrap_or(false)
    }

    /// `true` while the stream is running.
    pub fn is_stream_running(&self) -> bool {
        self.with_api(|api| api.is_stream_running()).unwrap_or(false)
    }

    /// Elapsed stream time.
    pub fn stream_time(&self) -> Result<Duration, Error> {
        self.with_api(|api| api.stream_time())?
    }

    /// Stream latency in frames.
    pub fn stream_latency(&self) -> Result<usize, Error> {
        self.with_api(|api| api.stream_latency())?
    }

    /// Sample rate captured at open.
    pub fn stream_sample_rate(&self) -> Result<u32, Error> {
        self.with_api(|api| api.stream_sample_rate())?
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        let _ = self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarding_without_a_backend_is_input_null() {
        let audio = Interface::new();
        assert!(matches!(audio.stream_time(), Err(Error::InputNull(_))));
        assert!(matches!(audio.close_stream(), Err(Error::InputNull(_))));
        assert!(!audio.is_stream_open());
        assert_eq!(audio.device_count(), 0);
    }

    #[test]
    fn unknown_backend_name_is_invalid_use() {
        let mut audio = Interface::new();
        assert!(matches!(
            audio.instantiate(Some("no-such-backend")),
            Err(Error::InvalidUse(_))
        ));
    }

    #[test]
    fn default_instantiation_falls_back_to_the_no_op_backend() {
        let mut audio = Interface::new();
        audio.instantiate(None).unwrap();
        assert!(audio.current_api().is_some());
        // Whatever was picked reports a consistent device view.
        let devices = audio.enumerate();
        assert_eq!(devices.len() as u32, audio.device_count());
    }

    #[test]
    fn added_backends_run_ahead_of_the_no_op_backend() {
        let mut audio = Interface::new();
        audio.add_api("custom", Box::new(crate::host::dummy::Dummy::create));
        let names = audio.available_apis();
        let custom = names.iter().position(|n| *n == "custom").unwrap();
        let dummy = names.iter().position(|n| *n == "dummy").unwrap();
        assert!(custom < dummy);
        audio.instantiate(Some("custom")).unwrap();
        assert_eq!(audio.current_api(), Some("dummy"));
    }
}
