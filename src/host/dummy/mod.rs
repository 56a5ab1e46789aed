//! The no-op backend.
//!
//! Always constructible, sees no devices, and refuses to open anything.
//! It exists so the dispatcher's default instantiation has a floor and so
//! environments without audio can still exercise the control surface.

use std::sync::{Arc, Mutex};

use crate::engine::StreamCore;
use crate::interface::ApiHandle;
use crate::traits::Api;
use crate::{
    DeviceInfo, Error, SampleFormat, Side, StreamOptions, StreamParameters,
};

pub struct Dummy {
    core: StreamCore,
}

impl Dummy {
    pub fn create() -> Result<ApiHandle, Error> {
        log::warn!("the dummy backend provides no functionality");
        Ok(Arc::new(Mutex::new(Dummy {
            core: StreamCore::new(),
        })))
    }
}

impl Api for Dummy {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn stream(&self) -> &StreamCore {
        &self.core
    }

    fn stream_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn device_count(&mut self) -> u32 {
        0
    }

    fn device_info(&mut self, _device: u32) -> DeviceInfo {
        DeviceInfo::default()
    }

    fn probe_open(
        &mut self,
        _side: Side,
        _params: &StreamParameters,
        _sample_rate: u32,
        _format: SampleFormat,
        _block_size: &mut u32,
        _options: &StreamOptions,
    ) -> Result<(), Error> {
        Err(Error::Failed("the dummy backend cannot open devices".into()))
    }

    fn start_stream(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn abort_stream(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close_stream(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
