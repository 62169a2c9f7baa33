//! WASAPI backend for Windows.
//!
//! Every call joins the multithreaded COM apartment on the calling thread, so
//! the provider and its handles can be used from any host thread.

mod enumerator;
mod notifications;
mod sessions;
mod volume;

use tracing::debug;
use windows::Win32::System::Com::{CoDecrementMTAUsage, CoIncrementMTAUsage, CO_MTA_USAGE_COOKIE};

use self::enumerator::{ComGuard, DeviceEnumerator};
use self::volume::WindowsEndpoint;
use super::{AudioProvider, EndpointHandle};
use crate::audio::{AudioError, DeviceDescriptor, DeviceKind, Result};

/// Provider backed by the MMDevice API.
///
/// Keeps the multithreaded apartment alive for its lifetime so endpoint
/// objects survive the per-call `ComGuard`s.
pub struct WindowsProvider {
    mta: CO_MTA_USAGE_COOKIE,
}

// SAFETY: the cookie is an opaque token only passed back to CoDecrementMTAUsage.
unsafe impl Send for WindowsProvider {}
unsafe impl Sync for WindowsProvider {}

impl WindowsProvider {
    pub fn new() -> Result<Self> {
        let mta = unsafe { CoIncrementMTAUsage() }.map_err(AudioError::ComInitFailed)?;
        let provider = Self { mta };
        {
            let _com = ComGuard::new()?;
            DeviceEnumerator::new()?;
        }
        debug!("WASAPI provider ready");
        Ok(provider)
    }
}

impl Drop for WindowsProvider {
    fn drop(&mut self) {
        if let Err(err) = unsafe { CoDecrementMTAUsage(self.mta) } {
            debug!(error = %err, "CoDecrementMTAUsage failed");
        }
    }
}

impl AudioProvider for WindowsProvider {
    fn name(&self) -> &'static str {
        "wasapi"
    }

    fn enumerate_endpoints(&self, kind: DeviceKind) -> Result<Vec<DeviceDescriptor>> {
        let _com = ComGuard::new()?;
        DeviceEnumerator::new()?.endpoints(kind)
    }

    fn default_endpoint(&self, kind: DeviceKind) -> Result<Option<String>> {
        let _com = ComGuard::new()?;
        DeviceEnumerator::new()?.default_device_id(kind)
    }

    fn resolve_endpoint(&self, id: &str) -> Result<Box<dyn EndpointHandle>> {
        let _com = ComGuard::new()?;
        let device = DeviceEnumerator::new()?.device(id)?;
        Ok(Box::new(WindowsEndpoint::new(id, device)?))
    }
}
