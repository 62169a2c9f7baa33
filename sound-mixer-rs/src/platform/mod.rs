//! Platform audio providers.
//!
//! The audio core only talks to the operating system through the
//! [`AudioProvider`] capability. Each backend hands out exclusive handles for
//! endpoints and sessions; dropping a handle releases the native resources
//! behind it.

pub mod memory;
#[cfg(all(unix, feature = "pulse"))]
pub mod pulse;
#[cfg(windows)]
pub mod wasapi;

use std::fmt;
use std::sync::Arc;

use crate::audio::{AudioError, DeviceDescriptor, DeviceKind, Result, SessionState};

pub use memory::MemoryProvider;

/// Values reported by a platform volume-change callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeNotification {
    /// Master volume scalar (0.0 to 1.0)
    pub volume: f32,

    pub muted: bool,

    /// Channel count, when the platform reports it with the change
    pub channels: Option<u32>,
}

/// Callback invoked on a platform-owned thread.
pub type VolumeCallback = Arc<dyn Fn(VolumeNotification) + Send + Sync>;

/// Change-notification registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap the backend-specific unsubscribe action.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A subscription with nothing to release.
    pub fn detached() -> Self {
        Self { release: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Live handle to one endpoint, owned by exactly one `Device`.
///
/// Control calls may run concurrently with a notification callback on another
/// thread, hence `Sync`.
pub trait EndpointHandle: Send + Sync {
    /// Current description (name and kind can change while the id stays).
    fn descriptor(&self) -> Result<DeviceDescriptor>;

    fn volume(&self) -> Result<f32>;
    fn set_volume(&self, volume: f32) -> Result<()>;
    fn mute(&self) -> Result<bool>;
    fn set_mute(&self, muted: bool) -> Result<()>;

    /// Per-channel volume scalars, in platform channel order.
    fn channel_volumes(&self) -> Result<Vec<f32>>;
    fn set_channel_volumes(&self, channels: &[f32]) -> Result<()>;

    /// Fresh enumeration of the streams routed through this endpoint.
    fn sessions(&self) -> Result<Vec<Box<dyn SessionHandle>>>;

    /// Register for volume/mute change notifications.
    fn subscribe(&self, callback: VolumeCallback) -> Result<Subscription>;
}

/// Live handle to one audio stream.
pub trait SessionHandle: Send {
    /// Platform session identifier, if the platform exposes one.
    fn identifier(&self) -> Option<String>;
    fn process_path(&self) -> String;
    fn display_name(&self) -> String;
    fn state(&self) -> Result<SessionState>;

    fn volume(&self) -> Result<f32>;
    fn set_volume(&self, volume: f32) -> Result<()>;
    fn mute(&self) -> Result<bool>;
    fn set_mute(&self, muted: bool) -> Result<()>;
    fn channel_volumes(&self) -> Result<Vec<f32>>;
    fn set_channel_volumes(&self, channels: &[f32]) -> Result<()>;
}

/// Enumeration and resolution primitives of one audio stack.
pub trait AudioProvider: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Active endpoints matching `kind` (`DeviceKind::All` for every direction).
    fn enumerate_endpoints(&self, kind: DeviceKind) -> Result<Vec<DeviceDescriptor>>;

    /// Id of the current default endpoint, `None` if the platform has none.
    fn default_endpoint(&self, kind: DeviceKind) -> Result<Option<String>>;

    /// Open a handle by id. Fails with `DeviceNotFound` when the id is gone.
    fn resolve_endpoint(&self, id: &str) -> Result<Box<dyn EndpointHandle>>;
}

/// Provider for the operating system this crate was built for.
#[allow(unreachable_code)]
pub fn platform_provider() -> Result<Arc<dyn AudioProvider>> {
    #[cfg(windows)]
    {
        return Ok(Arc::new(wasapi::WindowsProvider::new()?));
    }

    #[cfg(all(unix, feature = "pulse"))]
    {
        return Ok(Arc::new(pulse::PulseProvider::connect()?));
    }

    Err(AudioError::Platform(
        "no audio backend compiled for this platform".to_string(),
    ))
}
