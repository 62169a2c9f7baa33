//! Tracked audio endpoints.
//!
//! A [`Device`] owns the platform handle for one endpoint plus its change
//! subscription. Validity is only recomputed by [`Device::update`]; control
//! calls on an invalid device fail fast with `StaleHandle`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, info};

use super::bridge::{LastKnown, NotificationBridge};
use super::descriptor::{clamp_volume, DeviceDescriptor, DeviceKind, VolumeBalance};
use super::error::{AudioError, Result};
use super::session::Session;
use crate::platform::{
    AudioProvider, EndpointHandle, Subscription, VolumeCallback, VolumeNotification,
};

/// State shared with the platform notification callback.
///
/// The callback only holds a `Weak` to this, so notifications arriving after
/// the device is dropped are discarded.
pub(crate) struct DeviceState {
    id: String,
    desc: RwLock<DeviceDescriptor>,
    active: AtomicBool,
    pub(crate) cache: Mutex<LastKnown>,
    pub(crate) order: ReentrantMutex<()>,
}

impl DeviceState {
    fn new(desc: DeviceDescriptor) -> Self {
        Self {
            id: desc.id.clone(),
            desc: RwLock::new(desc),
            active: AtomicBool::new(false),
            cache: Mutex::new(LastKnown {
                volume: 0.0,
                muted: false,
                channels: None,
            }),
            order: ReentrantMutex::new(()),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn descriptor(&self) -> DeviceDescriptor {
        self.desc.read().clone()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

// Field order matters: the subscription is released before the handle.
#[derive(Default)]
struct Control {
    subscription: Option<Subscription>,
    handle: Option<Arc<dyn EndpointHandle>>,
}

/// An audio endpoint tracked by a [`DeviceRegistry`](super::DeviceRegistry).
pub struct Device {
    state: Arc<DeviceState>,
    control: Mutex<Control>,
    provider: Arc<dyn AudioProvider>,
    bridge: NotificationBridge,
}

impl Device {
    /// Resolve `id` and start listening for its changes.
    pub(crate) fn open(
        provider: Arc<dyn AudioProvider>,
        id: &str,
        bridge: NotificationBridge,
    ) -> Result<Arc<Self>> {
        let handle: Arc<dyn EndpointHandle> = Arc::from(provider.resolve_endpoint(id)?);
        let desc = handle.descriptor()?;
        let device = Arc::new(Self {
            state: Arc::new(DeviceState::new(desc)),
            control: Mutex::new(Control::default()),
            provider,
            bridge,
        });
        device.attach(handle)?;
        info!(device_id = %device.id(), name = %device.descriptor().name, "Device opened");
        Ok(device)
    }

    pub fn id(&self) -> &str {
        self.state.id()
    }

    pub fn kind(&self) -> DeviceKind {
        self.state.desc.read().kind
    }

    /// Snapshot of the descriptor as of the last successful update.
    pub fn descriptor(&self) -> DeviceDescriptor {
        self.state.descriptor()
    }

    /// Validity as of the last update; never probes the platform.
    pub fn is_valid(&self) -> bool {
        self.state.is_active()
    }

    /// Volume and mute the notification bridge currently diffs against.
    pub fn last_known(&self) -> (f32, bool) {
        let cache = self.state.cache.lock();
        (cache.volume, cache.muted)
    }

    /// Re-resolve the endpoint and refresh descriptor and subscription.
    ///
    /// Changes the device made since the last notification are dispatched to
    /// listeners as part of the refresh.
    ///
    /// Returns false, releasing the handle and the subscription, when the
    /// endpoint can no longer be resolved.
    pub fn update(&self) -> bool {
        match self.refresh() {
            Ok(fresh) => {
                if let Some(fresh) = fresh {
                    self.catch_up(fresh);
                }
                true
            }
            Err(_) => false,
        }
    }

    /// The re-resolving half of [`update`](Self::update).
    ///
    /// Returns the values still to be diffed for a device that stayed valid.
    /// Callers holding locks pass them to [`catch_up`](Self::catch_up) once
    /// released, since listeners may run inline.
    pub(crate) fn refresh(&self) -> Result<Option<VolumeNotification>> {
        let result = self
            .provider
            .resolve_endpoint(self.id())
            .and_then(|handle| self.attach(Arc::from(handle)));
        if let Err(err) = &result {
            debug!(device_id = %self.id(), error = %err, "Device revalidation failed");
            self.retire();
        }
        result
    }

    /// Report changes the platform has not notified yet.
    pub(crate) fn catch_up(&self, fresh: VolumeNotification) {
        self.bridge.deliver(&self.state, fresh);
    }

    /// Retire the device: release its handle and subscription.
    pub fn invalidate(&self) {
        if self.is_valid() {
            info!(device_id = %self.id(), "Device retired");
        }
        self.retire();
    }

    pub fn volume(&self) -> Result<f32> {
        let handle = self.handle()?;
        self.checked(handle.volume())
    }

    /// Set the master volume; out-of-range values are clamped to [0, 1].
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let handle = self.handle()?;
        self.checked(handle.set_volume(clamp_volume(volume)))
    }

    /// Add `delta` to the current volume and return the value applied.
    pub fn change_volume(&self, delta: f32) -> Result<f32> {
        let handle = self.handle()?;
        let current = self.checked(handle.volume())?;
        let volume = clamp_volume(current + delta);
        self.checked(handle.set_volume(volume))?;
        Ok(volume)
    }

    pub fn mute(&self) -> Result<bool> {
        let handle = self.handle()?;
        self.checked(handle.mute())
    }

    pub fn set_mute(&self, muted: bool) -> Result<()> {
        let handle = self.handle()?;
        self.checked(handle.set_mute(muted))
    }

    /// Flip the mute state and return the new value.
    pub fn toggle_mute(&self) -> Result<bool> {
        let handle = self.handle()?;
        let muted = !self.checked(handle.mute())?;
        self.checked(handle.set_mute(muted))?;
        Ok(muted)
    }

    pub fn balance(&self) -> Result<VolumeBalance> {
        let handle = self.handle()?;
        let channels = self.checked(handle.channel_volumes())?;
        Ok(VolumeBalance::from_channels(&channels))
    }

    /// Apply a stereo balance. Ignored for mono endpoints, non-stereo
    /// balances and values outside the open interval (0, 1).
    pub fn set_balance(&self, balance: VolumeBalance) -> Result<()> {
        let handle = self.handle()?;
        let mut channels = self.checked(handle.channel_volumes())?;
        if !balance.apply_to(&mut channels) {
            debug!(device_id = %self.id(), ?balance, "Balance not applicable");
            return Ok(());
        }
        self.checked(handle.set_channel_volumes(&channels))
    }

    /// Streams currently routed through this device. Queried fresh each call.
    pub fn sessions(&self) -> Result<Vec<Session>> {
        let handle = self.handle()?;
        let sessions = self.checked(handle.sessions())?;
        Ok(sessions
            .into_iter()
            .map(|session| Session::new(self.id(), session))
            .collect())
    }

    /// The first current session whose id is `id`.
    pub fn session(&self, id: &str) -> Result<Session> {
        self.sessions()?
            .into_iter()
            .find(|s| s.id() == id)
            .ok_or_else(|| AudioError::SessionNotFound {
                session_id: id.to_string(),
            })
    }

    fn stale(&self) -> AudioError {
        AudioError::StaleHandle {
            device_id: self.id().to_string(),
        }
    }

    /// Live handle, cloned out of the lock so platform calls run unlocked.
    fn handle(&self) -> Result<Arc<dyn EndpointHandle>> {
        if !self.is_valid() {
            return Err(self.stale());
        }
        self.control.lock().handle.clone().ok_or_else(|| self.stale())
    }

    /// Map "endpoint gone" into a retirement plus `StaleHandle`.
    fn checked<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(AudioError::DeviceNotFound { .. }) => {
                info!(device_id = %self.id(), "Device disappeared during control call");
                self.retire();
                Err(self.stale())
            }
            other => other,
        }
    }

    fn retire(&self) {
        self.state.active.store(false, Ordering::Release);
        let (subscription, handle) = {
            let mut control = self.control.lock();
            (control.subscription.take(), control.handle.take())
        };
        drop(subscription);
        drop(handle);
    }

    /// Install `handle` and replace the subscription.
    ///
    /// The cache is seeded only when the device was not active. A live device
    /// keeps its cache and gets the fresh values back for diffing, so a change
    /// whose callback is still in flight is reported once either way.
    fn attach(&self, handle: Arc<dyn EndpointHandle>) -> Result<Option<VolumeNotification>> {
        let desc = handle.descriptor()?;
        let fresh = VolumeNotification {
            volume: handle.volume()?,
            muted: handle.mute()?,
            channels: handle.channel_volumes().ok().map(|c| c.len() as u32),
        };
        let reviving = !self.state.is_active();

        // Replace, never add: the previous subscription goes first
        let previous = {
            let mut control = self.control.lock();
            control.handle = Some(Arc::clone(&handle));
            control.subscription.take()
        };
        drop(previous);

        {
            let mut current = self.state.desc.write();
            if *current != desc {
                if current.name != desc.name {
                    info!(
                        device_id = %desc.id,
                        from = %current.name,
                        to = %desc.name,
                        "Device renamed"
                    );
                }
                *current = desc;
            }
        }
        if reviving {
            *self.state.cache.lock() = LastKnown {
                volume: fresh.volume,
                muted: fresh.muted,
                channels: fresh.channels,
            };
            self.state.active.store(true, Ordering::Release);
        }

        let subscription = handle.subscribe(self.callback())?;
        self.control.lock().subscription = Some(subscription);
        debug!(device_id = %self.id(), "Change subscription installed");

        Ok((!reviving).then_some(fresh))
    }

    fn callback(&self) -> VolumeCallback {
        let state = Arc::downgrade(&self.state);
        let bridge = self.bridge.clone();
        Arc::new(move |notification| {
            if let Some(state) = state.upgrade() {
                bridge.deliver(&state, notification);
            }
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("descriptor", &self.descriptor())
            .field("valid", &self.is_valid())
            .finish()
    }
}
