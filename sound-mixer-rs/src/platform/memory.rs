//! In-process simulated sound server.
//!
//! Behaves like a real backend from the core's point of view: ids can
//! disappear under live handles, setters raise change notifications just like
//! WASAPI does for its own writes, and notifications are delivered on whatever
//! thread performs the change. Used by the test suites, by headless hosts and
//! by the CLI's `--backend memory` mode.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    AudioProvider, EndpointHandle, SessionHandle, Subscription, VolumeCallback,
    VolumeNotification,
};
use crate::audio::{clamp_volume, AudioError, DeviceDescriptor, DeviceKind, Result, SessionState};

#[derive(Debug, Clone)]
struct MemoryEndpoint {
    desc: DeviceDescriptor,
    volume: f32,
    muted: bool,
    channels: Vec<f32>,
    sessions: Vec<MemorySession>,
}

#[derive(Debug, Clone)]
struct MemorySession {
    key: u64,
    identifier: Option<String>,
    process_path: String,
    display_name: String,
    state: SessionState,
    volume: f32,
    muted: bool,
    channels: Vec<f32>,
}

#[derive(Default)]
struct MemoryState {
    endpoints: Vec<MemoryEndpoint>,
    default_output: Option<String>,
    default_input: Option<String>,
    subscribers: HashMap<String, Vec<(u64, VolumeCallback)>>,
    next_subscription: u64,
    next_session: u64,
    fail_enumeration: bool,
    deferred: bool,
    undelivered: Vec<(VolumeCallback, VolumeNotification)>,
}

impl MemoryState {
    fn endpoint(&self, id: &str) -> Result<&MemoryEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.desc.id == id)
            .ok_or_else(|| AudioError::DeviceNotFound {
                device_id: id.to_string(),
            })
    }

    fn endpoint_mut(&mut self, id: &str) -> Result<&mut MemoryEndpoint> {
        self.endpoints
            .iter_mut()
            .find(|e| e.desc.id == id)
            .ok_or_else(|| AudioError::DeviceNotFound {
                device_id: id.to_string(),
            })
    }

    fn session_mut(&mut self, device_id: &str, key: u64) -> Result<&mut MemorySession> {
        self.endpoint_mut(device_id)?
            .sessions
            .iter_mut()
            .find(|s| s.key == key)
            .ok_or_else(|| AudioError::SessionNotFound {
                session_id: key.to_string(),
            })
    }

    fn callbacks_for(&self, id: &str) -> Vec<VolumeCallback> {
        self.subscribers
            .get(id)
            .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

/// Description of a simulated audio session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub identifier: Option<String>,
    pub process_path: String,
    pub display_name: String,
    pub state: SessionState,
    pub channels: usize,
}

impl SessionSpec {
    pub fn new(identifier: &str, display_name: &str, process_path: &str) -> Self {
        Self {
            identifier: Some(identifier.to_string()),
            process_path: process_path.to_string(),
            display_name: display_name.to_string(),
            state: SessionState::Active,
            channels: 2,
        }
    }

    /// A session whose platform identifier is unavailable.
    pub fn anonymous(display_name: &str, process_path: &str) -> Self {
        Self {
            identifier: None,
            ..Self::new("", display_name, process_path)
        }
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = state;
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }
}

/// Simulated audio stack. Cloning shares the same simulated server.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stereo endpoint at full volume, unmuted.
    pub fn add_endpoint(&self, id: &str, name: &str, kind: DeviceKind) {
        self.add_endpoint_with_channels(id, name, kind, 2);
    }

    pub fn add_endpoint_with_channels(
        &self,
        id: &str,
        name: &str,
        kind: DeviceKind,
        channels: usize,
    ) {
        let mut state = self.state.lock();
        state.endpoints.retain(|e| e.desc.id != id);
        state.endpoints.push(MemoryEndpoint {
            desc: DeviceDescriptor::new(id, name, kind),
            volume: 1.0,
            muted: false,
            channels: vec![1.0; channels],
            sessions: Vec::new(),
        });
        debug!(device_id = id, %kind, "Simulated endpoint added");
    }

    /// Unplug an endpoint. Live handles start failing with `DeviceNotFound`.
    pub fn remove_endpoint(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.endpoints.len();
        state.endpoints.retain(|e| e.desc.id != id);
        if state.default_output.as_deref() == Some(id) {
            state.default_output = None;
        }
        if state.default_input.as_deref() == Some(id) {
            state.default_input = None;
        }
        before != state.endpoints.len()
    }

    pub fn rename_endpoint(&self, id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.endpoint_mut(id)?.desc.name = name.to_string();
        Ok(())
    }

    /// Set (or clear) the default endpoint for `kind`.
    pub fn set_default(&self, kind: DeviceKind, id: Option<&str>) {
        let mut state = self.state.lock();
        let id = id.map(str::to_string);
        match kind {
            DeviceKind::Output => state.default_output = id,
            DeviceKind::Input => state.default_input = id,
            DeviceKind::All => {
                state.default_output = id.clone();
                state.default_input = id;
            }
        }
    }

    pub fn add_session(&self, device_id: &str, spec: SessionSpec) -> Result<()> {
        let mut state = self.state.lock();
        state.next_session += 1;
        let key = state.next_session;
        state.endpoint_mut(device_id)?.sessions.push(MemorySession {
            key,
            identifier: spec.identifier,
            process_path: spec.process_path,
            display_name: spec.display_name,
            state: spec.state,
            volume: 1.0,
            muted: false,
            channels: vec![1.0; spec.channels],
        });
        Ok(())
    }

    /// Change the lifecycle state of every session with `identifier`.
    pub fn set_session_state(
        &self,
        device_id: &str,
        identifier: &str,
        new_state: SessionState,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let endpoint = state.endpoint_mut(device_id)?;
        let mut found = false;
        for session in endpoint
            .sessions
            .iter_mut()
            .filter(|s| s.identifier.as_deref() == Some(identifier))
        {
            session.state = new_state;
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(AudioError::SessionNotFound {
                session_id: identifier.to_string(),
            })
        }
    }

    pub fn remove_session(&self, device_id: &str, identifier: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let endpoint = state.endpoint_mut(device_id)?;
        let before = endpoint.sessions.len();
        endpoint
            .sessions
            .retain(|s| s.identifier.as_deref() != Some(identifier));
        Ok(before != endpoint.sessions.len())
    }

    /// Make the next enumerations fail as if the audio service were down.
    pub fn fail_enumeration(&self, fail: bool) {
        self.state.lock().fail_enumeration = fail;
    }

    /// Simulate a change made outside this process (another mixer, a hardware
    /// key). Notifies subscribers on the calling thread.
    pub fn external_change(&self, id: &str, volume: f32, muted: bool) -> Result<()> {
        let callbacks = {
            let mut state = self.state.lock();
            let endpoint = state.endpoint_mut(id)?;
            endpoint.volume = clamp_volume(volume);
            endpoint.muted = muted;
            state.callbacks_for(id)
        };
        notify(&self.state, id, callbacks);
        Ok(())
    }

    /// Hold change notifications until [`deliver_pending`](Self::deliver_pending)
    /// instead of running them on the changing thread, the way WASAPI posts
    /// `OnNotify` from its own worker some time after the change.
    pub fn defer_notifications(&self, deferred: bool) {
        self.state.lock().deferred = deferred;
    }

    /// Run every held notification in arrival order. Returns how many ran.
    pub fn deliver_pending(&self) -> usize {
        let undelivered = std::mem::take(&mut self.state.lock().undelivered);
        let count = undelivered.len();
        for (callback, notification) in undelivered {
            callback(notification);
        }
        count
    }

    /// Number of live change subscriptions for an endpoint.
    pub fn subscriber_count(&self, id: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(id)
            .map_or(0, Vec::len)
    }
}

/// Deliver the endpoint's current values to `callbacks` without holding the lock.
fn notify(state: &Arc<Mutex<MemoryState>>, id: &str, callbacks: Vec<VolumeCallback>) {
    let snapshot = {
        let mut state = state.lock();
        let snapshot = state.endpoint(id).ok().map(|e| VolumeNotification {
            volume: e.volume,
            muted: e.muted,
            channels: Some(e.channels.len() as u32),
        });
        match snapshot {
            Some(notification) if state.deferred => {
                for callback in &callbacks {
                    state.undelivered.push((Arc::clone(callback), notification));
                }
                None
            }
            other => other,
        }
    };
    if let Some(notification) = snapshot {
        for callback in callbacks {
            callback(notification);
        }
    }
}

impl AudioProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn enumerate_endpoints(&self, kind: DeviceKind) -> Result<Vec<DeviceDescriptor>> {
        let state = self.state.lock();
        if state.fail_enumeration {
            return Err(AudioError::Platform(
                "simulated enumeration failure".to_string(),
            ));
        }
        Ok(state
            .endpoints
            .iter()
            .filter(|e| e.desc.kind.matches(kind))
            .map(|e| e.desc.clone())
            .collect())
    }

    fn default_endpoint(&self, kind: DeviceKind) -> Result<Option<String>> {
        let state = self.state.lock();
        Ok(match kind {
            DeviceKind::Output => state.default_output.clone(),
            DeviceKind::Input => state.default_input.clone(),
            DeviceKind::All => None,
        })
    }

    fn resolve_endpoint(&self, id: &str) -> Result<Box<dyn EndpointHandle>> {
        self.state.lock().endpoint(id)?;
        Ok(Box::new(MemoryEndpointHandle {
            id: id.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryEndpointHandle {
    id: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryEndpointHandle {
    /// Apply a change, then notify subscribers like the platform would.
    fn change(&self, apply: impl FnOnce(&mut MemoryEndpoint)) -> Result<()> {
        let callbacks = {
            let mut state = self.state.lock();
            apply(state.endpoint_mut(&self.id)?);
            state.callbacks_for(&self.id)
        };
        notify(&self.state, &self.id, callbacks);
        Ok(())
    }
}

impl EndpointHandle for MemoryEndpointHandle {
    fn descriptor(&self) -> Result<DeviceDescriptor> {
        Ok(self.state.lock().endpoint(&self.id)?.desc.clone())
    }

    fn volume(&self) -> Result<f32> {
        Ok(self.state.lock().endpoint(&self.id)?.volume)
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        self.change(|e| e.volume = clamp_volume(volume))
    }

    fn mute(&self) -> Result<bool> {
        Ok(self.state.lock().endpoint(&self.id)?.muted)
    }

    fn set_mute(&self, muted: bool) -> Result<()> {
        self.change(|e| e.muted = muted)
    }

    fn channel_volumes(&self) -> Result<Vec<f32>> {
        Ok(self.state.lock().endpoint(&self.id)?.channels.clone())
    }

    fn set_channel_volumes(&self, channels: &[f32]) -> Result<()> {
        let mut state = self.state.lock();
        let endpoint = state.endpoint_mut(&self.id)?;
        for (slot, value) in endpoint.channels.iter_mut().zip(channels) {
            *slot = clamp_volume(*value);
        }
        Ok(())
    }

    fn sessions(&self) -> Result<Vec<Box<dyn SessionHandle>>> {
        let state = self.state.lock();
        let endpoint = state.endpoint(&self.id)?;
        Ok(endpoint
            .sessions
            .iter()
            .map(|s| {
                Box::new(MemorySessionHandle {
                    device_id: self.id.clone(),
                    key: s.key,
                    identifier: s.identifier.clone(),
                    process_path: s.process_path.clone(),
                    display_name: s.display_name.clone(),
                    state: Arc::clone(&self.state),
                }) as Box<dyn SessionHandle>
            })
            .collect())
    }

    fn subscribe(&self, callback: VolumeCallback) -> Result<Subscription> {
        let token = {
            let mut state = self.state.lock();
            state.endpoint(&self.id)?;
            state.next_subscription += 1;
            let token = state.next_subscription;
            state
                .subscribers
                .entry(self.id.clone())
                .or_default()
                .push((token, callback));
            token
        };

        let state = Arc::clone(&self.state);
        let id = self.id.clone();
        Ok(Subscription::new(move || {
            let mut state = state.lock();
            if let Some(subs) = state.subscribers.get_mut(&id) {
                subs.retain(|(t, _)| *t != token);
                if subs.is_empty() {
                    state.subscribers.remove(&id);
                }
            }
        }))
    }
}

struct MemorySessionHandle {
    device_id: String,
    key: u64,
    identifier: Option<String>,
    process_path: String,
    display_name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySessionHandle {
    fn read<T>(&self, f: impl FnOnce(&MemorySession) -> T) -> Result<T> {
        let mut state = self.state.lock();
        Ok(f(state.session_mut(&self.device_id, self.key)?))
    }

    fn write(&self, f: impl FnOnce(&mut MemorySession)) -> Result<()> {
        let mut state = self.state.lock();
        f(state.session_mut(&self.device_id, self.key)?);
        Ok(())
    }
}

impl SessionHandle for MemorySessionHandle {
    fn identifier(&self) -> Option<String> {
        self.identifier.clone()
    }

    fn process_path(&self) -> String {
        self.process_path.clone()
    }

    fn display_name(&self) -> String {
        self.display_name.clone()
    }

    fn state(&self) -> Result<SessionState> {
        // A session that vanished from the server reads as expired
        match self.read(|s| s.state) {
            Err(AudioError::SessionNotFound { .. }) | Err(AudioError::DeviceNotFound { .. }) => {
                Ok(SessionState::Expired)
            }
            other => other,
        }
    }

    fn volume(&self) -> Result<f32> {
        self.read(|s| s.volume)
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        self.write(|s| s.volume = clamp_volume(volume))
    }

    fn mute(&self) -> Result<bool> {
        self.read(|s| s.muted)
    }

    fn set_mute(&self, muted: bool) -> Result<()> {
        self.write(|s| s.muted = muted)
    }

    fn channel_volumes(&self) -> Result<Vec<f32>> {
        self.read(|s| s.channels.clone())
    }

    fn set_channel_volumes(&self, channels: &[f32]) -> Result<()> {
        self.write(|s| {
            for (slot, value) in s.channels.iter_mut().zip(channels) {
                *slot = clamp_volume(*value);
            }
        })
    }
}
