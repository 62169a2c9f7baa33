//! Reconciliation of platform endpoints into stable `Device` instances.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::bridge::NotificationBridge;
use super::descriptor::{DeviceDescriptor, DeviceKind, EventKind};
use super::device::Device;
use super::dispatch::HostContext;
use super::error::{AudioError, Result};
use super::events::{EventHandle, EventPool, Listener};
use crate::platform::AudioProvider;

/// Keeps one `Device` per endpoint id alive across enumerations.
///
/// Callers holding an `Arc<Device>` keep observing the same instance for as
/// long as the endpoint exists; endpoints that vanish are retired on the next
/// enumeration.
pub struct DeviceRegistry {
    provider: Arc<dyn AudioProvider>,
    bridge: NotificationBridge,
    tracked: Mutex<HashMap<String, Arc<Device>>>,
    /// Descriptor of every id ever opened, retired ones included, so their
    /// listeners stay addressable.
    known: Mutex<HashMap<String, DeviceDescriptor>>,
}

impl DeviceRegistry {
    pub fn new(provider: Arc<dyn AudioProvider>, context: Arc<dyn HostContext>) -> Self {
        info!(backend = provider.name(), "Device registry created");
        Self {
            provider,
            bridge: NotificationBridge::new(Arc::new(EventPool::new()), context),
            tracked: Mutex::new(HashMap::new()),
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn AudioProvider> {
        &self.provider
    }

    pub fn events(&self) -> &Arc<EventPool> {
        self.bridge.pool()
    }

    /// Every active endpoint, in platform enumeration order.
    ///
    /// An enumeration failure is logged and yields an empty list without
    /// touching the tracked set.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let descriptors = match self.provider.enumerate_endpoints(DeviceKind::All) {
            Ok(descriptors) => descriptors,
            Err(err) => {
                warn!(error = %err, "Device enumeration failed");
                return Vec::new();
            }
        };

        let mut tracked = self.tracked.lock();
        let mut seen = HashSet::with_capacity(descriptors.len());
        let mut devices = Vec::with_capacity(descriptors.len());
        let mut catch_up = Vec::new();

        for desc in descriptors {
            seen.insert(desc.id.clone());
            match tracked.get(&desc.id) {
                Some(device) => {
                    if let Ok(fresh) = device.refresh() {
                        if let Some(fresh) = fresh {
                            catch_up.push((Arc::clone(device), fresh));
                        }
                        devices.push(Arc::clone(device));
                    }
                }
                None => match self.open_tracked(&mut tracked, &desc.id) {
                    Ok(device) => devices.push(device),
                    Err(err) => {
                        debug!(
                            device_id = %desc.id,
                            error = %err,
                            "Skipping unresolvable endpoint"
                        );
                    }
                },
            }
        }

        tracked.retain(|id, device| {
            let keep = seen.contains(id) && device.is_valid();
            if !keep {
                device.invalidate();
            }
            keep
        });
        drop(tracked);

        // Listeners may run inline and query the registry
        for (device, fresh) in catch_up {
            device.catch_up(fresh);
        }
        debug!(count = devices.len(), "Devices reconciled");
        devices
    }

    pub fn devices_of_kind(&self, kind: DeviceKind) -> Vec<Arc<Device>> {
        self.devices()
            .into_iter()
            .filter(|d| d.kind().matches(kind))
            .collect()
    }

    /// Current default endpoint for `kind`, revalidated.
    pub fn default_device(&self, kind: DeviceKind) -> Result<Arc<Device>> {
        if kind == DeviceKind::All {
            return Err(AudioError::InvalidArgument(
                "default device requires output or input".to_string(),
            ));
        }
        let id = self
            .provider
            .default_endpoint(kind)?
            .ok_or(AudioError::NoDefaultDevice { kind })?;

        let mut tracked = self.tracked.lock();
        let Some(device) = tracked.get(&id).cloned() else {
            return self.open_tracked(&mut tracked, &id);
        };
        match device.refresh() {
            Ok(fresh) => {
                drop(tracked);
                if let Some(fresh) = fresh {
                    device.catch_up(fresh);
                }
                Ok(device)
            }
            Err(_) => {
                tracked.remove(&id);
                Err(AudioError::DeviceNotFound { device_id: id })
            }
        }
    }

    /// Tracked device by id, resolving and tracking it on first use.
    pub fn device(&self, id: &str) -> Result<Arc<Device>> {
        let mut tracked = self.tracked.lock();
        if let Some(device) = tracked.get(id) {
            if device.is_valid() || device.update() {
                return Ok(Arc::clone(device));
            }
            tracked.remove(id);
        }
        self.open_tracked(&mut tracked, id)
    }

    /// Number of devices currently tracked.
    pub fn tracked_len(&self) -> usize {
        self.tracked.lock().len()
    }

    pub fn on(&self, device: &Device, kind: EventKind, listener: Listener) -> EventHandle {
        self.events().register(&device.descriptor(), kind, listener)
    }

    pub fn off(&self, device: &Device, kind: EventKind, handle: EventHandle) -> bool {
        self.events().remove(&device.descriptor(), kind, handle)
    }

    pub fn remove_all_listeners(&self, device: &Device, kind: EventKind) {
        self.events().remove_all(&device.descriptor(), kind);
    }

    /// Remove a listener by device id.
    ///
    /// Unlike [`off`](Self::off) this needs no live device, so listeners of an
    /// unplugged endpoint can still be released. False for ids never opened.
    pub fn off_by_id(&self, id: &str, kind: EventKind, handle: EventHandle) -> bool {
        match self.known_descriptor(id) {
            Some(desc) => self.events().remove(&desc, kind, handle),
            None => false,
        }
    }

    /// Remove every `kind` listener of `id`. False for ids never opened.
    pub fn remove_all_listeners_by_id(&self, id: &str, kind: EventKind) -> bool {
        match self.known_descriptor(id) {
            Some(desc) => {
                self.events().remove_all(&desc, kind);
                true
            }
            None => false,
        }
    }

    // Cloned out so releasing a listener never runs under the lock
    fn known_descriptor(&self, id: &str) -> Option<DeviceDescriptor> {
        self.known.lock().get(id).cloned()
    }

    fn open_tracked(
        &self,
        tracked: &mut HashMap<String, Arc<Device>>,
        id: &str,
    ) -> Result<Arc<Device>> {
        let device = Device::open(Arc::clone(&self.provider), id, self.bridge.clone())?;
        tracked.insert(id.to_string(), Arc::clone(&device));
        self.known
            .lock()
            .insert(id.to_string(), device.descriptor());
        Ok(device)
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for (_, device) in self.tracked.get_mut().drain() {
            device.invalidate();
        }
        self.events().clear();
        self.known.get_mut().clear();
        debug!("Device registry shut down");
    }
}
