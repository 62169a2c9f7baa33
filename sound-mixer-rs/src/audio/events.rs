//! Listener registry keyed by (device, event kind).

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::bridge::NotificationRecord;
use super::descriptor::{event_key, DeviceDescriptor, EventKind};

/// Token returned by [`EventPool::register`]; unique for the pool's lifetime.
pub type EventHandle = u64;

/// Host callback. Dropping it releases whatever host resource it captured.
pub type Listener = Box<dyn Fn(&NotificationRecord) + Send + Sync>;

/// Shared reference to a registered listener, as handed out in snapshots.
pub type ListenerRef = Arc<ListenerSlot>;

/// One registration. Once removed it never calls its listener again, even
/// through snapshots taken before the removal.
pub struct ListenerSlot {
    handle: EventHandle,
    listener: Listener,
    released: AtomicBool,
}

impl ListenerSlot {
    pub fn handle(&self) -> EventHandle {
        self.handle
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Call the listener unless the slot was removed.
    ///
    /// A panicking listener is logged and swallowed. Returns true when the
    /// listener ran to completion.
    pub fn invoke(&self, record: &NotificationRecord) -> bool {
        if self.is_released() {
            return false;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| (self.listener)(record))) {
            Ok(()) => true,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                warn!(handle = self.handle, %message, "Event listener panicked");
                false
            }
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSlot")
            .field("handle", &self.handle)
            .field("released", &self.is_released())
            .finish()
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<u32, Vec<ListenerRef>>,
    next_handle: EventHandle,
}

/// Registry of host listeners.
///
/// Keys are derived from the device identity and the event kind, so listeners
/// survive device renames. Distinct (device, kind) pairs that hash to the same
/// key share one entry.
#[derive(Default)]
pub struct EventPool {
    state: Mutex<PoolState>,
}

impl EventPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        device: &DeviceDescriptor,
        kind: EventKind,
        listener: Listener,
    ) -> EventHandle {
        let key = event_key(device, kind);
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.entries.entry(key).or_default().push(Arc::new(ListenerSlot {
            handle,
            listener,
            released: AtomicBool::new(false),
        }));
        debug!(device_id = %device.id, %kind, handle, "Listener registered");
        handle
    }

    /// Remove one registration. Returns false if the key or handle is unknown.
    pub fn remove(&self, device: &DeviceDescriptor, kind: EventKind, handle: EventHandle) -> bool {
        let key = event_key(device, kind);
        let mut state = self.state.lock();
        let Some(slots) = state.entries.get_mut(&key) else {
            return false;
        };
        let Some(pos) = slots.iter().position(|s| s.handle == handle) else {
            return false;
        };
        let slot = slots.remove(pos);
        slot.release();
        if slots.is_empty() {
            state.entries.remove(&key);
        }
        debug!(device_id = %device.id, %kind, handle, "Listener removed");
        true
    }

    /// Snapshot of the live listeners under a key, in registration order.
    pub fn listeners(&self, device: &DeviceDescriptor, kind: EventKind) -> Vec<ListenerRef> {
        let key = event_key(device, kind);
        self.state
            .lock()
            .entries
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_all(&self, device: &DeviceDescriptor, kind: EventKind) {
        let key = event_key(device, kind);
        let removed = self.state.lock().entries.remove(&key);
        if let Some(slots) = removed {
            for slot in &slots {
                slot.release();
            }
            debug!(device_id = %device.id, %kind, count = slots.len(), "Listeners removed");
        }
    }

    /// Release every registration and restart handle numbering.
    pub fn clear(&self) {
        let entries = {
            let mut state = self.state.lock();
            state.next_handle = 0;
            std::mem::take(&mut state.entries)
        };
        for slot in entries.values().flatten() {
            slot.release();
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.state.lock().entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
