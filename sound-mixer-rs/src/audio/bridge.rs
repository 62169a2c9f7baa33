//! Platform notification to host listener bridge.
//!
//! Turns raw volume callbacks into change flags by diffing against the
//! device's last-known values, then posts one task per interested listener to
//! the host context.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, trace};

use super::descriptor::{DeviceDescriptor, EventKind};
use super::device::DeviceState;
use super::dispatch::HostContext;
use super::events::EventPool;
use crate::platform::VolumeNotification;

/// Smallest volume delta reported as a change.
pub const VOLUME_EPSILON: f32 = 1e-4;

bitflags! {
    /// What changed in a notification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NotificationFlags: u32 {
        const MUTE = 1;
        const VOLUME = 2;
        const CHANNEL_COUNT = 4;
    }
}

impl NotificationFlags {
    /// Listener kinds interested in these flags, mute first.
    pub fn event_kinds(self) -> impl Iterator<Item = EventKind> {
        [
            (NotificationFlags::MUTE, EventKind::Mute),
            (NotificationFlags::VOLUME, EventKind::Volume),
        ]
        .into_iter()
        .filter(move |(flag, _)| self.contains(*flag))
        .map(|(_, kind)| kind)
    }
}

/// Immutable payload handed to listeners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotificationRecord {
    pub flags: NotificationFlags,
    pub volume: f32,
    pub muted: bool,
}

/// Values the bridge diffs incoming notifications against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastKnown {
    pub volume: f32,
    pub muted: bool,
    pub channels: Option<u32>,
}

impl LastKnown {
    /// Fold a notification into the cache and report what changed.
    pub fn apply(&mut self, notification: &VolumeNotification) -> NotificationFlags {
        let mut flags = NotificationFlags::empty();
        if (notification.volume - self.volume).abs() > VOLUME_EPSILON {
            flags |= NotificationFlags::VOLUME;
        }
        if notification.muted != self.muted {
            flags |= NotificationFlags::MUTE;
        }
        if let Some(channels) = notification.channels {
            if self.channels.is_some_and(|known| known != channels) {
                flags |= NotificationFlags::CHANNEL_COUNT;
            }
            self.channels = Some(channels);
        }
        self.volume = notification.volume;
        self.muted = notification.muted;
        flags
    }
}

/// Routes change notifications from providers to the event pool's listeners.
#[derive(Clone)]
pub struct NotificationBridge {
    pool: Arc<EventPool>,
    context: Arc<dyn HostContext>,
}

impl NotificationBridge {
    pub fn new(pool: Arc<EventPool>, context: Arc<dyn HostContext>) -> Self {
        Self { pool, context }
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    /// Handle one provider callback for `device`. Runs on the platform thread.
    pub(crate) fn deliver(&self, device: &DeviceState, notification: VolumeNotification) {
        if !device.is_active() {
            trace!(device_id = %device.id(), "Notification for retired device ignored");
            return;
        }

        // Serializes notifications per device so listeners observe them in
        // arrival order. Reentrant for listeners that change the device
        // inline.
        let _order = device.order.lock();

        let flags = device.cache.lock().apply(&notification);
        if flags.is_empty() {
            trace!(device_id = %device.id(), "Notification without changes");
            return;
        }
        if flags.contains(NotificationFlags::CHANNEL_COUNT) {
            debug!(
                device_id = %device.id(),
                channels = ?notification.channels,
                "Channel count changed"
            );
        }
        trace!(
            device_id = %device.id(),
            ?flags,
            volume = notification.volume,
            muted = notification.muted,
            "Volume notification"
        );

        let record = NotificationRecord {
            flags,
            volume: notification.volume,
            muted: notification.muted,
        };
        self.dispatch(&device.descriptor(), record);
    }

    /// Post `record` to every listener subscribed to one of its flags.
    pub fn dispatch(&self, device: &DeviceDescriptor, record: NotificationRecord) {
        for kind in record.flags.event_kinds() {
            for slot in self.pool.listeners(device, kind) {
                self.context.post(Box::new(move || {
                    slot.invoke(&record);
                }));
            }
        }
    }
}
