//! Audio device and session control core.
//!
//! This module provides device reconciliation, volume/mute/balance control,
//! per-application sessions and change notifications. Platform specifics live
//! behind [`crate::platform::AudioProvider`].

pub mod bridge;
pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod registry;
pub mod session;

pub use bridge::{NotificationBridge, NotificationFlags, NotificationRecord};
pub use descriptor::{
    clamp_volume, event_key, jenkins_one_at_a_time, DeviceDescriptor, DeviceKind, EventKind,
    VolumeBalance,
};
pub use device::Device;
pub use dispatch::{HostContext, InlineContext, QueuedContext, Task};
pub use error::{AudioError, Result};
pub use events::{EventHandle, EventPool, Listener, ListenerRef};
pub use registry::DeviceRegistry;
pub use session::{Session, SessionState};
