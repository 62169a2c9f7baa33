//! Sound Mixer - Library
//!
//! Per-device and per-application audio control with change notifications.
//!
//! ## Features
//!
//! - Enumerate output and input devices, with stable instances across calls
//! - Volume, mute and stereo balance control for devices and sessions
//! - Volume/mute change listeners delivered on a host-chosen context
//! - WASAPI backend on Windows, PulseAudio backend on Linux (`pulse` feature),
//!   and an in-memory backend for tests and headless hosts

pub mod audio;
pub mod platform;

pub use audio::{
    AudioError, Device, DeviceDescriptor, DeviceKind, DeviceRegistry, EventHandle, EventKind,
    EventPool, HostContext, InlineContext, NotificationFlags, NotificationRecord, QueuedContext,
    Session, SessionState, VolumeBalance,
};
pub use platform::{platform_provider, AudioProvider, MemoryProvider};
