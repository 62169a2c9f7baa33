//! Audio service error types.

use super::descriptor::DeviceKind;
use thiserror::Error;

/// Result alias used across the audio core and the platform providers.
pub type Result<T> = std::result::Result<T, AudioError>;

/// Audio service error types.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("Audio session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("No default {kind} device available")]
    NoDefaultDevice { kind: DeviceKind },

    /// The device was invalidated; obtain a fresh instance from the registry.
    #[error("Device handle is stale: {device_id}")]
    StaleHandle { device_id: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Volume control not available for device")]
    VolumeNotAvailable,

    #[error("Audio platform error: {0}")]
    Platform(String),

    #[cfg(windows)]
    #[error("COM initialization failed: {0}")]
    ComInitFailed(#[source] windows::core::Error),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    WindowsError(#[source] windows::core::Error),
}

impl AudioError {
    /// True for every "no platform match" variant.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AudioError::DeviceNotFound { .. }
                | AudioError::SessionNotFound { .. }
                | AudioError::NoDefaultDevice { .. }
        )
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, AudioError::StaleHandle { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_family() {
        assert!(AudioError::DeviceNotFound {
            device_id: "x".into()
        }
        .is_not_found());
        assert!(AudioError::NoDefaultDevice {
            kind: DeviceKind::Input
        }
        .is_not_found());
        assert!(!AudioError::Platform("boom".into()).is_not_found());
    }

    #[test]
    fn test_messages() {
        let err = AudioError::NoDefaultDevice {
            kind: DeviceKind::Output,
        };
        assert_eq!(err.to_string(), "No default output device available");

        let err = AudioError::StaleHandle {
            device_id: "{0.0.0}".into(),
        };
        assert!(err.is_stale());
        assert_eq!(err.to_string(), "Device handle is stale: {0.0.0}");
    }
}
