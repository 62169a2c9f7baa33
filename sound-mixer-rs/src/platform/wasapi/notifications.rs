//! Endpoint volume change notifications using IAudioEndpointVolumeCallback.

use windows::core::implement;
use windows::Win32::Media::Audio::Endpoints::{
    IAudioEndpointVolume, IAudioEndpointVolumeCallback, IAudioEndpointVolumeCallback_Impl,
};
use windows::Win32::Media::Audio::AUDIO_VOLUME_NOTIFICATION_DATA;
// Re-export windows_core so the implement macro can find it
#[allow(unused_imports)]
use windows_core;

use crate::audio::{AudioError, Result};
use crate::platform::{VolumeCallback, VolumeNotification};

/// Callback object handed to the endpoint; runs on a system RPC thread.
#[implement(IAudioEndpointVolumeCallback)]
struct VolumeNotificationClient {
    callback: VolumeCallback,
}

impl IAudioEndpointVolumeCallback_Impl for VolumeNotificationClient_Impl {
    fn OnNotify(&self, pnotify: *mut AUDIO_VOLUME_NOTIFICATION_DATA) -> windows::core::Result<()> {
        if let Some(data) = unsafe { pnotify.as_ref() } {
            (self.callback)(VolumeNotification {
                volume: data.fMasterVolume,
                muted: data.bMuted.as_bool(),
                channels: Some(data.nChannels),
            });
        }
        Ok(())
    }
}

/// A registered callback; unregisters when consumed.
pub(super) struct Registration {
    volume: IAudioEndpointVolume,
    client: IAudioEndpointVolumeCallback,
}

// SAFETY: both interfaces live in the multithreaded apartment and
// IAudioEndpointVolume is documented as free-threaded.
unsafe impl Send for Registration {}

impl Registration {
    pub(super) fn register(
        volume: &IAudioEndpointVolume,
        callback: VolumeCallback,
    ) -> Result<Self> {
        let client: IAudioEndpointVolumeCallback = VolumeNotificationClient { callback }.into();
        unsafe {
            volume
                .RegisterControlChangeNotify(&client)
                .map_err(AudioError::WindowsError)?;
        }
        Ok(Self {
            volume: volume.clone(),
            client,
        })
    }

    pub(super) fn unregister(self) {
        if let Err(err) = unsafe { self.volume.UnregisterControlChangeNotify(&self.client) } {
            tracing::debug!(error = %err, "UnregisterControlChangeNotify failed");
        }
    }
}
