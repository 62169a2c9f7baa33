//! Endpoint control using IAudioEndpointVolume.
//!
//! Provides volume, mute and per-channel control for one endpoint, plus its
//! session list.

use windows::core::Interface;
use windows::Win32::Media::Audio::Endpoints::IAudioEndpointVolume;
use windows::Win32::Media::Audio::{
    IAudioSessionControl2, IAudioSessionManager2, IMMDevice, AUDCLNT_E_DEVICE_INVALIDATED,
    DEVICE_STATE_ACTIVE,
};
use windows::Win32::System::Com::CLSCTX_ALL;

use super::enumerator::{describe, ComGuard};
use super::notifications::Registration;
use super::sessions::WindowsSession;
use crate::audio::{AudioError, DeviceDescriptor, Result};
use crate::platform::{EndpointHandle, SessionHandle, Subscription, VolumeCallback};

/// Live handle on one MMDevice endpoint.
pub struct WindowsEndpoint {
    id: String,
    device: IMMDevice,
    endpoint_volume: IAudioEndpointVolume,
}

// SAFETY: the MMDevice objects are created in the multithreaded apartment and
// every call joins it through `ComGuard` first.
unsafe impl Send for WindowsEndpoint {}
unsafe impl Sync for WindowsEndpoint {}

impl WindowsEndpoint {
    pub fn new(id: &str, device: IMMDevice) -> Result<Self> {
        unsafe {
            let endpoint_volume: IAudioEndpointVolume = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|_| AudioError::VolumeNotAvailable)?;
            Ok(Self {
                id: id.to_string(),
                device,
                endpoint_volume,
            })
        }
    }

    /// Map "device unplugged" to `DeviceNotFound` so callers can go stale.
    fn map_err(&self, err: windows::core::Error) -> AudioError {
        if err.code() == AUDCLNT_E_DEVICE_INVALIDATED {
            AudioError::DeviceNotFound {
                device_id: self.id.clone(),
            }
        } else {
            AudioError::WindowsError(err)
        }
    }

    fn channel_count(&self) -> Result<u32> {
        unsafe {
            self.endpoint_volume
                .GetChannelCount()
                .map_err(|e| self.map_err(e))
        }
    }
}

impl EndpointHandle for WindowsEndpoint {
    fn descriptor(&self) -> Result<DeviceDescriptor> {
        let _com = ComGuard::new()?;
        let state = unsafe { self.device.GetState() }.map_err(|e| self.map_err(e))?;
        if state != DEVICE_STATE_ACTIVE {
            return Err(AudioError::DeviceNotFound {
                device_id: self.id.clone(),
            });
        }
        describe(&self.device)
    }

    fn volume(&self) -> Result<f32> {
        let _com = ComGuard::new()?;
        unsafe {
            self.endpoint_volume
                .GetMasterVolumeLevelScalar()
                .map_err(|e| self.map_err(e))
        }
    }

    fn set_volume(&self, level: f32) -> Result<()> {
        let _com = ComGuard::new()?;
        let level = level.clamp(0.0, 1.0);
        unsafe {
            self.endpoint_volume
                .SetMasterVolumeLevelScalar(level, std::ptr::null())
                .map_err(|e| self.map_err(e))
        }
    }

    fn mute(&self) -> Result<bool> {
        let _com = ComGuard::new()?;
        unsafe {
            let muted = self
                .endpoint_volume
                .GetMute()
                .map_err(|e| self.map_err(e))?;
            Ok(muted.as_bool())
        }
    }

    fn set_mute(&self, muted: bool) -> Result<()> {
        let _com = ComGuard::new()?;
        unsafe {
            self.endpoint_volume
                .SetMute(muted, std::ptr::null())
                .map_err(|e| self.map_err(e))
        }
    }

    fn channel_volumes(&self) -> Result<Vec<f32>> {
        let _com = ComGuard::new()?;
        (0..self.channel_count()?)
            .map(|i| unsafe {
                self.endpoint_volume
                    .GetChannelVolumeLevelScalar(i)
                    .map_err(|e| self.map_err(e))
            })
            .collect()
    }

    fn set_channel_volumes(&self, channels: &[f32]) -> Result<()> {
        let _com = ComGuard::new()?;
        let count = self.channel_count()?;
        for (i, level) in (0..count).zip(channels) {
            unsafe {
                self.endpoint_volume
                    .SetChannelVolumeLevelScalar(i, level.clamp(0.0, 1.0), std::ptr::null())
                    .map_err(|e| self.map_err(e))?;
            }
        }
        Ok(())
    }

    fn sessions(&self) -> Result<Vec<Box<dyn SessionHandle>>> {
        let _com = ComGuard::new()?;
        unsafe {
            let manager: IAudioSessionManager2 = self
                .device
                .Activate(CLSCTX_ALL, None)
                .map_err(|e| self.map_err(e))?;
            let list = manager
                .GetSessionEnumerator()
                .map_err(|e| self.map_err(e))?;
            let count = list.GetCount().map_err(|e| self.map_err(e))?;

            let mut sessions: Vec<Box<dyn SessionHandle>> =
                Vec::with_capacity(count.max(0) as usize);
            for i in 0..count {
                let control = list.GetSession(i).map_err(|e| self.map_err(e))?;
                let control: IAudioSessionControl2 =
                    control.cast().map_err(AudioError::WindowsError)?;
                match WindowsSession::new(control) {
                    Ok(session) => sessions.push(Box::new(session)),
                    Err(err) => {
                        tracing::debug!(device_id = %self.id, error = %err, "Skipping session")
                    }
                }
            }
            Ok(sessions)
        }
    }

    fn subscribe(&self, callback: VolumeCallback) -> Result<Subscription> {
        let _com = ComGuard::new()?;
        let registration = Registration::register(&self.endpoint_volume, callback)?;
        Ok(Subscription::new(move || {
            if let Ok(_com) = ComGuard::new() {
                registration.unregister();
            }
        }))
    }
}
