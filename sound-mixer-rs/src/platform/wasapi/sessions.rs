//! Per-application sessions using IAudioSessionControl2.

use std::path::Path;

use windows::core::{Interface, PWSTR};
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::Media::Audio::{
    AudioSessionStateActive, AudioSessionStateInactive, IAudioSessionControl2,
    IChannelAudioVolume, ISimpleAudioVolume,
};
use windows::Win32::System::Threading::{
    OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
    PROCESS_QUERY_LIMITED_INFORMATION,
};

use super::enumerator::{take_pwstr, ComGuard};
use crate::audio::{AudioError, Result, SessionState};
use crate::platform::SessionHandle;

pub struct WindowsSession {
    control: IAudioSessionControl2,
    simple: ISimpleAudioVolume,
    channels: IChannelAudioVolume,
    identifier: Option<String>,
    process_path: String,
    display_name: String,
}

// SAFETY: session interfaces are created in the multithreaded apartment and
// every call joins it through `ComGuard` first.
unsafe impl Send for WindowsSession {}

impl WindowsSession {
    pub fn new(control: IAudioSessionControl2) -> Result<Self> {
        unsafe {
            let simple: ISimpleAudioVolume = control.cast().map_err(AudioError::WindowsError)?;
            let channels: IChannelAudioVolume = control.cast().map_err(AudioError::WindowsError)?;

            let identifier = control
                .GetSessionInstanceIdentifier()
                .ok()
                .and_then(|id| take_pwstr(id).ok())
                .filter(|id| !id.is_empty());

            let pid = control.GetProcessId().unwrap_or(0);
            let process_path = process_path(pid).unwrap_or_else(|| pid.to_string());

            let display_name = control
                .GetDisplayName()
                .ok()
                .and_then(|name| take_pwstr(name).ok())
                // Resource references like "@%SystemRoot%\..." are not readable names
                .filter(|name| !name.is_empty() && !name.starts_with('@'))
                .unwrap_or_else(|| file_stem(&process_path));

            Ok(Self {
                control,
                simple,
                channels,
                identifier,
                process_path,
                display_name,
            })
        }
    }
}

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Full image path of a process, if it can be queried.
fn process_path(pid: u32) -> Option<String> {
    if pid == 0 {
        return None;
    }
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid).ok()?;
        let mut buffer = [0u16; 1024];
        let mut size = buffer.len() as u32;
        let result = QueryFullProcessImageNameW(
            handle,
            PROCESS_NAME_WIN32,
            PWSTR(buffer.as_mut_ptr()),
            &mut size,
        );
        let _ = CloseHandle(handle);
        result.ok()?;
        Some(String::from_utf16_lossy(&buffer[..size as usize]))
    }
}

impl SessionHandle for WindowsSession {
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
        let _com = ComGuard::new()?;
        let state = unsafe { self.control.GetState() }.map_err(AudioError::WindowsError)?;
        Ok(if state == AudioSessionStateActive {
            SessionState::Active
        } else if state == AudioSessionStateInactive {
            SessionState::Inactive
        } else {
            SessionState::Expired
        })
    }

    fn volume(&self) -> Result<f32> {
        let _com = ComGuard::new()?;
        unsafe { self.simple.GetMasterVolume() }.map_err(AudioError::WindowsError)
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        let _com = ComGuard::new()?;
        unsafe { self.simple.SetMasterVolume(volume, std::ptr::null()) }
            .map_err(AudioError::WindowsError)
    }

    fn mute(&self) -> Result<bool> {
        let _com = ComGuard::new()?;
        let muted = unsafe { self.simple.GetMute() }.map_err(AudioError::WindowsError)?;
        Ok(muted.as_bool())
    }

    fn set_mute(&self, muted: bool) -> Result<()> {
        let _com = ComGuard::new()?;
        unsafe { self.simple.SetMute(muted, std::ptr::null()) }.map_err(AudioError::WindowsError)
    }

    fn channel_volumes(&self) -> Result<Vec<f32>> {
        let _com = ComGuard::new()?;
        unsafe {
            let count = self
                .channels
                .GetChannelCount()
                .map_err(AudioError::WindowsError)?;
            (0..count)
                .map(|i| {
                    self.channels
                        .GetChannelVolume(i)
                        .map_err(AudioError::WindowsError)
                })
                .collect()
        }
    }

    fn set_channel_volumes(&self, levels: &[f32]) -> Result<()> {
        let _com = ComGuard::new()?;
        unsafe {
            let count = self
                .channels
                .GetChannelCount()
                .map_err(AudioError::WindowsError)?;
            for (i, level) in (0..count).zip(levels) {
                self.channels
                    .SetChannelVolume(i, level.clamp(0.0, 1.0), std::ptr::null())
                    .map_err(AudioError::WindowsError)?;
            }
        }
        Ok(())
    }
}
