//! Per-application audio streams.

use std::fmt;

use super::descriptor::{clamp_volume, VolumeBalance};
use super::error::Result;
use crate::platform::SessionHandle;

/// Lifecycle state reported by the platform for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SessionState {
    Inactive = 0,
    Active = 1,
    Expired = 2,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Inactive => f.write_str("inactive"),
            SessionState::Active => f.write_str("active"),
            SessionState::Expired => f.write_str("expired"),
        }
    }
}

/// One audio stream routed through a device.
///
/// Sessions are produced fresh by every `Device::sessions()` call and are never
/// tracked; two enumerations yield distinct instances for the same stream.
pub struct Session {
    id: String,
    device_id: String,
    handle: Box<dyn SessionHandle>,
}

impl Session {
    pub(crate) fn new(device_id: &str, handle: Box<dyn SessionHandle>) -> Self {
        let id = session_id(handle.as_ref());
        Self {
            id,
            device_id: device_id.to_string(),
            handle,
        }
    }

    /// Platform session identifier, or `"{display_name}|{process_path}"` when
    /// the platform has none. The fallback is not unique across several
    /// sessions of the same application.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn process_path(&self) -> String {
        self.handle.process_path()
    }

    pub fn display_name(&self) -> String {
        self.handle.display_name()
    }

    /// Live state, queried from the platform on every call.
    pub fn state(&self) -> Result<SessionState> {
        self.handle.state()
    }

    pub fn volume(&self) -> Result<f32> {
        self.handle.volume()
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.handle.set_volume(clamp_volume(volume))
    }

    pub fn mute(&self) -> Result<bool> {
        self.handle.mute()
    }

    pub fn set_mute(&self, muted: bool) -> Result<()> {
        self.handle.set_mute(muted)
    }

    /// Flip the mute state and return the new value.
    pub fn toggle_mute(&self) -> Result<bool> {
        let muted = !self.handle.mute()?;
        self.handle.set_mute(muted)?;
        Ok(muted)
    }

    pub fn balance(&self) -> Result<VolumeBalance> {
        Ok(VolumeBalance::from_channels(&self.handle.channel_volumes()?))
    }

    /// Apply a stereo balance. Mono sessions and out-of-range balances are
    /// ignored.
    pub fn set_balance(&self, balance: VolumeBalance) -> Result<()> {
        let mut channels = self.handle.channel_volumes()?;
        if balance.apply_to(&mut channels) {
            self.handle.set_channel_volumes(&channels)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

fn session_id(handle: &dyn SessionHandle) -> String {
    match handle.identifier() {
        Some(id) if !id.is_empty() => id,
        _ => format!("{}|{}", handle.display_name(), handle.process_path()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::DeviceKind;
    use crate::platform::memory::SessionSpec;
    use crate::platform::{AudioProvider, MemoryProvider};

    fn sessions_of(provider: &MemoryProvider) -> Vec<Session> {
        provider
            .resolve_endpoint("out")
            .unwrap()
            .sessions()
            .unwrap()
            .into_iter()
            .map(|h| Session::new("out", h))
            .collect()
    }

    fn provider() -> MemoryProvider {
        let provider = MemoryProvider::new();
        provider.add_endpoint("out", "Speakers", DeviceKind::Output);
        provider
    }

    #[test]
    fn test_id_prefers_platform_identifier() {
        let provider = provider();
        provider
            .add_session("out", SessionSpec::new("guid-1", "Player", "C:\\player.exe"))
            .unwrap();
        let sessions = sessions_of(&provider);
        assert_eq!(sessions[0].id(), "guid-1");
        assert_eq!(sessions[0].device_id(), "out");
    }

    #[test]
    fn test_id_fallback() {
        let provider = provider();
        provider
            .add_session("out", SessionSpec::anonymous("Browser", "/usr/bin/browser"))
            .unwrap();
        provider
            .add_session("out", SessionSpec::anonymous("Browser", "/usr/bin/browser"))
            .unwrap();
        let sessions = sessions_of(&provider);
        assert_eq!(sessions[0].id(), "Browser|/usr/bin/browser");
        // Two tabs of one app collapse onto the same derived id
        assert_eq!(sessions[0].id(), sessions[1].id());
    }

    #[test]
    fn test_volume_round_trip_and_clamp() {
        let provider = provider();
        provider
            .add_session("out", SessionSpec::new("s", "Player", "player"))
            .unwrap();
        let session = sessions_of(&provider).remove(0);

        for v in [0.0, 0.25, 0.5, 1.0] {
            session.set_volume(v).unwrap();
            assert!((session.volume().unwrap() - v).abs() < 1e-4);
        }
        session.set_volume(1.7).unwrap();
        assert_eq!(session.volume().unwrap(), 1.0);
        session.set_volume(-0.5).unwrap();
        assert_eq!(session.volume().unwrap(), 0.0);
    }

    #[test]
    fn test_toggle_mute() {
        let provider = provider();
        provider
            .add_session("out", SessionSpec::new("s", "Player", "player"))
            .unwrap();
        let session = sessions_of(&provider).remove(0);
        assert!(session.toggle_mute().unwrap());
        assert!(session.mute().unwrap());
        assert!(!session.toggle_mute().unwrap());
    }

    #[test]
    fn test_balance_rules() {
        let provider = provider();
        provider
            .add_session("out", SessionSpec::new("stereo", "A", "a"))
            .unwrap();
        provider
            .add_session("out", SessionSpec::new("mono", "B", "b").with_channels(1))
            .unwrap();
        let sessions = sessions_of(&provider);

        sessions[0].set_balance(VolumeBalance::new(0.3, 0.6)).unwrap();
        let balance = sessions[0].balance().unwrap();
        assert!((balance.left - 0.3).abs() < 1e-4);
        assert!((balance.right - 0.6).abs() < 1e-4);

        // Boundary values are rejected silently
        sessions[0].set_balance(VolumeBalance::new(1.0, 0.5)).unwrap();
        assert!((sessions[0].balance().unwrap().left - 0.3).abs() < 1e-4);

        assert!(!sessions[1].balance().unwrap().stereo);
        sessions[1].set_balance(VolumeBalance::new(0.3, 0.6)).unwrap();
        assert_eq!(sessions[1].handle.channel_volumes().unwrap(), vec![1.0]);
    }
}
