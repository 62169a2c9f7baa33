//! Audio device data models.
//!
//! Defines the value types identifying a device and describing its stereo
//! balance, plus the hashing used to key event listeners.

use std::fmt;
use std::str::FromStr;

use super::error::AudioError;

/// Direction of an audio endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceKind {
    /// Speakers, headphones, sinks
    Output = 0,

    /// Microphones, line-in, sources
    Input = 1,

    /// Wildcard accepted by queries only; never carried by a real device
    All = 2,
}

impl DeviceKind {
    /// True if a device of kind `self` satisfies a query for `filter`.
    pub fn matches(self, filter: DeviceKind) -> bool {
        filter == DeviceKind::All || self == filter
    }

    pub fn from_index(value: u32) -> Option<Self> {
        match value {
            0 => Some(DeviceKind::Output),
            1 => Some(DeviceKind::Input),
            2 => Some(DeviceKind::All),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Output => f.write_str("output"),
            DeviceKind::Input => f.write_str("input"),
            DeviceKind::All => f.write_str("all"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "output" | "render" => Ok(DeviceKind::Output),
            "input" | "capture" => Ok(DeviceKind::Input),
            "all" => Ok(DeviceKind::All),
            other => Err(AudioError::InvalidArgument(format!(
                "unknown device kind '{other}'"
            ))),
        }
    }
}

/// Kind of change a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    Volume = 0,
    Mute = 1,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Volume => f.write_str("volume"),
            EventKind::Mute => f.write_str("mute"),
        }
    }
}

impl FromStr for EventKind {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "volume" => Ok(EventKind::Volume),
            "mute" => Ok(EventKind::Mute),
            other => Err(AudioError::InvalidArgument(format!(
                "unknown event kind '{other}'"
            ))),
        }
    }
}

/// Identifies an endpoint across calls.
///
/// `PartialEq` compares the full (name, id, kind) tuple and answers "did the
/// observable description change". Lookups never use it: the registry and the
/// event pool key devices by [`DeviceDescriptor::identity`] only, because the
/// display name can change between reads (e.g. after a rename).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Platform-stable opaque id (IMMDevice id, PulseAudio sink/source name)
    pub id: String,

    /// Human-readable name; may change between reads
    pub name: String,

    pub kind: DeviceKind,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
        }
    }

    /// Canonical identity used for every map lookup.
    pub fn identity(&self) -> &str {
        &self.id
    }

    /// Legacy structural hash over name, id and kind.
    pub fn hashcode(&self) -> u32 {
        let name = jenkins_one_at_a_time(self.name.as_bytes());
        let id = jenkins_one_at_a_time(self.id.as_bytes());
        ((self.kind as u32) << 16) ^ name ^ id
    }

    /// Rename-stable hash over id and kind.
    pub fn identity_hash(&self) -> u32 {
        ((self.kind as u32) << 16) ^ jenkins_one_at_a_time(self.id.as_bytes())
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.kind, self.id)
    }
}

/// Jenkins one-at-a-time hash over raw bytes.
pub fn jenkins_one_at_a_time(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in key {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// Event pool key for a (device, event kind) pair.
///
/// Collisions between different pairs are possible and are treated as the
/// same key by the pool.
pub fn event_key(device: &DeviceDescriptor, kind: EventKind) -> u32 {
    device.identity_hash() ^ kind as u32
}

/// Stereo channel split of a device or session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeBalance {
    pub left: f32,
    pub right: f32,

    /// When false, `left` and `right` carry no meaning
    pub stereo: bool,
}

impl VolumeBalance {
    pub fn new(left: f32, right: f32) -> Self {
        Self {
            left,
            right,
            stereo: true,
        }
    }

    /// Balance reported for targets with fewer than two channels.
    pub fn mono() -> Self {
        Self {
            left: 0.0,
            right: 0.0,
            stereo: false,
        }
    }

    /// Build from per-channel scalars; the first two channels are left/right.
    pub fn from_channels(channels: &[f32]) -> Self {
        match channels {
            [left, right, ..] => Self::new(*left, *right),
            _ => Self::mono(),
        }
    }

    /// Both channels strictly inside (0, 1).
    ///
    /// Exactly 0.0 and 1.0 are rejected, which makes "full left" unreachable
    /// through the balance API. Kept as-is until the intent is confirmed.
    pub fn is_valid_for_write(&self) -> bool {
        (self.left > 0.0 && self.left < 1.0) && (self.right > 0.0 && self.right < 1.0)
    }

    /// Write left/right into the first two entries of `channels`.
    ///
    /// Returns false (and leaves `channels` untouched) when the balance is not
    /// applicable: mono balance, invalid values, or fewer than two channels.
    pub fn apply_to(&self, channels: &mut [f32]) -> bool {
        if !self.stereo || !self.is_valid_for_write() || channels.len() < 2 {
            return false;
        }
        channels[0] = self.left;
        channels[1] = self.right;
        true
    }
}

/// Clamp a requested volume scalar into [0, 1]; NaN maps to silence.
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speakers() -> DeviceDescriptor {
        DeviceDescriptor::new("{0.0.0.00000000}.{speakers}", "Speakers", DeviceKind::Output)
    }

    #[test]
    fn test_jenkins_known_values() {
        assert_eq!(jenkins_one_at_a_time(b""), 0);
        assert_eq!(jenkins_one_at_a_time(b"a"), 0xca2e_9442);
        assert_eq!(
            jenkins_one_at_a_time(b"The quick brown fox jumps over the lazy dog"),
            0x519e_91f5
        );
    }

    #[test]
    fn test_hashcode_is_stable() {
        let a = speakers();
        assert_eq!(a.hashcode(), a.hashcode());
        assert_eq!(a.hashcode(), speakers().hashcode());
    }

    #[test]
    fn test_hashcode_mixes_kind() {
        let out = speakers();
        let mut inp = speakers();
        inp.kind = DeviceKind::Input;
        assert_ne!(out.hashcode(), inp.hashcode());
        assert_eq!(out.hashcode() ^ inp.hashcode(), 1 << 16);
    }

    #[test]
    fn test_identity_survives_rename() {
        let before = speakers();
        let mut after = speakers();
        after.name = "Living Room".to_string();

        assert_ne!(before, after);
        assert_eq!(before.identity(), after.identity());
        assert_eq!(before.identity_hash(), after.identity_hash());
        assert_ne!(before.hashcode(), after.hashcode());
        assert_eq!(
            event_key(&before, EventKind::Mute),
            event_key(&after, EventKind::Mute)
        );
    }

    #[test]
    fn test_event_key_separates_kinds() {
        let dev = speakers();
        assert_ne!(
            event_key(&dev, EventKind::Volume),
            event_key(&dev, EventKind::Mute)
        );
    }

    #[test]
    fn test_balance_write_boundary() {
        assert!(!VolumeBalance::new(1.0, 0.5).is_valid_for_write());
        assert!(!VolumeBalance::new(0.5, 0.0).is_valid_for_write());
        assert!(VolumeBalance::new(0.999, 0.001).is_valid_for_write());
    }

    #[test]
    fn test_balance_apply() {
        let mut channels = [0.5, 0.5, 0.3];
        assert!(VolumeBalance::new(0.25, 0.75).apply_to(&mut channels));
        assert_eq!(channels, [0.25, 0.75, 0.3]);

        let mut mono = [0.5];
        assert!(!VolumeBalance::new(0.25, 0.75).apply_to(&mut mono));
        assert_eq!(mono, [0.5]);

        let mut channels = [0.5, 0.5];
        assert!(!VolumeBalance::mono().apply_to(&mut channels));
        assert!(!VolumeBalance::new(1.0, 0.5).apply_to(&mut channels));
        assert_eq!(channels, [0.5, 0.5]);
    }

    #[test]
    fn test_balance_from_channels() {
        assert_eq!(
            VolumeBalance::from_channels(&[0.2, 0.8, 0.1]),
            VolumeBalance::new(0.2, 0.8)
        );
        assert!(!VolumeBalance::from_channels(&[0.4]).stereo);
        assert!(!VolumeBalance::from_channels(&[]).stereo);
    }

    #[test]
    fn test_clamp_volume() {
        assert_eq!(clamp_volume(-0.5), 0.0);
        assert_eq!(clamp_volume(1.7), 1.0);
        assert_eq!(clamp_volume(0.42), 0.42);
        assert_eq!(clamp_volume(f32::NAN), 0.0);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Volume".parse::<EventKind>().unwrap(), EventKind::Volume);
        assert_eq!("mute".parse::<EventKind>().unwrap(), EventKind::Mute);
        assert!("balance".parse::<EventKind>().is_err());
        assert_eq!("render".parse::<DeviceKind>().unwrap(), DeviceKind::Output);
        assert!(DeviceKind::Input.matches(DeviceKind::All));
        assert!(!DeviceKind::Input.matches(DeviceKind::Output));
    }
}
