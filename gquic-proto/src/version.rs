use std::fmt;

/// A protocol version, identified on the wire by a four-byte tag such as `Q012`
///
/// Unknown tags are representable so that a server can tell a client which versions it
/// should have offered instead.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Version(u32);

impl Version {
    /// QUIC_VERSION_11
    pub const V11: Self = Self(make_tag(b"Q011"));
    /// QUIC_VERSION_12
    pub const V12: Self = Self(make_tag(b"Q012"));

    /// Interpret a tag read off the wire
    pub const fn from_tag(tag: u32) -> Self {
        Self(tag)
    }

    /// The tag written on the wire
    pub fn tag(self) -> u32 {
        self.0
    }

    /// Whether this implementation speaks the version at all
    pub fn is_known(self) -> bool {
        KNOWN_VERSIONS.contains(&self)
    }
}

const KNOWN_VERSIONS: &[Version] = &[Version::V12, Version::V11];

/// Versions offered by default, most preferred first
pub const DEFAULT_SUPPORTED_VERSIONS: &[Version] = KNOWN_VERSIONS;

const fn make_tag(x: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*x)
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            for &b in &bytes {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}
