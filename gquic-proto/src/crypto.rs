//! Traits and implementations for the packet protection layer
//!
//! The framer holds one [`Encrypter`] per [`EncryptionLevel`] and up to two [`Decrypter`]s. Key
//! establishment happens elsewhere; installing the resulting keys is all the protocol logic
//! needs.

mod null;
pub use null::{NullDecrypter, NullEncrypter};

/// Protection applied to a packet
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncryptionLevel {
    /// Integrity only, through the null encrypter
    #[default]
    None,
    /// Keys from the first handshake round trip
    Initial,
    /// Forward-secure keys
    ForwardSecure,
}

impl EncryptionLevel {
    pub(crate) const VALUES: [Self; 3] = [Self::None, Self::Initial, Self::ForwardSecure];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Protects outgoing packets
pub trait Encrypter: Send {
    /// Encrypt `plaintext`, authenticating `associated_data` along with it
    ///
    /// Returns `None` if encryption failed.
    fn encrypt_packet(
        &self,
        sequence_number: u64,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Option<Vec<u8>>;

    /// Largest plaintext whose ciphertext fits in `ciphertext_size` bytes
    fn max_plaintext_size(&self, ciphertext_size: usize) -> usize;

    /// Size of the ciphertext for `plaintext_size` bytes of plaintext
    fn ciphertext_size(&self, plaintext_size: usize) -> usize;
}

/// Authenticates and decrypts incoming packets
pub trait Decrypter: Send {
    /// Returns the plaintext, or `None` if the packet does not authenticate under this key
    fn decrypt_packet(
        &self,
        sequence_number: u64,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Option<Vec<u8>>;
}
