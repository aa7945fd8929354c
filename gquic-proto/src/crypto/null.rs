use super::{Decrypter, Encrypter};

/// Bytes of the truncated FNV-1a-128 hash prepended to the plaintext
const HASH_SIZE: usize = 12;

const FNV_PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;
const FNV_OFFSET: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;

/// Integrity protection without confidentiality, used before keys are established
#[derive(Debug, Default, Copy, Clone)]
pub struct NullEncrypter;

impl Encrypter for NullEncrypter {
    fn encrypt_packet(
        &self,
        _sequence_number: u64,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Option<Vec<u8>> {
        let hash = fnv1a_128(associated_data, plaintext);
        let mut out = Vec::with_capacity(HASH_SIZE + plaintext.len());
        out.extend_from_slice(&(hash as u64).to_le_bytes());
        out.extend_from_slice(&((hash >> 64) as u32).to_le_bytes());
        out.extend_from_slice(plaintext);
        Some(out)
    }

    fn max_plaintext_size(&self, ciphertext_size: usize) -> usize {
        ciphertext_size.saturating_sub(HASH_SIZE)
    }

    fn ciphertext_size(&self, plaintext_size: usize) -> usize {
        plaintext_size + HASH_SIZE
    }
}

/// Counterpart of [`NullEncrypter`]
#[derive(Debug, Default, Copy, Clone)]
pub struct NullDecrypter;

impl Decrypter for NullDecrypter {
    fn decrypt_packet(
        &self,
        _sequence_number: u64,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Option<Vec<u8>> {
        if ciphertext.len() < HASH_SIZE {
            return None;
        }
        let (hash, plaintext) = ciphertext.split_at(HASH_SIZE);
        let mut low = [0; 8];
        low.copy_from_slice(&hash[..8]);
        let mut high = [0; 4];
        high.copy_from_slice(&hash[8..]);
        let received = u128::from(u64::from_le_bytes(low))
            | u128::from(u32::from_le_bytes(high)) << 64;
        let expected = fnv1a_128(associated_data, plaintext) & ((1 << 96) - 1);
        if received != expected {
            return None;
        }
        Some(plaintext.to_vec())
    }
}

fn fnv1a_128(associated_data: &[u8], plaintext: &[u8]) -> u128 {
    associated_data
        .iter()
        .chain(plaintext)
        .fold(FNV_OFFSET, |hash, &b| {
            (hash ^ u128::from(b)).wrapping_mul(FNV_PRIME)
        })
}
