//! Cipher suite descriptors
//!
//! Exactly two suites exist and both must stay byte-compatible with objects
//! already written:
//!
//! | suite            | cipher              | IV  | tag     |
//! |------------------|---------------------|-----|---------|
//! | NonAuthenticated | AES/CBC/PKCS5Padding | 16  | none    |
//! | Authenticated    | AES/GCM/NoPadding   | 12  | 128 bit |

use objcrypt_core::{CryptoError, CryptoResult};
use rand::RngCore;

/// AES block size, shared by both suites.
pub const BLOCK_SIZE: usize = 16;

/// GCM can produce at most 2^32 - 2 keystream blocks per IV.
pub const MAX_GCM_PLAINTEXT_BYTES: u64 = (1 << 36) - 32;

/// Largest CBC plaintext whose padded length still fits in a u64.
pub const MAX_CBC_PLAINTEXT_BYTES: u64 = u64::MAX - BLOCK_SIZE as u64;

/// Static parameters of one cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemeParams {
    pub cipher_algorithm: &'static str,
    pub key_length_bits: u32,
    pub iv_length_bytes: usize,
    pub block_size_bytes: usize,
    /// 0 for the non-authenticated suite
    pub tag_length_bits: u32,
    pub key_generator_algorithm: &'static str,
    pub max_plaintext_bytes: u64,
}

const NON_AUTHENTICATED: SchemeParams = SchemeParams {
    cipher_algorithm: "AES/CBC/PKCS5Padding",
    key_length_bits: 256,
    iv_length_bytes: 16,
    block_size_bytes: BLOCK_SIZE,
    tag_length_bits: 0,
    key_generator_algorithm: "AES",
    max_plaintext_bytes: MAX_CBC_PLAINTEXT_BYTES,
};

const AUTHENTICATED: SchemeParams = SchemeParams {
    cipher_algorithm: "AES/GCM/NoPadding",
    key_length_bits: 256,
    iv_length_bytes: 12,
    block_size_bytes: BLOCK_SIZE,
    tag_length_bits: 128,
    key_generator_algorithm: "AES",
    max_plaintext_bytes: MAX_GCM_PLAINTEXT_BYTES,
};

/// The content cipher suite of an encrypted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoScheme {
    /// Legacy AES-256-CBC with PKCS#7 padding
    NonAuthenticated,
    /// AES-256-GCM with a trailing 128-bit tag
    Authenticated,
}

impl CryptoScheme {
    pub const fn params(self) -> &'static SchemeParams {
        match self {
            CryptoScheme::NonAuthenticated => &NON_AUTHENTICATED,
            CryptoScheme::Authenticated => &AUTHENTICATED,
        }
    }

    pub const fn cipher_algorithm(self) -> &'static str {
        self.params().cipher_algorithm
    }

    pub const fn key_length_bits(self) -> u32 {
        self.params().key_length_bits
    }

    pub const fn key_length_bytes(self) -> usize {
        (self.params().key_length_bits / 8) as usize
    }

    pub const fn iv_length_bytes(self) -> usize {
        self.params().iv_length_bytes
    }

    pub const fn block_size_bytes(self) -> usize {
        self.params().block_size_bytes
    }

    pub const fn tag_length_bits(self) -> u32 {
        self.params().tag_length_bits
    }

    pub const fn tag_length_bytes(self) -> usize {
        (self.params().tag_length_bits / 8) as usize
    }

    pub const fn key_generator_algorithm(self) -> &'static str {
        self.params().key_generator_algorithm
    }

    pub const fn max_plaintext_bytes(self) -> u64 {
        self.params().max_plaintext_bytes
    }

    pub const fn is_authenticated(self) -> bool {
        self.params().tag_length_bits > 0
    }

    /// Look up a suite by the algorithm name stored in object metadata.
    pub fn from_cipher_algorithm(name: &str) -> Option<Self> {
        [CryptoScheme::NonAuthenticated, CryptoScheme::Authenticated]
            .into_iter()
            .find(|s| s.cipher_algorithm() == name)
    }

    /// Ciphertext length for a plaintext of `plaintext_len` bytes.
    ///
    /// CBC always pads, so a block-aligned plaintext gains a full block.
    /// Saturates for lengths past [`max_plaintext_bytes`](Self::max_plaintext_bytes).
    pub fn ciphertext_length(self, plaintext_len: u64) -> u64 {
        match self {
            CryptoScheme::NonAuthenticated => {
                let block = self.block_size_bytes() as u64;
                (plaintext_len / block + 1).saturating_mul(block)
            }
            CryptoScheme::Authenticated => {
                plaintext_len.saturating_add(self.tag_length_bytes() as u64)
            }
        }
    }

    /// Reject plaintexts the suite cannot safely encrypt under one IV.
    pub fn check_capacity(self, plaintext_len: u64) -> CryptoResult<()> {
        if plaintext_len > self.max_plaintext_bytes() {
            return Err(CryptoError::CapacityExceeded {
                requested: plaintext_len,
                limit: self.max_plaintext_bytes(),
                algorithm: self.cipher_algorithm(),
            });
        }
        Ok(())
    }

    /// Generate a fresh random IV of the suite's length.
    pub fn generate_iv(self) -> Vec<u8> {
        let mut iv = vec![0u8; self.iv_length_bytes()];
        rand::thread_rng().fill_bytes(&mut iv);
        iv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_length_iff_authenticated() {
        assert!(CryptoScheme::Authenticated.is_authenticated());
        assert_eq!(CryptoScheme::Authenticated.tag_length_bits(), 128);
        assert!(!CryptoScheme::NonAuthenticated.is_authenticated());
        assert_eq!(CryptoScheme::NonAuthenticated.tag_length_bits(), 0);
    }

    #[test]
    fn test_algorithm_name_lookup() {
        assert_eq!(
            CryptoScheme::from_cipher_algorithm("AES/GCM/NoPadding"),
            Some(CryptoScheme::Authenticated)
        );
        assert_eq!(
            CryptoScheme::from_cipher_algorithm("AES/CBC/PKCS5Padding"),
            Some(CryptoScheme::NonAuthenticated)
        );
        assert_eq!(CryptoScheme::from_cipher_algorithm("AES/CTR/NoPadding"), None);
    }

    #[test]
    fn test_ciphertext_length() {
        let gcm = CryptoScheme::Authenticated;
        assert_eq!(gcm.ciphertext_length(0), 16);
        assert_eq!(gcm.ciphertext_length(1000), 1016);

        let cbc = CryptoScheme::NonAuthenticated;
        assert_eq!(cbc.ciphertext_length(0), 16);
        assert_eq!(cbc.ciphertext_length(15), 16);
        assert_eq!(cbc.ciphertext_length(16), 32);
        assert_eq!(cbc.ciphertext_length(1000), 1008);
    }

    #[test]
    fn test_capacity() {
        let gcm = CryptoScheme::Authenticated;
        assert!(gcm.check_capacity(MAX_GCM_PLAINTEXT_BYTES).is_ok());
        assert!(matches!(
            gcm.check_capacity(MAX_GCM_PLAINTEXT_BYTES + 1),
            Err(CryptoError::CapacityExceeded { .. })
        ));

        let cbc = CryptoScheme::NonAuthenticated;
        assert!(cbc.check_capacity(MAX_CBC_PLAINTEXT_BYTES).is_ok());
        assert_eq!(cbc.ciphertext_length(MAX_CBC_PLAINTEXT_BYTES), u64::MAX - 15);
        assert!(matches!(
            cbc.check_capacity(MAX_CBC_PLAINTEXT_BYTES + 1),
            Err(CryptoError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_ciphertext_length_saturates() {
        for n in [u64::MAX - 15, u64::MAX - 1, u64::MAX] {
            assert_eq!(CryptoScheme::NonAuthenticated.ciphertext_length(n), u64::MAX);
            assert_eq!(CryptoScheme::Authenticated.ciphertext_length(n), u64::MAX);
        }
    }

    #[test]
    fn test_iv_lengths() {
        assert_eq!(CryptoScheme::Authenticated.generate_iv().len(), 12);
        assert_eq!(CryptoScheme::NonAuthenticated.generate_iv().len(), 16);
        assert_ne!(
            CryptoScheme::Authenticated.generate_iv(),
            CryptoScheme::Authenticated.generate_iv()
        );
    }
}
