//! Content-encryption keys and key-encryption keys

use objcrypt_core::{CryptoError, CryptoResult};
use rand::RngCore;
use rsa::{RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroize;

use crate::CEK_SIZE;

/// A per-object 256-bit content-encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct ContentKey {
    bytes: [u8; CEK_SIZE],
}

impl ContentKey {
    pub fn from_bytes(bytes: [u8; CEK_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; CEK_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::Cipher(format!(
                "content key has wrong size: {} bytes (expected {CEK_SIZE})",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; CEK_SIZE] {
        &self.bytes
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit content-encryption key.
pub fn generate_content_key() -> ContentKey {
    let mut bytes = [0u8; CEK_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    ContentKey::from_bytes(bytes)
}

/// A symmetric AES key-encryption key (128, 192 or 256 bit). Zeroized on drop.
#[derive(Clone)]
pub struct SymmetricKek {
    bytes: Vec<u8>,
}

impl SymmetricKek {
    pub fn new(bytes: Vec<u8>) -> CryptoResult<Self> {
        match bytes.len() {
            16 | 24 | 32 => Ok(Self { bytes }),
            n => Err(CryptoError::MaterialResolution(format!(
                "AES key-encryption key must be 16, 24 or 32 bytes, got {n}"
            ))),
        }
    }

    /// Generate a random 256-bit KEK.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for SymmetricKek {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKek")
            .field("bits", &(self.bytes.len() * 8))
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// An RSA key-encryption key. Without the private half it can only wrap.
#[derive(Clone)]
pub struct RsaKek {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
}

impl RsaKek {
    pub fn from_private(private: RsaPrivateKey) -> Self {
        Self {
            public: private.to_public_key(),
            private: Some(private),
        }
    }

    pub fn from_public(public: RsaPublicKey) -> Self {
        Self {
            public,
            private: None,
        }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn private_key(&self) -> CryptoResult<&RsaPrivateKey> {
        self.private.as_ref().ok_or_else(|| {
            CryptoError::MaterialResolution(
                "RSA key-encryption key has no private half; it can wrap but not unwrap".into(),
            )
        })
    }
}

impl std::fmt::Debug for RsaKek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use rsa::traits::PublicKeyParts;
        f.debug_struct("RsaKek")
            .field("modulus_bits", &(self.public.size() * 8))
            .field("has_private", &self.private.is_some())
            .finish()
    }
}

/// The key that wraps a CEK.
#[derive(Debug, Clone)]
pub enum KeyEncryptionKey {
    Symmetric(SymmetricKek),
    Rsa(RsaKek),
}

impl KeyEncryptionKey {
    pub fn kind(&self) -> &'static str {
        match self {
            KeyEncryptionKey::Symmetric(_) => "AES",
            KeyEncryptionKey::Rsa(_) => "RSA",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_generation() {
        let k1 = generate_content_key();
        let k2 = generate_content_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_content_key_from_slice_rejects_wrong_size() {
        assert!(ContentKey::from_slice(&[0u8; 16]).is_err());
        assert!(ContentKey::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cek = ContentKey::from_bytes([0x41; CEK_SIZE]);
        let kek = SymmetricKek::new(vec![0x42; 32]).unwrap();
        let rendered = format!("{cek:?} {kek:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("65, 65"));
        assert!(!rendered.contains("66, 66"));
    }

    #[test]
    fn test_symmetric_kek_sizes() {
        assert!(SymmetricKek::new(vec![0; 16]).is_ok());
        assert!(SymmetricKek::new(vec![0; 24]).is_ok());
        assert!(SymmetricKek::new(vec![0; 32]).is_ok());
        assert!(matches!(
            SymmetricKek::new(vec![0; 20]),
            Err(CryptoError::MaterialResolution(_))
        ));
    }
}
