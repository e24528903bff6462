//! CEK wrapping under a key-encryption key
//!
//! | suite            | KEK | algorithm (metadata name)      | wrapped CEK |
//! |------------------|-----|--------------------------------|-------------|
//! | authenticated    | AES | `AESWrap` (RFC 3394)           | 40 bytes    |
//! | authenticated    | RSA | `RSA-OAEP-SHA256`              | modulus     |
//! | non-authenticated| AES | none (AES/ECB/PKCS5Padding)    | 48 bytes    |
//! | non-authenticated| RSA | none (RSA/ECB/PKCS1Padding)    | modulus     |
//!
//! The legacy algorithms carry no name in metadata; they are implied by the
//! absence of `crypto-keywrap-algorithm` and the KEK type.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use aes_kw::{KekAes128, KekAes192, KekAes256};
use objcrypt_core::{CryptoError, CryptoResult};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Encrypt};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::cbc::{pkcs7_pad, pkcs7_unpad};
use crate::keys::{ContentKey, KeyEncryptionKey};
use crate::scheme::{CryptoScheme, BLOCK_SIZE};
use crate::CEK_SIZE;

/// RFC 3394 adds one 64-bit integrity block.
const AES_WRAP_OVERHEAD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyWrapAlgorithm {
    /// RFC 3394 AES key wrap
    AesWrap,
    /// RSA-OAEP with SHA-256 and MGF1-SHA-256
    RsaOaepSha256,
    /// AES/ECB/PKCS5Padding of the raw CEK (legacy, unnamed)
    LegacyAesEcb,
    /// RSA PKCS#1 v1.5 encryption (legacy, unnamed)
    LegacyRsaPkcs1,
}

impl KeyWrapAlgorithm {
    /// Name written to `crypto-keywrap-algorithm`; `None` for legacy wraps.
    pub fn name(self) -> Option<&'static str> {
        match self {
            KeyWrapAlgorithm::AesWrap => Some("AESWrap"),
            KeyWrapAlgorithm::RsaOaepSha256 => Some("RSA-OAEP-SHA256"),
            KeyWrapAlgorithm::LegacyAesEcb | KeyWrapAlgorithm::LegacyRsaPkcs1 => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AESWrap" => Some(KeyWrapAlgorithm::AesWrap),
            "RSA-OAEP-SHA256" => Some(KeyWrapAlgorithm::RsaOaepSha256),
            _ => None,
        }
    }

    /// The algorithm new objects of `scheme` use with `kek`.
    pub fn select(scheme: CryptoScheme, kek: &KeyEncryptionKey) -> Self {
        match (scheme, kek) {
            (CryptoScheme::Authenticated, KeyEncryptionKey::Symmetric(_)) => Self::AesWrap,
            (CryptoScheme::Authenticated, KeyEncryptionKey::Rsa(_)) => Self::RsaOaepSha256,
            (CryptoScheme::NonAuthenticated, KeyEncryptionKey::Symmetric(_)) => Self::LegacyAesEcb,
            (CryptoScheme::NonAuthenticated, KeyEncryptionKey::Rsa(_)) => Self::LegacyRsaPkcs1,
        }
    }

    /// The algorithm that wrapped a stored CEK: the recorded name if any,
    /// otherwise the legacy algorithm implied by the KEK type.
    pub fn for_envelope(name: Option<&str>, kek: &KeyEncryptionKey) -> CryptoResult<Self> {
        match name {
            Some(name) => Self::from_name(name).ok_or_else(|| {
                CryptoError::InvalidMetadata(format!("unknown key-wrap algorithm {name:?}"))
            }),
            None => Ok(Self::select(CryptoScheme::NonAuthenticated, kek)),
        }
    }

    /// Length of a wrapped 256-bit CEK.
    pub fn wrapped_length(self, kek: &KeyEncryptionKey) -> usize {
        match (self, kek) {
            (KeyWrapAlgorithm::AesWrap, _) => CEK_SIZE + AES_WRAP_OVERHEAD,
            (KeyWrapAlgorithm::LegacyAesEcb, _) => pkcs7_padded_len(CEK_SIZE),
            (_, KeyEncryptionKey::Rsa(rsa)) => rsa.public_key().size(),
            (_, KeyEncryptionKey::Symmetric(_)) => 0,
        }
    }

    pub fn wrap(self, cek: &ContentKey, kek: &KeyEncryptionKey) -> CryptoResult<Vec<u8>> {
        match (self, kek) {
            (KeyWrapAlgorithm::AesWrap, KeyEncryptionKey::Symmetric(kek)) => {
                aes_kw_wrap(kek.as_bytes(), cek.as_bytes())
            }
            (KeyWrapAlgorithm::LegacyAesEcb, KeyEncryptionKey::Symmetric(kek)) => {
                let mut padded = pkcs7_pad(cek.as_bytes());
                let result = ecb_apply(kek.as_bytes(), &mut padded, EcbDirection::Encrypt);
                result.map(|()| padded)
            }
            (KeyWrapAlgorithm::RsaOaepSha256, KeyEncryptionKey::Rsa(rsa)) => rsa
                .public_key()
                .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), cek.as_bytes())
                .map_err(|e| CryptoError::Cipher(format!("RSA-OAEP wrap failed: {e}"))),
            (KeyWrapAlgorithm::LegacyRsaPkcs1, KeyEncryptionKey::Rsa(rsa)) => rsa
                .public_key()
                .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, cek.as_bytes())
                .map_err(|e| CryptoError::Cipher(format!("RSA PKCS#1 wrap failed: {e}"))),
            (algorithm, kek) => Err(mismatch(algorithm, kek)),
        }
    }

    pub fn unwrap(self, wrapped: &[u8], kek: &KeyEncryptionKey) -> CryptoResult<ContentKey> {
        let mut raw = match (self, kek) {
            (KeyWrapAlgorithm::AesWrap, KeyEncryptionKey::Symmetric(kek)) => {
                aes_kw_unwrap(kek.as_bytes(), wrapped)?
            }
            (KeyWrapAlgorithm::LegacyAesEcb, KeyEncryptionKey::Symmetric(kek)) => {
                if wrapped.is_empty() || wrapped.len() % BLOCK_SIZE != 0 {
                    return Err(CryptoError::InvalidMetadata(format!(
                        "legacy wrapped key must be whole AES blocks, got {} bytes",
                        wrapped.len()
                    )));
                }
                let mut buf = wrapped.to_vec();
                ecb_apply(kek.as_bytes(), &mut buf, EcbDirection::Decrypt)?;
                let unpadded = pkcs7_unpad(&buf).map(<[u8]>::to_vec);
                buf.zeroize();
                unpadded.map_err(|_| {
                    CryptoError::MaterialResolution(
                        "legacy key unwrap failed: wrong key-encryption key or corrupt envelope"
                            .into(),
                    )
                })?
            }
            (KeyWrapAlgorithm::RsaOaepSha256, KeyEncryptionKey::Rsa(rsa)) => rsa
                .private_key()?
                .decrypt(Oaep::new::<Sha256>(), wrapped)
                .map_err(|e| {
                    CryptoError::MaterialResolution(format!("RSA-OAEP unwrap failed: {e}"))
                })?,
            (KeyWrapAlgorithm::LegacyRsaPkcs1, KeyEncryptionKey::Rsa(rsa)) => rsa
                .private_key()?
                .decrypt(Pkcs1v15Encrypt, wrapped)
                .map_err(|e| {
                    CryptoError::MaterialResolution(format!("RSA PKCS#1 unwrap failed: {e}"))
                })?,
            (algorithm, kek) => return Err(mismatch(algorithm, kek)),
        };
        let cek = ContentKey::from_slice(&raw);
        raw.zeroize();
        cek
    }
}

fn mismatch(algorithm: KeyWrapAlgorithm, kek: &KeyEncryptionKey) -> CryptoError {
    CryptoError::MaterialResolution(format!(
        "key-wrap algorithm {algorithm:?} cannot use an {} key-encryption key",
        kek.kind()
    ))
}

fn pkcs7_padded_len(len: usize) -> usize {
    (len / BLOCK_SIZE + 1) * BLOCK_SIZE
}

fn aes_kw_wrap(kek: &[u8], data: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut out = vec![0u8; data.len() + AES_WRAP_OVERHEAD];
    let result = match kek.len() {
        16 => KekAes128::from(key_array::<16>(kek)?).wrap(data, &mut out),
        24 => KekAes192::from(key_array::<24>(kek)?).wrap(data, &mut out),
        32 => KekAes256::from(key_array::<32>(kek)?).wrap(data, &mut out),
        n => return Err(bad_kek_len(n)),
    };
    result.map_err(|e| CryptoError::Cipher(format!("AES key wrap failed: {e:?}")))?;
    Ok(out)
}

fn aes_kw_unwrap(kek: &[u8], wrapped: &[u8]) -> CryptoResult<Vec<u8>> {
    if wrapped.len() < AES_WRAP_OVERHEAD + 16 {
        return Err(CryptoError::InvalidMetadata(format!(
            "AES-wrapped key too short: {} bytes",
            wrapped.len()
        )));
    }
    let mut out = vec![0u8; wrapped.len() - AES_WRAP_OVERHEAD];
    let result = match kek.len() {
        16 => KekAes128::from(key_array::<16>(kek)?).unwrap(wrapped, &mut out),
        24 => KekAes192::from(key_array::<24>(kek)?).unwrap(wrapped, &mut out),
        32 => KekAes256::from(key_array::<32>(kek)?).unwrap(wrapped, &mut out),
        n => return Err(bad_kek_len(n)),
    };
    result.map_err(|_| {
        CryptoError::MaterialResolution(
            "AES key unwrap failed: wrong key-encryption key or corrupt envelope".into(),
        )
    })?;
    Ok(out)
}

#[derive(Clone, Copy)]
enum EcbDirection {
    Encrypt,
    Decrypt,
}

fn ecb_apply(kek: &[u8], data: &mut [u8], direction: EcbDirection) -> CryptoResult<()> {
    match kek.len() {
        16 => ecb_blocks::<Aes128>(kek, data, direction),
        24 => ecb_blocks::<Aes192>(kek, data, direction),
        32 => ecb_blocks::<Aes256>(kek, data, direction),
        n => Err(bad_kek_len(n)),
    }
}

fn ecb_blocks<C>(kek: &[u8], data: &mut [u8], direction: EcbDirection) -> CryptoResult<()>
where
    C: KeyInit + BlockEncrypt + BlockDecrypt,
{
    let cipher = C::new_from_slice(kek)
        .map_err(|e| CryptoError::Cipher(format!("AES key init failed: {e}")))?;
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        let block = GenericArray::from_mut_slice(block);
        match direction {
            EcbDirection::Encrypt => cipher.encrypt_block(block),
            EcbDirection::Decrypt => cipher.decrypt_block(block),
        }
    }
    Ok(())
}

fn key_array<const N: usize>(kek: &[u8]) -> CryptoResult<[u8; N]> {
    kek.try_into().map_err(|_| bad_kek_len(kek.len()))
}

fn bad_kek_len(n: usize) -> CryptoError {
    CryptoError::MaterialResolution(format!(
        "AES key-encryption key must be 16, 24 or 32 bytes, got {n}"
    ))
}
