//! objcrypt-crypto: client-side envelope encryption for object storage
//!
//! Each object is encrypted under its own random content-encryption key
//! (CEK). The CEK is wrapped by a key-encryption key (KEK) and the wrapped
//! CEK travels with the object as its envelope.
//!
//! Key hierarchy:
//! ```text
//! KEK (AES 128/192/256 or RSA, from a KeyMaterialProvider)
//!   └── CEK (per object, 256-bit random, wrapped: AESWrap | RSA-OAEP-SHA256 | legacy)
//!       └── Content cipher: AES-256-GCM (12-byte IV, 128-bit tag)
//!                        or AES-256-CBC/PKCS#7 (16-byte IV, legacy)
//! ```
//!
//! Pipeline: plaintext → CipherReader(StreamCipher) → transport,
//! and back: transport → CipherReader(StreamCipher or auxiliary) → plaintext.

mod cbc;
mod gcm;
mod keystream;

pub mod cipher;
pub mod keys;
pub mod material;
pub mod multipart;
pub mod provider;
pub mod range;
pub mod scheme;
pub mod stream;
pub mod wrap;

pub use cipher::{Checkpoint, CipherMode, CipherState, StreamCipher};
pub use keys::{generate_content_key, ContentKey, KeyEncryptionKey, RsaKek, SymmetricKek};
pub use material::{ContentCryptoMaterial, Envelope};
pub use multipart::{part_ciphertext_length, MultipartUploadCryptoContext};
pub use provider::{
    EncryptionMaterials, KeyMaterialProvider, SimpleMaterialsProvider, StaticMaterialsProvider,
};
pub use range::{plan_range, CryptoRange, RangeReader};
pub use scheme::CryptoScheme;
pub use stream::CipherReader;
pub use wrap::KeyWrapAlgorithm;

/// Size of a content-encryption key in bytes (256-bit)
pub const CEK_SIZE: usize = 32;

/// Size of a GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;
