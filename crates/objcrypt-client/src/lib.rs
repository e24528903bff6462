//! objcrypt-client: encrypting object storage client
//!
//! [`CryptoClient`] encrypts bodies on their way to an [`ObjectTransport`]
//! and decrypts them on the way back. Two transports ship with the crate:
//! [`MemoryTransport`] for tests and embedding, and [`LocalFsTransport`]
//! which keeps objects in a directory tree.

pub mod client;
pub mod keyring;
pub mod local;
pub mod memory;
pub mod transport;

pub use client::{put_bytes, CryptoClient, CryptoModule, DecryptedObject, MultipartUpload};
pub use keyring::provider_from_config;
pub use local::LocalFsTransport;
pub use memory::MemoryTransport;
pub use transport::{BytesBody, GetObjectOutput, HeadObjectOutput, ObjectTransport, UploadBody};
