use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CryptoError, CryptoResult};
use crate::types::{MaterialsDescription, DEFAULT_INSTRUCTION_SUFFIX};

/// Top-level configuration (loaded from objcrypt.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjcryptConfig {
    /// Key-encryption keys known to this client
    pub keys: Vec<KekConfig>,
    pub crypto: CryptoConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl ObjcryptConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> CryptoResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CryptoError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| CryptoError::Config(format!("parsing {}: {e}", path.display())))
    }
}

/// Which cipher suite new objects use, and what the client agrees to decrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CryptoMode {
    /// Legacy AES-CBC for new objects
    EncryptionOnly,
    /// AES-GCM for new objects; legacy objects and range reads still allowed
    AuthenticatedEncryption,
    /// AES-GCM only; legacy objects and unauthenticated range reads rejected
    StrictAuthenticatedEncryption,
}

/// Where the encryption envelope is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Envelope fields live in the encrypted object's own metadata
    ObjectMetadata,
    /// Envelope fields live in a separate `<key>.<suffix>` object
    InstructionFile,
}

/// Client-side encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Crypto mode (default: authenticated-encryption)
    pub mode: CryptoMode,
    /// Envelope storage mode (default: object-metadata)
    pub storage_mode: StorageMode,
    /// Suffix appended to the object key for instruction objects
    pub instruction_suffix: String,
    /// Whether the cipher provider in use offers AEAD. Authenticated modes
    /// refuse to start without it.
    pub aead_available: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            mode: CryptoMode::AuthenticatedEncryption,
            storage_mode: StorageMode::ObjectMetadata,
            instruction_suffix: DEFAULT_INSTRUCTION_SUFFIX.into(),
            aead_available: true,
        }
    }
}

/// Local object store used by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding objects and their metadata sidecars
    pub root: PathBuf,
    /// Multipart part size in bytes (default: 8 MiB)
    pub part_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.local/share/objcrypt/store"),
            part_size: 8 * 1024 * 1024,
        }
    }
}

/// A single key-encryption key entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KekConfig {
    /// Materials description recorded with every object this KEK wraps
    pub description: MaterialsDescription,
    /// File holding a base64 AES key (16, 24 or 32 bytes)
    pub aes_key_file: Option<PathBuf>,
    /// PKCS#8 PEM RSA private key
    pub rsa_private_key_file: Option<PathBuf>,
    /// PKCS#8 PEM RSA public key (wrap-only recipient)
    pub rsa_public_key_file: Option<PathBuf>,
    /// Use this KEK for new objects
    pub current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
