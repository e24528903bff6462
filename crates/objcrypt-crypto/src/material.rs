//! Content crypto material: the per-object envelope
//!
//! An envelope is a flat string map stored either in the encrypted object's
//! metadata or as the JSON body of a side-channel instruction object:
//!
//! ```text
//! authenticated                        non-authenticated (legacy)
//!   crypto-key-v2        base64 CEK*     crypto-key           base64 CEK*
//!   crypto-iv            base64 IV       crypto-iv            base64 IV
//!   crypto-cek-algorithm AES/GCM/...     materials-description JSON
//!   crypto-keywrap-algorithm AESWrap|RSA-OAEP-SHA256
//!   crypto-tag-length    128
//!   materials-description JSON
//! ```
//!
//! `*` wrapped under the KEK named by `materials-description`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use objcrypt_core::types::keys;
use objcrypt_core::{CryptoError, CryptoResult, MaterialsDescription, ObjectMetadata};

use crate::cipher::{CipherMode, StreamCipher};
use crate::keys::{generate_content_key, ContentKey};
use crate::provider::{EncryptionMaterials, KeyMaterialProvider};
use crate::scheme::CryptoScheme;
use crate::wrap::KeyWrapAlgorithm;

/// Parsed but still wrapped envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub scheme: CryptoScheme,
    pub wrapped_cek: Vec<u8>,
    pub iv: Vec<u8>,
    /// `None` for legacy wraps
    pub key_wrap_algorithm: Option<String>,
    pub description: MaterialsDescription,
}

impl Envelope {
    /// Does `map` carry an envelope at all?
    pub fn is_present(map: &ObjectMetadata) -> bool {
        map.contains_key(keys::CRYPTO_KEY_V2) || map.contains_key(keys::CRYPTO_KEY)
    }

    pub fn from_map(map: &ObjectMetadata) -> CryptoResult<Self> {
        let cek_algorithm = map.get(keys::CRYPTO_CEK_ALGORITHM).map(String::as_str);

        let (scheme, wrapped_b64) = if let Some(wrapped) = map.get(keys::CRYPTO_KEY_V2) {
            let name = cek_algorithm.ok_or_else(|| missing(keys::CRYPTO_CEK_ALGORITHM))?;
            let scheme = CryptoScheme::from_cipher_algorithm(name).ok_or_else(|| {
                CryptoError::InvalidMetadata(format!("unknown content cipher {name:?}"))
            })?;
            if scheme != CryptoScheme::Authenticated {
                return Err(CryptoError::InvalidMetadata(format!(
                    "{} carries non-authenticated cipher {name:?}",
                    keys::CRYPTO_KEY_V2
                )));
            }
            if !map.contains_key(keys::CRYPTO_KEYWRAP_ALGORITHM) {
                return Err(missing(keys::CRYPTO_KEYWRAP_ALGORITHM));
            }
            if let Some(tag) = map.get(keys::CRYPTO_TAG_LENGTH) {
                let expected = scheme.tag_length_bits().to_string();
                if *tag != expected {
                    return Err(CryptoError::InvalidMetadata(format!(
                        "unsupported tag length {tag} (expected {expected})"
                    )));
                }
            }
            (scheme, wrapped)
        } else if let Some(wrapped) = map.get(keys::CRYPTO_KEY) {
            // An authenticated marker must never go down the legacy path
            if let Some(name) = cek_algorithm {
                let legacy = CryptoScheme::from_cipher_algorithm(name);
                if legacy != Some(CryptoScheme::NonAuthenticated) {
                    return Err(CryptoError::InvalidMetadata(format!(
                        "legacy envelope names content cipher {name:?}"
                    )));
                }
            }
            (CryptoScheme::NonAuthenticated, wrapped)
        } else {
            return Err(missing(keys::CRYPTO_KEY_V2));
        };

        let wrapped_cek = decode_field(keys::CRYPTO_KEY, wrapped_b64)?;
        let iv_b64 = map.get(keys::CRYPTO_IV).ok_or_else(|| missing(keys::CRYPTO_IV))?;
        let iv = decode_field(keys::CRYPTO_IV, iv_b64)?;
        if iv.len() != scheme.iv_length_bytes() {
            return Err(CryptoError::InvalidMetadata(format!(
                "IV is {} bytes, {} needs {}",
                iv.len(),
                scheme.cipher_algorithm(),
                scheme.iv_length_bytes()
            )));
        }

        let description = match map.get(keys::MATERIALS_DESCRIPTION) {
            Some(json) => serde_json::from_str(json).map_err(|e| {
                CryptoError::InvalidMetadata(format!("{}: {e}", keys::MATERIALS_DESCRIPTION))
            })?,
            None => MaterialsDescription::new(),
        };

        Ok(Self {
            scheme,
            wrapped_cek,
            iv,
            key_wrap_algorithm: map.get(keys::CRYPTO_KEYWRAP_ALGORITHM).cloned(),
            description,
        })
    }

    pub fn to_map(&self) -> ObjectMetadata {
        let mut map = ObjectMetadata::new();
        let key_field = match self.scheme {
            CryptoScheme::Authenticated => keys::CRYPTO_KEY_V2,
            CryptoScheme::NonAuthenticated => keys::CRYPTO_KEY,
        };
        map.insert(key_field.into(), B64.encode(&self.wrapped_cek));
        map.insert(keys::CRYPTO_IV.into(), B64.encode(&self.iv));
        if self.scheme.is_authenticated() {
            map.insert(
                keys::CRYPTO_CEK_ALGORITHM.into(),
                self.scheme.cipher_algorithm().into(),
            );
            map.insert(
                keys::CRYPTO_TAG_LENGTH.into(),
                self.scheme.tag_length_bits().to_string(),
            );
        }
        if let Some(name) = &self.key_wrap_algorithm {
            map.insert(keys::CRYPTO_KEYWRAP_ALGORITHM.into(), name.clone());
        }
        // Serializing a string map cannot fail
        let description = serde_json::to_string(&self.description).unwrap_or_else(|_| "{}".into());
        map.insert(keys::MATERIALS_DESCRIPTION.into(), description);
        map
    }

    /// JSON body of an instruction object.
    pub fn to_instruction(&self) -> CryptoResult<Vec<u8>> {
        serde_json::to_vec(&self.to_map())
            .map_err(|e| CryptoError::InvalidMetadata(format!("instruction serialization: {e}")))
    }

    pub fn from_instruction(data: &[u8]) -> CryptoResult<Self> {
        let map: ObjectMetadata = serde_json::from_slice(data).map_err(|e| {
            CryptoError::InvalidMetadata(format!("instruction deserialization: {e}"))
        })?;
        Self::from_map(&map)
    }
}

fn missing(field: &str) -> CryptoError {
    CryptoError::InvalidMetadata(format!("missing {field}"))
}

fn decode_field(field: &str, value: &str) -> CryptoResult<Vec<u8>> {
    B64.decode(value)
        .map_err(|e| CryptoError::InvalidMetadata(format!("{field} is not valid base64: {e}")))
}

/// Unwrapped envelope of one object: CEK, IV and how the CEK is wrapped.
pub struct ContentCryptoMaterial {
    scheme: CryptoScheme,
    cek: ContentKey,
    iv: Vec<u8>,
    wrapped_cek: Vec<u8>,
    key_wrap_algorithm: KeyWrapAlgorithm,
    description: MaterialsDescription,
}

impl ContentCryptoMaterial {
    /// Fresh CEK and IV for a new object, wrapped under the provider's
    /// current KEK.
    pub fn generate(
        scheme: CryptoScheme,
        provider: &dyn KeyMaterialProvider,
    ) -> CryptoResult<Self> {
        let materials = provider.encryption_materials()?;
        Self::create(generate_content_key(), scheme.generate_iv(), &materials, scheme)
    }

    pub fn create(
        cek: ContentKey,
        iv: Vec<u8>,
        materials: &EncryptionMaterials,
        scheme: CryptoScheme,
    ) -> CryptoResult<Self> {
        if iv.len() != scheme.iv_length_bytes() {
            return Err(CryptoError::Cipher(format!(
                "{} needs a {}-byte IV, got {}",
                scheme.cipher_algorithm(),
                scheme.iv_length_bytes(),
                iv.len()
            )));
        }
        let key_wrap_algorithm = KeyWrapAlgorithm::select(scheme, &materials.kek);
        let wrapped_cek = key_wrap_algorithm.wrap(&cek, &materials.kek)?;
        tracing::debug!(
            algorithm = scheme.cipher_algorithm(),
            key_wrap = ?key_wrap_algorithm,
            kek = materials.kek.kind(),
            "content crypto material created"
        );
        Ok(Self {
            scheme,
            cek,
            iv,
            wrapped_cek,
            key_wrap_algorithm,
            description: materials.description.clone(),
        })
    }

    /// Re-wrap the same CEK for the KEK named by `new_description`.
    ///
    /// The object body stays valid; only the envelope changes.
    pub fn recreate(
        &self,
        new_description: &MaterialsDescription,
        provider: &dyn KeyMaterialProvider,
    ) -> CryptoResult<Self> {
        if *new_description == self.description {
            return Err(CryptoError::MaterialResolution(
                "new materials description must differ from the current one".into(),
            ));
        }
        let materials: Arc<EncryptionMaterials> = provider.resolve(new_description)?;
        Self::create(self.cek.clone(), self.iv.clone(), &materials, self.scheme)
    }

    /// Unwrap the CEK of a stored envelope.
    pub fn from_envelope(
        envelope: &Envelope,
        provider: &dyn KeyMaterialProvider,
    ) -> CryptoResult<Self> {
        let materials = provider.resolve(&envelope.description)?;
        let algorithm =
            KeyWrapAlgorithm::for_envelope(envelope.key_wrap_algorithm.as_deref(), &materials.kek)?;
        let cek = algorithm.unwrap(&envelope.wrapped_cek, &materials.kek)?;
        Ok(Self {
            scheme: envelope.scheme,
            cek,
            iv: envelope.iv.clone(),
            wrapped_cek: envelope.wrapped_cek.clone(),
            key_wrap_algorithm: algorithm,
            description: envelope.description.clone(),
        })
    }

    pub fn from_metadata(
        map: &ObjectMetadata,
        provider: &dyn KeyMaterialProvider,
    ) -> CryptoResult<Self> {
        Self::from_envelope(&Envelope::from_map(map)?, provider)
    }

    pub fn from_instruction(data: &[u8], provider: &dyn KeyMaterialProvider) -> CryptoResult<Self> {
        Self::from_envelope(&Envelope::from_instruction(data)?, provider)
    }

    pub fn envelope(&self) -> Envelope {
        Envelope {
            scheme: self.scheme,
            wrapped_cek: self.wrapped_cek.clone(),
            iv: self.iv.clone(),
            key_wrap_algorithm: self.key_wrap_algorithm.name().map(String::from),
            description: self.description.clone(),
        }
    }

    pub fn to_metadata(&self) -> ObjectMetadata {
        self.envelope().to_map()
    }

    pub fn to_instruction(&self) -> CryptoResult<Vec<u8>> {
        self.envelope().to_instruction()
    }

    /// A cipher at byte 0 bound to this CEK and IV.
    pub fn cipher(&self, mode: CipherMode) -> CryptoResult<StreamCipher> {
        StreamCipher::new(self.scheme, &self.cek, &self.iv, mode)
    }

    pub fn scheme(&self) -> CryptoScheme {
        self.scheme
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn wrapped_cek(&self) -> &[u8] {
        &self.wrapped_cek
    }

    pub fn key_wrap_algorithm(&self) -> KeyWrapAlgorithm {
        self.key_wrap_algorithm
    }

    pub fn description(&self) -> &MaterialsDescription {
        &self.description
    }
}

impl std::fmt::Debug for ContentCryptoMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCryptoMaterial")
            .field("scheme", &self.scheme)
            .field("cek", &self.cek)
            .field("key_wrap_algorithm", &self.key_wrap_algorithm)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SymmetricKek;
    use crate::provider::{SimpleMaterialsProvider, StaticMaterialsProvider};

    fn desc(name: &str) -> MaterialsDescription {
        [("kek".to_string(), name.to_string())].into_iter().collect()
    }

    fn provider(name: &str) -> StaticMaterialsProvider {
        let kek = SymmetricKek::generate();
        StaticMaterialsProvider::new(EncryptionMaterials::symmetric(kek, desc(name)))
    }

    #[test]
    fn test_authenticated_metadata_fields() {
        let material =
            ContentCryptoMaterial::generate(CryptoScheme::Authenticated, &provider("a")).unwrap();
        let map = material.to_metadata();
        assert_eq!(map[keys::CRYPTO_CEK_ALGORITHM], "AES/GCM/NoPadding");
        assert_eq!(map[keys::CRYPTO_KEYWRAP_ALGORITHM], "AESWrap");
        assert_eq!(map[keys::CRYPTO_TAG_LENGTH], "128");
        assert_eq!(map[keys::MATERIALS_DESCRIPTION], r#"{"kek":"a"}"#);
        assert!(!map.contains_key(keys::CRYPTO_KEY));
        assert_eq!(B64.decode(&map[keys::CRYPTO_KEY_V2]).unwrap().len(), 40);
    }

    #[test]
    fn test_legacy_metadata_fields() {
        let keyring = provider("a");
        let material =
            ContentCryptoMaterial::generate(CryptoScheme::NonAuthenticated, &keyring).unwrap();
        let map = material.to_metadata();
        assert!(map.contains_key(keys::CRYPTO_KEY));
        assert!(!map.contains_key(keys::CRYPTO_KEY_V2));
        assert!(!map.contains_key(keys::CRYPTO_CEK_ALGORITHM));
        assert!(!map.contains_key(keys::CRYPTO_KEYWRAP_ALGORITHM));
        assert!(!map.contains_key(keys::CRYPTO_TAG_LENGTH));
        assert_eq!(B64.decode(&map[keys::CRYPTO_KEY]).unwrap().len(), 48);
        assert_eq!(B64.decode(&map[keys::CRYPTO_IV]).unwrap().len(), 16);
    }

    #[test]
    fn test_unwrap_from_metadata() {
        let p = provider("a");
        for scheme in [CryptoScheme::Authenticated, CryptoScheme::NonAuthenticated] {
            let material = ContentCryptoMaterial::generate(scheme, &p).unwrap();
            let back = ContentCryptoMaterial::from_metadata(&material.to_metadata(), &p).unwrap();
            assert_eq!(back.cek.as_bytes(), material.cek.as_bytes());
            assert_eq!(back.iv(), material.iv());
            assert_eq!(back.scheme(), scheme);
            assert_eq!(back.key_wrap_algorithm(), material.key_wrap_algorithm());
        }
    }

    #[test]
    fn test_instruction_roundtrip() {
        let p = provider("a");
        let material = ContentCryptoMaterial::generate(CryptoScheme::Authenticated, &p).unwrap();
        let doc = material.to_instruction().unwrap();
        let envelope = Envelope::from_instruction(&doc).unwrap();
        assert_eq!(envelope, material.envelope());
    }

    #[test]
    fn test_authenticated_marker_never_takes_legacy_path() {
        let p = provider("a");
        let material = ContentCryptoMaterial::generate(CryptoScheme::Authenticated, &p).unwrap();
        let mut map = material.to_metadata();
        let wrapped = map.remove(keys::CRYPTO_KEY_V2).unwrap();
        map.insert(keys::CRYPTO_KEY.into(), wrapped);
        assert!(matches!(
            Envelope::from_map(&map),
            Err(CryptoError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_malformed_envelopes() {
        let p = provider("a");
        let good = ContentCryptoMaterial::generate(CryptoScheme::Authenticated, &p)
            .unwrap()
            .to_metadata();

        assert!(Envelope::from_map(&ObjectMetadata::new()).is_err());
        assert!(!Envelope::is_present(&ObjectMetadata::new()));

        for field in [keys::CRYPTO_IV, keys::CRYPTO_CEK_ALGORITHM, keys::CRYPTO_KEYWRAP_ALGORITHM] {
            let mut map = good.clone();
            map.remove(field);
            assert!(Envelope::from_map(&map).is_err(), "missing {field}");
        }

        let mut map = good.clone();
        map.insert(keys::CRYPTO_IV.into(), B64.encode([0u8; 16]));
        assert!(Envelope::from_map(&map).is_err(), "GCM with a 16-byte IV");

        let mut map = good.clone();
        map.insert(keys::CRYPTO_TAG_LENGTH.into(), "96".into());
        assert!(Envelope::from_map(&map).is_err());

        let mut map = good;
        map.insert(keys::MATERIALS_DESCRIPTION.into(), "not json".into());
        assert!(Envelope::from_map(&map).is_err());
    }

    #[test]
    fn test_recreate_for_second_recipient() {
        let mut keyring = SimpleMaterialsProvider::with_current(EncryptionMaterials::symmetric(
            SymmetricKek::generate(),
            desc("owner"),
        ));
        keyring.add(EncryptionMaterials::symmetric(SymmetricKek::generate(), desc("auditor")));

        let material =
            ContentCryptoMaterial::generate(CryptoScheme::Authenticated, &keyring).unwrap();
        let shared = material.recreate(&desc("auditor"), &keyring).unwrap();
        assert_eq!(shared.description(), &desc("auditor"));
        assert_ne!(shared.wrapped_cek(), material.wrapped_cek());
        assert_eq!(shared.iv(), material.iv());

        let back = ContentCryptoMaterial::from_metadata(&shared.to_metadata(), &keyring).unwrap();
        assert_eq!(back.cek.as_bytes(), material.cek.as_bytes());

        assert!(matches!(
            material.recreate(&desc("owner"), &keyring),
            Err(CryptoError::MaterialResolution(_))
        ));
        assert!(material.recreate(&desc("stranger"), &keyring).is_err());
    }

    #[test]
    fn test_unknown_description_fails_resolution() {
        let material =
            ContentCryptoMaterial::generate(CryptoScheme::Authenticated, &provider("a")).unwrap();
        let result = ContentCryptoMaterial::from_metadata(&material.to_metadata(), &provider("b"));
        assert!(matches!(result, Err(CryptoError::MaterialResolution(_))));
    }
}
