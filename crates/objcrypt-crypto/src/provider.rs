//! Key-material providers: where key-encryption keys come from
//!
//! Every wrapped CEK is stored with a materials description, a free-form
//! string map. On decrypt the description is handed back to the provider,
//! which must return the same KEK that wrapped the CEK.

use std::collections::BTreeMap;
use std::sync::Arc;

use objcrypt_core::{CryptoError, CryptoResult, MaterialsDescription};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::keys::{KeyEncryptionKey, RsaKek, SymmetricKek};

/// A KEK together with the description recorded next to everything it wraps.
#[derive(Debug, Clone)]
pub struct EncryptionMaterials {
    pub kek: KeyEncryptionKey,
    pub description: MaterialsDescription,
}

impl EncryptionMaterials {
    pub fn new(kek: KeyEncryptionKey, description: MaterialsDescription) -> Self {
        Self { kek, description }
    }

    pub fn symmetric(kek: SymmetricKek, description: MaterialsDescription) -> Self {
        Self::new(KeyEncryptionKey::Symmetric(kek), description)
    }

    pub fn rsa(private: RsaPrivateKey, description: MaterialsDescription) -> Self {
        Self::new(KeyEncryptionKey::Rsa(RsaKek::from_private(private)), description)
    }

    /// Wrap-only materials for a recipient whose private key we do not hold.
    pub fn rsa_public(public: RsaPublicKey, description: MaterialsDescription) -> Self {
        Self::new(KeyEncryptionKey::Rsa(RsaKek::from_public(public)), description)
    }
}

/// Source of key-encryption keys.
pub trait KeyMaterialProvider: Send + Sync {
    /// Materials used to wrap CEKs of new objects.
    fn encryption_materials(&self) -> CryptoResult<Arc<EncryptionMaterials>>;

    /// Materials matching a description read back from an object.
    fn resolve(&self, description: &MaterialsDescription) -> CryptoResult<Arc<EncryptionMaterials>>;
}

/// A provider holding exactly one KEK.
#[derive(Debug, Clone)]
pub struct StaticMaterialsProvider {
    materials: Arc<EncryptionMaterials>,
}

impl StaticMaterialsProvider {
    pub fn new(materials: EncryptionMaterials) -> Self {
        Self {
            materials: Arc::new(materials),
        }
    }
}

impl KeyMaterialProvider for StaticMaterialsProvider {
    fn encryption_materials(&self) -> CryptoResult<Arc<EncryptionMaterials>> {
        Ok(Arc::clone(&self.materials))
    }

    fn resolve(
        &self,
        description: &MaterialsDescription,
    ) -> CryptoResult<Arc<EncryptionMaterials>> {
        if *description == self.materials.description {
            Ok(Arc::clone(&self.materials))
        } else {
            Err(CryptoError::MaterialResolution(format!(
                "no key-encryption key for description {description:?}"
            )))
        }
    }
}

/// A set of KEKs keyed by description, one of them current.
///
/// Rotating means adding a new KEK and making it current; objects wrapped
/// under older KEKs stay readable as long as those remain in the set.
#[derive(Debug, Clone, Default)]
pub struct SimpleMaterialsProvider {
    materials: BTreeMap<MaterialsDescription, Arc<EncryptionMaterials>>,
    current: Option<MaterialsDescription>,
}

impl SimpleMaterialsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `materials` as the current KEK.
    pub fn with_current(materials: EncryptionMaterials) -> Self {
        let mut provider = Self::new();
        provider.add_current(materials);
        provider
    }

    /// Add a KEK that can decrypt but is not used for new objects.
    pub fn add(&mut self, materials: EncryptionMaterials) {
        self.materials
            .insert(materials.description.clone(), Arc::new(materials));
    }

    /// Add a KEK and use it for new objects from now on.
    pub fn add_current(&mut self, materials: EncryptionMaterials) {
        let description = materials.description.clone();
        self.add(materials);
        self.current = Some(description);
    }

    /// Make an already added KEK current.
    pub fn set_current(&mut self, description: &MaterialsDescription) -> CryptoResult<()> {
        if !self.materials.contains_key(description) {
            return Err(CryptoError::MaterialResolution(format!(
                "cannot make unknown description {description:?} current"
            )));
        }
        self.current = Some(description.clone());
        Ok(())
    }

    pub fn remove(
        &mut self,
        description: &MaterialsDescription,
    ) -> Option<Arc<EncryptionMaterials>> {
        if self.current.as_ref() == Some(description) {
            self.current = None;
        }
        self.materials.remove(description)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

impl KeyMaterialProvider for SimpleMaterialsProvider {
    fn encryption_materials(&self) -> CryptoResult<Arc<EncryptionMaterials>> {
        self.current
            .as_ref()
            .and_then(|d| self.materials.get(d))
            .cloned()
            .ok_or_else(|| CryptoError::MaterialResolution("no current key-encryption key".into()))
    }

    fn resolve(
        &self,
        description: &MaterialsDescription,
    ) -> CryptoResult<Arc<EncryptionMaterials>> {
        self.materials.get(description).cloned().ok_or_else(|| {
            CryptoError::MaterialResolution(format!(
                "no key-encryption key for description {description:?}"
            ))
        })
    }
}
