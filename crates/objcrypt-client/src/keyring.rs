//! Key-encryption keys loaded from configuration
//!
//! Each `[[keys]]` entry names exactly one key source:
//! - `aes_key_file`: base64 AES key (16, 24 or 32 bytes)
//! - `rsa_private_key_file`: PKCS#8 PEM private key
//! - `rsa_public_key_file`: PKCS#8 PEM public key (can wrap, cannot unwrap)

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use objcrypt_core::config::KekConfig;
use objcrypt_core::{CryptoError, CryptoResult};
use objcrypt_crypto::{EncryptionMaterials, SimpleMaterialsProvider, SymmetricKek};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroize;

/// Build a provider holding every configured KEK.
///
/// The entry marked `current` wraps new objects. A lone entry is current
/// even when unmarked.
pub fn provider_from_config(entries: &[KekConfig]) -> CryptoResult<SimpleMaterialsProvider> {
    let current_count = entries.iter().filter(|e| e.current).count();
    if current_count > 1 {
        return Err(CryptoError::Config(format!(
            "{current_count} keys are marked current; at most one may be"
        )));
    }

    let mut provider = SimpleMaterialsProvider::new();
    for (i, entry) in entries.iter().enumerate() {
        let materials = load_materials(entry).map_err(|e| match e {
            CryptoError::Config(msg) => CryptoError::Config(format!("keys[{i}]: {msg}")),
            other => CryptoError::Config(format!("keys[{i}]: {other}")),
        })?;
        if entry.current || entries.len() == 1 {
            provider.add_current(materials);
        } else {
            provider.add(materials);
        }
    }
    if provider.len() != entries.len() {
        return Err(CryptoError::Config("two keys share one materials description".into()));
    }
    tracing::debug!(keys = provider.len(), "key-encryption keys loaded");
    Ok(provider)
}

fn load_materials(entry: &KekConfig) -> CryptoResult<EncryptionMaterials> {
    let sources = [
        entry.aes_key_file.is_some(),
        entry.rsa_private_key_file.is_some(),
        entry.rsa_public_key_file.is_some(),
    ];
    if sources.iter().filter(|s| **s).count() != 1 {
        return Err(CryptoError::Config(
            "set exactly one of aes_key_file, rsa_private_key_file, rsa_public_key_file".into(),
        ));
    }
    let description = entry.description.clone();

    if let Some(path) = &entry.aes_key_file {
        return Ok(EncryptionMaterials::symmetric(read_aes_key(path)?, description));
    }
    if let Some(path) = &entry.rsa_private_key_file {
        let pem = read_to_string(path)?;
        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| CryptoError::Config(format!("parsing {}: {e}", path.display())))?;
        return Ok(EncryptionMaterials::rsa(key, description));
    }
    match &entry.rsa_public_key_file {
        Some(path) => {
            let pem = read_to_string(path)?;
            let key = RsaPublicKey::from_public_key_pem(&pem)
                .map_err(|e| CryptoError::Config(format!("parsing {}: {e}", path.display())))?;
            Ok(EncryptionMaterials::rsa_public(key, description))
        }
        None => Err(CryptoError::Config("no key source".into())),
    }
}

fn read_to_string(path: &Path) -> CryptoResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| CryptoError::Config(format!("reading {}: {e}", path.display())))
}

/// Read a base64 AES key file.
pub fn read_aes_key(path: &Path) -> CryptoResult<SymmetricKek> {
    let mut text = read_to_string(path)?;
    let decoded = B64.decode(text.trim());
    text.zeroize();
    let bytes =
        decoded.map_err(|e| CryptoError::Config(format!("decoding {}: {e}", path.display())))?;
    SymmetricKek::new(bytes).map_err(|e| CryptoError::Config(format!("{}: {e}", path.display())))
}

/// Write a fresh 256-bit AES key as base64. Refuses to overwrite.
pub fn write_aes_key(path: &Path) -> CryptoResult<()> {
    use std::io::Write;

    let kek = SymmetricKek::generate();
    let mut encoded = B64.encode(kek.as_bytes());
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let result = options
        .open(path)
        .and_then(|mut file| writeln!(file, "{encoded}"));
    encoded.zeroize();
    result.map_err(|e| CryptoError::Config(format!("writing {}: {e}", path.display())))?;
    tracing::debug!(path = %path.display(), "AES key-encryption key written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use objcrypt_core::MaterialsDescription;
    use objcrypt_crypto::KeyMaterialProvider;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    fn desc(name: &str) -> MaterialsDescription {
        MaterialsDescription::from([("kek".to_string(), name.to_string())])
    }

    fn aes_entry(dir: &Path, name: &str, current: bool) -> KekConfig {
        let path = dir.join(format!("{name}.b64"));
        write_aes_key(&path).unwrap();
        KekConfig {
            description: desc(name),
            aes_key_file: Some(path),
            current,
            ..KekConfig::default()
        }
    }

    #[test]
    fn test_single_key_becomes_current() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_from_config(&[aes_entry(dir.path(), "only", false)]).unwrap();
        assert_eq!(provider.encryption_materials().unwrap().description, desc("only"));
    }

    #[test]
    fn test_rotation_keeps_old_keys_resolvable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_from_config(&[
            aes_entry(dir.path(), "2023", false),
            aes_entry(dir.path(), "2024", true),
        ])
        .unwrap();
        assert_eq!(provider.encryption_materials().unwrap().description, desc("2024"));
        assert!(provider.resolve(&desc("2023")).is_ok());
    }

    #[test]
    fn test_rsa_key_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let private_path = dir.path().join("recipient.pem");
        let public_path = dir.path().join("recipient.pub.pem");
        let private_pem = private.to_pkcs8_pem(LineEnding::LF).unwrap();
        std::fs::write(&private_path, private_pem.as_bytes()).unwrap();
        std::fs::write(
            &public_path,
            private.to_public_key().to_public_key_pem(LineEnding::LF).unwrap(),
        )
        .unwrap();

        let provider = provider_from_config(&[
            KekConfig {
                description: desc("private"),
                rsa_private_key_file: Some(private_path),
                current: true,
                ..KekConfig::default()
            },
            KekConfig {
                description: desc("public"),
                rsa_public_key_file: Some(public_path),
                ..KekConfig::default()
            },
        ])
        .unwrap();
        assert_eq!(provider.len(), 2);
    }

    #[test]
    fn test_rejects_bad_entries() {
        let dir = tempfile::tempdir().unwrap();

        let no_source = KekConfig::default();
        assert!(matches!(provider_from_config(&[no_source]), Err(CryptoError::Config(_))));

        let mut two_sources = aes_entry(dir.path(), "a", false);
        two_sources.rsa_public_key_file = Some(dir.path().join("x.pem"));
        assert!(matches!(provider_from_config(&[two_sources]), Err(CryptoError::Config(_))));

        let two_current = [aes_entry(dir.path(), "b", true), aes_entry(dir.path(), "c", true)];
        assert!(matches!(provider_from_config(&two_current), Err(CryptoError::Config(_))));

        let bad = dir.path().join("bad.b64");
        std::fs::write(&bad, "not base64 !!").unwrap();
        let entry = KekConfig {
            aes_key_file: Some(bad),
            ..KekConfig::default()
        };
        assert!(matches!(provider_from_config(&[entry]), Err(CryptoError::Config(_))));

        let short = dir.path().join("short.b64");
        std::fs::write(&short, B64.encode([0u8; 7])).unwrap();
        assert!(read_aes_key(&short).is_err());
    }

    #[test]
    fn test_write_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kek.b64");
        write_aes_key(&path).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(write_aes_key(&path).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
        assert_eq!(read_aes_key(&path).unwrap().as_bytes().len(), 32);
    }
}
