use std::collections::BTreeMap;

/// User metadata stored alongside an object (string-keyed, case-significant).
pub type ObjectMetadata = BTreeMap<String, String>;

/// Free-form description identifying the key-encryption key that wrapped a CEK.
pub type MaterialsDescription = BTreeMap<String, String>;

/// Metadata / instruction-document field names.
pub mod keys {
    /// Decimal plaintext length of the encrypted object
    pub const UNENCRYPTED_CONTENT_LENGTH: &str = "unencrypted-content-length";
    /// Base64 wrapped CEK, legacy non-authenticated suite
    pub const CRYPTO_KEY: &str = "crypto-key";
    /// Base64 wrapped CEK, authenticated suite
    pub const CRYPTO_KEY_V2: &str = "crypto-key-v2";
    pub const CRYPTO_IV: &str = "crypto-iv";
    pub const CRYPTO_CEK_ALGORITHM: &str = "crypto-cek-algorithm";
    pub const CRYPTO_KEYWRAP_ALGORITHM: &str = "crypto-keywrap-algorithm";
    /// Decimal tag length in bits
    pub const CRYPTO_TAG_LENGTH: &str = "crypto-tag-length";
    /// Present only on side-channel instruction objects
    pub const CRYPTO_INSTRUCTION_FILE: &str = "crypto-instruction-file";
    /// JSON object of key-material description strings
    pub const MATERIALS_DESCRIPTION: &str = "materials-description";

    /// Every envelope field that may appear in object metadata.
    pub const ENVELOPE_FIELDS: &[&str] = &[
        CRYPTO_KEY,
        CRYPTO_KEY_V2,
        CRYPTO_IV,
        CRYPTO_CEK_ALGORITHM,
        CRYPTO_KEYWRAP_ALGORITHM,
        CRYPTO_TAG_LENGTH,
        MATERIALS_DESCRIPTION,
    ];
}

/// Default suffix of side-channel instruction objects (`<key>.instruction`).
pub const DEFAULT_INSTRUCTION_SUFFIX: &str = "instruction";

/// Key of the instruction object belonging to `object_key`.
pub fn instruction_key(object_key: &str, suffix: &str) -> String {
    format!("{object_key}.{suffix}")
}

/// Strip envelope fields, leaving the caller-visible user metadata.
pub fn without_envelope(metadata: &ObjectMetadata) -> ObjectMetadata {
    metadata
        .iter()
        .filter(|(k, _)| !keys::ENVELOPE_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_key() {
        assert_eq!(
            instruction_key("photos/cat.jpg", DEFAULT_INSTRUCTION_SUFFIX),
            "photos/cat.jpg.instruction"
        );
    }

    #[test]
    fn test_without_envelope_keeps_user_fields() {
        let mut meta = ObjectMetadata::new();
        meta.insert(keys::CRYPTO_KEY_V2.into(), "AAAA".into());
        meta.insert(keys::CRYPTO_IV.into(), "BBBB".into());
        meta.insert(keys::UNENCRYPTED_CONTENT_LENGTH.into(), "42".into());
        meta.insert("owner".into(), "alice".into());

        let user = without_envelope(&meta);
        assert_eq!(user.len(), 2);
        assert_eq!(user["owner"], "alice");
        assert_eq!(user[keys::UNENCRYPTED_CONTENT_LENGTH], "42");
    }
}
