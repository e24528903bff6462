//! End-to-end tests of the encrypting client over the in-memory and
//! local-directory transports.

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use objcrypt_client::{put_bytes, CryptoClient, LocalFsTransport, MemoryTransport, ObjectTransport};
use objcrypt_core::config::{CryptoConfig, CryptoMode, StorageMode};
use objcrypt_core::types::keys;
use objcrypt_core::{CryptoError, MaterialsDescription, ObjectMetadata};
use objcrypt_crypto::{
    CryptoScheme, EncryptionMaterials, KeyMaterialProvider, SimpleMaterialsProvider,
    StaticMaterialsProvider, SymmetricKek,
};
use proptest::prelude::*;

fn desc(name: &str) -> MaterialsDescription {
    MaterialsDescription::from([("kek".to_string(), name.to_string())])
}

fn provider(name: &str, byte: u8) -> Arc<dyn KeyMaterialProvider> {
    Arc::new(StaticMaterialsProvider::new(EncryptionMaterials::symmetric(
        SymmetricKek::new(vec![byte; 32]).unwrap(),
        desc(name),
    )))
}

fn config(mode: CryptoMode, storage_mode: StorageMode) -> CryptoConfig {
    CryptoConfig {
        mode,
        storage_mode,
        ..CryptoConfig::default()
    }
}

fn client_on(
    transport: &Arc<MemoryTransport>,
    mode: CryptoMode,
    storage_mode: StorageMode,
) -> CryptoClient<Arc<MemoryTransport>> {
    CryptoClient::new(
        transport.clone(),
        provider("main", 0x11),
        config(mode, storage_mode),
    )
    .unwrap()
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn user_metadata() -> ObjectMetadata {
    ObjectMetadata::from([("owner".to_string(), "alice".to_string())])
}

#[test]
fn roundtrip_every_mode_and_storage() {
    for mode in [CryptoMode::EncryptionOnly, CryptoMode::AuthenticatedEncryption] {
        for storage_mode in [StorageMode::ObjectMetadata, StorageMode::InstructionFile] {
            let transport = Arc::new(MemoryTransport::default());
            let client = client_on(&transport, mode, storage_mode);
            let data = sample(1000);
            put_bytes(&client, "docs/report.pdf", &data, &user_metadata()).unwrap();

            let (stored, stored_meta) = transport.object("docs/report.pdf").unwrap();
            assert_ne!(&stored[..16], &data[..16], "body stored in the clear");
            assert_eq!(stored_meta[keys::UNENCRYPTED_CONTENT_LENGTH], "1000");

            let got = client.get_object("docs/report.pdf").unwrap();
            assert_eq!(got.metadata["owner"], "alice");
            assert!(!got.metadata.contains_key(keys::CRYPTO_IV));
            assert_eq!(got.content_length, Some(1000));
            let expected_scheme = if mode == CryptoMode::EncryptionOnly {
                CryptoScheme::NonAuthenticated
            } else {
                CryptoScheme::Authenticated
            };
            assert_eq!(got.scheme, expected_scheme);
            assert_eq!(got.integrity_verified, expected_scheme.is_authenticated());
            assert_eq!(got.into_bytes().unwrap(), data);
        }
    }
}

#[test]
fn instruction_mode_keeps_envelope_out_of_object_metadata() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client_on(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::InstructionFile);
    put_bytes(&client, "photo.jpg", b"not really a jpeg", &ObjectMetadata::new()).unwrap();

    let (_, object_meta) = transport.object("photo.jpg").unwrap();
    assert!(!object_meta.contains_key(keys::CRYPTO_KEY_V2));

    let (document, instruction_meta) = transport.object("photo.jpg.instruction").unwrap();
    assert!(instruction_meta.contains_key(keys::CRYPTO_INSTRUCTION_FILE));
    let fields: ObjectMetadata = serde_json::from_slice(&document).unwrap();
    assert_eq!(fields[keys::CRYPTO_CEK_ALGORITHM], "AES/GCM/NoPadding");
    assert_eq!(fields[keys::CRYPTO_KEYWRAP_ALGORITHM], "AESWrap");
    assert_eq!(fields[keys::CRYPTO_TAG_LENGTH], "128");

    let got = client.get_object_with_instruction("photo.jpg", "instruction").unwrap();
    assert_eq!(got.into_bytes().unwrap(), b"not really a jpeg");
}

#[test]
fn missing_envelope_is_invalid_metadata() {
    let transport = Arc::new(MemoryTransport::default());
    transport.insert_object("plain", b"hello".to_vec(), ObjectMetadata::new());
    let client =
        client_on(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    assert!(matches!(client.get_object("plain"), Err(CryptoError::InvalidMetadata(_))));
    assert!(matches!(client.get_object("absent"), Err(CryptoError::NotFound(_))));
}

#[test]
fn authenticated_range_fetches_only_covering_blocks() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client_on(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    let data = sample(1000);
    put_bytes(&client, "obj", &data, &ObjectMetadata::new()).unwrap();

    let got = client.get_object_range("obj", 10..20).unwrap();
    assert!(!got.integrity_verified);
    assert_eq!(got.content_length, Some(10));
    assert_eq!(got.into_bytes().unwrap(), &data[10..20]);
    assert_eq!(
        transport.requested_ranges().last().unwrap(),
        &("obj".to_string(), Some(0..32))
    );
}

#[test]
fn legacy_range_fetches_chaining_block() {
    let transport = Arc::new(MemoryTransport::default());
    let client = client_on(&transport, CryptoMode::EncryptionOnly, StorageMode::ObjectMetadata);
    let data = sample(1000);
    put_bytes(&client, "obj", &data, &ObjectMetadata::new()).unwrap();

    let got = client.get_object_range("obj", 20..40).unwrap();
    assert_eq!(got.into_bytes().unwrap(), &data[20..40]);
    assert_eq!(
        transport.requested_ranges().last().unwrap(),
        &("obj".to_string(), Some(0..48))
    );

    // Tail of the object, through the padding block
    let got = client.get_object_range("obj", 990..5000).unwrap();
    assert_eq!(got.into_bytes().unwrap(), &data[990..]);
}

#[test]
fn strict_mode_rejects_ranges_and_legacy_objects() {
    let transport = Arc::new(MemoryTransport::default());
    let legacy = client_on(&transport, CryptoMode::EncryptionOnly, StorageMode::ObjectMetadata);
    put_bytes(&legacy, "old", b"legacy content", &ObjectMetadata::new()).unwrap();

    let strict = client_on(
        &transport,
        CryptoMode::StrictAuthenticatedEncryption,
        StorageMode::ObjectMetadata,
    );
    put_bytes(&strict, "new", b"modern content", &ObjectMetadata::new()).unwrap();

    assert!(matches!(strict.get_object("old"), Err(CryptoError::UnsupportedOperation(_))));
    assert!(matches!(
        strict.get_object_range("new", 0..4),
        Err(CryptoError::UnsupportedOperation(_))
    ));
    assert_eq!(strict.get_object("new").unwrap().into_bytes().unwrap(), b"modern content");

    // The lenient authenticated mode still reads legacy objects, unverified
    let lenient =
        client_on(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    let got = lenient.get_object("old").unwrap();
    assert!(!got.integrity_verified);
    assert_eq!(got.into_bytes().unwrap(), b"legacy content");
}

#[test]
fn tampered_ciphertext_fails_authentication() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client_on(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    put_bytes(&client, "obj", &sample(300), &ObjectMetadata::new()).unwrap();

    let (mut stored, meta) = transport.object("obj").unwrap();
    stored[150] ^= 0x01;
    transport.insert_object("obj", stored, meta);

    let result = client.get_object("obj").unwrap().into_bytes();
    assert!(matches!(result, Err(CryptoError::AuthenticationFailure(_))));
}

#[test]
fn authenticated_marker_never_decrypts_as_legacy() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client_on(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    put_bytes(&client, "obj", b"data", &ObjectMetadata::new()).unwrap();

    let (stored, mut meta) = transport.object("obj").unwrap();
    let wrapped = meta.remove(keys::CRYPTO_KEY_V2).unwrap();
    meta.insert(keys::CRYPTO_KEY.into(), wrapped);
    transport.insert_object("obj", stored, meta);

    assert!(matches!(client.get_object("obj"), Err(CryptoError::InvalidMetadata(_))));
}

#[test]
fn interrupted_upload_is_resent_from_mark() {
    for mode in [CryptoMode::EncryptionOnly, CryptoMode::AuthenticatedEncryption] {
        let transport = Arc::new(MemoryTransport::default());
        let client = client_on(&transport, mode, StorageMode::ObjectMetadata);
        let data = sample(50_000);
        transport.fail_next_upload_after(20_011);
        put_bytes(&client, "big", &data, &ObjectMetadata::new()).unwrap();

        assert_eq!(transport.resend_count(), 1);
        assert_eq!(client.get_object("big").unwrap().into_bytes().unwrap(), data);
    }
}

#[test]
fn body_is_encrypted_from_its_current_position() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client_on(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    let mut body = Cursor::new(b"headerPAYLOAD".to_vec());
    body.seek(SeekFrom::Start(6)).unwrap();
    client.put_object("obj", body, &ObjectMetadata::new()).unwrap();
    assert_eq!(client.get_object("obj").unwrap().into_bytes().unwrap(), b"PAYLOAD");
}

/// A body that claims a huge length without holding it.
struct Sparse {
    len: u64,
    pos: u64,
}

impl Read for Sparse {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min((self.len - self.pos) as usize);
        buf[..n].fill(0);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for Sparse {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::End(d) => (self.len as i64 + d) as u64,
            SeekFrom::Current(d) => (self.pos as i64 + d) as u64,
        };
        Ok(self.pos)
    }
}

#[test]
fn oversized_body_is_refused_before_reading() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client_on(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    let body = Sparse { len: 1 << 36, pos: 0 };
    let result = client.put_object("huge", body, &ObjectMetadata::new());
    assert!(matches!(result, Err(CryptoError::CapacityExceeded { .. })));
    assert!(transport.keys().is_empty());
}

#[test]
fn second_recipient_reads_through_its_own_instruction() {
    let transport = Arc::new(MemoryTransport::default());

    let mut owner_keys = SimpleMaterialsProvider::new();
    owner_keys.add_current(EncryptionMaterials::symmetric(
        SymmetricKek::new(vec![1; 32]).unwrap(),
        desc("owner"),
    ));
    owner_keys.add(EncryptionMaterials::symmetric(
        SymmetricKek::new(vec![2; 32]).unwrap(),
        desc("auditor"),
    ));
    let owner = CryptoClient::new(
        transport.clone(),
        Arc::new(owner_keys),
        config(CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata),
    )
    .unwrap();
    put_bytes(&owner, "ledger.csv", b"a,b,c\n1,2,3\n", &ObjectMetadata::new()).unwrap();
    let body_before = transport.object("ledger.csv").unwrap();

    owner
        .put_instruction_for_recipient("ledger.csv", &desc("auditor"), "auditor")
        .unwrap();
    assert_eq!(transport.object("ledger.csv").unwrap(), body_before);

    // Same description again is not a new recipient
    assert!(matches!(
        owner.put_instruction_for_recipient("ledger.csv", &desc("owner"), "again"),
        Err(CryptoError::MaterialResolution(_))
    ));
    // The default suffix belongs to the object itself
    assert!(matches!(
        owner.put_instruction_for_recipient("ledger.csv", &desc("auditor"), "instruction"),
        Err(CryptoError::UnsupportedOperation(_))
    ));

    let auditor = CryptoClient::new(
        transport.clone(),
        provider("auditor", 2),
        config(CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata),
    )
    .unwrap();
    assert!(matches!(
        auditor.get_object("ledger.csv"),
        Err(CryptoError::MaterialResolution(_))
    ));
    let got = auditor
        .get_object_with_instruction("ledger.csv", "auditor")
        .unwrap();
    assert_eq!(got.into_bytes().unwrap(), b"a,b,c\n1,2,3\n");
}

#[test]
fn local_directory_transport_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let transport = LocalFsTransport::new(dir.path().join("store")).unwrap();
    let client = CryptoClient::new(
        transport,
        provider("main", 0x33),
        config(CryptoMode::AuthenticatedEncryption, StorageMode::InstructionFile),
    )
    .unwrap();

    let data = sample(5000);
    put_bytes(&client, "nested/dir/file.bin", &data, &user_metadata()).unwrap();
    assert!(client
        .transport()
        .head_object("nested/dir/file.bin.instruction")
        .is_ok());

    let got = client.get_object("nested/dir/file.bin").unwrap();
    assert_eq!(got.metadata["owner"], "alice");
    assert_eq!(got.into_bytes().unwrap(), data);

    let range = client.get_object_range("nested/dir/file.bin", 4000..4100).unwrap();
    assert_eq!(range.into_bytes().unwrap(), &data[4000..4100]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Any range of any object decrypts to the matching plaintext slice
    #[test]
    fn range_reads_match_slices(
        legacy in any::<bool>(),
        len in 1usize..=700,
        start in 0u64..=720,
        width in 0u64..=300,
    ) {
        let mode =
            if legacy { CryptoMode::EncryptionOnly } else { CryptoMode::AuthenticatedEncryption };
        let transport = Arc::new(MemoryTransport::default());
        let client = client_on(&transport, mode, StorageMode::ObjectMetadata);
        let data = sample(len);
        put_bytes(&client, "obj", &data, &ObjectMetadata::new()).unwrap();

        let end = start + width;
        let got = client.get_object_range("obj", start..end).unwrap().into_bytes().unwrap();
        let lo = (start as usize).min(len);
        let hi = (end as usize).min(len).max(lo);
        prop_assert_eq!(got, data[lo..hi].to_vec());
    }
}
