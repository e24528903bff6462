//! Multipart uploads through the encrypting client.

use std::io::Cursor;
use std::sync::Arc;

use objcrypt_client::{CryptoClient, MemoryTransport};
use objcrypt_core::config::{CryptoConfig, CryptoMode, StorageMode};
use objcrypt_core::{CryptoError, MaterialsDescription, ObjectMetadata};
use objcrypt_crypto::{EncryptionMaterials, StaticMaterialsProvider, SymmetricKek};

fn client(
    transport: &Arc<MemoryTransport>,
    mode: CryptoMode,
    storage_mode: StorageMode,
) -> CryptoClient<Arc<MemoryTransport>> {
    let provider = StaticMaterialsProvider::new(EncryptionMaterials::symmetric(
        SymmetricKek::new(vec![0x5a; 32]).unwrap(),
        MaterialsDescription::from([("kek".to_string(), "multipart".to_string())]),
    ));
    let config = CryptoConfig {
        mode,
        storage_mode,
        ..CryptoConfig::default()
    };
    CryptoClient::new(transport.clone(), Arc::new(provider), config).unwrap()
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

/// Part sizes that leave CBC blocks split across parts.
const PARTS: [usize; 4] = [1000, 37, 4096, 555];

fn upload_all(client: &CryptoClient<Arc<MemoryTransport>>, key: &str, data: &[u8]) {
    let mut upload = client.initiate_multipart_upload(key, &ObjectMetadata::new()).unwrap();
    let mut offset = 0;
    for (i, len) in PARTS.iter().enumerate() {
        let part = &data[offset..offset + len];
        let is_last = i == PARTS.len() - 1;
        client
            .upload_part(&mut upload, i as u32 + 1, Cursor::new(part), is_last)
            .unwrap();
        offset += len;
    }
    client.complete_multipart_upload(upload).unwrap();
}

#[test]
fn parts_concatenate_into_one_decryptable_object() {
    for mode in [CryptoMode::EncryptionOnly, CryptoMode::AuthenticatedEncryption] {
        for storage_mode in [StorageMode::ObjectMetadata, StorageMode::InstructionFile] {
            let transport = Arc::new(MemoryTransport::default());
            let client = client(&transport, mode, storage_mode);
            let data = sample(PARTS.iter().sum());
            upload_all(&client, "video.mp4", &data);

            assert_eq!(transport.pending_uploads(), 0);
            let got = client.get_object("video.mp4").unwrap();
            assert_eq!(got.into_bytes().unwrap(), data);

            // No recorded length: the range path derives it from the object
            let range = client.get_object_range("video.mp4", 1030..1100).unwrap();
            assert_eq!(range.into_bytes().unwrap(), &data[1030..1100]);
        }
    }
}

#[test]
fn skipped_part_aborts_the_remote_upload() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    let mut upload = client.initiate_multipart_upload("obj", &ObjectMetadata::new()).unwrap();
    let upload_id = upload.upload_id().to_string();

    client
        .upload_part(&mut upload, 1, Cursor::new(vec![1u8; 100]), false)
        .unwrap();
    let result = client.upload_part(&mut upload, 4, Cursor::new(vec![2u8; 100]), false);
    assert!(matches!(result, Err(CryptoError::Sequencing(_))));
    assert_eq!(transport.aborted_uploads(), vec![format!("obj:{upload_id}")]);
    assert!(upload.context().is_aborted());

    // The context stays poisoned
    let retry = client.upload_part(&mut upload, 2, Cursor::new(vec![2u8; 100]), true);
    assert!(matches!(retry, Err(CryptoError::Sequencing(_))));
    assert!(client.complete_multipart_upload(upload).is_err());
    assert!(transport.keys().is_empty());
}

#[test]
fn part_after_final_is_a_sequencing_error() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    let mut upload = client.initiate_multipart_upload("obj", &ObjectMetadata::new()).unwrap();
    client
        .upload_part(&mut upload, 1, Cursor::new(vec![1u8; 64]), true)
        .unwrap();
    let result = client.upload_part(&mut upload, 2, Cursor::new(vec![1u8; 64]), true);
    assert!(matches!(result, Err(CryptoError::Sequencing(_))));
    assert_eq!(transport.aborted_uploads().len(), 1);
}

#[test]
fn complete_requires_the_final_part() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    let mut upload = client.initiate_multipart_upload("obj", &ObjectMetadata::new()).unwrap();
    client
        .upload_part(&mut upload, 1, Cursor::new(vec![1u8; 64]), false)
        .unwrap();
    assert!(matches!(
        client.complete_multipart_upload(upload),
        Err(CryptoError::InvalidState(_))
    ));
}

#[test]
fn redoing_the_last_part_replaces_it() {
    for mode in [CryptoMode::EncryptionOnly, CryptoMode::AuthenticatedEncryption] {
        let transport = Arc::new(MemoryTransport::default());
        let client = client(&transport, mode, StorageMode::ObjectMetadata);
        let data = sample(3000);
        let mut upload = client.initiate_multipart_upload("obj", &ObjectMetadata::new()).unwrap();

        client
            .upload_part(&mut upload, 1, Cursor::new(&data[..1001]), false)
            .unwrap();
        // Same part again, e.g. after a lost response
        client
            .upload_part(&mut upload, 1, Cursor::new(&data[..1001]), false)
            .unwrap();
        client
            .upload_part(&mut upload, 2, Cursor::new(&data[1001..]), true)
            .unwrap();
        client.complete_multipart_upload(upload).unwrap();

        assert_eq!(client.get_object("obj").unwrap().into_bytes().unwrap(), data);
    }
}

#[test]
fn dropped_part_connection_is_resent() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    let data = sample(20_000);
    let mut upload = client.initiate_multipart_upload("obj", &ObjectMetadata::new()).unwrap();

    client
        .upload_part(&mut upload, 1, Cursor::new(&data[..12_000]), false)
        .unwrap();
    transport.fail_next_upload_after(5_000);
    client
        .upload_part(&mut upload, 2, Cursor::new(&data[12_000..]), true)
        .unwrap();
    client.complete_multipart_upload(upload).unwrap();

    assert_eq!(transport.resend_count(), 1);
    assert_eq!(client.get_object("obj").unwrap().into_bytes().unwrap(), data);
}

#[test]
fn abort_discards_parts() {
    let transport = Arc::new(MemoryTransport::default());
    let client =
        client(&transport, CryptoMode::AuthenticatedEncryption, StorageMode::ObjectMetadata);
    let mut upload = client.initiate_multipart_upload("obj", &ObjectMetadata::new()).unwrap();
    client
        .upload_part(&mut upload, 1, Cursor::new(vec![9u8; 10]), false)
        .unwrap();
    client.abort_multipart_upload(upload).unwrap();
    assert_eq!(transport.pending_uploads(), 0);
    assert!(transport.keys().is_empty());
}
