//! Encrypting object client
//!
//! `CryptoClient` sits between the caller and an [`ObjectTransport`]:
//!   - `put_object`: generate a CEK, encrypt the body while it streams to the
//!     transport, store the envelope inline or as an instruction object
//!   - `get_object` / `get_object_with_instruction`: unwrap the CEK from the
//!     envelope and decrypt while the caller reads
//!   - `get_object_range`: widen the range to cipher blocks, decrypt with an
//!     auxiliary cipher, trim to the requested bytes
//!   - multipart: one crypto context per upload, one cipher per part
//!
//! Range reads of authenticated objects skip the GCM tag check. They are
//! returned with `integrity_verified == false` and logged at warn level;
//! strict mode refuses them.

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::ops::Range;
use std::sync::Arc;

use objcrypt_core::config::{CryptoConfig, CryptoMode, StorageMode};
use objcrypt_core::types::{instruction_key, keys, without_envelope, DEFAULT_INSTRUCTION_SUFFIX};
use objcrypt_core::{CryptoError, CryptoResult, MaterialsDescription, ObjectMetadata};
use objcrypt_crypto::scheme::BLOCK_SIZE;
use objcrypt_crypto::{
    part_ciphertext_length, plan_range, CipherMode, CipherReader, ContentCryptoMaterial,
    CryptoScheme, Envelope, KeyMaterialProvider, MultipartUploadCryptoContext, RangeReader,
};
use tracing::{debug, info, warn};

use crate::transport::{BytesBody, ObjectTransport};

/// Which suite new objects get and which stored objects may be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoModule {
    /// Legacy AES-CBC for new objects
    NonAuthenticated,
    /// AES-GCM for new objects. `strict` rejects legacy objects and
    /// unverified range reads.
    Authenticated { strict: bool },
}

impl CryptoModule {
    pub fn from_mode(mode: CryptoMode) -> Self {
        match mode {
            CryptoMode::EncryptionOnly => CryptoModule::NonAuthenticated,
            CryptoMode::AuthenticatedEncryption => CryptoModule::Authenticated { strict: false },
            CryptoMode::StrictAuthenticatedEncryption => {
                CryptoModule::Authenticated { strict: true }
            }
        }
    }

    /// Suite used for new objects.
    pub fn scheme(self) -> CryptoScheme {
        match self {
            CryptoModule::NonAuthenticated => CryptoScheme::NonAuthenticated,
            CryptoModule::Authenticated { .. } => CryptoScheme::Authenticated,
        }
    }

    pub fn is_strict(self) -> bool {
        matches!(self, CryptoModule::Authenticated { strict: true })
    }
}

/// A downloaded object, decrypting as it is read.
pub struct DecryptedObject {
    pub body: Box<dyn Read + Send>,
    /// User metadata, envelope fields removed
    pub metadata: ObjectMetadata,
    pub scheme: CryptoScheme,
    /// `true` only when the whole body is covered by a GCM tag that is
    /// checked before the body reports EOF
    pub integrity_verified: bool,
    /// Plaintext bytes in `body`, when known up front
    pub content_length: Option<u64>,
}

impl DecryptedObject {
    /// Read the whole body. A tag mismatch comes back as
    /// `CryptoError::AuthenticationFailure`.
    pub fn into_bytes(mut self) -> CryptoResult<Vec<u8>> {
        let mut out = Vec::new();
        self.body.read_to_end(&mut out).map_err(CryptoError::from_io)?;
        Ok(out)
    }
}

impl std::fmt::Debug for DecryptedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedObject")
            .field("metadata", &self.metadata)
            .field("scheme", &self.scheme)
            .field("integrity_verified", &self.integrity_verified)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Handle for one multipart upload.
#[derive(Debug)]
pub struct MultipartUpload {
    context: MultipartUploadCryptoContext,
}

impl MultipartUpload {
    pub fn key(&self) -> &str {
        self.context.key()
    }

    pub fn upload_id(&self) -> &str {
        self.context.upload_id()
    }

    pub fn context(&self) -> &MultipartUploadCryptoContext {
        &self.context
    }
}

pub struct CryptoClient<T: ObjectTransport> {
    transport: T,
    provider: Arc<dyn KeyMaterialProvider>,
    module: CryptoModule,
    config: CryptoConfig,
}

impl<T: ObjectTransport> CryptoClient<T> {
    /// Authenticated modes need an AEAD-capable cipher provider; that is
    /// checked here, never mid-stream.
    pub fn new(
        transport: T,
        provider: Arc<dyn KeyMaterialProvider>,
        config: CryptoConfig,
    ) -> CryptoResult<Self> {
        let module = CryptoModule::from_mode(config.mode);
        if module.scheme().is_authenticated() && !config.aead_available {
            return Err(CryptoError::UnsupportedOperation(format!(
                "crypto mode {:?} needs an AEAD-capable cipher provider",
                config.mode
            )));
        }
        if config.instruction_suffix.is_empty() {
            return Err(CryptoError::Config("instruction_suffix must not be empty".into()));
        }
        debug!(module = ?module, storage_mode = ?config.storage_mode, "crypto client ready");
        Ok(Self {
            transport,
            provider,
            module,
            config,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn module(&self) -> CryptoModule {
        self.module
    }

    /// Encrypt `body` from its current position to its end and store it.
    ///
    /// The body is read once, while the transport sends it. A transport that
    /// loses the connection rewinds it with mark/reset.
    pub fn put_object<R>(
        &self,
        key: &str,
        mut body: R,
        metadata: &ObjectMetadata,
    ) -> CryptoResult<()>
    where
        R: Read + Seek + Send,
    {
        let scheme = self.module.scheme();
        let plaintext_len = remaining_len(&mut body)?;
        scheme.check_capacity(plaintext_len)?;

        let material = ContentCryptoMaterial::generate(scheme, self.provider.as_ref())?;
        let mut object_metadata = metadata.clone();
        object_metadata.insert(keys::UNENCRYPTED_CONTENT_LENGTH.into(), plaintext_len.to_string());
        if self.config.storage_mode == StorageMode::ObjectMetadata {
            object_metadata.extend(material.to_metadata());
        }

        let content_length = scheme.ciphertext_length(plaintext_len);
        let mut reader = CipherReader::new(body, material.cipher(CipherMode::Encrypt)?);
        self.transport
            .put_object(key, &mut reader, content_length, &object_metadata)?;

        if self.config.storage_mode == StorageMode::InstructionFile {
            self.put_instruction(key, &self.config.instruction_suffix, &material)?;
        }
        info!(
            bucket = self.transport.bucket(),
            key,
            algorithm = scheme.cipher_algorithm(),
            plaintext_len,
            content_length,
            "encrypted object stored"
        );
        Ok(())
    }

    /// Download and decrypt a whole object. The envelope is taken from the
    /// object metadata, or from the instruction object with the configured
    /// suffix when the metadata carries none.
    pub fn get_object(&self, key: &str) -> CryptoResult<DecryptedObject> {
        self.get(key, None)
    }

    /// Like [`get_object`](Self::get_object), with the envelope always read
    /// from `<key>.<suffix>`.
    pub fn get_object_with_instruction(
        &self,
        key: &str,
        suffix: &str,
    ) -> CryptoResult<DecryptedObject> {
        self.get(key, Some(suffix))
    }

    fn get(&self, key: &str, suffix: Option<&str>) -> CryptoResult<DecryptedObject> {
        let object = self.transport.get_object(key, None)?;
        let material = self.load_material(key, &object.metadata, suffix)?;
        self.check_readable(key, &material)?;

        let scheme = material.scheme();
        let cipher = material.cipher(CipherMode::Decrypt)?;
        let content_length = recorded_length(&object.metadata)
            .or_else(|| authenticated_plaintext_len(scheme, object.object_size));
        info!(
            bucket = self.transport.bucket(),
            key,
            algorithm = scheme.cipher_algorithm(),
            "decrypting object"
        );
        Ok(DecryptedObject {
            body: Box::new(CipherReader::new(object.body, cipher)),
            metadata: without_envelope(&object.metadata),
            scheme,
            integrity_verified: scheme.is_authenticated(),
            content_length,
        })
    }

    /// Decrypt the half-open plaintext `range` of an object.
    ///
    /// Only the cipher blocks covering the range are fetched (plus one
    /// leading block for CBC). Authenticated objects are decrypted without
    /// checking the tag: the result is NOT integrity-verified.
    pub fn get_object_range(&self, key: &str, range: Range<u64>) -> CryptoResult<DecryptedObject> {
        if self.module.is_strict() {
            return Err(CryptoError::UnsupportedOperation(
                "range reads are not integrity-checked and strict mode forbids them".into(),
            ));
        }
        if range.start > range.end {
            return Err(CryptoError::InvalidState(format!(
                "range start {} is past its end {}",
                range.start, range.end
            )));
        }

        let head = self.transport.head_object(key)?;
        let material = self.load_material(key, &head.metadata, None)?;
        self.check_readable(key, &material)?;
        let scheme = material.scheme();
        let plaintext_len = match recorded_length(&head.metadata) {
            Some(len) => len,
            None => self.plaintext_len(key, &material, head.object_size)?,
        };

        let metadata = without_envelope(&head.metadata);
        let Some(plan) = plan_range(scheme, range.clone(), plaintext_len) else {
            return Ok(DecryptedObject {
                body: Box::new(io::empty()),
                metadata,
                scheme,
                integrity_verified: false,
                content_length: Some(0),
            });
        };

        if scheme.is_authenticated() {
            warn!(
                bucket = self.transport.bucket(),
                key,
                start = range.start,
                end = range.end,
                "range read of an authenticated object is not integrity-verified"
            );
        }
        debug!(key, fetch = ?plan.fetch, offset = plan.cipher_offset, "range read planned");

        let object = self.transport.get_object(key, Some(plan.fetch.clone()))?;
        let auxiliary = material
            .cipher(CipherMode::Decrypt)?
            .create_auxiliary(plan.cipher_offset)?;
        let body =
            RangeReader::new(CipherReader::new(object.body, auxiliary), plan.skip, plan.take);
        Ok(DecryptedObject {
            body: Box::new(body),
            metadata,
            scheme,
            integrity_verified: false,
            content_length: Some(plan.take),
        })
    }

    /// Grant the KEK named by `new_description` access to an existing object.
    ///
    /// The CEK is unwrapped from the object's current envelope and re-wrapped
    /// into a new instruction object `<key>.<suffix>`. The encrypted body and
    /// its own envelope are left alone.
    pub fn put_instruction_for_recipient(
        &self,
        key: &str,
        new_description: &MaterialsDescription,
        suffix: &str,
    ) -> CryptoResult<()> {
        if suffix.is_empty()
            || suffix == DEFAULT_INSTRUCTION_SUFFIX
            || suffix == self.config.instruction_suffix
        {
            return Err(CryptoError::UnsupportedOperation(format!(
                "suffix {suffix:?} would overwrite the object's own instruction"
            )));
        }
        let head = self.transport.head_object(key)?;
        let material = self.load_material(key, &head.metadata, None)?;
        let rewrapped = material.recreate(new_description, self.provider.as_ref())?;
        self.put_instruction(key, suffix, &rewrapped)?;
        info!(
            bucket = self.transport.bucket(),
            key,
            suffix,
            "instruction written for additional recipient"
        );
        Ok(())
    }

    /// Start a multipart upload; every part shares one CEK and IV.
    pub fn initiate_multipart_upload(
        &self,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> CryptoResult<MultipartUpload> {
        let scheme = self.module.scheme();
        let material = ContentCryptoMaterial::generate(scheme, self.provider.as_ref())?;
        let mut object_metadata = metadata.clone();
        if self.config.storage_mode == StorageMode::ObjectMetadata {
            object_metadata.extend(material.to_metadata());
        }

        let upload_id = self.transport.create_multipart_upload(key, &object_metadata)?;
        let context =
            MultipartUploadCryptoContext::new(self.transport.bucket(), key, upload_id, material)?;
        info!(
            bucket = self.transport.bucket(),
            key,
            upload_id = context.upload_id(),
            algorithm = scheme.cipher_algorithm(),
            "multipart upload initiated"
        );
        Ok(MultipartUpload { context })
    }

    /// Encrypt and send part `part_number`, from `body`'s current position
    /// to its end.
    ///
    /// A part that failed in the transport may be sent again with the same
    /// number. A sequencing violation aborts the remote upload.
    pub fn upload_part<R>(
        &self,
        upload: &mut MultipartUpload,
        part_number: u32,
        mut body: R,
        is_last_part: bool,
    ) -> CryptoResult<()>
    where
        R: Read + Seek + Send,
    {
        if upload.context.is_aborted() {
            return Err(CryptoError::Sequencing(format!(
                "multipart upload {} was aborted",
                upload.context.upload_id()
            )));
        }
        let part_len = remaining_len(&mut body)?;
        let cipher = match upload.context.begin_part_upload(part_number, is_last_part) {
            Ok(cipher) => cipher,
            Err(err) => return Err(self.abort_on_sequencing(upload, err)),
        };

        let scheme = cipher.scheme();
        let offset = cipher.current_count();
        if let Err(err) = scheme.check_capacity(offset.saturating_add(part_len)) {
            upload.context.abort();
            self.abort_remote(upload);
            return Err(err);
        }
        let content_length = part_ciphertext_length(scheme, offset, part_len, is_last_part);

        let mut reader = CipherReader::new(body, cipher);
        if !is_last_part {
            reader = reader.without_finalize();
        }
        self.transport.upload_part(
            upload.context.key(),
            upload.context.upload_id(),
            part_number,
            &mut reader,
            content_length,
        )?;

        if let Err(err) = upload.context.end_part_upload(reader.cipher()) {
            return Err(self.abort_on_sequencing(upload, err));
        }
        info!(
            key = upload.context.key(),
            upload_id = upload.context.upload_id(),
            part_number,
            part_len,
            content_length,
            "part uploaded"
        );
        Ok(())
    }

    /// Assemble the uploaded parts. The final part must have been sent.
    pub fn complete_multipart_upload(&self, upload: MultipartUpload) -> CryptoResult<()> {
        let context = &upload.context;
        if context.is_aborted() {
            return Err(CryptoError::Sequencing(format!(
                "multipart upload {} was aborted",
                context.upload_id()
            )));
        }
        if context.is_part_in_progress() || !context.has_final_part() {
            return Err(CryptoError::InvalidState(format!(
                "multipart upload {} has not sent its final part",
                context.upload_id()
            )));
        }

        self.transport
            .complete_multipart_upload(context.key(), context.upload_id())?;
        if self.config.storage_mode == StorageMode::InstructionFile {
            let suffix = &self.config.instruction_suffix;
            self.put_instruction(context.key(), suffix, context.material())?;
        }
        info!(
            key = context.key(),
            upload_id = context.upload_id(),
            parts = context.current_part_number(),
            plaintext_len = context.cumulative_plaintext_bytes(),
            "multipart upload completed"
        );
        Ok(())
    }

    pub fn abort_multipart_upload(&self, mut upload: MultipartUpload) -> CryptoResult<()> {
        upload.context.abort();
        self.transport
            .abort_multipart_upload(upload.context.key(), upload.context.upload_id())?;
        info!(
            key = upload.context.key(),
            upload_id = upload.context.upload_id(),
            "multipart upload aborted"
        );
        Ok(())
    }

    fn abort_on_sequencing(&self, upload: &mut MultipartUpload, err: CryptoError) -> CryptoError {
        if matches!(err, CryptoError::Sequencing(_)) {
            self.abort_remote(upload);
        }
        err
    }

    fn abort_remote(&self, upload: &MultipartUpload) {
        let key = upload.context.key();
        let upload_id = upload.context.upload_id();
        match self.transport.abort_multipart_upload(key, upload_id) {
            Ok(()) => warn!(key, upload_id, "remote multipart upload aborted"),
            Err(e) => warn!(key, upload_id, "failed to abort remote multipart upload: {e}"),
        }
    }

    fn put_instruction(
        &self,
        key: &str,
        suffix: &str,
        material: &ContentCryptoMaterial,
    ) -> CryptoResult<()> {
        let document = material.to_instruction()?;
        let mut marker = ObjectMetadata::new();
        marker.insert(keys::CRYPTO_INSTRUCTION_FILE.into(), String::new());
        let length = document.len() as u64;
        self.transport.put_object(
            &instruction_key(key, suffix),
            &mut BytesBody::new(document),
            length,
            &marker,
        )
    }

    /// Envelope from the object's metadata, or from its instruction object.
    fn load_material(
        &self,
        key: &str,
        metadata: &ObjectMetadata,
        suffix: Option<&str>,
    ) -> CryptoResult<ContentCryptoMaterial> {
        if suffix.is_none() && Envelope::is_present(metadata) {
            return ContentCryptoMaterial::from_metadata(metadata, self.provider.as_ref());
        }

        let suffix = suffix.unwrap_or(&self.config.instruction_suffix);
        let instruction = instruction_key(key, suffix);
        let object = match self.transport.get_object(&instruction, None) {
            Ok(object) => object,
            Err(CryptoError::NotFound(_)) => {
                return Err(CryptoError::InvalidMetadata(format!(
                    "{key} carries no encryption envelope and {instruction} does not exist"
                )));
            }
            Err(e) => return Err(e),
        };
        if !object.metadata.contains_key(keys::CRYPTO_INSTRUCTION_FILE) {
            return Err(CryptoError::InvalidMetadata(format!(
                "{instruction} is not an instruction object"
            )));
        }
        let mut document = Vec::new();
        let mut body = object.body;
        body.read_to_end(&mut document)?;
        debug!(key, instruction = %instruction, "envelope read from instruction object");
        ContentCryptoMaterial::from_instruction(&document, self.provider.as_ref())
    }

    /// Apply the legacy-object policy of the configured module.
    fn check_readable(&self, key: &str, material: &ContentCryptoMaterial) -> CryptoResult<()> {
        if material.scheme().is_authenticated() {
            return Ok(());
        }
        if self.module.is_strict() {
            return Err(CryptoError::UnsupportedOperation(format!(
                "{key} uses legacy {} and strict mode only reads authenticated objects",
                material.scheme().cipher_algorithm()
            )));
        }
        if matches!(self.module, CryptoModule::Authenticated { .. }) {
            warn!(
                key,
                algorithm = material.scheme().cipher_algorithm(),
                "decrypting legacy object without integrity protection"
            );
        }
        Ok(())
    }

    /// Plaintext length of an object that does not record it.
    ///
    /// GCM: stored size minus the tag. CBC: decrypt the last block (with the
    /// block before it as chain) and read the padding.
    fn plaintext_len(
        &self,
        key: &str,
        material: &ContentCryptoMaterial,
        object_size: u64,
    ) -> CryptoResult<u64> {
        let scheme = material.scheme();
        if let Some(len) = authenticated_plaintext_len(scheme, object_size) {
            return Ok(len);
        }
        if scheme.is_authenticated() || object_size == 0 || object_size % BLOCK_SIZE as u64 != 0 {
            return Err(CryptoError::InvalidMetadata(format!(
                "{key}: stored size {object_size} is not a valid {} ciphertext length",
                scheme.cipher_algorithm()
            )));
        }

        let block = BLOCK_SIZE as u64;
        let last = object_size - block;
        let fetch = last.saturating_sub(block)..object_size;
        let mut tail = Vec::new();
        self.transport
            .get_object(key, Some(fetch))?
            .body
            .read_to_end(&mut tail)?;

        let mut cipher = material.cipher(CipherMode::Decrypt)?.create_auxiliary(last)?;
        let mut plain = cipher.update(&tail)?;
        plain.extend(cipher.do_final()?);
        let pad = plain.last().copied().unwrap_or(0) as usize;
        let valid = plain.len() == BLOCK_SIZE
            && (1..=BLOCK_SIZE).contains(&pad)
            && plain[BLOCK_SIZE - pad..].iter().all(|&b| b as usize == pad);
        if !valid {
            return Err(CryptoError::Cipher(format!("{key}: invalid padding in last block")));
        }
        debug!(key, pad, "legacy plaintext length read from last block");
        Ok(object_size - pad as u64)
    }
}

/// Bytes from the reader's current position to its end; the position is
/// left unchanged.
fn remaining_len<R: Seek>(body: &mut R) -> CryptoResult<u64> {
    let start = body.stream_position()?;
    let end = body.seek(SeekFrom::End(0))?;
    body.seek(SeekFrom::Start(start))?;
    Ok(end.saturating_sub(start))
}

fn recorded_length(metadata: &ObjectMetadata) -> Option<u64> {
    metadata
        .get(keys::UNENCRYPTED_CONTENT_LENGTH)
        .and_then(|v| v.parse().ok())
}

fn authenticated_plaintext_len(scheme: CryptoScheme, object_size: u64) -> Option<u64> {
    if !scheme.is_authenticated() {
        return None;
    }
    object_size.checked_sub(scheme.tag_length_bytes() as u64)
}

/// Convenience for callers holding the whole plaintext in memory.
pub fn put_bytes<T: ObjectTransport>(
    client: &CryptoClient<T>,
    key: &str,
    data: &[u8],
    metadata: &ObjectMetadata,
) -> CryptoResult<()> {
    client.put_object(key, Cursor::new(data), metadata)
}
