//! Cipher state for one multipart upload
//!
//! All parts of an object share one CEK and IV: the ciphertext of the whole
//! object is the concatenation of the part ciphertexts, and only the final
//! part emits the GCM tag (or the CBC padding). Each part's cipher therefore
//! has to start exactly where the previous part's cipher stopped. The context
//! enforces that by handing out ciphers only for the next part (`n + 1`) or
//! for a retry of the same part (`n`), and poisons itself on any other
//! request.
//!
//! ```text
//!   Idle(n) ──begin(n+1)──▶ InProgress(n+1) ──end──▶ Idle(n+1)
//!      │                      │      ▲
//!      │ begin(n)             └──────┘ begin(n+1) again (retry)
//!      ▼
//!   InProgress(n)  redo of the last completed part
//! ```
//!
//! Callers dispatching parts from a pool must serialize `begin_part_upload`
//! and `end_part_upload`.

use objcrypt_core::{CryptoError, CryptoResult};

use crate::cipher::{CipherMode, Checkpoint, StreamCipher};
use crate::material::ContentCryptoMaterial;
use crate::scheme::{CryptoScheme, BLOCK_SIZE};

/// Ciphertext bytes one part produces.
///
/// `offset` is the plaintext offset the part starts at. GCM output tracks
/// input byte for byte; CBC emits whole blocks, carrying a partial block
/// over to the next part, and pads the final part.
pub fn part_ciphertext_length(scheme: CryptoScheme, offset: u64, len: u64, is_last: bool) -> u64 {
    match scheme {
        CryptoScheme::Authenticated => {
            len + if is_last { scheme.tag_length_bytes() as u64 } else { 0 }
        }
        CryptoScheme::NonAuthenticated => {
            let block = BLOCK_SIZE as u64;
            let emitted_before = offset / block * block;
            let emitted_after = if is_last {
                scheme.ciphertext_length(offset.saturating_add(len))
            } else {
                offset.saturating_add(len) / block * block
            };
            emitted_after - emitted_before
        }
    }
}

struct PartInProgress {
    part_number: u32,
    start: Checkpoint,
    is_last: bool,
}

pub struct MultipartUploadCryptoContext {
    bucket: String,
    key: String,
    upload_id: String,
    material: ContentCryptoMaterial,
    base: StreamCipher,
    /// Last completed part, 0 before the first one
    current_part_number: u32,
    cumulative_plaintext_bytes: u64,
    /// Cipher position after the last completed part
    committed: Checkpoint,
    /// Cipher position before the last completed part, for redoing it
    last_part_start: Checkpoint,
    in_progress: Option<PartInProgress>,
    final_part_seen: bool,
    aborted: bool,
}

impl MultipartUploadCryptoContext {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        upload_id: impl Into<String>,
        material: ContentCryptoMaterial,
    ) -> CryptoResult<Self> {
        let base = material.cipher(CipherMode::Encrypt)?;
        let start = base.checkpoint();
        Ok(Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_id: upload_id.into(),
            material,
            base,
            current_part_number: 0,
            cumulative_plaintext_bytes: 0,
            committed: start.clone(),
            last_part_start: start,
            in_progress: None,
            final_part_seen: false,
            aborted: false,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn material(&self) -> &ContentCryptoMaterial {
        &self.material
    }

    pub fn current_part_number(&self) -> u32 {
        self.current_part_number
    }

    pub fn cumulative_plaintext_bytes(&self) -> u64 {
        self.cumulative_plaintext_bytes
    }

    pub fn is_part_in_progress(&self) -> bool {
        self.in_progress.is_some()
    }

    pub fn has_final_part(&self) -> bool {
        self.final_part_seen
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Poison the context; every later call fails.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.in_progress = None;
    }

    /// Cipher for part `part_number`, positioned at the part's first byte.
    ///
    /// `is_last` marks the final part: its cipher must be finalized so the
    /// tag or padding is emitted, and no part may follow it.
    pub fn begin_part_upload(
        &mut self,
        part_number: u32,
        is_last: bool,
    ) -> CryptoResult<StreamCipher> {
        if self.aborted {
            return Err(CryptoError::Sequencing(format!(
                "multipart upload {} of {}/{} was aborted",
                self.upload_id, self.bucket, self.key
            )));
        }
        if part_number < 1 {
            return Err(self.violation(format!("part numbers start at 1, got {part_number}")));
        }

        if let Some(part) = &mut self.in_progress {
            if part.part_number == part_number {
                // Retry of the part being sent
                part.is_last = is_last;
                tracing::debug!(upload_id = %self.upload_id, part_number, "retrying part");
                return self.base.resume(&part.start);
            }
            let msg = format!(
                "part {part_number} begun while part {} is still in progress",
                part.part_number
            );
            return Err(self.violation(msg));
        }

        let start = if part_number == self.current_part_number + 1 {
            if self.final_part_seen {
                return Err(self.violation(format!(
                    "part {part_number} begun after final part {}",
                    self.current_part_number
                )));
            }
            self.committed.clone()
        } else if part_number == self.current_part_number {
            // Redo of the last completed part: roll the cipher back to its start
            self.committed = self.last_part_start.clone();
            self.cumulative_plaintext_bytes = self.committed.count();
            self.current_part_number -= 1;
            self.final_part_seen = false;
            self.last_part_start.clone()
        } else {
            return Err(self.violation(format!(
                "part {part_number} begun after part {}; expected {} or {}",
                self.current_part_number,
                self.current_part_number,
                self.current_part_number + 1
            )));
        };

        tracing::debug!(
            upload_id = %self.upload_id,
            part_number,
            offset = start.count(),
            is_last,
            "part cipher derived"
        );
        let cipher = self.base.resume(&start)?;
        self.in_progress = Some(PartInProgress {
            part_number,
            start,
            is_last,
        });
        Ok(cipher)
    }

    /// Commit the part started by the last `begin_part_upload`. `cipher` is
    /// the part's cipher after its whole body went through it.
    pub fn end_part_upload(&mut self, cipher: &StreamCipher) -> CryptoResult<()> {
        if self.aborted {
            return Err(CryptoError::Sequencing(format!(
                "multipart upload {} was aborted",
                self.upload_id
            )));
        }
        let Some(part) = self.in_progress.take() else {
            return Err(self.violation("end_part_upload without a part in progress".into()));
        };

        let end = cipher.checkpoint();
        if end.count() < part.start.count() {
            return Err(self.violation(format!(
                "part {} cipher is behind the part start ({} < {})",
                part.part_number,
                end.count(),
                part.start.count()
            )));
        }

        let part_bytes = end.count() - part.start.count();
        self.current_part_number = part.part_number;
        self.cumulative_plaintext_bytes = end.count();
        self.last_part_start = part.start;
        self.committed = end;
        self.final_part_seen = part.is_last;
        tracing::debug!(
            upload_id = %self.upload_id,
            part_number = part.part_number,
            part_bytes,
            cumulative = self.cumulative_plaintext_bytes,
            "part committed"
        );
        Ok(())
    }

    fn violation(&mut self, msg: String) -> CryptoError {
        tracing::warn!(
            upload_id = %self.upload_id,
            bucket = %self.bucket,
            key = %self.key,
            "multipart sequencing violation: {msg}"
        );
        self.abort();
        CryptoError::Sequencing(msg)
    }
}

impl std::fmt::Debug for MultipartUploadCryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartUploadCryptoContext")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("upload_id", &self.upload_id)
            .field("current_part_number", &self.current_part_number)
            .field("cumulative_plaintext_bytes", &self.cumulative_plaintext_bytes)
            .field("part_in_progress", &self.in_progress.as_ref().map(|p| p.part_number))
            .field("final_part_seen", &self.final_part_seen)
            .field("aborted", &self.aborted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SymmetricKek;
    use crate::provider::{EncryptionMaterials, StaticMaterialsProvider};

    fn context(scheme: CryptoScheme) -> MultipartUploadCryptoContext {
        let provider = StaticMaterialsProvider::new(EncryptionMaterials::symmetric(
            SymmetricKek::generate(),
            Default::default(),
        ));
        let material = ContentCryptoMaterial::generate(scheme, &provider).unwrap();
        MultipartUploadCryptoContext::new("bucket", "key", "upload-1", material).unwrap()
    }

    fn send(ctx: &mut MultipartUploadCryptoContext, n: u32, body: &[u8], is_last: bool) -> Vec<u8> {
        let mut cipher = ctx.begin_part_upload(n, is_last).unwrap();
        let mut out = cipher.update(body).unwrap();
        if is_last {
            out.extend(cipher.do_final().unwrap());
        }
        ctx.end_part_upload(&cipher).unwrap();
        out
    }

    #[test]
    fn test_part_ciphertext_length() {
        let gcm = CryptoScheme::Authenticated;
        assert_eq!(part_ciphertext_length(gcm, 0, 100, false), 100);
        assert_eq!(part_ciphertext_length(gcm, 100, 50, true), 66);

        let cbc = CryptoScheme::NonAuthenticated;
        assert_eq!(part_ciphertext_length(cbc, 0, 40, false), 32);
        assert_eq!(part_ciphertext_length(cbc, 40, 40, false), 48);
        assert_eq!(part_ciphertext_length(cbc, 80, 5, true), 16);
        assert_eq!(part_ciphertext_length(cbc, 80, 0, true), 16);
    }

    #[test]
    fn test_cbc_part_lengths_match_output() {
        let mut ctx = context(CryptoScheme::NonAuthenticated);
        let mut offset = 0u64;
        for (n, len, last) in [(1u32, 40usize, false), (2, 40, false), (3, 7, true)] {
            let out = send(&mut ctx, n, &vec![1u8; len], last);
            assert_eq!(
                out.len() as u64,
                part_ciphertext_length(CryptoScheme::NonAuthenticated, offset, len as u64, last)
            );
            offset += len as u64;
        }
    }

    #[test]
    fn test_sequential_parts() {
        let mut ctx = context(CryptoScheme::Authenticated);
        send(&mut ctx, 1, &[1u8; 32], false);
        assert!(ctx.begin_part_upload(2, true).is_ok());
    }

    #[test]
    fn test_skipped_part_is_fatal() {
        let mut ctx = context(CryptoScheme::Authenticated);
        send(&mut ctx, 1, &[1u8; 32], false);
        assert!(matches!(
            ctx.begin_part_upload(4, false),
            Err(CryptoError::Sequencing(_))
        ));
        assert!(ctx.is_aborted());
        assert!(matches!(
            ctx.begin_part_upload(2, false),
            Err(CryptoError::Sequencing(_))
        ));
    }

    #[test]
    fn test_part_zero_rejected() {
        let mut ctx = context(CryptoScheme::Authenticated);
        assert!(matches!(
            ctx.begin_part_upload(0, false),
            Err(CryptoError::Sequencing(_))
        ));
    }

    #[test]
    fn test_retry_before_end_is_idempotent() {
        let mut ctx = context(CryptoScheme::Authenticated);
        let mut first = ctx.begin_part_upload(1, false).unwrap();
        let a = first.update(b"retry me").unwrap();
        let mut second = ctx.begin_part_upload(1, false).unwrap();
        let b = second.update(b"retry me").unwrap();
        assert_eq!(a, b);
        ctx.end_part_upload(&second).unwrap();
        assert_eq!(ctx.current_part_number(), 1);
        assert_eq!(ctx.cumulative_plaintext_bytes(), 8);
    }

    #[test]
    fn test_redo_completed_part() {
        let mut ctx = context(CryptoScheme::Authenticated);
        let p1 = send(&mut ctx, 1, &[3u8; 40], false);
        let redo = send(&mut ctx, 1, &[3u8; 40], false);
        assert_eq!(p1, redo);
        assert_eq!(ctx.cumulative_plaintext_bytes(), 40);
    }

    #[test]
    fn test_parts_concatenate_to_single_encryption() {
        for scheme in [CryptoScheme::Authenticated, CryptoScheme::NonAuthenticated] {
            let mut ctx = context(scheme);
            let body: Vec<u8> = (0..100u8).collect();
            let mut ciphertext = send(&mut ctx, 1, &body[..48], false);
            ciphertext.extend(send(&mut ctx, 2, &body[48..96], false));
            ciphertext.extend(send(&mut ctx, 3, &body[96..], true));

            let mut dec = ctx.material().cipher(CipherMode::Decrypt).unwrap();
            let mut plain = dec.update(&ciphertext).unwrap();
            plain.extend(dec.do_final().unwrap());
            assert_eq!(plain, body, "{scheme:?}");
        }
    }

    #[test]
    fn test_no_part_after_final() {
        let mut ctx = context(CryptoScheme::Authenticated);
        send(&mut ctx, 1, &[0u8; 16], true);
        assert!(ctx.has_final_part());
        assert!(matches!(
            ctx.begin_part_upload(2, false),
            Err(CryptoError::Sequencing(_))
        ));
    }

    #[test]
    fn test_end_without_begin() {
        let mut ctx = context(CryptoScheme::Authenticated);
        let stray = ctx.material().cipher(CipherMode::Encrypt).unwrap();
        assert!(matches!(
            ctx.end_part_upload(&stray),
            Err(CryptoError::Sequencing(_))
        ));
    }

    #[test]
    fn test_other_part_while_in_progress() {
        let mut ctx = context(CryptoScheme::Authenticated);
        let _part1 = ctx.begin_part_upload(1, false).unwrap();
        assert!(ctx.begin_part_upload(2, false).is_err());
        assert!(ctx.is_aborted());
    }
}
