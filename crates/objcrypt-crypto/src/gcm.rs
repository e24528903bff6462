//! Streaming AES-256-GCM
//!
//! GCM is CTR-mode encryption plus a GHASH over the ciphertext. Keeping the
//! two halves separate lets the body stream through in arbitrary slices:
//! the keystream can be rebuilt at any offset and the GHASH state is a small
//! cloneable value, so `mark`/`reset` never replay earlier input.
//!
//! Output is byte-identical to one-shot AES-256-GCM with empty AAD:
//! `ciphertext || tag`.
//!
//! Decryption holds back the trailing 16 bytes seen so far (they may be the
//! tag) and releases everything before them. The tag is only checked in
//! `finalize`; plaintext released earlier is unverified until then.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use objcrypt_core::{CryptoError, CryptoResult};

use crate::cipher::CipherMode;
use crate::keys::ContentKey;
use crate::keystream::{self, pre_counter_block, Aes256Ctr32};
use crate::scheme::BLOCK_SIZE;
use crate::TAG_SIZE;

pub(crate) struct GcmEngine {
    mode: CipherMode,
    j0: [u8; BLOCK_SIZE],
    keystream: Aes256Ctr32,
    ghash: GHash,
    tag_mask: [u8; TAG_SIZE],
    /// Ciphertext not yet folded into GHASH (always < one block)
    hash_pending: Vec<u8>,
    /// Body bytes processed so far (excludes the tag)
    body_len: u64,
    /// Decrypt only: trailing bytes that may turn out to be the tag
    held_back: Vec<u8>,
}

#[derive(Clone)]
pub(crate) struct GcmSnapshot {
    ghash: GHash,
    hash_pending: Vec<u8>,
    body_len: u64,
    held_back: Vec<u8>,
}

impl GcmEngine {
    pub(crate) fn new(key: &ContentKey, iv: &[u8], mode: CipherMode) -> CryptoResult<Self> {
        let aes = Aes256::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::Cipher(format!("AES key init failed: {e}")))?;

        let mut hash_key = aes::Block::default();
        aes.encrypt_block(&mut hash_key);

        let j0 = pre_counter_block(iv)?;
        let mut mask = aes::Block::clone_from_slice(&j0);
        aes.encrypt_block(&mut mask);
        let mut tag_mask = [0u8; TAG_SIZE];
        tag_mask.copy_from_slice(&mask);

        Ok(Self {
            mode,
            j0,
            keystream: keystream::keystream_at(key, &j0, 0)?,
            ghash: GHash::new(&hash_key),
            tag_mask,
            hash_pending: Vec::with_capacity(BLOCK_SIZE),
            body_len: 0,
            held_back: Vec::with_capacity(TAG_SIZE),
        })
    }

    /// True once at least one byte of output has been released.
    pub(crate) fn has_output(&self) -> bool {
        self.body_len > 0
    }

    pub(crate) fn update(&mut self, input: &[u8]) -> CryptoResult<Vec<u8>> {
        match self.mode {
            CipherMode::Encrypt => {
                let mut out = input.to_vec();
                keystream::apply(&mut self.keystream, &mut out, self.body_len)?;
                self.absorb(&out);
                self.body_len += out.len() as u64;
                Ok(out)
            }
            CipherMode::Decrypt => {
                self.held_back.extend_from_slice(input);
                if self.held_back.len() <= TAG_SIZE {
                    return Ok(Vec::new());
                }
                let release = self.held_back.len() - TAG_SIZE;
                let mut body: Vec<u8> = self.held_back.drain(..release).collect();
                self.absorb(&body);
                keystream::apply(&mut self.keystream, &mut body, self.body_len)?;
                self.body_len += body.len() as u64;
                Ok(body)
            }
        }
    }

    pub(crate) fn finalize(&mut self) -> CryptoResult<Vec<u8>> {
        let tag = self.compute_tag();
        match self.mode {
            CipherMode::Encrypt => Ok(tag.to_vec()),
            CipherMode::Decrypt => {
                if self.held_back.len() != TAG_SIZE {
                    return Err(CryptoError::AuthenticationFailure(format!(
                        "ciphertext truncated: {} trailing bytes, expected a {TAG_SIZE}-byte tag",
                        self.held_back.len()
                    )));
                }
                if !constant_time_eq(&tag, &self.held_back) {
                    return Err(CryptoError::AuthenticationFailure(
                        "GCM tag mismatch: object is corrupted or has been tampered with".into(),
                    ));
                }
                Ok(Vec::new())
            }
        }
    }

    pub(crate) fn snapshot(&self) -> GcmSnapshot {
        GcmSnapshot {
            ghash: self.ghash.clone(),
            hash_pending: self.hash_pending.clone(),
            body_len: self.body_len,
            held_back: self.held_back.clone(),
        }
    }

    /// Rebuild the keystream at the snapshot's body offset and restore the
    /// GHASH state.
    pub(crate) fn restore(&mut self, key: &ContentKey, snapshot: &GcmSnapshot) -> CryptoResult<()> {
        self.keystream = keystream::keystream_at(key, &self.j0, snapshot.body_len)?;
        self.ghash = snapshot.ghash.clone();
        self.hash_pending = snapshot.hash_pending.clone();
        self.body_len = snapshot.body_len;
        self.held_back = snapshot.held_back.clone();
        Ok(())
    }

    fn absorb(&mut self, ciphertext: &[u8]) {
        self.hash_pending.extend_from_slice(ciphertext);
        let full = self.hash_pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        if full > 0 {
            self.ghash.update_padded(&self.hash_pending[..full]);
            self.hash_pending.drain(..full);
        }
    }

    fn compute_tag(&self) -> [u8; TAG_SIZE] {
        let mut ghash = self.ghash.clone();
        ghash.update_padded(&self.hash_pending);

        // len(AAD) || len(C), both in bits; AAD is always empty here
        let mut lengths = [0u8; BLOCK_SIZE];
        lengths[8..].copy_from_slice(&(self.body_len * 8).to_be_bytes());
        ghash.update_padded(&lengths);

        let digest = ghash.finalize();
        let mut tag = [0u8; TAG_SIZE];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = digest[i] ^ self.tag_mask[i];
        }
        tag
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
