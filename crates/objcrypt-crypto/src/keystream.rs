//! AES-256-CTR keystream positioned at an arbitrary byte offset
//!
//! GCM encrypts with a 32-bit big-endian counter starting at `J0 + 1`, where
//! `J0 = IV || 0x00000001` for a 96-bit IV. Any byte offset of the GCM body
//! therefore maps to counter block `J0 + 1 + offset / 16` with the first
//! `offset % 16` keystream bytes discarded. This is what makes cheap
//! `reset()` and range decryption possible: no earlier input is replayed.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher as _};
use objcrypt_core::{CryptoError, CryptoResult};

use crate::keys::ContentKey;
use crate::scheme::{BLOCK_SIZE, MAX_GCM_PLAINTEXT_BYTES};

pub(crate) type Aes256Ctr32 = ctr::Ctr32BE<Aes256>;

/// GCM nonce length handled by the counter arithmetic below.
pub(crate) const GCM_IV_SIZE: usize = 12;

/// Pre-counter block `J0 = IV || 0x00000001` for a 96-bit IV.
pub(crate) fn pre_counter_block(iv: &[u8]) -> CryptoResult<[u8; BLOCK_SIZE]> {
    if iv.len() != GCM_IV_SIZE {
        return Err(CryptoError::Cipher(format!(
            "GCM IV must be {GCM_IV_SIZE} bytes, got {}",
            iv.len()
        )));
    }
    let mut j0 = [0u8; BLOCK_SIZE];
    j0[..GCM_IV_SIZE].copy_from_slice(iv);
    j0[BLOCK_SIZE - 1] = 1;
    Ok(j0)
}

/// Advance the low 32 bits of a counter block by `blocks`, wrapping like GCM.
pub(crate) fn increment_counter(block: &[u8; BLOCK_SIZE], blocks: u64) -> [u8; BLOCK_SIZE] {
    let mut out = *block;
    let mut low = [0u8; 4];
    low.copy_from_slice(&block[BLOCK_SIZE - 4..]);
    let counter = u32::from_be_bytes(low).wrapping_add(blocks as u32);
    out[BLOCK_SIZE - 4..].copy_from_slice(&counter.to_be_bytes());
    out
}

/// Build the GCM body keystream positioned at `offset` bytes into the body.
pub(crate) fn keystream_at(
    key: &ContentKey,
    j0: &[u8; BLOCK_SIZE],
    offset: u64,
) -> CryptoResult<Aes256Ctr32> {
    let block_size = BLOCK_SIZE as u64;
    let counter_block = increment_counter(j0, 1 + offset / block_size);
    let mut keystream = Aes256Ctr32::new_from_slices(key.as_bytes(), &counter_block)
        .map_err(|e| CryptoError::Cipher(format!("AES-CTR init failed: {e}")))?;

    let skip = (offset % block_size) as usize;
    if skip > 0 {
        let mut discard = [0u8; BLOCK_SIZE];
        keystream
            .try_apply_keystream(&mut discard[..skip])
            .map_err(|_| capacity_error(offset))?;
    }
    Ok(keystream)
}

/// XOR `data` with the keystream in place.
pub(crate) fn apply(
    keystream: &mut Aes256Ctr32,
    data: &mut [u8],
    position: u64,
) -> CryptoResult<()> {
    keystream
        .try_apply_keystream(data)
        .map_err(|_| capacity_error(position + data.len() as u64))
}

fn capacity_error(requested: u64) -> CryptoError {
    CryptoError::CapacityExceeded {
        requested,
        limit: MAX_GCM_PLAINTEXT_BYTES,
        algorithm: "AES/CTR/NoPadding",
    }
}

/// Bare counter-mode engine used for auxiliary (random-access) ciphers of
/// the authenticated suite. It never sees or checks the GCM tag.
pub(crate) struct CtrEngine {
    keystream: Aes256Ctr32,
    j0: [u8; BLOCK_SIZE],
    base_offset: u64,
    processed: u64,
}

#[derive(Clone)]
pub(crate) struct CtrSnapshot {
    processed: u64,
}

impl CtrEngine {
    pub(crate) fn new(key: &ContentKey, iv: &[u8], base_offset: u64) -> CryptoResult<Self> {
        let j0 = pre_counter_block(iv)?;
        Ok(Self {
            keystream: keystream_at(key, &j0, base_offset)?,
            j0,
            base_offset,
            processed: 0,
        })
    }

    pub(crate) fn update(&mut self, input: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut out = input.to_vec();
        apply(&mut self.keystream, &mut out, self.base_offset + self.processed)?;
        self.processed += input.len() as u64;
        Ok(out)
    }

    pub(crate) fn snapshot(&self) -> CtrSnapshot {
        CtrSnapshot {
            processed: self.processed,
        }
    }

    pub(crate) fn restore(&mut self, key: &ContentKey, snapshot: &CtrSnapshot) -> CryptoResult<()> {
        self.keystream = keystream_at(key, &self.j0, self.base_offset + snapshot.processed)?;
        self.processed = snapshot.processed;
        Ok(())
    }
}
