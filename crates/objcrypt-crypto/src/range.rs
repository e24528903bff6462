//! Byte-range reads of encrypted objects
//!
//! A plaintext range is widened to whole cipher blocks before fetching:
//! start rounds down and end rounds up to a 16-byte boundary. The fetched
//! ciphertext goes through an auxiliary cipher positioned at the rounded
//! start, and the output is trimmed back to the requested bytes.
//!
//! CBC needs the ciphertext block before the first fetched block as its
//! chaining value, so legacy range reads fetch one extra block in front.

use std::io::{self, Read};
use std::ops::Range;

use crate::scheme::{CryptoScheme, BLOCK_SIZE};

/// How to serve one plaintext range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoRange {
    /// Ciphertext bytes to fetch from storage
    pub fetch: Range<u64>,
    /// Plaintext offset to create the auxiliary cipher at
    pub cipher_offset: u64,
    /// Decrypted bytes to drop before the requested range starts
    pub skip: u64,
    /// Decrypted bytes to return
    pub take: u64,
}

/// Plan a read of `requested` from an object of `plaintext_len` bytes.
///
/// The range is clamped to the object; `None` if nothing is left.
pub fn plan_range(
    scheme: CryptoScheme,
    requested: Range<u64>,
    plaintext_len: u64,
) -> Option<CryptoRange> {
    let start = requested.start;
    let end = requested.end.min(plaintext_len);
    if start >= end {
        return None;
    }

    let block = BLOCK_SIZE as u64;
    let aligned_start = start / block * block;
    let aligned_end = end.div_ceil(block) * block;

    let fetch_start = match scheme {
        CryptoScheme::NonAuthenticated if aligned_start >= block => aligned_start - block,
        _ => aligned_start,
    };

    Some(CryptoRange {
        fetch: fetch_start..aligned_end,
        cipher_offset: aligned_start,
        skip: start - aligned_start,
        take: end - start,
    })
}

/// Drops `skip` bytes and then yields at most `take` bytes of the inner reader.
pub struct RangeReader<R> {
    inner: R,
    skip: u64,
    remaining: u64,
}

impl<R: Read> RangeReader<R> {
    pub fn new(inner: R, skip: u64, take: u64) -> Self {
        Self {
            inner,
            skip,
            remaining: take,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for RangeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.skip > 0 {
            let mut discard = [0u8; 256];
            let want = discard.len().min(self.skip as usize);
            let n = self.inner.read(&mut discard[..want])?;
            if n == 0 {
                return Ok(0);
            }
            self.skip -= n as u64;
        }
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..want])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}
