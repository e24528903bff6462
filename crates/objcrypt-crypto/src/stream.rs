//! `io::Read` adapter that runs a byte stream through a [`StreamCipher`]
//!
//! Wraps the caller's plaintext for upload, or the transport's ciphertext for
//! download. Cipher failures (including tag mismatch) surface as `io::Error`
//! carrying the original [`CryptoError`]; recover it with
//! [`CryptoError::from_io`].
//!
//! When decrypting with the authenticated suite, EOF is reported only after
//! the tag has been verified. A reader that stops early has consumed
//! unverified plaintext.

use std::io::{self, Read, Seek, SeekFrom};

use objcrypt_core::CryptoError;

use crate::cipher::{CipherState, StreamCipher};

const READ_CHUNK: usize = 8 * 1024;

pub struct CipherReader<R> {
    inner: R,
    cipher: StreamCipher,
    /// Output produced but not yet handed to the caller
    buffer: Vec<u8>,
    pos: usize,
    scratch: Box<[u8]>,
    finalize_on_eof: bool,
    eof: bool,
    mark: Option<ReaderMark>,
}

struct ReaderMark {
    inner_position: u64,
    pending_output: Vec<u8>,
    eof: bool,
    /// False when the mark fell after `do_final`; only the output rewinds
    cipher_marked: bool,
}

impl<R: Read> CipherReader<R> {
    pub fn new(inner: R, cipher: StreamCipher) -> Self {
        Self {
            inner,
            cipher,
            buffer: Vec::new(),
            pos: 0,
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            finalize_on_eof: true,
            eof: false,
            mark: None,
        }
    }

    /// Do not call `do_final` at EOF.
    ///
    /// Used for non-final multipart parts: the cipher keeps running across
    /// parts and only the last one emits the tag or padding.
    pub fn without_finalize(mut self) -> Self {
        self.finalize_on_eof = false;
        self
    }

    pub fn cipher(&self) -> &StreamCipher {
        &self.cipher
    }

    pub fn into_cipher(self) -> StreamCipher {
        self.cipher
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Fill `buffer` with at least one byte of output, or hit EOF.
    fn fill(&mut self) -> Result<(), CryptoError> {
        while self.pos >= self.buffer.len() && !self.eof {
            self.buffer.clear();
            self.pos = 0;

            let n = loop {
                match self.inner.read(&mut self.scratch) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(CryptoError::Io(e)),
                }
            };

            if n == 0 {
                self.eof = true;
                if self.finalize_on_eof {
                    self.buffer = self.cipher.do_final()?;
                }
            } else {
                self.buffer = self.cipher.update(&self.scratch[..n])?;
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        self.fill()?;
        let available = &self.buffer[self.pos..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl<R: Read + Seek> CipherReader<R> {
    /// Remember the current stream position so a failed send can resume.
    ///
    /// Records the inner reader's offset, marks the cipher, and keeps a copy
    /// of output not yet handed out (always less than one read chunk). Once
    /// the cipher has been finalized at EOF, the tag or final block may still
    /// be pending; that tail is all a later reset has to restore.
    pub fn mark(&mut self) -> io::Result<u64> {
        let inner_position = self.inner.stream_position()?;
        let cipher_marked = self.cipher.state() != CipherState::Finalized;
        if cipher_marked {
            self.cipher.mark()?;
        }
        self.mark = Some(ReaderMark {
            inner_position,
            pending_output: self.buffer[self.pos..].to_vec(),
            eof: self.eof,
            cipher_marked,
        });
        Ok(inner_position)
    }

    /// Rewind to the last [`mark`](Self::mark). The inner reader is seeked;
    /// no consumed bytes are buffered or replayed through the cipher.
    pub fn reset(&mut self) -> io::Result<()> {
        let mark = self.mark.as_ref().ok_or_else(|| {
            io::Error::from(CryptoError::InvalidState("reset without a prior mark".into()))
        })?;
        self.inner.seek(SeekFrom::Start(mark.inner_position))?;
        self.buffer = mark.pending_output.clone();
        self.pos = 0;
        self.eof = mark.eof;
        if mark.cipher_marked {
            self.cipher.reset()?;
        }
        tracing::debug!(position = mark.inner_position, "stream reset to mark");
        Ok(())
    }
}
