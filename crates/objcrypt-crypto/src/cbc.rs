//! Streaming AES-256-CBC with PKCS#7 padding (legacy suite)
//!
//! The engine tracks the chaining value (the last ciphertext block) itself,
//! so its whole state is one block plus fewer than two blocks of buffered
//! input. Snapshots copy that state; restoring rebuilds the block cipher
//! with the chaining value as IV.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, InvalidLength, KeyIvInit};
use aes::Aes256;
use objcrypt_core::{CryptoError, CryptoResult};

use crate::cipher::CipherMode;
use crate::keys::ContentKey;
use crate::scheme::BLOCK_SIZE;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

enum Core {
    Encrypt(Aes256CbcEnc),
    Decrypt(Aes256CbcDec),
    /// Auxiliary decryptor still waiting for the preceding ciphertext block
    AwaitingChain,
}

pub(crate) struct CbcEngine {
    key: ContentKey,
    core: Core,
    chain: [u8; BLOCK_SIZE],
    pending: Vec<u8>,
    padded: bool,
}

#[derive(Clone)]
pub(crate) struct CbcSnapshot {
    chain: Option<[u8; BLOCK_SIZE]>,
    pending: Vec<u8>,
}

impl CbcEngine {
    pub(crate) fn new(key: &ContentKey, iv: &[u8], mode: CipherMode) -> CryptoResult<Self> {
        let chain = to_block(iv)?;
        let mut engine = Self {
            key: key.clone(),
            core: Core::AwaitingChain,
            chain,
            pending: Vec::with_capacity(2 * BLOCK_SIZE),
            padded: true,
        };
        engine.core = engine.build_core(mode, &chain)?;
        Ok(engine)
    }

    /// Unpadded decryptor starting at a block-aligned ciphertext offset.
    ///
    /// At offset 0 the object IV seeds the chain. Past offset 0 the first 16
    /// input bytes must be the ciphertext block just before `offset`; they are
    /// consumed as the chaining value and produce no output.
    pub(crate) fn auxiliary_decryptor(
        key: &ContentKey,
        iv: &[u8],
        offset: u64,
    ) -> CryptoResult<Self> {
        if offset % BLOCK_SIZE as u64 != 0 {
            return Err(CryptoError::UnsupportedOperation(format!(
                "CBC random access needs a block-aligned offset, got {offset}"
            )));
        }
        let mut engine = Self::new(key, iv, CipherMode::Decrypt)?;
        engine.padded = false;
        if offset > 0 {
            engine.core = Core::AwaitingChain;
        }
        Ok(engine)
    }

    fn build_core(&self, mode: CipherMode, chain: &[u8; BLOCK_SIZE]) -> CryptoResult<Core> {
        let err = |e: InvalidLength| CryptoError::Cipher(format!("AES-CBC init failed: {e}"));
        Ok(match mode {
            CipherMode::Encrypt => Core::Encrypt(
                Aes256CbcEnc::new_from_slices(self.key.as_bytes(), chain).map_err(err)?,
            ),
            CipherMode::Decrypt => Core::Decrypt(
                Aes256CbcDec::new_from_slices(self.key.as_bytes(), chain).map_err(err)?,
            ),
        })
    }

    pub(crate) fn update(&mut self, input: &[u8]) -> CryptoResult<Vec<u8>> {
        self.pending.extend_from_slice(input);

        if matches!(self.core, Core::AwaitingChain) {
            if self.pending.len() < BLOCK_SIZE {
                return Ok(Vec::new());
            }
            let chain = to_block(&self.pending[..BLOCK_SIZE])?;
            self.pending.drain(..BLOCK_SIZE);
            self.core = self.build_core(CipherMode::Decrypt, &chain)?;
            self.chain = chain;
        }

        let mut ready = self.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        // A padded decryptor must keep the last full block until finalize
        if self.padded && matches!(self.core, Core::Decrypt(_)) && ready == self.pending.len() {
            ready = ready.saturating_sub(BLOCK_SIZE);
        }
        let blocks: Vec<u8> = self.pending.drain(..ready).collect();
        Ok(self.process_blocks(&blocks))
    }

    pub(crate) fn finalize(&mut self) -> CryptoResult<Vec<u8>> {
        match self.core {
            Core::AwaitingChain => {
                if self.pending.is_empty() {
                    Ok(Vec::new())
                } else {
                    Err(CryptoError::Cipher(format!(
                        "CBC ciphertext ended inside the chaining block ({} bytes)",
                        self.pending.len()
                    )))
                }
            }
            Core::Encrypt(_) => {
                let padded = pkcs7_pad(&self.pending);
                self.pending.clear();
                Ok(self.process_blocks(&padded))
            }
            Core::Decrypt(_) if self.padded => {
                if self.pending.len() != BLOCK_SIZE {
                    return Err(CryptoError::Cipher(format!(
                        "CBC ciphertext is not a whole number of blocks ({} trailing bytes)",
                        self.pending.len()
                    )));
                }
                let last = std::mem::take(&mut self.pending);
                let block = self.process_blocks(&last);
                pkcs7_unpad(&block).map(<[u8]>::to_vec)
            }
            Core::Decrypt(_) => {
                if !self.pending.is_empty() {
                    return Err(CryptoError::Cipher(format!(
                        "CBC ciphertext is not a whole number of blocks ({} trailing bytes)",
                        self.pending.len()
                    )));
                }
                Ok(Vec::new())
            }
        }
    }

    pub(crate) fn snapshot(&self) -> CbcSnapshot {
        CbcSnapshot {
            chain: match self.core {
                Core::AwaitingChain => None,
                _ => Some(self.chain),
            },
            pending: self.pending.clone(),
        }
    }

    pub(crate) fn restore(&mut self, snapshot: &CbcSnapshot) -> CryptoResult<()> {
        let mode = match self.core {
            Core::Encrypt(_) => CipherMode::Encrypt,
            Core::Decrypt(_) | Core::AwaitingChain => CipherMode::Decrypt,
        };
        self.core = match snapshot.chain {
            Some(chain) => {
                self.chain = chain;
                self.build_core(mode, &chain)?
            }
            None => Core::AwaitingChain,
        };
        self.pending = snapshot.pending.clone();
        Ok(())
    }

    /// Run whole blocks through the cipher, tracking the chaining value.
    fn process_blocks(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(BLOCK_SIZE) {
            let mut block = GenericArray::clone_from_slice(chunk);
            match &mut self.core {
                Core::Encrypt(enc) => {
                    enc.encrypt_block_mut(&mut block);
                    self.chain.copy_from_slice(&block);
                }
                Core::Decrypt(dec) => {
                    dec.decrypt_block_mut(&mut block);
                    self.chain.copy_from_slice(chunk);
                }
                Core::AwaitingChain => {
                    unreachable!("chain is installed before blocks are processed")
                }
            }
            out.extend_from_slice(&block);
        }
        out
    }
}

fn to_block(bytes: &[u8]) -> CryptoResult<[u8; BLOCK_SIZE]> {
    bytes.try_into().map_err(|_| {
        CryptoError::Cipher(format!(
            "CBC IV must be {BLOCK_SIZE} bytes, got {}",
            bytes.len()
        ))
    })
}

/// PKCS#7 pad to a whole number of blocks; always adds 1..=16 bytes.
pub(crate) fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

pub(crate) fn pkcs7_unpad(data: &[u8]) -> CryptoResult<&[u8]> {
    let invalid = || CryptoError::Cipher("invalid PKCS#7 padding".into());
    let pad = *data.last().ok_or_else(invalid)? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        return Err(invalid());
    }
    let (body, padding) = data.split_at(data.len() - pad);
    if padding.iter().any(|&b| b as usize != pad) {
        return Err(invalid());
    }
    Ok(body)
}
