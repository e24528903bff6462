//! StreamCipher: one stateful cipher bound to a CEK, IV and direction
//!
//! ```text
//!   Init ──update──▶ Streaming ──do_final──▶ Finalized
//!    ▲                  │  ▲                    │
//!    └──────reset───────┘  └───────reset────────┘
//! ```
//!
//! `mark` snapshots the engine (counter position, GHASH state or CBC chain,
//! plus fewer than two blocks of buffered input). `reset` rebuilds the
//! engine from that snapshot; previously fed input is never replayed.
//!
//! A `StreamCipher` is not `Sync`-shared: exactly one byte stream owns it.

use objcrypt_core::{CryptoError, CryptoResult};

use crate::cbc::{CbcEngine, CbcSnapshot};
use crate::gcm::{GcmEngine, GcmSnapshot};
use crate::keys::ContentKey;
use crate::keystream::{CtrEngine, CtrSnapshot};
use crate::scheme::CryptoScheme;

/// Direction of a cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

impl CipherMode {
    pub fn inverse(self) -> Self {
        match self {
            CipherMode::Encrypt => CipherMode::Decrypt,
            CipherMode::Decrypt => CipherMode::Encrypt,
        }
    }
}

/// Lifecycle state of a [`StreamCipher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherState {
    /// Constructed, nothing fed yet
    Init,
    /// At least one non-empty update
    Streaming,
    /// `do_final` has run; only `reset` is legal
    Finalized,
}

/// How the engine was constructed, needed to rebuild a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Primary,
    /// Counter-mode view of the authenticated suite at a body offset
    AuxiliaryCtr(u64),
    /// Unpadded CBC decryptor at a block-aligned ciphertext offset
    AuxiliaryCbc(u64),
}

enum Engine {
    Gcm(GcmEngine),
    Cbc(CbcEngine),
    Ctr(CtrEngine),
}

#[derive(Clone)]
enum EngineSnapshot {
    Gcm(GcmSnapshot),
    Cbc(CbcSnapshot),
    Ctr(CtrSnapshot),
}

/// Opaque copy of a cipher's position, taken by [`StreamCipher::checkpoint`].
///
/// Holds no key material; only counters, hash state and buffered input.
#[derive(Clone)]
pub struct Checkpoint {
    count: u64,
    state: CipherState,
    engine: EngineSnapshot,
}

impl Checkpoint {
    /// Input bytes processed when the checkpoint was taken.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("count", &self.count)
            .field("state", &self.state)
            .finish()
    }
}

pub struct StreamCipher {
    scheme: CryptoScheme,
    mode: CipherMode,
    origin: Origin,
    key: ContentKey,
    iv: Vec<u8>,
    engine: Engine,
    state: CipherState,
    current_count: u64,
    marked: Checkpoint,
}

impl StreamCipher {
    /// Primary cipher of `scheme`, positioned at byte 0.
    pub fn new(
        scheme: CryptoScheme,
        key: &ContentKey,
        iv: &[u8],
        mode: CipherMode,
    ) -> CryptoResult<Self> {
        if iv.len() != scheme.iv_length_bytes() {
            return Err(CryptoError::Cipher(format!(
                "{} needs a {}-byte IV, got {}",
                scheme.cipher_algorithm(),
                scheme.iv_length_bytes(),
                iv.len()
            )));
        }
        let engine = match scheme {
            CryptoScheme::Authenticated => Engine::Gcm(GcmEngine::new(key, iv, mode)?),
            CryptoScheme::NonAuthenticated => Engine::Cbc(CbcEngine::new(key, iv, mode)?),
        };
        tracing::debug!(algorithm = scheme.cipher_algorithm(), ?mode, "cipher created");
        Ok(Self::assemble(scheme, mode, Origin::Primary, key, iv, engine))
    }

    fn assemble(
        scheme: CryptoScheme,
        mode: CipherMode,
        origin: Origin,
        key: &ContentKey,
        iv: &[u8],
        engine: Engine,
    ) -> Self {
        let marked = Checkpoint {
            count: 0,
            state: CipherState::Init,
            engine: snapshot_of(&engine),
        };
        Self {
            scheme,
            mode,
            origin,
            key: key.clone(),
            iv: iv.to_vec(),
            engine,
            state: CipherState::Init,
            current_count: 0,
            marked,
        }
    }

    pub fn scheme(&self) -> CryptoScheme {
        self.scheme
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn state(&self) -> CipherState {
        self.state
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Input bytes processed since construction (or since the restored mark).
    pub fn current_count(&self) -> u64 {
        self.current_count
    }

    pub fn marked_count(&self) -> u64 {
        self.marked.count
    }

    /// Whether `do_final` verifies (or emits) an authentication tag.
    ///
    /// False for every auxiliary cipher, including those of the
    /// authenticated suite.
    pub fn is_authenticated(&self) -> bool {
        matches!(self.engine, Engine::Gcm(_))
    }

    /// Authenticated decrypt only: true once plaintext has been released.
    /// While false, every byte fed so far may still be tag.
    pub fn has_produced_output(&self) -> bool {
        match &self.engine {
            Engine::Gcm(gcm) => gcm.has_output(),
            _ => self.current_count > 0,
        }
    }

    /// Feed input, returning whatever output is ready.
    ///
    /// An empty slice is a no-op and does not change state.
    pub fn update(&mut self, input: &[u8]) -> CryptoResult<Vec<u8>> {
        if self.state == CipherState::Finalized {
            return Err(CryptoError::InvalidState(
                "update after do_final; reset the cipher first".into(),
            ));
        }
        if input.is_empty() {
            return Ok(Vec::new());
        }
        self.check_capacity(input.len() as u64)?;

        let out = match &mut self.engine {
            Engine::Gcm(gcm) => gcm.update(input)?,
            Engine::Cbc(cbc) => cbc.update(input)?,
            Engine::Ctr(ctr) => ctr.update(input)?,
        };
        self.current_count += input.len() as u64;
        self.state = CipherState::Streaming;
        Ok(out)
    }

    /// Flush buffered input. Appends the tag when encrypting with the
    /// authenticated suite; verifies it when decrypting.
    pub fn do_final(&mut self) -> CryptoResult<Vec<u8>> {
        if self.state == CipherState::Finalized {
            return Err(CryptoError::InvalidState("do_final called twice".into()));
        }
        self.state = CipherState::Finalized;
        match &mut self.engine {
            Engine::Gcm(gcm) => gcm.finalize(),
            Engine::Cbc(cbc) => cbc.finalize(),
            Engine::Ctr(_) => Ok(Vec::new()),
        }
    }

    /// Remember the current position for a later [`reset`](Self::reset).
    pub fn mark(&mut self) -> CryptoResult<u64> {
        if self.state == CipherState::Finalized {
            return Err(CryptoError::InvalidState("cannot mark a finalized cipher".into()));
        }
        self.marked = self.checkpoint();
        Ok(self.marked.count)
    }

    /// Return to the last mark (or to byte 0 if never marked).
    pub fn reset(&mut self) -> CryptoResult<()> {
        let marked = self.marked.clone();
        self.restore(&marked)?;
        tracing::debug!(
            algorithm = self.scheme.cipher_algorithm(),
            position = marked.count,
            "cipher reset to mark"
        );
        Ok(())
    }

    /// Snapshot the current position without replacing the mark.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            count: self.current_count,
            state: self.state,
            engine: snapshot_of(&self.engine),
        }
    }

    /// A new cipher with this one's key and IV, continuing from `checkpoint`.
    ///
    /// The result's mark is the checkpoint, so `reset` returns to it.
    pub fn resume(&self, checkpoint: &Checkpoint) -> CryptoResult<StreamCipher> {
        let engine = self.fresh_engine(self.mode)?;
        let mut cipher =
            Self::assemble(self.scheme, self.mode, self.origin, &self.key, &self.iv, engine);
        cipher.restore(checkpoint)?;
        cipher.marked = checkpoint.clone();
        Ok(cipher)
    }

    /// An independent cipher producing the same output as this one would
    /// after `byte_offset` bytes of input, without seeing those bytes.
    ///
    /// Authenticated suite: bare AES-CTR at that body offset. It never checks
    /// the tag, so its plaintext is NOT integrity-verified.
    ///
    /// Legacy suite: decrypt only, `byte_offset` block-aligned. For a non-zero
    /// offset the first 16 bytes fed must be the ciphertext block preceding
    /// `byte_offset`. Padding is not removed.
    pub fn create_auxiliary(&self, byte_offset: u64) -> CryptoResult<StreamCipher> {
        let (origin, engine) = match self.scheme {
            CryptoScheme::Authenticated => (
                Origin::AuxiliaryCtr(byte_offset),
                Engine::Ctr(CtrEngine::new(&self.key, &self.iv, byte_offset)?),
            ),
            CryptoScheme::NonAuthenticated => {
                if self.mode != CipherMode::Decrypt {
                    return Err(CryptoError::UnsupportedOperation(
                        "CBC cannot encrypt from an arbitrary offset".into(),
                    ));
                }
                (
                    Origin::AuxiliaryCbc(byte_offset),
                    Engine::Cbc(CbcEngine::auxiliary_decryptor(&self.key, &self.iv, byte_offset)?),
                )
            }
        };
        tracing::debug!(
            algorithm = self.scheme.cipher_algorithm(),
            offset = byte_offset,
            "auxiliary cipher created"
        );
        Ok(Self::assemble(self.scheme, self.mode, origin, &self.key, &self.iv, engine))
    }

    /// Same key, IV and scheme; opposite direction; positioned at byte 0.
    pub fn create_inverse(&self) -> CryptoResult<StreamCipher> {
        let mode = self.mode.inverse();
        let engine = self.fresh_engine(mode)?;
        Ok(Self::assemble(self.scheme, mode, self.origin, &self.key, &self.iv, engine))
    }

    fn fresh_engine(&self, mode: CipherMode) -> CryptoResult<Engine> {
        Ok(match (self.origin, self.scheme) {
            (Origin::Primary, CryptoScheme::Authenticated) => {
                Engine::Gcm(GcmEngine::new(&self.key, &self.iv, mode)?)
            }
            (Origin::Primary, CryptoScheme::NonAuthenticated) => {
                Engine::Cbc(CbcEngine::new(&self.key, &self.iv, mode)?)
            }
            (Origin::AuxiliaryCtr(offset), _) => {
                Engine::Ctr(CtrEngine::new(&self.key, &self.iv, offset)?)
            }
            (Origin::AuxiliaryCbc(offset), _) => {
                if mode != CipherMode::Decrypt {
                    return Err(CryptoError::UnsupportedOperation(
                        "auxiliary CBC ciphers only decrypt".into(),
                    ));
                }
                Engine::Cbc(CbcEngine::auxiliary_decryptor(&self.key, &self.iv, offset)?)
            }
        })
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> CryptoResult<()> {
        match (&mut self.engine, &checkpoint.engine) {
            (Engine::Gcm(gcm), EngineSnapshot::Gcm(snap)) => gcm.restore(&self.key, snap)?,
            (Engine::Cbc(cbc), EngineSnapshot::Cbc(snap)) => cbc.restore(snap)?,
            (Engine::Ctr(ctr), EngineSnapshot::Ctr(snap)) => ctr.restore(&self.key, snap)?,
            _ => {
                return Err(CryptoError::InvalidState(
                    "checkpoint was taken from a different kind of cipher".into(),
                ))
            }
        }
        self.current_count = checkpoint.count;
        self.state = checkpoint.state;
        Ok(())
    }

    fn check_capacity(&self, additional: u64) -> CryptoResult<()> {
        let max = self.scheme.max_plaintext_bytes();
        let limit = match self.mode {
            CipherMode::Decrypt => self.scheme.ciphertext_length(max),
            CipherMode::Encrypt => max,
        };
        let base = match self.origin {
            Origin::AuxiliaryCtr(offset) => offset,
            _ => 0,
        };
        let requested = base
            .saturating_add(self.current_count)
            .saturating_add(additional);
        if requested > limit {
            return Err(CryptoError::CapacityExceeded {
                requested,
                limit,
                algorithm: self.scheme.cipher_algorithm(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCipher")
            .field("scheme", &self.scheme)
            .field("mode", &self.mode)
            .field("origin", &self.origin)
            .field("state", &self.state)
            .field("current_count", &self.current_count)
            .field("marked_count", &self.marked.count)
            .finish_non_exhaustive()
    }
}

fn snapshot_of(engine: &Engine) -> EngineSnapshot {
    match engine {
        Engine::Gcm(gcm) => EngineSnapshot::Gcm(gcm.snapshot()),
        Engine::Cbc(cbc) => EngineSnapshot::Cbc(cbc.snapshot()),
        Engine::Ctr(ctr) => EngineSnapshot::Ctr(ctr.snapshot()),
    }
}
