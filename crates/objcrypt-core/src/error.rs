use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD tag mismatch. The object is corrupted or has been tampered with.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// A multipart part was begun out of order. Fatal to the whole upload.
    #[error("multipart sequencing error: {0}")]
    Sequencing(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("key material resolution failed: {0}")]
    MaterialResolution(String),

    #[error("capacity exceeded: {requested} bytes exceeds the {limit}-byte limit of {algorithm}")]
    CapacityExceeded {
        requested: u64,
        limit: u64,
        algorithm: &'static str,
    },

    #[error("invalid encryption metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid cipher state: {0}")]
    InvalidState(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// Only transport-level failures are worth retrying; every cryptographic
    /// failure is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CryptoError::Transport(_) | CryptoError::Io(_))
    }

    /// Recover a `CryptoError` that travelled through an `io::Read` boundary.
    ///
    /// Cipher failures raised inside a wrapped stream surface as `io::Error`;
    /// plain I/O errors from the underlying transport stay `Io`.
    pub fn from_io(err: std::io::Error) -> Self {
        let is_crypto = err
            .get_ref()
            .map(|inner| inner.is::<CryptoError>())
            .unwrap_or(false);
        if !is_crypto {
            return CryptoError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<CryptoError>()) {
            Some(Ok(crypto)) => *crypto,
            Some(Err(other)) => CryptoError::Io(std::io::Error::other(other)),
            None => CryptoError::Transport("empty I/O error".into()),
        }
    }
}

impl From<CryptoError> for std::io::Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Io(io) => io,
            CryptoError::AuthenticationFailure(_) | CryptoError::Cipher(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, err)
            }
            other => std::io::Error::other(other),
        }
    }
}
