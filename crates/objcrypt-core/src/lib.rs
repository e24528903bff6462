pub mod config;
pub mod error;
pub mod types;

pub use error::{CryptoError, CryptoResult};
pub use types::{MaterialsDescription, ObjectMetadata};
