use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no key material loaded")]
    KeyUnavailable,

    #[error("signing key rotated (handle generation {held}, current {current})")]
    Rotated { held: u64, current: u64 },

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("password required to unlock key file")]
    PasswordRequired,

    #[error("refusing to store an unencrypted key without explicit opt-in")]
    PlaintextNotAllowed,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("unsupported key file version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    #[error("key file {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
