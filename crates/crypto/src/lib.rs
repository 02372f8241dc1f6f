//! Neuron identity primitives.
//!
//! Ed25519 key pairs, the in-memory [`Keystore`] every outbound message is
//! signed through, and the password protected on-disk [`KeyFile`].

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use neuron_types::{PublicKey, SignatureBytes};
use rand_core::OsRng;

pub mod error;
pub mod keyfile;
pub mod keystore;

pub use error::KeyError;
pub use keyfile::{KeyFile, KeyMetadata, KeySecret};
pub use keystore::{Keystore, SigningHandle};

/// Ed25519 key pair owned by this process.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new key pair from the OS random source.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.verifying_key.to_bytes()
    }

    /// Secret scalar seed. Only key file persistence should need this.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> Result<(), KeyError> {
        self.verifying_key
            .verify(message, &Signature::from_bytes(signature))
            .map_err(|_| KeyError::InvalidSignature)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

/// Verify a signature made by a peer's key.
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<(), KeyError> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|err| KeyError::InvalidKey(err.to_string()))?;
    verifying_key
        .verify(message, &Signature::from_bytes(signature))
        .map_err(|_| KeyError::InvalidSignature)
}
