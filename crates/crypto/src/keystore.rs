//! In-memory keystore holding this process's identity.
//!
//! The active key pair is replaced only by [`Keystore::rotate`]. Each rotation
//! bumps a generation counter; a [`SigningHandle`] taken before the rotation
//! refuses to sign afterwards, which invalidates in-flight operations that
//! were started under the old identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use neuron_types::{PeerIndex, PublicKey, SignatureBytes};
use parking_lot::RwLock;
use tracing::info;

use crate::{KeyError, KeyPair};

#[derive(Default)]
struct ActiveIdentity {
    keypair: Option<Arc<KeyPair>>,
    registered_index: Option<PeerIndex>,
}

#[derive(Default)]
pub struct Keystore {
    active: RwLock<ActiveIdentity>,
    generation: Arc<AtomicU64>,
}

impl Keystore {
    pub fn new(keypair: KeyPair) -> Self {
        Self {
            active: RwLock::new(ActiveIdentity {
                keypair: Some(Arc::new(keypair)),
                registered_index: None,
            }),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Keystore with no key material; every signing call fails until a key is
    /// installed with [`Keystore::rotate`].
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.active.read().keypair.is_some()
    }

    pub fn sign(&self, message: &[u8]) -> Result<SignatureBytes, KeyError> {
        let keypair = self.keypair()?;
        Ok(keypair.sign(message))
    }

    pub fn public_identifier(&self) -> Result<PublicKey, KeyError> {
        Ok(self.keypair()?.public_key())
    }

    /// Capture the active key for a multi-step operation.
    pub fn signer(&self) -> Result<SigningHandle, KeyError> {
        let active = self.active.read();
        let keypair = active.keypair.clone().ok_or(KeyError::KeyUnavailable)?;
        Ok(SigningHandle {
            keypair,
            generation: self.generation.load(Ordering::Acquire),
            current: Arc::clone(&self.generation),
        })
    }

    /// Replace the active key. Clears the registration, since the ledger
    /// knows the new key under no index yet. Returns the new generation.
    pub fn rotate(&self, keypair: KeyPair) -> u64 {
        let public_key = keypair.public_key();
        let mut active = self.active.write();
        active.keypair = Some(Arc::new(keypair));
        active.registered_index = None;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        drop(active);

        info!(
            target: "neuron::keystore",
            generation,
            public_key = %hex::encode(public_key),
            "signing key rotated"
        );
        generation
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn confirm_registration(&self, index: PeerIndex) {
        self.active.write().registered_index = Some(index);
    }

    pub fn registered_index(&self) -> Option<PeerIndex> {
        self.active.read().registered_index
    }

    fn keypair(&self) -> Result<Arc<KeyPair>, KeyError> {
        self.active
            .read()
            .keypair
            .clone()
            .ok_or(KeyError::KeyUnavailable)
    }
}

/// Key pinned to the keystore generation it was taken from.
#[derive(Clone)]
pub struct SigningHandle {
    keypair: Arc<KeyPair>,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl SigningHandle {
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation
    }

    pub fn sign(&self, message: &[u8]) -> Result<SignatureBytes, KeyError> {
        self.ensure_current()?;
        let signature = self.keypair.sign(message);
        // a rotation racing the signature still voids it
        self.ensure_current()?;
        Ok(signature)
    }

    fn ensure_current(&self) -> Result<(), KeyError> {
        let current = self.current.load(Ordering::Acquire);
        if current != self.generation {
            return Err(KeyError::Rotated {
                held: self.generation,
                current,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SigningHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningHandle")
            .field("public_key", &hex::encode(self.public_key()))
            .field("generation", &self.generation)
            .finish()
    }
}
