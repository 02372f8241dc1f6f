//! Versioned JSON key file.
//!
//! The secret is either stored in plain hex, which must be explicitly allowed,
//! or encrypted with AES-256-GCM under a key derived from a password with
//! Argon2id.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{serde::ts_seconds, DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{KeyError, KeyPair};

/// Current on-disk key file schema version.
const KEYFILE_VERSION: u8 = 1;
const KDF_LABEL: &str = "argon2id-v1";
const PLAINTEXT_WARNING: &str = "Key file stored without password protection";

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyFile {
    pub version: u8,
    pub public_key_hex: String,
    #[serde(default)]
    pub metadata: KeyMetadata,
    #[serde(flatten)]
    pub secret: KeySecret,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KeyMetadata {
    #[serde(with = "ts_seconds")]
    pub created_at: DateTime<Utc>,
    /// Role the key was generated for (`miner`, `validator`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl KeyMetadata {
    pub fn new(role: Option<String>, warning: Option<String>) -> Self {
        Self {
            created_at: Utc::now(),
            role,
            warning,
        }
    }
}

impl Default for KeyMetadata {
    fn default() -> Self {
        KeyMetadata::new(None, None)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "protection", rename_all = "snake_case")]
pub enum KeySecret {
    Plain {
        private_key_hex: String,
    },
    PasswordProtected {
        ciphertext: String,
        nonce: String,
        salt: String,
        kdf: String,
    },
}

impl KeyFile {
    /// Generate a fresh identity and the key file that stores it.
    pub fn generate(
        password: Option<&str>,
        role: Option<String>,
        allow_plaintext: bool,
    ) -> Result<(Self, KeyPair), KeyError> {
        let keypair = KeyPair::generate();
        let keyfile = Self::from_keypair(&keypair, password, role, allow_plaintext)?;
        Ok((keyfile, keypair))
    }

    pub fn from_keypair(
        keypair: &KeyPair,
        password: Option<&str>,
        role: Option<String>,
        allow_plaintext: bool,
    ) -> Result<Self, KeyError> {
        let secret = build_secret(&keypair.secret_bytes(), password, allow_plaintext)?;
        let warning = matches!(secret, KeySecret::Plain { .. }).then(|| PLAINTEXT_WARNING.to_string());

        Ok(Self {
            version: KEYFILE_VERSION,
            public_key_hex: hex::encode(keypair.public_key()),
            metadata: KeyMetadata::new(role, warning),
            secret,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.secret, KeySecret::PasswordProtected { .. })
    }

    /// Write the key file atomically. An existing file is only replaced when
    /// `force` is set.
    pub fn save(&self, path: &Path, force: bool) -> Result<(), KeyError> {
        if path.exists() && !force {
            return Err(KeyError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_path(path);
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp_path, data)?;
        fs::rename(tmp_path, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let data = fs::read(path)?;
        let keyfile: KeyFile = serde_json::from_slice(&data)?;
        if keyfile.version != KEYFILE_VERSION {
            return Err(KeyError::UnsupportedVersion {
                found: keyfile.version,
                expected: KEYFILE_VERSION,
            });
        }
        Ok(keyfile)
    }

    /// Recover the key pair, checking it against the recorded public key.
    pub fn unlock(&self, password: Option<&str>) -> Result<KeyPair, KeyError> {
        let secret = match &self.secret {
            KeySecret::Plain { private_key_hex } => {
                let mut key = [0u8; 32];
                hex::decode_to_slice(private_key_hex, &mut key)
                    .map_err(|err| KeyError::InvalidKey(err.to_string()))?;
                key
            }
            KeySecret::PasswordProtected {
                ciphertext,
                nonce,
                salt,
                ..
            } => {
                let password = password.ok_or(KeyError::PasswordRequired)?;
                decrypt_private_key(ciphertext, nonce, salt, password)?
            }
        };

        let keypair = KeyPair::from_secret_bytes(&secret);
        if self.public_key_hex != hex::encode(keypair.public_key()) {
            return Err(KeyError::InvalidKey(
                "public key in file does not match decrypted private key".into(),
            ));
        }
        Ok(keypair)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn build_secret(
    private_key: &[u8; 32],
    password: Option<&str>,
    allow_plaintext: bool,
) -> Result<KeySecret, KeyError> {
    match password {
        Some(password) => encrypt_private_key(private_key, password),
        None if allow_plaintext => Ok(KeySecret::Plain {
            private_key_hex: hex::encode(private_key),
        }),
        None => Err(KeyError::PlaintextNotAllowed),
    }
}

fn encrypt_private_key(private_key: &[u8; 32], password: &str) -> Result<KeySecret, KeyError> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_encryption_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|err| KeyError::Encryption(format!("cipher init failed: {err}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), private_key.as_slice())
        .map_err(|err| KeyError::Encryption(format!("encryption failed: {err}")))?;

    Ok(KeySecret::PasswordProtected {
        ciphertext: BASE64.encode(ciphertext),
        nonce: BASE64.encode(nonce_bytes),
        salt: BASE64.encode(salt),
        kdf: KDF_LABEL.to_string(),
    })
}

fn decrypt_private_key(
    ciphertext: &str,
    nonce: &str,
    salt: &str,
    password: &str,
) -> Result<[u8; 32], KeyError> {
    let decode = |label: &str, value: &str| {
        BASE64
            .decode(value)
            .map_err(|err| KeyError::Decryption(format!("invalid {label}: {err}")))
    };
    let ciphertext = decode("ciphertext", ciphertext)?;
    let nonce: [u8; 12] = decode("nonce", nonce)?
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::Decryption("nonce must be 12 bytes".into()))?;
    let salt = decode("salt", salt)?;

    let key = derive_encryption_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|err| KeyError::Decryption(format!("cipher init failed: {err}")))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| KeyError::Decryption("wrong password or corrupted key file".into()))?;

    plaintext
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidKey(format!("expected 32 byte key, got {}", plaintext.len())))
}

fn derive_encryption_key(password: &str, salt: &[u8]) -> Result<[u8; 32], KeyError> {
    let mut key = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|err| KeyError::Encryption(format!("key derivation failed: {err}")))?;
    Ok(key)
}
