//! Identity-keyed signing and verification.
//!
//! Credentials live in one directory: `<identity>.public` holds an SPKI PEM
//! Ed25519 public key, `<identity>.private` a PKCS#8 PEM Ed25519 private key.
//! Signatures are Ed25519ph over a SHA-512 digest, which is deterministic: the
//! same bytes signed with the same key always give the same signature.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use parking_lot::Mutex;
use sha2::{Digest, Sha512};
use tracing::{error, info, warn};

use crate::utils::{DealerError, Result};

const PUBLIC_SUFFIX: &str = "public";
const PRIVATE_SUFFIX: &str = "private";

/// Loaded key pairs plus the shared digest context.
///
/// The key maps are filled once by [`SignatureStore::load`] and never change
/// afterwards, so lookups take no lock. The digest context is reused by every
/// sign/verify call and is the only serialization point.
pub struct SignatureStore {
    public_keys: HashMap<String, VerifyingKey>,
    private_keys: HashMap<String, SigningKey>,
    context: Mutex<Sha512>,
}

impl SignatureStore {
    /// Loads every credential file under `directory`, creating the directory
    /// when it does not exist yet.
    ///
    /// Files with a bad key or an unknown suffix are logged and skipped. Only a
    /// directory that cannot be created or read is an error.
    pub fn load(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref();
        let display = directory.display().to_string();

        if !directory.exists() {
            fs::create_dir_all(directory).map_err(|e| DealerError::KeyDirectory {
                path: display.clone(),
                reason: format!("cannot create: {e}"),
            })?;
        } else if !directory.is_dir() {
            return Err(DealerError::KeyDirectory {
                path: display,
                reason: "not a directory".to_string(),
            });
        }

        let entries = fs::read_dir(directory).map_err(|e| DealerError::KeyDirectory {
            path: display.clone(),
            reason: e.to_string(),
        })?;

        let mut public_keys = HashMap::new();
        let mut private_keys = HashMap::new();

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let (Some(identity), Some(suffix)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                warn!(file = %path.display(), "skipping credential file without a key suffix");
                continue;
            };

            if suffix != PUBLIC_SUFFIX && suffix != PRIVATE_SUFFIX {
                warn!(file = %path.display(), suffix, "unknown key type");
                continue;
            }

            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(e) => {
                    error!(file = %path.display(), "cannot open key file: {e}");
                    continue;
                }
            };

            if suffix == PUBLIC_SUFFIX {
                match VerifyingKey::from_public_key_pem(&contents) {
                    Ok(key) => {
                        public_keys.insert(identity.to_string(), key);
                    }
                    Err(e) => {
                        error!(file = %path.display(), "failed to load a public key: {e}")
                    }
                }
            } else {
                match SigningKey::from_pkcs8_pem(&contents) {
                    Ok(key) => {
                        private_keys.insert(identity.to_string(), key);
                    }
                    Err(e) => {
                        error!(file = %path.display(), "failed to load a private key: {e}")
                    }
                }
            }
        }

        info!(
            public = public_keys.len(),
            private = private_keys.len(),
            directory = %directory.display(),
            "loaded credentials"
        );

        Ok(Self {
            public_keys,
            private_keys,
            context: Mutex::new(Sha512::new()),
        })
    }

    /// Signs `message` with the private key of `identity`.
    pub fn sign(&self, message: &[u8], identity: &str) -> Result<Vec<u8>> {
        let key = self
            .private_keys
            .get(identity)
            .ok_or_else(|| DealerError::UnauthorizedIdentity(identity.to_string()))?;

        let mut context = self.context.lock();
        context.update(message);
        // take() leaves a fresh state behind for the next caller
        let digest = std::mem::take(&mut *context);

        key.sign_prehashed(digest, None)
            .map(|signature| signature.to_bytes().to_vec())
            .map_err(|_| DealerError::InvalidSignature(identity.to_string()))
    }

    /// Checks `signature` over `message` against the public key of `identity`.
    pub fn verify(&self, message: &[u8], signature: &[u8], identity: &str) -> Result<()> {
        let key = self
            .public_keys
            .get(identity)
            .ok_or_else(|| DealerError::UnauthorizedIdentity(identity.to_string()))?;

        let signature = Signature::from_slice(signature)
            .map_err(|_| DealerError::InvalidSignature(identity.to_string()))?;

        let mut context = self.context.lock();
        context.update(message);
        let digest = std::mem::take(&mut *context);

        key.verify_prehashed(digest, None, &signature)
            .map_err(|_| DealerError::InvalidSignature(identity.to_string()))
    }

    pub fn can_sign(&self, identity: &str) -> bool {
        self.private_keys.contains_key(identity)
    }

    pub fn can_verify(&self, identity: &str) -> bool {
        self.public_keys.contains_key(identity)
    }
}

impl fmt::Debug for SignatureStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut public: Vec<_> = self.public_keys.keys().collect();
        let mut private: Vec<_> = self.private_keys.keys().collect();
        public.sort();
        private.sort();

        f.debug_struct("SignatureStore")
            .field("public", &public)
            .field("private", &private)
            .finish()
    }
}
