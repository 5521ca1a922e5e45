//! Key material: X25519 identities, sealed boxes, and the integrity key.
//!
//! Identity keys live in base64 text files (`<name>.key` for the private half,
//! `<name>.pub` for the public half). A sealed box encrypts to a public identity
//! without any prior contact:
//!
//! ```text
//! sealed = ephemeral_pub (32) || nonce (12) || aes256gcm(k, plaintext) (+16 tag)
//! k      = sha256("cumulus-seal-v1" || dh(ephemeral, recipient) || ephemeral_pub || recipient_pub)
//! ```

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{GridError, Result};
use crate::integrity::IntegrityKey;

const SEAL_DOMAIN: &[u8] = b"cumulus-seal-v1";
const NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

/// Fill a fresh array with OS-seeded randomness
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes);
    bytes
}

fn decode_key32(encoded: &str, what: &str) -> Result<[u8; 32]> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| GridError::KeyMaterial(format!("{} is not base64: {}", what, e)))?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        GridError::KeyMaterial(format!(
            "{} has invalid length (expected 32 bytes, got {})",
            what,
            raw.len()
        ))
    })
}

fn read_key_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| GridError::KeyMaterial(format!("cannot read {}: {}", path.display(), e)))
}

fn seal_key(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_DOMAIN);
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

/// Private identity of a controller or client
#[derive(Clone)]
pub struct IdentityKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKey")
            .field("public", &STANDARD.encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl IdentityKey {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        Self::from_bytes(random_bytes::<32>())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        Ok(Self::from_bytes(decode_key32(encoded, "private key")?))
    }

    /// Load a private key file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_base64(&read_key_file(path.as_ref())?)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.secret.to_bytes())
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity(self.public)
    }

    /// Decrypt a sealed box addressed to this identity
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < 32 + NONCE_LEN + GCM_TAG_LEN {
            return Err(GridError::Crypto("sealed box too short".to_string()));
        }
        let (ephemeral_bytes, rest) = sealed.split_at(32);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(ephemeral_bytes);
        let ephemeral = PublicKey::from(ephemeral);

        let shared = self.secret.diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return Err(GridError::Crypto("non-contributory key exchange".to_string()));
        }
        let key = seal_key(shared.as_bytes(), &ephemeral, &self.public);

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| GridError::Crypto(format!("key init failed: {}", e)))?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| GridError::Crypto("sealed box authentication failed".to_string()))
    }
}

/// Public identity; anyone holding it can seal messages for its owner
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicIdentity(PublicKey);

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicIdentity({})", self.to_base64())
    }
}

impl PublicIdentity {
    pub fn from_base64(encoded: &str) -> Result<Self> {
        Ok(Self(PublicKey::from(decode_key32(encoded, "public key")?)))
    }

    /// Load a public key file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_base64(&read_key_file(path.as_ref())?)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_bytes())
    }

    /// Encrypt `plaintext` so only the owner of this identity can read it
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ephemeral_secret = StaticSecret::from(random_bytes::<32>());
        let ephemeral = PublicKey::from(&ephemeral_secret);

        let shared = ephemeral_secret.diffie_hellman(&self.0);
        if !shared.was_contributory() {
            return Err(GridError::Crypto("non-contributory key exchange".to_string()));
        }
        let key = seal_key(shared.as_bytes(), &ephemeral, &self.0);

        let nonce_bytes = random_bytes::<NONCE_LEN>();
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| GridError::Crypto(format!("key init failed: {}", e)))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| GridError::Crypto(format!("encrypt failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(32 + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(ephemeral.as_bytes());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }
}

/// Resolves a username to its registered public identity
pub trait KeyDirectory: Send + Sync {
    fn lookup(&self, identity: &str) -> Option<PublicIdentity>;
}

/// Directory of `<name>.pub` files
#[derive(Debug, Clone)]
pub struct KeyDir {
    dir: PathBuf,
}

impl KeyDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{}.pub", identity))
    }
}

/// Usernames are restricted to word characters so they map safely onto file names
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty()
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl KeyDirectory for KeyDir {
    fn lookup(&self, identity: &str) -> Option<PublicIdentity> {
        if !is_valid_identity(identity) {
            return None;
        }
        match PublicIdentity::load(self.path_for(identity)) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::debug!(identity = %identity, error = %e, "No public key for identity");
                None
            }
        }
    }
}

impl KeyDirectory for std::collections::HashMap<String, PublicIdentity> {
    fn lookup(&self, identity: &str) -> Option<PublicIdentity> {
        self.get(identity).copied()
    }
}

/// Load the shared integrity key file (base64 text)
pub fn load_integrity_key(path: impl AsRef<Path>) -> Result<IntegrityKey> {
    let path = path.as_ref();
    let raw = STANDARD
        .decode(read_key_file(path)?.trim())
        .map_err(|e| GridError::KeyMaterial(format!("{} is not base64: {}", path.display(), e)))?;
    IntegrityKey::new(raw)
}

/// Generate a random integrity key, base64-encoded for writing to disk
pub fn generate_integrity_key() -> String {
    STANDARD.encode(random_bytes::<32>())
}
