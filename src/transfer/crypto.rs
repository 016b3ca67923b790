//! AES-256-GCM chunk codec.
//!
//! Each sender seals with IVs of the form `prefix (4 bytes) ‖ counter
//! (u64 big-endian)`. The counter starts at zero, increments after every
//! seal, and is never reset while the key lives, so no (key, IV) pair can
//! recur on one sender. Both peers share the key, so the two senders carry
//! distinct prefixes — derived from role rather than drawn at random, which
//! removes the collision case outright.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand_core::RngCore;
use thiserror::Error;

use super::wire::IV_LEN;

pub const KEY_LEN: usize = 32;

/// Which end of the pairing this engine is. The initiator generates the
/// session key; the joiner imports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Joiner,
}

impl Role {
    /// High four IV bytes for this sender.
    fn iv_prefix(self) -> [u8; 4] {
        match self {
            Role::Initiator => [0x00, 0x00, 0x00, 0x00],
            Role::Joiner => [0x00, 0x00, 0x00, 0x01],
        }
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("chunk encryption failed")]
    Encrypt,
    #[error("chunk authentication failed")]
    Decrypt,
    #[error("iv counter exhausted")]
    CounterExhausted,
}

/// The raw session key. Zeroed on drop; export it once for the key-exchange
/// message and let it go out of scope.
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

/// Sealing half: owns this sender's IV sequence.
pub struct ChunkSealer {
    cipher: Aes256Gcm,
    prefix: [u8; 4],
    counter: u64,
}

impl ChunkSealer {
    pub fn new(key: &SessionKey, role: Role) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
            prefix: role.iv_prefix(),
            counter: 0,
        }
    }

    /// Encrypt one plaintext chunk, returning the IV used and the
    /// ciphertext with the 16-byte GCM tag appended. No associated data.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<([u8; IV_LEN], Vec<u8>), CryptoError> {
        let iv = self.next_iv()?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        Ok((iv, ciphertext))
    }

    fn next_iv(&mut self) -> Result<[u8; IV_LEN], CryptoError> {
        let mut iv = [0u8; IV_LEN];
        iv[..4].copy_from_slice(&self.prefix);
        iv[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)?;
        Ok(iv)
    }
}

/// Opening half: decrypts with whatever IV the peer supplied.
pub struct ChunkOpener {
    cipher: Aes256Gcm,
}

impl ChunkOpener {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    pub fn open(&self, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}
