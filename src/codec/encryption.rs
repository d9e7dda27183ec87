//! AEAD sealing for values, index entries and the file header.
//!
//! Sealed layout is `nonce (12) ‖ ciphertext ‖ tag (16)`, a fixed 28-byte
//! overhead per sealed run. A fresh random nonce is drawn for every seal.
//! Keys are caller strings of at least 16 characters, stretched to the
//! 32 bytes the ciphers expect with SHA-256.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Per-seal overhead: nonce plus tag.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Minimum accepted length of a caller-supplied encryption key.
pub const MIN_KEY_CHARS: usize = 16;

/// AEAD cipher identity stamped into the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    None,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Encryption {
    /// Resolves a header id to a cipher identity.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Encryption::None),
            1 => Ok(Encryption::Aes256Gcm),
            2 => Ok(Encryption::ChaCha20Poly1305),
            _ => Err(Error::CorruptHeader(format!("unknown encryption id {id}"))),
        }
    }

    /// The id written into the file header.
    pub fn id(&self) -> u8 {
        match self {
            Encryption::None => 0,
            Encryption::Aes256Gcm => 1,
            Encryption::ChaCha20Poly1305 => 2,
        }
    }

    /// Bytes added to every sealed run, zero when encryption is off.
    pub fn overhead(&self) -> usize {
        match self {
            Encryption::None => 0,
            _ => SEAL_OVERHEAD,
        }
    }
}

/// A live cipher instance with its derived key.
#[derive(Clone)]
pub enum Cipher {
    None,
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl Cipher {
    /// Builds a cipher for the given identity, deriving the 32-byte key from
    /// the caller string.
    pub fn new(kind: Encryption, key: Option<&str>) -> Result<Self> {
        if kind == Encryption::None {
            return Ok(Cipher::None);
        }
        let key = key.ok_or_else(|| {
            Error::InvalidInput("encryption requires an encryption key".to_string())
        })?;
        if key.chars().count() < MIN_KEY_CHARS {
            return Err(Error::InvalidInput(format!(
                "encryption key must be at least {MIN_KEY_CHARS} characters"
            )));
        }
        let derived = Sha256::digest(key.as_bytes());
        match kind {
            Encryption::None => unreachable!(),
            Encryption::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&derived)
                    .map_err(|e| Error::InvalidInput(format!("bad key: {e}")))?;
                Ok(Cipher::Aes256Gcm(Box::new(cipher)))
            }
            Encryption::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&derived)
                    .map_err(|e| Error::InvalidInput(format!("bad key: {e}")))?;
                Ok(Cipher::ChaCha20Poly1305(Box::new(cipher)))
            }
        }
    }

    /// The identity of this cipher.
    pub fn kind(&self) -> Encryption {
        match self {
            Cipher::None => Encryption::None,
            Cipher::Aes256Gcm(_) => Encryption::Aes256Gcm,
            Cipher::ChaCha20Poly1305(_) => Encryption::ChaCha20Poly1305,
        }
    }

    /// Bytes added to every sealed run.
    pub fn overhead(&self) -> usize {
        self.kind().overhead()
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Cipher::None)
    }

    /// Seals `plain` under a fresh random nonce.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        match self {
            Cipher::None => Ok(plain.to_vec()),
            Cipher::Aes256Gcm(cipher) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                let sealed = cipher
                    .encrypt(&nonce, plain)
                    .map_err(|_| Error::IO("aead seal failed".to_string()))?;
                let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
                Ok(out)
            }
            Cipher::ChaCha20Poly1305(cipher) => {
                let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
                let sealed = cipher
                    .encrypt(&nonce, plain)
                    .map_err(|_| Error::IO("aead seal failed".to_string()))?;
                let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
                Ok(out)
            }
        }
    }

    /// Opens a sealed run. Tag rejection is [`Error::AuthFailure`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        match self {
            Cipher::None => Ok(sealed.to_vec()),
            _ if sealed.len() < SEAL_OVERHEAD => Err(Error::CorruptEntry(format!(
                "sealed run of {} bytes is shorter than the aead envelope",
                sealed.len()
            ))),
            Cipher::Aes256Gcm(cipher) => {
                let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
                cipher
                    .decrypt(GenericArray::from_slice(nonce), ciphertext)
                    .map_err(|_| Error::AuthFailure)
            }
            Cipher::ChaCha20Poly1305(cipher) => {
                let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
                cipher
                    .decrypt(GenericArray::from_slice(nonce), ciphertext)
                    .map_err(|_| Error::AuthFailure)
            }
        }
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cipher").field(&self.kind()).finish()
    }
}
