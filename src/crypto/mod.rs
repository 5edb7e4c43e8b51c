//! Tunnel cryptography
//!
//! AEAD crypters with explicit nonce construction, key derivation, and the
//! chunk framing that protects tunnel payloads.

mod cipher;
mod crypter;
pub mod kdf;

pub use cipher::{AeadCipher, CHUNK_SIZE_LEN, CHUNK_SIZE_MASK, FRAME_PAYLOAD_SIZE};
pub use crypter::{AeadCrypter, Crypter, NonceMode};

use crate::error::CipherError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest key size of any supported method
pub const MAX_KEY_LENGTH: usize = 64;

/// Largest nonce size of any supported method
pub const MAX_NONCE_LENGTH: usize = 32;

/// AEAD methods usable for the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CipherMethod {
    /// ChaCha20-Poly1305 (IETF, 96-bit nonce)
    #[default]
    #[serde(rename = "chacha20-ietf-poly1305")]
    ChaCha20IetfPoly1305,
    /// XChaCha20-Poly1305 (192-bit nonce)
    #[serde(rename = "xchacha20-ietf-poly1305")]
    XChaCha20IetfPoly1305,
    /// AES-128-GCM
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    /// AES-192-GCM
    #[serde(rename = "aes-192-gcm")]
    Aes192Gcm,
    /// AES-256-GCM
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl CipherMethod {
    /// All supported methods
    pub const ALL: [CipherMethod; 5] = [
        CipherMethod::ChaCha20IetfPoly1305,
        CipherMethod::XChaCha20IetfPoly1305,
        CipherMethod::Aes128Gcm,
        CipherMethod::Aes192Gcm,
        CipherMethod::Aes256Gcm,
    ];

    /// Configuration name of the method
    pub fn name(self) -> &'static str {
        match self {
            CipherMethod::ChaCha20IetfPoly1305 => "chacha20-ietf-poly1305",
            CipherMethod::XChaCha20IetfPoly1305 => "xchacha20-ietf-poly1305",
            CipherMethod::Aes128Gcm => "aes-128-gcm",
            CipherMethod::Aes192Gcm => "aes-192-gcm",
            CipherMethod::Aes256Gcm => "aes-256-gcm",
        }
    }

    /// Key length in bytes
    pub fn key_size(self) -> usize {
        match self {
            CipherMethod::Aes128Gcm => 16,
            CipherMethod::Aes192Gcm => 24,
            _ => 32,
        }
    }

    /// Nonce length in bytes
    pub fn nonce_size(self) -> usize {
        match self {
            CipherMethod::XChaCha20IetfPoly1305 => 24,
            _ => 12,
        }
    }

    /// Authentication tag length in bytes
    pub fn tag_size(self) -> usize {
        16
    }

    /// Session salt length; equal to the key length
    pub fn salt_size(self) -> usize {
        self.key_size()
    }
}

impl fmt::Display for CipherMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherMethod {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CipherMethod::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CipherError::UnsupportedMethod(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_sizes() {
        let m = CipherMethod::ChaCha20IetfPoly1305;
        assert_eq!((m.key_size(), m.nonce_size(), m.tag_size()), (32, 12, 16));
        let m = CipherMethod::XChaCha20IetfPoly1305;
        assert_eq!((m.key_size(), m.nonce_size(), m.tag_size()), (32, 24, 16));
        let m = CipherMethod::Aes128Gcm;
        assert_eq!((m.key_size(), m.nonce_size()), (16, 12));
        let m = CipherMethod::Aes192Gcm;
        assert_eq!(m.key_size(), 24);
        let m = CipherMethod::Aes256Gcm;
        assert_eq!((m.key_size(), m.nonce_size()), (32, 12));
    }

    #[test]
    fn test_method_from_str() {
        for method in CipherMethod::ALL {
            assert_eq!(method.name().parse::<CipherMethod>().unwrap(), method);
            assert_eq!(method.to_string(), method.name());
        }
        assert_eq!(
            "AES-256-GCM".parse::<CipherMethod>().unwrap(),
            CipherMethod::Aes256Gcm
        );
        assert!(matches!(
            "salsa20".parse::<CipherMethod>(),
            Err(CipherError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_sizes_within_limits() {
        for method in CipherMethod::ALL {
            assert!(method.key_size() <= MAX_KEY_LENGTH);
            assert!(method.nonce_size() <= MAX_NONCE_LENGTH);
            assert_eq!(method.salt_size(), method.key_size());
        }
    }
}
