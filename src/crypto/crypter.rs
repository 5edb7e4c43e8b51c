//! AEAD crypter with explicit nonce construction
//!
//! A crypter holds a key and a nonce base (prefix or IV) and seals or opens
//! packets identified by a 64-bit packet number. The packet number is the only
//! varying input to the nonce, so callers must never reuse one for a key.

use super::{CipherMethod, MAX_NONCE_LENGTH};
use crate::error::CipherError;
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, Nonce, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use zeroize::Zeroize;

type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, U12>;

/// Symmetric packet protection contract
pub trait Crypter: Send {
    /// Install the key; fails unless `key.len() == key_size()`
    fn set_key(&mut self, key: &[u8]) -> Result<(), CipherError>;

    /// Switch to prefix mode: nonce = prefix || packet_number (LE)
    fn set_nonce_prefix(&mut self, prefix: &[u8]) -> Result<(), CipherError>;

    /// Switch to IV mode: nonce = iv XOR packet_number (LE, zero padded)
    fn set_iv(&mut self, iv: &[u8]) -> Result<(), CipherError>;

    /// Key length in bytes
    fn key_size(&self) -> usize;

    /// IV length in bytes
    fn iv_size(&self) -> usize;

    /// Nonce prefix length in bytes
    fn nonce_prefix_size(&self) -> usize;

    /// Tag length in bytes
    fn tag_size(&self) -> usize;

    /// Seal `plaintext`, returning ciphertext followed by the tag
    fn encrypt_packet(
        &self,
        packet_number: u64,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CipherError>;

    /// Open `ciphertext` (with trailing tag)
    fn decrypt_packet(
        &self,
        packet_number: u64,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CipherError>;
}

/// How the packet number is folded into the nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceMode {
    /// Fixed prefix followed by the little-endian packet number
    Prefix,
    /// IV XOR little-endian packet number
    Iv,
}

enum AeadImpl {
    ChaCha20(ChaCha20Poly1305),
    XChaCha20(XChaCha20Poly1305),
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl AeadImpl {
    fn new(method: CipherMethod, key: &[u8]) -> Result<Self, CipherError> {
        let invalid = |_| CipherError::InvalidKeyLength {
            expected: method.key_size(),
            actual: key.len(),
        };
        Ok(match method {
            CipherMethod::ChaCha20IetfPoly1305 => {
                AeadImpl::ChaCha20(ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?)
            }
            CipherMethod::XChaCha20IetfPoly1305 => {
                AeadImpl::XChaCha20(XChaCha20Poly1305::new_from_slice(key).map_err(invalid)?)
            }
            CipherMethod::Aes128Gcm => {
                AeadImpl::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?)
            }
            CipherMethod::Aes192Gcm => {
                AeadImpl::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?)
            }
            CipherMethod::Aes256Gcm => {
                AeadImpl::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?)
            }
        })
    }

    fn seal(&self, nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, CipherError> {
        match self {
            AeadImpl::ChaCha20(c) => seal_with(c, nonce, aad, msg),
            AeadImpl::XChaCha20(c) => seal_with(c, nonce, aad, msg),
            AeadImpl::Aes128(c) => seal_with(c, nonce, aad, msg),
            AeadImpl::Aes192(c) => seal_with(c, nonce, aad, msg),
            AeadImpl::Aes256(c) => seal_with(c, nonce, aad, msg),
        }
    }

    fn open(&self, nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, CipherError> {
        match self {
            AeadImpl::ChaCha20(c) => open_with(c, nonce, aad, msg),
            AeadImpl::XChaCha20(c) => open_with(c, nonce, aad, msg),
            AeadImpl::Aes128(c) => open_with(c, nonce, aad, msg),
            AeadImpl::Aes192(c) => open_with(c, nonce, aad, msg),
            AeadImpl::Aes256(c) => open_with(c, nonce, aad, msg),
        }
    }
}

fn seal_with<A: Aead + AeadCore>(
    cipher: &A,
    nonce: &[u8],
    aad: &[u8],
    msg: &[u8],
) -> Result<Vec<u8>, CipherError> {
    cipher
        .encrypt(Nonce::<A>::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| CipherError::EncryptFailed)
}

fn open_with<A: Aead + AeadCore>(
    cipher: &A,
    nonce: &[u8],
    aad: &[u8],
    msg: &[u8],
) -> Result<Vec<u8>, CipherError> {
    cipher
        .decrypt(Nonce::<A>::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| CipherError::DecryptFailed)
}

/// AEAD crypter for one [`CipherMethod`]
pub struct AeadCrypter {
    method: CipherMethod,
    aead: Option<AeadImpl>,
    nonce_base: [u8; MAX_NONCE_LENGTH],
    mode: NonceMode,
}

impl AeadCrypter {
    /// Create a crypter without key, in IV mode with an all-zero IV
    pub fn new(method: CipherMethod) -> Self {
        AeadCrypter {
            method,
            aead: None,
            nonce_base: [0u8; MAX_NONCE_LENGTH],
            mode: NonceMode::Iv,
        }
    }

    /// Create a keyed crypter
    pub fn with_key(method: CipherMethod, key: &[u8]) -> Result<Self, CipherError> {
        let mut crypter = AeadCrypter::new(method);
        crypter.set_key(key)?;
        Ok(crypter)
    }

    /// The method this crypter implements
    pub fn method(&self) -> CipherMethod {
        self.method
    }

    /// Current nonce construction mode
    pub fn nonce_mode(&self) -> NonceMode {
        self.mode
    }

    /// Build the nonce for `packet_number`
    pub fn nonce_for(&self, packet_number: u64) -> Vec<u8> {
        let size = self.method.nonce_size();
        let mut nonce = self.nonce_base[..size].to_vec();
        let counter = packet_number.to_le_bytes();
        match self.mode {
            NonceMode::Prefix => {
                let prefix_len = self.nonce_prefix_size();
                nonce[prefix_len..].copy_from_slice(&counter);
            }
            NonceMode::Iv => {
                for (byte, c) in nonce.iter_mut().zip(counter.iter()) {
                    *byte ^= c;
                }
            }
        }
        nonce
    }

    fn aead(&self) -> Result<&AeadImpl, CipherError> {
        self.aead.as_ref().ok_or(CipherError::KeyNotSet)
    }
}

impl Crypter for AeadCrypter {
    fn set_key(&mut self, key: &[u8]) -> Result<(), CipherError> {
        if key.len() != self.key_size() {
            return Err(CipherError::InvalidKeyLength {
                expected: self.key_size(),
                actual: key.len(),
            });
        }
        self.aead = Some(AeadImpl::new(self.method, key)?);
        Ok(())
    }

    fn set_nonce_prefix(&mut self, prefix: &[u8]) -> Result<(), CipherError> {
        if prefix.len() != self.nonce_prefix_size() {
            return Err(CipherError::InvalidNoncePrefixLength {
                expected: self.nonce_prefix_size(),
                actual: prefix.len(),
            });
        }
        self.nonce_base.zeroize();
        self.nonce_base[..prefix.len()].copy_from_slice(prefix);
        self.mode = NonceMode::Prefix;
        Ok(())
    }

    fn set_iv(&mut self, iv: &[u8]) -> Result<(), CipherError> {
        if iv.len() != self.iv_size() {
            return Err(CipherError::InvalidIvLength {
                expected: self.iv_size(),
                actual: iv.len(),
            });
        }
        self.nonce_base.zeroize();
        self.nonce_base[..iv.len()].copy_from_slice(iv);
        self.mode = NonceMode::Iv;
        Ok(())
    }

    fn key_size(&self) -> usize {
        self.method.key_size()
    }

    fn iv_size(&self) -> usize {
        self.method.nonce_size()
    }

    fn nonce_prefix_size(&self) -> usize {
        self.method.nonce_size() - std::mem::size_of::<u64>()
    }

    fn tag_size(&self) -> usize {
        self.method.tag_size()
    }

    fn encrypt_packet(
        &self,
        packet_number: u64,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let nonce = self.nonce_for(packet_number);
        self.aead()?.seal(&nonce, associated_data, plaintext)
    }

    fn decrypt_packet(
        &self,
        packet_number: u64,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < self.tag_size() {
            return Err(CipherError::DecryptFailed);
        }
        let nonce = self.nonce_for(packet_number);
        self.aead()?.open(&nonce, associated_data, ciphertext)
    }
}

impl Drop for AeadCrypter {
    fn drop(&mut self) {
        self.nonce_base.zeroize();
    }
}

impl std::fmt::Debug for AeadCrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadCrypter")
            .field("method", &self.method)
            .field("mode", &self.mode)
            .field("keyed", &self.aead.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn keyed(method: CipherMethod) -> AeadCrypter {
        let key: Vec<u8> = (0..method.key_size() as u8).collect();
        AeadCrypter::with_key(method, &key).unwrap()
    }

    #[test]
    fn test_set_key_wrong_length() {
        let mut crypter = AeadCrypter::new(CipherMethod::ChaCha20IetfPoly1305);
        assert_eq!(
            crypter.set_key(&[0u8; 16]),
            Err(CipherError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        );
        assert!(crypter.set_key(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_set_iv_and_prefix_wrong_length() {
        let mut crypter = AeadCrypter::new(CipherMethod::XChaCha20IetfPoly1305);
        assert_eq!(crypter.iv_size(), 24);
        assert_eq!(crypter.nonce_prefix_size(), 16);
        assert!(crypter.set_iv(&[0u8; 12]).is_err());
        assert!(crypter.set_nonce_prefix(&[0u8; 4]).is_err());
        assert!(crypter.set_iv(&[0u8; 24]).is_ok());
        assert!(crypter.set_nonce_prefix(&[0u8; 16]).is_ok());
        assert_eq!(crypter.nonce_mode(), NonceMode::Prefix);
    }

    #[test]
    fn test_encrypt_without_key() {
        let crypter = AeadCrypter::new(CipherMethod::Aes256Gcm);
        assert_eq!(
            crypter.encrypt_packet(0, &[], b"data"),
            Err(CipherError::KeyNotSet)
        );
    }

    #[test]
    fn test_prefix_nonce_layout() {
        let mut crypter = keyed(CipherMethod::ChaCha20IetfPoly1305);
        crypter.set_nonce_prefix(&[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        let nonce = crypter.nonce_for(0x0102030405060708);
        assert_eq!(
            nonce,
            vec![0xAA, 0xBB, 0xCC, 0xDD, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_iv_nonce_layout() {
        let mut crypter = keyed(CipherMethod::Aes128Gcm);
        let iv = [0xFFu8; 12];
        crypter.set_iv(&iv).unwrap();
        let nonce = crypter.nonce_for(1);
        assert_eq!(nonce[0], 0xFE);
        assert!(nonce[1..].iter().all(|&b| b == 0xFF));

        let zero = keyed(CipherMethod::Aes128Gcm);
        assert_eq!(zero.nonce_for(0), vec![0u8; 12]);
        assert_eq!(zero.nonce_for(258)[..2], [0x02, 0x01]);
    }

    #[test]
    fn test_nonce_injective() {
        for mode in [NonceMode::Prefix, NonceMode::Iv] {
            let mut crypter = keyed(CipherMethod::ChaCha20IetfPoly1305);
            match mode {
                NonceMode::Prefix => crypter.set_nonce_prefix(&[7, 7, 7, 7]).unwrap(),
                NonceMode::Iv => crypter.set_iv(&[0x5A; 12]).unwrap(),
            }
            let mut seen = HashSet::new();
            for pn in (0..2000u64).chain([u64::MAX - 1, u64::MAX, 1 << 40]) {
                assert!(seen.insert(crypter.nonce_for(pn)), "nonce repeated for {}", pn);
            }
        }
    }

    #[test]
    fn test_round_trip_all_methods() {
        let plaintext: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        for method in CipherMethod::ALL {
            let crypter = keyed(method);
            let sealed = crypter.encrypt_packet(42, b"ad", &plaintext).unwrap();
            assert_eq!(sealed.len(), plaintext.len() + crypter.tag_size());
            let opened = crypter.decrypt_packet(42, b"ad", &sealed).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_tampering_detected() {
        let crypter = keyed(CipherMethod::Aes256Gcm);
        let mut sealed = crypter.encrypt_packet(1, &[], b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert_eq!(
            crypter.decrypt_packet(1, &[], &sealed),
            Err(CipherError::DecryptFailed)
        );

        let sealed = crypter.encrypt_packet(1, &[], b"payload").unwrap();
        assert_eq!(
            crypter.decrypt_packet(2, &[], &sealed),
            Err(CipherError::DecryptFailed)
        );
        assert_eq!(
            crypter.decrypt_packet(1, &[], &sealed[..4]),
            Err(CipherError::DecryptFailed)
        );
    }

    #[test]
    fn test_chacha20_poly1305_rfc8439_vector() {
        let key: Vec<u8> = (0x80..=0x9Fu8).collect();
        let mut crypter =
            AeadCrypter::with_key(CipherMethod::ChaCha20IetfPoly1305, &key).unwrap();
        crypter.set_nonce_prefix(&[0x07, 0x00, 0x00, 0x00]).unwrap();
        let packet_number = u64::from_le_bytes([0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47]);
        let aad = [
            0x50, 0x51, 0x52, 0x53, 0xC0, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7,
        ];
        let plaintext = b"Ladies and Gentlemen of the class of '99: If I could offer you only one tip for the future, sunscreen would be it.";

        let sealed = crypter.encrypt_packet(packet_number, &aad, plaintext).unwrap();
        let tag = &sealed[sealed.len() - 16..];
        assert_eq!(
            tag,
            &[
                0x1A, 0xE1, 0x0B, 0x59, 0x4F, 0x09, 0xE2, 0x6A, 0x7E, 0x90, 0x2E, 0xCB, 0xD0,
                0x60, 0x06, 0x91
            ]
        );
        assert_eq!(sealed[0], 0xD3);
    }
}
