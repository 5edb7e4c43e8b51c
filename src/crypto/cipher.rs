//! AEAD chunk framing for tunnel payloads
//!
//! ```text
//! [salt][encrypted length (2 bytes BE) + tag][encrypted payload + tag] ...
//! ```
//!
//! The salt (key-size bytes) is sent once per direction and seeds the session
//! subkey. Every AEAD operation consumes one packet number, so each chunk uses
//! two consecutive nonces.

use super::kdf::session_subkey;
use super::{AeadCrypter, CipherMethod, Crypter};
use crate::error::CipherError;
use bytes::{Buf, BufMut, BytesMut};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

/// Length of the encoded chunk size
pub const CHUNK_SIZE_LEN: usize = 2;

/// Largest payload a single chunk may carry
pub const CHUNK_SIZE_MASK: usize = 0x3FFF;

/// Payload size used when splitting outgoing data
pub const FRAME_PAYLOAD_SIZE: usize = 16384 - 128;

/// One direction of an AEAD tunnel
pub struct AeadCipher {
    method: CipherMethod,
    master_key: Zeroizing<Vec<u8>>,
    salt: Vec<u8>,
    crypter: Option<AeadCrypter>,
    counter: u64,
    /// Buffered ciphertext not yet forming a full chunk (decrypt side)
    pending: BytesMut,
    /// Decoded length of the chunk currently being received
    pending_len: Option<usize>,
}

impl AeadCipher {
    /// Encrypting side with a fresh random salt
    pub fn encryptor(method: CipherMethod, master_key: &[u8]) -> Result<Self, CipherError> {
        let mut salt = vec![0u8; method.salt_size()];
        SystemRandom::new()
            .fill(&mut salt)
            .map_err(|_| CipherError::KeyDerivation("random salt unavailable".to_string()))?;
        Self::encryptor_with_salt(method, master_key, salt)
    }

    /// Encrypting side with a caller supplied salt
    pub fn encryptor_with_salt(
        method: CipherMethod,
        master_key: &[u8],
        salt: Vec<u8>,
    ) -> Result<Self, CipherError> {
        let mut cipher = Self::decryptor(method, master_key)?;
        if salt.len() != method.salt_size() {
            return Err(CipherError::InvalidIvLength {
                expected: method.salt_size(),
                actual: salt.len(),
            });
        }
        cipher.salt = salt;
        Ok(cipher)
    }

    /// Decrypting side; the salt is read from the stream
    pub fn decryptor(method: CipherMethod, master_key: &[u8]) -> Result<Self, CipherError> {
        if master_key.len() != method.key_size() {
            return Err(CipherError::InvalidKeyLength {
                expected: method.key_size(),
                actual: master_key.len(),
            });
        }
        Ok(AeadCipher {
            method,
            master_key: Zeroizing::new(master_key.to_vec()),
            salt: Vec::new(),
            crypter: None,
            counter: 0,
            pending: BytesMut::new(),
            pending_len: None,
        })
    }

    /// Cipher method in use
    pub fn method(&self) -> CipherMethod {
        self.method
    }

    /// Whether the session key has been derived
    pub fn is_initialized(&self) -> bool {
        self.crypter.is_some()
    }

    /// Next packet number to be consumed
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Number of ciphertext bytes buffered waiting for a full chunk
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    fn init_session(&mut self) -> Result<(), CipherError> {
        let subkey = session_subkey(&self.master_key, &self.salt)?;
        self.crypter = Some(AeadCrypter::with_key(self.method, &subkey)?);
        self.counter = 0;
        Ok(())
    }

    fn next_packet_number(&mut self) -> Result<u64, CipherError> {
        let current = self.counter;
        self.counter = current
            .checked_add(1)
            .ok_or(CipherError::NonceExhausted)?;
        Ok(current)
    }

    fn seal(&mut self, plaintext: &[u8], out: &mut BytesMut) -> Result<(), CipherError> {
        let pn = self.next_packet_number()?;
        let crypter = self.crypter.as_ref().ok_or(CipherError::KeyNotSet)?;
        out.put_slice(&crypter.encrypt_packet(pn, &[], plaintext)?);
        Ok(())
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let pn = self.next_packet_number()?;
        let crypter = self.crypter.as_ref().ok_or(CipherError::KeyNotSet)?;
        crypter.decrypt_packet(pn, &[], ciphertext)
    }

    /// Encrypt `plaintext` into `out`, prefixing the salt on first use
    ///
    /// Data larger than one chunk is split. An empty input produces nothing
    /// beyond the salt.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut BytesMut) -> Result<(), CipherError> {
        if self.crypter.is_none() {
            out.put_slice(&self.salt);
            self.init_session()?;
        }

        for chunk in plaintext.chunks(FRAME_PAYLOAD_SIZE) {
            let len = (chunk.len() & CHUNK_SIZE_MASK) as u16;
            self.seal(&len.to_be_bytes(), out)?;
            self.seal(chunk, out)?;
        }
        Ok(())
    }

    /// Feed `ciphertext` and append every complete chunk's plaintext to `out`
    ///
    /// Partial chunks stay buffered until more data arrives. Any failure is
    /// fatal; the cipher must not be used afterwards.
    pub fn decrypt(&mut self, ciphertext: &[u8], out: &mut BytesMut) -> Result<(), CipherError> {
        self.pending.extend_from_slice(ciphertext);

        if self.crypter.is_none() {
            let salt_len = self.method.salt_size();
            if self.pending.len() < salt_len {
                return Ok(());
            }
            self.salt = self.pending.split_to(salt_len).to_vec();
            self.init_session()?;
        }

        let tag = self.method.tag_size();
        loop {
            let payload_len = match self.pending_len {
                Some(len) => len,
                None => {
                    if self.pending.len() < CHUNK_SIZE_LEN + tag {
                        return Ok(());
                    }
                    let header = self.pending.split_to(CHUNK_SIZE_LEN + tag);
                    let plain = self.open(&header)?;
                    let len = (u16::from_be_bytes([plain[0], plain[1]]) as usize) & CHUNK_SIZE_MASK;
                    if len == 0 {
                        return Err(CipherError::InvalidChunkLength(len));
                    }
                    self.pending_len = Some(len);
                    len
                }
            };

            if self.pending.len() < payload_len + tag {
                return Ok(());
            }
            let body = self.pending.split_to(payload_len + tag);
            let plain = self.open(&body)?;
            out.put_slice(&plain);
            self.pending_len = None;
            if !self.pending.has_remaining() {
                return Ok(());
            }
        }
    }
}

impl std::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadCipher")
            .field("method", &self.method)
            .field("initialized", &self.is_initialized())
            .field("counter", &self.counter)
            .field("buffered", &self.pending.len())
            .finish()
    }
}
