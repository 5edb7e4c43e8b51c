//! Key derivation
//!
//! Master keys come either from a password (`EVP_BytesToKey` with MD5) or from
//! an explicit base64 key. Each tunnel direction then derives its own subkey
//! from the master key and a random salt with HKDF-SHA1.

use super::CipherMethod;
use crate::error::CipherError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;
use zeroize::Zeroizing;

/// HKDF info string for per-session subkeys
pub const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Derive a key of `key_len` bytes from a password, OpenSSL `EVP_BytesToKey` style
///
/// `D_1 = MD5(password)`, `D_i = MD5(D_{i-1} || password)`, concatenated and
/// truncated.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(Vec::with_capacity(key_len + 16));
    let mut prev: Option<[u8; 16]> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(prev) = prev {
            hasher.update(prev);
        }
        hasher.update(password);
        let digest: [u8; 16] = hasher.finalize().into();
        key.extend_from_slice(&digest);
        prev = Some(digest);
    }

    key.truncate(key_len);
    key
}

/// Decode an explicit base64 master key, which must match the method key size
pub fn parse_key(encoded: &str, method: CipherMethod) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let key = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CipherError::KeyDerivation(format!("invalid base64 key: {}", e)))?;
    if key.len() != method.key_size() {
        return Err(CipherError::InvalidKeyLength {
            expected: method.key_size(),
            actual: key.len(),
        });
    }
    Ok(Zeroizing::new(key))
}

/// Build the master key from either an explicit key or a password
pub fn master_key(
    method: CipherMethod,
    key: Option<&str>,
    password: Option<&str>,
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    match (key, password) {
        (Some(key), _) if !key.is_empty() => parse_key(key, method),
        (_, Some(password)) => Ok(evp_bytes_to_key(password.as_bytes(), method.key_size())),
        _ => Err(CipherError::KeyDerivation(
            "either key or password is required".to_string(),
        )),
    }
}

/// HKDF-SHA1 extract-and-expand
pub fn hkdf_sha1(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let hk = Hkdf::<Sha1>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new(vec![0u8; len]);
    hk.expand(info, &mut okm)
        .map_err(|_| CipherError::KeyDerivation("HKDF output too long".to_string()))?;
    Ok(okm)
}

/// Per-session subkey for one tunnel direction
pub fn session_subkey(master: &[u8], salt: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    hkdf_sha1(salt, master, SUBKEY_INFO, master.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_evp_bytes_to_key_first_block_is_md5() {
        let key = evp_bytes_to_key(b"foobar", 32);
        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], hex("3858f62230ac3c915f300c664312c63f").as_slice());

        let mut hasher = Md5::new();
        hasher.update(&key[..16]);
        hasher.update(b"foobar");
        let second: [u8; 16] = hasher.finalize().into();
        assert_eq!(&key[16..], &second);
    }

    #[test]
    fn test_evp_bytes_to_key_truncates() {
        let short = evp_bytes_to_key(b"foobar", 16);
        let long = evp_bytes_to_key(b"foobar", 24);
        assert_eq!(short.len(), 16);
        assert_eq!(long.len(), 24);
        assert_eq!(&long[..16], short.as_slice());
    }

    #[test]
    fn test_hkdf_sha1_rfc5869_case4() {
        let ikm = hex("0b0b0b0b0b0b0b0b0b0b0b");
        let salt = hex("000102030405060708090a0b0c");
        let info = hex("f0f1f2f3f4f5f6f7f8f9");
        let okm = hkdf_sha1(&salt, &ikm, &info, 42).unwrap();
        assert_eq!(
            okm.as_slice(),
            hex("085a01ea1b10f36933068b56efa5ad81a4f14b822f5b091568a9cdd4f155fda2c22e422478d305f3f896")
                .as_slice()
        );
    }

    #[test]
    fn test_session_subkey_depends_on_salt() {
        let master = evp_bytes_to_key(b"secret", 32);
        let a = session_subkey(&master, &[1u8; 32]).unwrap();
        let b = session_subkey(&master, &[2u8; 32]).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn test_parse_key() {
        let encoded = STANDARD.encode([7u8; 16]);
        let key = parse_key(&encoded, CipherMethod::Aes128Gcm).unwrap();
        assert_eq!(key.as_slice(), &[7u8; 16]);

        assert!(matches!(
            parse_key(&encoded, CipherMethod::Aes256Gcm),
            Err(CipherError::InvalidKeyLength { expected: 32, actual: 16 })
        ));
        assert!(matches!(
            parse_key("not base64!", CipherMethod::Aes128Gcm),
            Err(CipherError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_master_key_prefers_explicit_key() {
        let encoded = STANDARD.encode([9u8; 32]);
        let key = master_key(CipherMethod::Aes256Gcm, Some(&encoded), Some("pw")).unwrap();
        assert_eq!(key.as_slice(), &[9u8; 32]);

        let key = master_key(CipherMethod::Aes256Gcm, None, Some("pw")).unwrap();
        assert_eq!(key.as_slice(), evp_bytes_to_key(b"pw", 32).as_slice());

        assert!(master_key(CipherMethod::Aes256Gcm, None, None).is_err());
    }
}
