//! Overlay data cipher: AES-128-CBC + PKCS#7 with a fixed IV
//!
//! Every deployed peer derives the 16-byte session key by repeating the
//! 64-bit app key twice (little-endian) and encrypts overlay payloads in
//! CBC mode against the constant IV below. A fixed IV with a shared
//! per-session key leaks equal-prefix information between messages; it is
//! kept because the bytes on the wire are the compatibility contract.
//! An all-zero key means the overlay runs in plaintext.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, Result};

/// AES-128 key length in bytes
pub const AES_KEY_SIZE: usize = 16;

/// AES block length in bytes (PKCS#7 pads to this)
pub const BLOCK_SIZE: usize = 16;

/// The wire-compatible CBC IV. Do not change.
const CBC_IV: &[u8; BLOCK_SIZE] = b"UHNJUSBACIJFYSQN";

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// A 16-byte overlay session key, wiped on drop.
///
/// Built by repeating the 64-bit app key twice; app key 0 yields the nil
/// key, which switches the overlay to plaintext.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct OverlayKey([u8; AES_KEY_SIZE]);

impl OverlayKey {
    /// Derive the session key from a 64-bit app key.
    pub fn from_app_key(app_key: u64) -> Self {
        let mut key = [0u8; AES_KEY_SIZE];
        key[..8].copy_from_slice(&app_key.to_le_bytes());
        key[8..].copy_from_slice(&app_key.to_le_bytes());
        Self(key)
    }

    /// Whether this is the nil (all-zero) key, i.e. no encryption.
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; AES_KEY_SIZE]
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for OverlayKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log key material
        write!(f, "OverlayKey({})", if self.is_nil() { "nil" } else { "set" })
    }
}

/// Encrypt an overlay payload.
///
/// Nil key passes the plaintext through unchanged. Otherwise the output is
/// `len(plaintext)` rounded up to the next whole block (PKCS#7 always adds
/// at least one padding byte).
pub fn encrypt_overlay(key: &OverlayKey, plaintext: &[u8]) -> Vec<u8> {
    if key.is_nil() {
        return plaintext.to_vec();
    }
    Aes128CbcEnc::new(key.as_bytes().into(), CBC_IV.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt an overlay payload. Inverse of [`encrypt_overlay`].
///
/// Nil key passes the ciphertext through unchanged.
pub fn decrypt_overlay(key: &OverlayKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if key.is_nil() {
        return Ok(ciphertext.to_vec());
    }
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength(ciphertext.len()));
    }
    Aes128CbcDec::new(key.as_bytes().into(), CBC_IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| CryptoError::Decryption(format!("bad PKCS#7 padding: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = OverlayKey::from_app_key(0x0102030405060708);
        for len in [0usize, 1, 15, 16, 17, 31, 32, 1000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let ciphertext = encrypt_overlay(&key, &plaintext);
            assert_eq!(ciphertext.len() % BLOCK_SIZE, 0);
            assert!(ciphertext.len() > plaintext.len());
            let decrypted = decrypt_overlay(&key, &ciphertext).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_nil_key_is_passthrough() {
        let key = OverlayKey::from_app_key(0);
        assert!(key.is_nil());
        let data = b"plaintext overlay".to_vec();
        assert_eq!(encrypt_overlay(&key, &data), data);
        assert_eq!(decrypt_overlay(&key, &data).unwrap(), data);
    }

    #[test]
    fn test_key_is_repeated_app_key() {
        let key = OverlayKey::from_app_key(0x0102030405060708);
        let expected = [
            0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // LE once
            0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // and again
        ];
        assert_eq!(key.as_bytes(), &expected);
    }

    /// Block-aligned plaintext still grows by one full padding block
    #[test]
    fn test_full_block_padding() {
        let key = OverlayKey::from_app_key(42);
        let plaintext = [0xAAu8; BLOCK_SIZE];
        let ciphertext = encrypt_overlay(&key, &plaintext);
        assert_eq!(ciphertext.len(), 2 * BLOCK_SIZE);
    }

    /// Same plaintext, same key, fixed IV: identical ciphertext.
    /// This property is what makes the construction weak, and also what
    /// makes it testable against captures from other peers.
    #[test]
    fn test_deterministic_ciphertext() {
        let key = OverlayKey::from_app_key(7);
        let a = encrypt_overlay(&key, b"hello overlay");
        let b = encrypt_overlay(&key, b"hello overlay");
        assert_eq!(a, b);
    }

    #[test]
    fn test_decrypt_rejects_partial_block() {
        let key = OverlayKey::from_app_key(7);
        let err = decrypt_overlay(&key, &[0u8; 17]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidLength(17)));
    }

    #[test]
    fn test_decrypt_rejects_garbage_padding() {
        let key = OverlayKey::from_app_key(7);
        // random-looking block decrypts to junk whose final byte is almost
        // surely not valid padding for this fixed input
        let result = decrypt_overlay(&key, &[0x5Au8; BLOCK_SIZE]);
        if let Ok(decrypted) = result {
            assert!(decrypted.len() < BLOCK_SIZE);
        }
    }

    #[test]
    fn test_wrong_key_does_not_roundtrip() {
        let key = OverlayKey::from_app_key(1);
        let other = OverlayKey::from_app_key(2);
        let ciphertext = encrypt_overlay(&key, b"confidential bytes here!");
        match decrypt_overlay(&other, &ciphertext) {
            Ok(decrypted) => assert_ne!(decrypted, b"confidential bytes here!"),
            Err(_) => {} // padding check usually fails first
        }
    }
}
