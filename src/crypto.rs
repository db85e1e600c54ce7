//! AES-GCM sealing for record payloads and wrapped data keys
//!
//! Every seal draws a fresh random nonce. Data keys handed out by a
//! key-management service may be 128 or 256 bits; the cipher variant
//! follows the key length.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{BackendError, Result};

pub const AES_128_KEY_SIZE: usize = 16;
pub const AES_256_KEY_SIZE: usize = 32;

/// GCM nonce length
pub const NONCE_SIZE: usize = 12;

/// GCM tag length, appended to every ciphertext
pub const TAG_SIZE: usize = 16;

/// Raw key material; wiped when dropped and never printed
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: Vec<u8>,
}

impl SecureKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Random 256-bit key
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; AES_256_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey({} bytes, redacted)", self.bytes.len())
    }
}

/// Output of one seal: the nonce and the tagged ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    pub nonce: Vec<u8>,
    /// Ciphertext followed by the GCM tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    pub fn new(nonce: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self { nonce, ciphertext }
    }

    /// Base64 of `nonce || ciphertext`
    pub fn to_base64(&self) -> String {
        let mut joined = Vec::with_capacity(self.nonce.len() + self.ciphertext.len());
        joined.extend_from_slice(&self.nonce);
        joined.extend_from_slice(&self.ciphertext);
        BASE64.encode(joined)
    }

    /// Inverse of [`to_base64`](Self::to_base64)
    pub fn from_base64(text: &str) -> Result<Self> {
        let mut raw = BASE64
            .decode(text)
            .map_err(|e| BackendError::DecryptionFailed(format!("payload is not base64: {}", e)))?;
        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(BackendError::DecryptionFailed(format!(
                "payload of {} bytes cannot hold a nonce and tag",
                raw.len()
            )));
        }
        let ciphertext = raw.split_off(NONCE_SIZE);
        Ok(Self::new(raw, ciphertext))
    }
}

type GcmNonce = Nonce<aes_gcm::aead::consts::U12>;
type AeadResult = std::result::Result<Vec<u8>, aes_gcm::Error>;

fn init_error(e: impl std::fmt::Display) -> BackendError {
    BackendError::Crypto(format!("cipher setup: {}", e))
}

enum Cipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Cipher {
    fn for_key(key: &SecureKey) -> Result<Self> {
        match key.len() {
            AES_128_KEY_SIZE => Ok(Cipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key.as_bytes()).map_err(init_error)?,
            ))),
            AES_256_KEY_SIZE => Ok(Cipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key.as_bytes()).map_err(init_error)?,
            ))),
            other => Err(BackendError::Crypto(format!(
                "data key is {} bytes, want {} or {}",
                other, AES_128_KEY_SIZE, AES_256_KEY_SIZE
            ))),
        }
    }

    fn encrypt(&self, nonce: &GcmNonce, payload: Payload<'_, '_>) -> AeadResult {
        match self {
            Cipher::Aes128(c) => c.encrypt(nonce, payload),
            Cipher::Aes256(c) => c.encrypt(nonce, payload),
        }
    }

    fn decrypt(&self, nonce: &GcmNonce, payload: Payload<'_, '_>) -> AeadResult {
        match self {
            Cipher::Aes128(c) => c.decrypt(nonce, payload),
            Cipher::Aes256(c) => c.decrypt(nonce, payload),
        }
    }
}

/// Stateless AES-GCM entry points
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Seal `plaintext` under `key` with a fresh random nonce, binding `aad`
    pub fn encrypt(key: &SecureKey, plaintext: &[u8], aad: Option<&[u8]>) -> Result<EncryptedData> {
        let cipher = Cipher::for_key(key)?;
        let mut nonce = vec![0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let payload = Payload {
            msg: plaintext,
            aad: aad.unwrap_or_default(),
        };
        let sealed = cipher
            .encrypt(GcmNonce::from_slice(&nonce), payload)
            .map_err(|e| BackendError::Crypto(format!("seal failed: {}", e)))?;
        Ok(EncryptedData::new(nonce, sealed))
    }

    /// Decrypt and authenticate; `aad` must match what was used to encrypt
    pub fn decrypt(key: &SecureKey, sealed: &EncryptedData, aad: Option<&[u8]>) -> Result<Vec<u8>> {
        let cipher = Cipher::for_key(key)?;
        if sealed.nonce.len() != NONCE_SIZE {
            return Err(BackendError::DecryptionFailed(format!(
                "nonce is {} bytes, want {}",
                sealed.nonce.len(),
                NONCE_SIZE
            )));
        }

        let payload = Payload {
            msg: &sealed.ciphertext,
            aad: aad.unwrap_or_default(),
        };
        cipher
            .decrypt(GcmNonce::from_slice(&sealed.nonce), payload)
            .map_err(|_| BackendError::DecryptionFailed("tag mismatch (tampered data or wrong key)".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &[u8] = b"roles/admin";

    #[test]
    fn test_seal_and_open() {
        let key = SecureKey::generate();
        let sealed = AesGcmCipher::encrypt(&key, b"role definition", Some(PATH)).unwrap();
        assert_eq!(sealed.nonce.len(), NONCE_SIZE);
        assert_eq!(sealed.ciphertext.len(), b"role definition".len() + TAG_SIZE);
        assert_eq!(AesGcmCipher::decrypt(&key, &sealed, Some(PATH)).unwrap(), b"role definition");

        let again = AesGcmCipher::encrypt(&key, b"role definition", Some(PATH)).unwrap();
        assert_ne!(sealed.nonce, again.nonce);
    }

    #[test]
    fn test_aes128_data_key() {
        let key = SecureKey::new(b"example key 1234".to_vec());
        let sealed = AesGcmCipher::encrypt(&key, b"short key", None).unwrap();
        assert_eq!(AesGcmCipher::decrypt(&key, &sealed, None).unwrap(), b"short key");
    }

    #[test]
    fn test_open_rejects_other_path_or_key() {
        let key = SecureKey::generate();
        let sealed = AesGcmCipher::encrypt(&key, b"value", Some(PATH)).unwrap();

        let moved = AesGcmCipher::decrypt(&key, &sealed, Some(b"roles/other"));
        assert!(matches!(moved, Err(BackendError::DecryptionFailed(_))));
        let stranger = AesGcmCipher::decrypt(&SecureKey::generate(), &sealed, Some(PATH));
        assert!(matches!(stranger, Err(BackendError::DecryptionFailed(_))));
    }

    #[test]
    fn test_odd_key_length() {
        let key = SecureKey::new(vec![7u8; 20]);
        assert!(matches!(
            AesGcmCipher::encrypt(&key, b"value", None),
            Err(BackendError::Crypto(_))
        ));
        assert_eq!(format!("{:?}", key), "SecureKey(20 bytes, redacted)");
    }

    #[test]
    fn test_base64_transport() {
        let sealed = AesGcmCipher::encrypt(&SecureKey::generate(), b"transport", None).unwrap();
        assert_eq!(EncryptedData::from_base64(&sealed.to_base64()).unwrap(), sealed);
        assert!(EncryptedData::from_base64("AAAA").is_err());
        assert!(EncryptedData::from_base64("not base64!").is_err());
    }
}
