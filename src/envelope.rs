use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::crypto::{AesGcmCipher, EncryptedData, SecureKey};
use crate::error::{BackendError, Result};

pub const ENVELOPE_VERSION: u8 = 1;

/// Stored form of an encrypted value: the ciphertext plus everything a
/// reader with key-service access needs to rebuild the data key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(rename = "v")]
    pub version: u8,
    /// Wrapping key id reported by the key service
    pub key_id: String,
    /// Base64 of the wrapped data key
    pub wrapped_key: String,
    /// Base64 of `nonce || ciphertext || tag`
    pub payload: String,
}

impl EncryptedEnvelope {
    /// Encrypt `plaintext` under `key`, binding it to `aad`
    pub fn seal(
        key: &SecureKey,
        wrapped_key: &[u8],
        key_id: &str,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Self> {
        let encrypted = AesGcmCipher::encrypt(key, plaintext, Some(aad))?;
        Ok(Self {
            version: ENVELOPE_VERSION,
            key_id: key_id.to_string(),
            wrapped_key: STANDARD.encode(wrapped_key),
            payload: encrypted.to_base64(),
        })
    }

    pub fn open(&self, key: &SecureKey, aad: &[u8]) -> Result<Vec<u8>> {
        let encrypted = EncryptedData::from_base64(&self.payload)?;
        AesGcmCipher::decrypt(key, &encrypted, Some(aad))
    }

    pub fn wrapped_key(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.wrapped_key)
            .map_err(|e| BackendError::DecryptionFailed(format!("invalid wrapped key: {}", e)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(BackendError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(|e| {
            BackendError::DecryptionFailed(format!("unrecognized ciphertext format: {}", e))
        })?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(BackendError::DecryptionFailed(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}
