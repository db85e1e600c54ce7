//! Key management: data keys wrapped by a key-management service
//!
//! A [`KeyService`] hands out data keys (plaintext + wrapped blob) and
//! unwraps blobs it produced earlier. [`KeyManager`] is the thin, stateless
//! front the rest of the driver talks to; [`KeyRing`] is the per-backend
//! cache: the current data key plus every key unwrapped so far.

use async_trait::async_trait;
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::{AesGcmCipher, EncryptedData, SecureKey};
use crate::error::{BackendError, Result};

/// Data key as returned by the key service
#[derive(Debug, Clone)]
pub struct DataKey {
    /// Raw key material, process memory only
    pub plaintext: SecureKey,
    /// The same key wrapped by the service; safe to persist
    pub ciphertext_blob: Vec<u8>,
    /// Identifier of the wrapping key
    pub key_id: String,
}

/// Remote key-management service
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Generate a new data key wrapped under `key_alias`
    async fn generate_data_key(&self, key_alias: &str) -> Result<DataKey>;

    /// Unwrap a blob previously returned by `generate_data_key`
    async fn decrypt(&self, ciphertext_blob: &[u8]) -> Result<SecureKey>;
}

/// Front for a key service; carries no state of its own
#[derive(Clone)]
pub struct KeyManager {
    service: Arc<dyn KeyService>,
}

impl KeyManager {
    pub fn new(service: Arc<dyn KeyService>) -> Self {
        Self { service }
    }

    pub async fn generate_data_key(&self, key_alias: &str) -> Result<DataKey> {
        debug!("Generating data key under {}", key_alias);
        let data_key = self.service.generate_data_key(key_alias).await?;
        info!(
            "Generated data key under {} (wrapping key {})",
            key_alias, data_key.key_id
        );
        Ok(data_key)
    }

    pub async fn decrypt(&self, ciphertext_blob: &[u8]) -> Result<SecureKey> {
        debug!("Unwrapping data key ({} byte blob)", ciphertext_blob.len());
        self.service.decrypt(ciphertext_blob).await
    }
}

/// Per-backend key cache
///
/// The current data key never changes after `open`. Keys found in records
/// written by other processes are unwrapped once and kept for the life of
/// the ring.
pub struct KeyRing {
    manager: KeyManager,
    current: DataKey,
    unwrapped: RwLock<HashMap<Vec<u8>, SecureKey>>,
}

impl KeyRing {
    pub async fn open(manager: KeyManager, key_alias: &str) -> Result<Self> {
        let current = manager.generate_data_key(key_alias).await?;
        Ok(Self::with_data_key(manager, current))
    }

    pub fn with_data_key(manager: KeyManager, current: DataKey) -> Self {
        Self {
            manager,
            current,
            unwrapped: RwLock::new(HashMap::new()),
        }
    }

    pub fn current(&self) -> &DataKey {
        &self.current
    }

    /// Plaintext key for a wrapped blob, unwrapping through the service on first sight
    pub async fn plaintext_for(&self, ciphertext_blob: &[u8]) -> Result<SecureKey> {
        if ciphertext_blob == self.current.ciphertext_blob.as_slice() {
            return Ok(self.current.plaintext.clone());
        }
        let cached = self.unwrapped.read().get(ciphertext_blob).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }

        let key = self.manager.decrypt(ciphertext_blob).await?;
        self.unwrapped
            .write()
            .insert(ciphertext_blob.to_vec(), key.clone());
        Ok(key)
    }

    pub fn cached_keys(&self) -> usize {
        self.unwrapped.read().len()
    }
}

/// AWS KMS-backed key service
pub struct KmsKeyService {
    client: aws_sdk_kms::Client,
}

impl KmsKeyService {
    pub fn new(client: aws_sdk_kms::Client) -> Self {
        Self { client }
    }

    pub fn from_conf(config: &aws_config::SdkConfig) -> Self {
        Self::new(aws_sdk_kms::Client::new(config))
    }
}

#[async_trait]
impl KeyService for KmsKeyService {
    async fn generate_data_key(&self, key_alias: &str) -> Result<DataKey> {
        let output = self
            .client
            .generate_data_key()
            .key_id(key_alias)
            .key_spec(DataKeySpec::Aes256)
            .send()
            .await
            .map_err(|e| kms_error("generate data key", key_alias, e))?;

        let plaintext = output.plaintext().ok_or_else(|| {
            BackendError::KeyServiceUnavailable("generate data key returned no plaintext".into())
        })?;
        let ciphertext_blob = output.ciphertext_blob().ok_or_else(|| {
            BackendError::KeyServiceUnavailable("generate data key returned no ciphertext".into())
        })?;

        Ok(DataKey {
            plaintext: SecureKey::new(plaintext.as_ref().to_vec()),
            ciphertext_blob: ciphertext_blob.as_ref().to_vec(),
            key_id: output.key_id().unwrap_or(key_alias).to_string(),
        })
    }

    async fn decrypt(&self, ciphertext_blob: &[u8]) -> Result<SecureKey> {
        let output = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(ciphertext_blob.to_vec()))
            .send()
            .await
            .map_err(|e| kms_error("decrypt", "data key", e))?;

        let plaintext = output.plaintext().ok_or_else(|| {
            BackendError::KeyServiceUnavailable("decrypt returned no plaintext".into())
        })?;
        Ok(SecureKey::new(plaintext.as_ref().to_vec()))
    }
}

fn kms_error<E, R>(op: &str, target: &str, err: SdkError<E, R>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = err.as_service_error().and_then(|e| e.code()).map(str::to_string);
    let message = format!("{} {}: {}", op, target, DisplayErrorContext(&err));
    match code.as_deref() {
        Some("NotFoundException") => BackendError::KeyNotFound(message),
        Some("AccessDeniedException")
        | Some("DisabledException")
        | Some("KMSInvalidStateException")
        | Some("IncorrectKeyException") => BackendError::AccessDenied(message),
        Some("InvalidCiphertextException") => BackendError::DecryptionFailed(message),
        _ => BackendError::KeyServiceUnavailable(message),
    }
}

/// Wrapped blob layout used by [`LocalKeyService`]
#[derive(Serialize, Deserialize)]
struct LocalBlob {
    key_id: String,
    data: String,
}

struct MasterKey {
    key_id: String,
    key: SecureKey,
}

/// In-process key service: one random master key per alias wraps data keys
/// with AES-GCM. For development and tests; master keys die with the process.
pub struct LocalKeyService {
    masters: RwLock<HashMap<String, MasterKey>>,
    unavailable: AtomicBool,
}

impl LocalKeyService {
    pub fn new() -> Self {
        Self {
            masters: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn with_alias(key_alias: &str) -> Self {
        let service = Self::new();
        service.add_alias(key_alias);
        service
    }

    /// Register a fresh master key under `key_alias`, returning its key id
    pub fn add_alias(&self, key_alias: &str) -> String {
        let key_id = Uuid::new_v4().to_string();
        self.masters.write().insert(
            key_alias.to_string(),
            MasterKey {
                key_id: key_id.clone(),
                key: SecureKey::generate(),
            },
        );
        key_id
    }

    /// Simulate an outage: every call fails with `KeyServiceUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::KeyServiceUnavailable(
                "local key service is offline".into(),
            ));
        }
        Ok(())
    }
}

impl Default for LocalKeyService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyService for LocalKeyService {
    async fn generate_data_key(&self, key_alias: &str) -> Result<DataKey> {
        self.check_available()?;
        let masters = self.masters.read();
        let master = masters
            .get(key_alias)
            .ok_or_else(|| BackendError::KeyNotFound(key_alias.to_string()))?;

        let dek = SecureKey::generate();
        let wrapped = AesGcmCipher::encrypt(&master.key, dek.as_bytes(), Some(master.key_id.as_bytes()))?;
        let blob = serde_json::to_vec(&LocalBlob {
            key_id: master.key_id.clone(),
            data: wrapped.to_base64(),
        })?;

        Ok(DataKey {
            plaintext: dek,
            ciphertext_blob: blob,
            key_id: master.key_id.clone(),
        })
    }

    async fn decrypt(&self, ciphertext_blob: &[u8]) -> Result<SecureKey> {
        self.check_available()?;
        let blob: LocalBlob = serde_json::from_slice(ciphertext_blob)
            .map_err(|e| BackendError::DecryptionFailed(format!("unrecognized key blob: {}", e)))?;

        let masters = self.masters.read();
        let master = masters
            .values()
            .find(|m| m.key_id == blob.key_id)
            .ok_or_else(|| BackendError::KeyNotFound(blob.key_id.clone()))?;

        let wrapped = EncryptedData::from_base64(&blob.data)?;
        let dek = AesGcmCipher::decrypt(&master.key, &wrapped, Some(master.key_id.as_bytes()))?;
        Ok(SecureKey::new(dek))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALIAS: &str = "alias/test";

    #[tokio::test]
    async fn test_generate_and_unwrap() {
        let service = LocalKeyService::with_alias(ALIAS);
        let data_key = service.generate_data_key(ALIAS).await.unwrap();
        assert_eq!(data_key.plaintext.len(), 32);

        let unwrapped = service.decrypt(&data_key.ciphertext_blob).await.unwrap();
        assert_eq!(unwrapped.as_bytes(), data_key.plaintext.as_bytes());
    }

    #[tokio::test]
    async fn test_unknown_alias() {
        let service = LocalKeyService::new();
        let err = service.generate_data_key("alias/missing").await.unwrap_err();
        assert!(matches!(err, BackendError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let service = LocalKeyService::with_alias(ALIAS);
        service.set_unavailable(true);
        let err = service.generate_data_key(ALIAS).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_tampered_blob() {
        let service = LocalKeyService::with_alias(ALIAS);
        let err = service.decrypt(b"not a blob").await.unwrap_err();
        assert!(matches!(err, BackendError::DecryptionFailed(_)));
    }

    #[tokio::test]
    async fn test_key_ring_caches_foreign_keys() {
        let service = Arc::new(LocalKeyService::with_alias(ALIAS));
        let manager = KeyManager::new(service.clone());
        let ring = KeyRing::open(manager, ALIAS).await.unwrap();

        // current key never goes to the service
        let current = ring.current().clone();
        let key = ring.plaintext_for(&current.ciphertext_blob).await.unwrap();
        assert_eq!(key.as_bytes(), current.plaintext.as_bytes());
        assert_eq!(ring.cached_keys(), 0);

        // a key from an earlier process is unwrapped once
        let older = service.generate_data_key(ALIAS).await.unwrap();
        let key = ring.plaintext_for(&older.ciphertext_blob).await.unwrap();
        assert_eq!(key.as_bytes(), older.plaintext.as_bytes());
        assert_eq!(ring.cached_keys(), 1);

        service.set_unavailable(true);
        let key = ring.plaintext_for(&older.ciphertext_blob).await.unwrap();
        assert_eq!(key.as_bytes(), older.plaintext.as_bytes());
    }
}
