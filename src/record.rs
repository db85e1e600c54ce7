//! Storage record layout and the value codec
//!
//! A logical `(path, value, ttl)` triple becomes one item with the
//! attributes below. `Value` always holds an [`EncryptedEnvelope`] once a
//! record has gone through [`StorageRecord::encrypt`].

use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::crypto::SecureKey;
use crate::envelope::EncryptedEnvelope;
use crate::error::{BackendError, Result};
use crate::storage::{string_attr, Item};

/// Partition key of the current schema
pub const ATTR_HASH_KEY: &str = "HashKey";
/// Sort key of the current schema
pub const ATTR_FULL_PATH: &str = "FullPath";
/// Sole key of the legacy schema
pub const ATTR_LEGACY_KEY: &str = "Key";
pub const ATTR_VALUE: &str = "Value";
/// Write time, epoch milliseconds
pub const ATTR_TIMESTAMP: &str = "Timestamp";
/// Lifetime at write time, milliseconds
pub const ATTR_TTL: &str = "TTL";
/// Native expiration attribute, epoch seconds
pub const ATTR_EXPIRES: &str = "Expires";

/// Partition key for `path`: its first non-empty segment
pub fn hash_key_for(path: &str) -> Result<String> {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BackendError::BadParameter(format!("path {:?} has no top-level segment", path)))
}

/// Primary key of the current schema for `path`
pub fn key_for_path(path: &str) -> Result<Item> {
    Ok(Item::from([
        (ATTR_HASH_KEY.to_string(), AttributeValue::S(hash_key_for(path)?)),
        (ATTR_FULL_PATH.to_string(), AttributeValue::S(path.to_string())),
    ]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    pub hash_key: String,
    pub full_path: String,
    pub value: Vec<u8>,
    pub timestamp: i64,
    pub ttl: Option<Duration>,
}

impl StorageRecord {
    /// Plaintext record for `path` written at `now`
    pub fn new(path: &str, value: &[u8], ttl: Option<Duration>, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            hash_key: hash_key_for(path)?,
            full_path: path.to_string(),
            value: value.to_vec(),
            timestamp: now.timestamp_millis(),
            ttl,
        })
    }

    /// Absolute expiry in epoch milliseconds
    pub fn expires_at_millis(&self) -> Option<i64> {
        self.ttl
            .map(|ttl| self.timestamp.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64))
    }

    /// Absolute expiry in epoch seconds, rounded up, for the store's reaper
    pub fn expires_at_seconds(&self) -> Option<i64> {
        self.expires_at_millis().map(|ms| ms.div_euclid(1000) + i64::from(ms.rem_euclid(1000) != 0))
    }

    /// Logical expiry; holds even if the store has not reaped the item yet
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at_millis()
            .map_or(false, |at| at <= now.timestamp_millis())
    }

    /// Lifetime left at `now`; `None` when the record never expires
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at_millis().map(|at| {
            let left = at.saturating_sub(now.timestamp_millis()).max(0);
            Duration::from_millis(left as u64)
        })
    }

    /// Replace `value` with an envelope sealed under the data key
    ///
    /// A fresh nonce is drawn on every call, so the same value never
    /// encrypts to the same bytes twice. The full path is bound as
    /// associated data.
    pub fn encrypt(&mut self, plaintext_key: &SecureKey, wrapped_key: &[u8], key_id: &str) -> Result<()> {
        let envelope = EncryptedEnvelope::seal(
            plaintext_key,
            wrapped_key,
            key_id,
            &self.value,
            self.full_path.as_bytes(),
        )?;
        self.value = envelope.to_bytes()?;
        Ok(())
    }

    /// Reverse of [`encrypt`](Self::encrypt)
    pub fn decrypt(&mut self, plaintext_key: &SecureKey) -> Result<()> {
        let envelope = EncryptedEnvelope::from_bytes(&self.value)?;
        self.value = envelope.open(plaintext_key, self.full_path.as_bytes())?;
        Ok(())
    }

    /// Wrapped data key carried by an encrypted value
    pub fn wrapped_key(&self) -> Result<Vec<u8>> {
        EncryptedEnvelope::from_bytes(&self.value)?.wrapped_key()
    }

    /// Item under the current schema, `Expires` included when a TTL is set
    pub fn to_item(&self) -> Item {
        let mut item = Item::from([
            (ATTR_HASH_KEY.to_string(), AttributeValue::S(self.hash_key.clone())),
            (ATTR_FULL_PATH.to_string(), AttributeValue::S(self.full_path.clone())),
            (ATTR_VALUE.to_string(), AttributeValue::B(Blob::new(self.value.clone()))),
            (ATTR_TIMESTAMP.to_string(), AttributeValue::N(self.timestamp.to_string())),
        ]);
        if let Some(ttl) = self.ttl {
            item.insert(ATTR_TTL.to_string(), AttributeValue::N(ttl.as_millis().to_string()));
        }
        if let Some(expires) = self.expires_at_seconds() {
            item.insert(ATTR_EXPIRES.to_string(), AttributeValue::N(expires.to_string()));
        }
        item
    }

    /// Parse an item stored under the current schema
    pub fn from_item(item: &Item) -> Result<Self> {
        let full_path = string_attr(item, ATTR_FULL_PATH)
            .ok_or_else(|| malformed(ATTR_FULL_PATH))?
            .to_string();
        let hash_key = string_attr(item, ATTR_HASH_KEY)
            .ok_or_else(|| malformed(ATTR_HASH_KEY))?
            .to_string();
        Self::from_parts(hash_key, full_path, item)
    }

    /// Shape of the same record under the legacy single-key schema
    pub fn to_legacy_item(&self) -> Item {
        let mut item = self.to_item();
        item.remove(ATTR_HASH_KEY);
        if let Some(path) = item.remove(ATTR_FULL_PATH) {
            item.insert(ATTR_LEGACY_KEY.to_string(), path);
        }
        item
    }

    fn from_parts(hash_key: String, full_path: String, item: &Item) -> Result<Self> {
        let value = item
            .get(ATTR_VALUE)
            .and_then(|v| v.as_b().ok())
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| malformed(ATTR_VALUE))?;
        let timestamp = number_attr(item, ATTR_TIMESTAMP)?.ok_or_else(|| malformed(ATTR_TIMESTAMP))?;
        let ttl = number_attr(item, ATTR_TTL)?.map(|ms| Duration::from_millis(ms.max(0) as u64));

        Ok(Self {
            hash_key,
            full_path,
            value,
            timestamp,
            ttl,
        })
    }
}

/// Re-key a legacy item for the current schema
///
/// Every non-key attribute is carried over untouched, ciphertext included.
pub fn rekey_legacy_item(item: &Item) -> Result<Item> {
    let path = string_attr(item, ATTR_LEGACY_KEY).ok_or_else(|| malformed(ATTR_LEGACY_KEY))?;
    let mut rekeyed: Item = item
        .iter()
        .filter(|(name, _)| name.as_str() != ATTR_LEGACY_KEY)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    rekeyed.insert(ATTR_HASH_KEY.to_string(), AttributeValue::S(hash_key_for(path)?));
    rekeyed.insert(ATTR_FULL_PATH.to_string(), AttributeValue::S(path.to_string()));
    Ok(rekeyed)
}

fn number_attr(item: &Item, name: &str) -> Result<Option<i64>> {
    match item.get(name) {
        None => Ok(None),
        Some(AttributeValue::N(raw)) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|e| BackendError::Serialization(format!("attribute {} = {:?}: {}", name, raw, e))),
        Some(_) => Err(malformed(name)),
    }
}

fn malformed(attribute: &str) -> BackendError {
    BackendError::Serialization(format!("missing or mistyped attribute {}", attribute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const JSON: &[u8] = br#"{"some":"json","data":true}"#;

    fn sample() -> StorageRecord {
        StorageRecord {
            hash_key: "a".into(),
            full_path: "a/directory/path".into(),
            value: JSON.to_vec(),
            timestamp: 1_505_543_201_000,
            ttl: Some(Duration::from_secs(1)),
        }
    }

    #[test]
    fn test_hash_key_for() {
        assert_eq!(hash_key_for("a/directory/path").unwrap(), "a");
        assert_eq!(hash_key_for("/roles/admin").unwrap(), "roles");
        assert_eq!(hash_key_for("single").unwrap(), "single");
        assert!(hash_key_for("").is_err());
        assert!(hash_key_for("///").is_err());
    }

    #[test]
    fn test_encrypt_is_not_deterministic() {
        let key = SecureKey::new(b"example key 1234".to_vec());
        let mut record = sample();

        record.encrypt(&key, b"encrypteddatakey", "abcde-12345").unwrap();
        assert_ne!(record.value, JSON);
        let first = record.value.clone();
        assert_eq!(record.wrapped_key().unwrap(), b"encrypteddatakey");

        record.decrypt(&key).unwrap();
        assert_eq!(record.value, JSON);

        record.encrypt(&key, b"encrypteddatakey", "abcde-12345").unwrap();
        assert_ne!(record.value, first);
    }

    #[test]
    fn test_decrypt_rejects_plaintext_and_wrong_key() {
        let mut plain = sample();
        assert!(matches!(
            plain.decrypt(&SecureKey::generate()),
            Err(BackendError::DecryptionFailed(_))
        ));

        let mut record = sample();
        record.encrypt(&SecureKey::generate(), b"blob", "k").unwrap();
        assert!(matches!(
            record.decrypt(&SecureKey::generate()),
            Err(BackendError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_expiry() {
        let record = sample();
        let written = Utc.timestamp_millis_opt(record.timestamp).unwrap();
        assert!(!record.is_expired(written));
        assert_eq!(record.remaining_ttl(written), Some(Duration::from_secs(1)));
        assert!(record.is_expired(written + chrono::Duration::seconds(1)));
        assert_eq!(
            record.remaining_ttl(written + chrono::Duration::seconds(5)),
            Some(Duration::ZERO)
        );

        let forever = StorageRecord { ttl: None, ..sample() };
        assert!(!forever.is_expired(written + chrono::Duration::days(3650)));
        assert_eq!(forever.remaining_ttl(written), None);
    }

    #[test]
    fn test_expires_rounds_up() {
        let mut record = sample();
        record.timestamp = 10_500;
        assert_eq!(record.expires_at_seconds(), Some(12));
        record.timestamp = 10_000;
        assert_eq!(record.expires_at_seconds(), Some(11));
    }

    #[test]
    fn test_item_conversion() {
        let record = sample();
        let item = record.to_item();
        assert!(item.contains_key(ATTR_EXPIRES));
        assert_eq!(StorageRecord::from_item(&item).unwrap(), record);

        let mut broken = item.clone();
        broken.insert(ATTR_TIMESTAMP.into(), AttributeValue::S("yesterday".into()));
        assert!(StorageRecord::from_item(&broken).is_err());
    }

    #[test]
    fn test_rekey_legacy_item() {
        let record = sample();
        let legacy = record.to_legacy_item();
        assert!(!legacy.contains_key(ATTR_HASH_KEY));
        assert_eq!(string_attr(&legacy, ATTR_LEGACY_KEY), Some("a/directory/path"));

        let rekeyed = rekey_legacy_item(&legacy).unwrap();
        assert_eq!(rekeyed, record.to_item());
        assert!(rekey_legacy_item(&record.to_item()).is_err());
    }
}
