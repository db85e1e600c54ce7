pub mod backend;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod key_manager;
pub mod record;
pub mod storage;
pub mod table;

// DynamoDB and KMS wiring
pub mod dynamo;

pub use backend::{lock_path, Backend, DynamoBackend, Expected, PathPager, LOCKS_PREFIX};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DynamoConfig;
pub use crypto::{AesGcmCipher, EncryptedData, SecureKey, AES_128_KEY_SIZE, AES_256_KEY_SIZE, NONCE_SIZE};
pub use envelope::{EncryptedEnvelope, ENVELOPE_VERSION};
pub use error::{BackendError, Result};
pub use key_manager::{DataKey, KeyManager, KeyRing, KeyService, KmsKeyService, LocalKeyService};
pub use record::{hash_key_for, key_for_path, StorageRecord};
pub use storage::{Condition, InMemoryTables, Item, KeySchema, Page, Query, TableDescription, TableService, Throughput};
pub use table::{SchemaGeneration, TableManager, TableStatus};

pub use dynamo::{load_sdk_config, DynamoTables};
