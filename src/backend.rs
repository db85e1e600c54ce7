//! Generic storage-driver contract and its DynamoDB implementation
//!
//! [`Backend`] is what the rest of the platform programs against. Locks
//! and put-if-absent are built once, as default methods, on top of
//! `compare_and_swap`.

use async_trait::async_trait;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::DynamoConfig;
use crate::dynamo::{load_sdk_config, DynamoTables};
use crate::error::{BackendError, Result};
use crate::key_manager::{KeyManager, KeyRing, KeyService, KmsKeyService};
use crate::record::{hash_key_for, key_for_path, StorageRecord, ATTR_FULL_PATH, ATTR_HASH_KEY, ATTR_VALUE};
use crate::storage::{string_attr, Condition, Item, Query, TableService, Throughput};
use crate::table::{TableManager, TableStatus};

/// Namespace lock records live under
pub const LOCKS_PREFIX: &str = "locks";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const LIST_PAGE_SIZE: i32 = 100;

/// Precondition for [`Backend::compare_and_swap`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    /// Path never written, deleted, or logically expired. A stored empty
    /// value does not count as absent.
    Absent,
    /// Stored value equals these bytes exactly
    Value(Vec<u8>),
}

/// Path of the record backing the named lock
pub fn lock_path(name: &str) -> String {
    format!("{}/{}", LOCKS_PREFIX, name)
}

/// Storage-driver contract shared by every backend implementation
#[async_trait]
pub trait Backend: Send + Sync {
    /// Unconditional overwrite; `ttl` of `None` or zero never expires
    async fn put(&self, path: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Stored value; `NotFound` when absent or expired
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Value plus remaining lifetime (`None` when it never expires)
    async fn get_with_ttl(&self, path: &str) -> Result<(Vec<u8>, Option<Duration>)>;

    /// Remove `path`; `NotFound` only when nothing is stored
    async fn delete(&self, path: &str) -> Result<()>;

    /// Write `value` only if the stored value matches `expected`
    async fn compare_and_swap(
        &self,
        path: &str,
        expected: &Expected,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Live paths starting with `prefix`, lexically ordered. Only the
    /// partition named by the prefix's first segment is searched.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Release held resources; later calls fail with `Closed`
    async fn close(&self) -> Result<()>;

    /// Put only if absent; `AlreadyExists` otherwise
    async fn create(&self, path: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        match self.compare_and_swap(path, &Expected::Absent, value, ttl).await {
            Err(BackendError::CompareFailed(_)) => Err(BackendError::AlreadyExists(path.to_string())),
            other => other,
        }
    }

    /// Delete every live path under `prefix`, returning how many went
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut deleted = 0;
        for path in self.list(prefix).await? {
            match self.delete(&path).await {
                Ok(()) => deleted += 1,
                Err(BackendError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Block until the named lock is ours; it lapses after `ttl` unless released
    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(BackendError::BadParameter("lock ttl must be positive".into()));
        }
        let path = lock_path(name);
        let holder = Uuid::new_v4().to_string();
        loop {
            match self
                .compare_and_swap(&path, &Expected::Absent, holder.as_bytes(), Some(ttl))
                .await
            {
                Ok(()) => {
                    debug!("Acquired lock {}", name);
                    return Ok(());
                }
                Err(BackendError::CompareFailed(_)) => tokio::time::sleep(LOCK_RETRY_INTERVAL).await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop a lock taken with [`acquire_lock`](Self::acquire_lock)
    async fn release_lock(&self, name: &str) -> Result<()> {
        self.delete(&lock_path(name)).await
    }
}

/// Envelope-encrypted driver over a partition/sort-key table
pub struct DynamoBackend {
    tables: Arc<dyn TableService>,
    manager: TableManager,
    table_name: String,
    keys: KeyRing,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl DynamoBackend {
    /// Construct from the platform's textual options against AWS
    pub async fn new(params: &HashMap<String, String>) -> Result<Self> {
        let config = DynamoConfig::from_params(params)?;
        info!("Initializing DynamoDB backend: {:?}", config);

        let sdk_config = load_sdk_config(&config).await;
        let tables = Arc::new(DynamoTables::from_conf(&sdk_config, config.endpoint.as_deref()));
        let key_service = Arc::new(KmsKeyService::from_conf(&sdk_config));
        Self::open(config, tables, key_service, Arc::new(SystemClock)).await
    }

    /// Bring the table to the current schema, fetch a data key, and serve
    pub async fn open(
        config: DynamoConfig,
        tables: Arc<dyn TableService>,
        key_service: Arc<dyn KeyService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = TableManager::new(
            tables.clone(),
            Throughput {
                read_capacity: config.read_capacity,
                write_capacity: config.write_capacity,
            },
        );
        manager.ensure_ready(&config.table_name).await?;

        let keys = KeyRing::open(KeyManager::new(key_service), &config.key_alias).await?;
        info!("DynamoDB backend ready on table {}", config.table_name);

        Ok(Self {
            tables,
            manager,
            table_name: config.table_name,
            keys,
            clock,
            closed: AtomicBool::new(false),
        })
    }

    /// Name of the table this driver serves
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Lifecycle handle for operator tasks such as a manual migration
    pub fn table_manager(&self) -> &TableManager {
        &self.manager
    }

    /// Status of the served table, read fresh from the store
    pub async fn table_status(&self) -> Result<TableStatus> {
        self.manager.status(&self.table_name).await
    }

    /// Page-by-page listing; see [`PathPager`]
    pub fn list_pages(&self, prefix: &str) -> Result<PathPager<'_>> {
        self.ensure_open()?;
        Ok(PathPager {
            backend: self,
            hash_key: hash_key_for(prefix)?,
            prefix: prefix.to_string(),
            start: None,
            last_path: None,
            done: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        Ok(())
    }

    /// Stored record for `path`, expired or not, still encrypted
    async fn read_record(&self, path: &str) -> Result<Option<StorageRecord>> {
        let item = self.tables.get_item(&self.table_name, key_for_path(path)?).await?;
        item.as_ref().map(StorageRecord::from_item).transpose()
    }

    /// Decrypted, unexpired record for `path`
    async fn read_live(&self, path: &str) -> Result<StorageRecord> {
        let now = self.clock.now();
        let mut record = match self.read_record(path).await? {
            Some(record) if !record.is_expired(now) => record,
            _ => return Err(BackendError::NotFound(path.to_string())),
        };
        self.open_record(&mut record).await?;
        Ok(record)
    }

    async fn open_record(&self, record: &mut StorageRecord) -> Result<()> {
        let wrapped = record
            .wrapped_key()
            .map_err(|e| with_path(&record.full_path, e))?;
        let key = self.keys.plaintext_for(&wrapped).await?;
        record.decrypt(&key).map_err(|e| with_path(&record.full_path, e))
    }

    fn sealed_record(&self, path: &str, value: &[u8], ttl: Option<Duration>) -> Result<StorageRecord> {
        let ttl = ttl.filter(|t| !t.is_zero());
        let mut record = StorageRecord::new(path, value, ttl, self.clock.now())?;
        let data_key = self.keys.current();
        record.encrypt(&data_key.plaintext, &data_key.ciphertext_blob, &data_key.key_id)?;
        Ok(record)
    }
}

fn with_path(path: &str, err: BackendError) -> BackendError {
    match err {
        BackendError::DecryptionFailed(msg) => BackendError::DecryptionFailed(format!("{}: {}", path, msg)),
        other => other,
    }
}

#[async_trait]
impl Backend for DynamoBackend {
    async fn put(&self, path: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        let record = self.sealed_record(path, value, ttl)?;
        self.tables
            .put_item(&self.table_name, record.to_item(), Condition::Always)
            .await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        Ok(self.read_live(path).await?.value)
    }

    async fn get_with_ttl(&self, path: &str) -> Result<(Vec<u8>, Option<Duration>)> {
        self.ensure_open()?;
        let record = self.read_live(path).await?;
        let ttl = record.remaining_ttl(self.clock.now());
        Ok((record.value, ttl))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        match self.tables.delete_item(&self.table_name, key_for_path(path)?).await? {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(path.to_string())),
        }
    }

    async fn compare_and_swap(
        &self,
        path: &str,
        expected: &Expected,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.ensure_open()?;
        let now = self.clock.now();
        let current = self.read_record(path).await?;
        let compare_failed = |why: &str| BackendError::CompareFailed(format!("{}: {}", path, why));

        // the condition pins the exact ciphertext we judged, so a writer
        // that slipped in between makes the put fail at the store
        let condition = match (expected, current) {
            (Expected::Absent, None) => Condition::AttributeNotExists(ATTR_FULL_PATH.to_string()),
            (Expected::Absent, Some(stored)) if stored.is_expired(now) => {
                Condition::AttributeEquals(ATTR_VALUE.to_string(), AttributeValue::B(Blob::new(stored.value)))
            }
            (Expected::Absent, Some(_)) => return Err(compare_failed("value exists")),
            (Expected::Value(_), None) => return Err(compare_failed("value is absent")),
            (Expected::Value(_), Some(stored)) if stored.is_expired(now) => {
                return Err(compare_failed("value has expired"))
            }
            (Expected::Value(want), Some(mut stored)) => {
                let ciphertext = stored.value.clone();
                self.open_record(&mut stored).await?;
                if stored.value != *want {
                    return Err(compare_failed("value differs"));
                }
                Condition::AttributeEquals(ATTR_VALUE.to_string(), AttributeValue::B(Blob::new(ciphertext)))
            }
        };

        let record = self.sealed_record(path, value, ttl)?;
        match self.tables.put_item(&self.table_name, record.to_item(), condition).await {
            Err(BackendError::CompareFailed(_)) => Err(compare_failed("concurrent modification")),
            other => other,
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut pager = self.list_pages(prefix)?;
        let mut paths = Vec::new();
        while let Some(page) = pager.next_page().await? {
            paths.extend(page);
        }
        Ok(paths)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("DynamoDB backend on table {} closed", self.table_name);
        }
        Ok(())
    }
}

/// Lazy listing of one partition, one query page at a time
///
/// Abandon it at any page boundary; nothing needs cleaning up. To pick up
/// later, keep [`cursor`](Self::cursor) and pass it to
/// [`resume_after`](Self::resume_after) on a fresh pager.
pub struct PathPager<'a> {
    backend: &'a DynamoBackend,
    hash_key: String,
    prefix: String,
    start: Option<Item>,
    last_path: Option<String>,
    done: bool,
}

impl<'a> PathPager<'a> {
    /// Next batch of live paths, `None` when exhausted
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>> {
        self.backend.ensure_open()?;
        if self.done {
            return Ok(None);
        }

        let query = Query {
            hash_attribute: ATTR_HASH_KEY.to_string(),
            hash_value: self.hash_key.clone(),
            range_attribute: ATTR_FULL_PATH.to_string(),
            range_prefix: self.prefix.clone(),
            start: self.start.clone(),
            limit: LIST_PAGE_SIZE,
        };
        let page = self.backend.tables.query(&self.backend.table_name, query).await?;

        let now = self.backend.clock.now();
        let mut paths = Vec::with_capacity(page.items.len());
        for item in &page.items {
            let record = StorageRecord::from_item(item)?;
            self.last_path = Some(record.full_path.clone());
            if !record.is_expired(now) {
                paths.push(record.full_path);
            }
        }

        match page.last_evaluated_key {
            Some(key) if string_attr(&key, ATTR_FULL_PATH).is_some() => self.start = Some(key),
            _ => self.done = true,
        }
        Ok(Some(paths))
    }

    /// Last path examined so far
    pub fn cursor(&self) -> Option<&str> {
        self.last_path.as_deref()
    }

    /// Continue after `path`, typically a saved [`cursor`](Self::cursor)
    pub fn resume_after(mut self, path: &str) -> Result<Self> {
        self.start = Some(key_for_path(path)?);
        self.last_path = Some(path.to_string());
        self.done = false;
        Ok(self)
    }
}
