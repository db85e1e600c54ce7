//! Table lifecycle and the legacy → current schema migration
//!
//! Status is always derived from what the store reports, never cached:
//!
//! ```text
//! Missing ──create──▶ OK
//! NeedsMigration ──migrate──▶ Migrating ──▶ OK
//! ```
//!
//! A `<table>.migrating` working table marks an attempt that has not
//! finished; re-running [`TableManager::migrate`] picks it up from there.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{BackendError, Result};
use crate::record::{
    rekey_legacy_item, ATTR_EXPIRES, ATTR_FULL_PATH, ATTR_HASH_KEY, ATTR_LEGACY_KEY,
};
use crate::storage::{Condition, Item, KeySchema, TableService, Throughput};

/// Suffix of the safety copy taken before a migration
pub const BACKUP_SUFFIX: &str = ".bak";
/// Suffix of the working table a migration fills before the swap
pub const WORKING_SUFFIX: &str = ".migrating";

const SCAN_PAGE_SIZE: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Missing,
    NeedsMigration,
    Migrating,
    Ok,
}

impl std::fmt::Display for TableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableStatus::Missing => write!(f, "missing"),
            TableStatus::NeedsMigration => write!(f, "needs migration"),
            TableStatus::Migrating => write!(f, "migrating"),
            TableStatus::Ok => write!(f, "ok"),
        }
    }
}

/// The two key layouts this driver knows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaGeneration {
    /// Single hash key holding the full path
    Legacy,
    /// Hash key = top-level namespace, range key = full path
    Current,
}

impl SchemaGeneration {
    pub fn key_schema(self) -> KeySchema {
        match self {
            SchemaGeneration::Legacy => KeySchema::hash(ATTR_LEGACY_KEY),
            SchemaGeneration::Current => KeySchema::hash_range(ATTR_HASH_KEY, ATTR_FULL_PATH),
        }
    }

    /// Match a declared key schema against the known fingerprints
    pub fn recognize(schema: &KeySchema) -> Option<Self> {
        [SchemaGeneration::Legacy, SchemaGeneration::Current]
            .into_iter()
            .find(|generation| generation.key_schema() == *schema)
    }
}

pub fn backup_table_name(table: &str) -> String {
    format!("{}{}", table, BACKUP_SUFFIX)
}

pub fn working_table_name(table: &str) -> String {
    format!("{}{}", table, WORKING_SUFFIX)
}

/// Owns table creation, inspection, deletion and migration
#[derive(Clone)]
pub struct TableManager {
    tables: Arc<dyn TableService>,
    throughput: Throughput,
}

impl TableManager {
    pub fn new(tables: Arc<dyn TableService>, throughput: Throughput) -> Self {
        Self { tables, throughput }
    }

    /// Generation of `table`'s key schema, `None` if the table is absent
    async fn generation(&self, table: &str) -> Result<Option<SchemaGeneration>> {
        let Some(description) = self.tables.describe_table(table).await? else {
            return Ok(None);
        };
        SchemaGeneration::recognize(&description.key_schema)
            .map(Some)
            .ok_or_else(|| BackendError::UnsupportedSchema {
                table: table.to_string(),
                detail: description.key_schema.to_string(),
            })
    }

    /// Current status of `table`, computed fresh from the store
    pub async fn status(&self, table: &str) -> Result<TableStatus> {
        if self.generation(&working_table_name(table)).await?.is_some() {
            return Ok(TableStatus::Migrating);
        }
        Ok(match self.generation(table).await? {
            None => TableStatus::Missing,
            Some(SchemaGeneration::Legacy) => TableStatus::NeedsMigration,
            Some(SchemaGeneration::Current) => TableStatus::Ok,
        })
    }

    /// Create `table` with the given layout; a no-op if it already has it
    pub async fn create_table(&self, table: &str, generation: SchemaGeneration) -> Result<()> {
        self.create(table, generation, true).await
    }

    async fn create(&self, table: &str, generation: SchemaGeneration, native_ttl: bool) -> Result<()> {
        let schema = generation.key_schema();
        if let Some(description) = self.tables.describe_table(table).await? {
            if description.key_schema == schema {
                debug!("Table {} already exists with schema {}", table, schema);
                return Ok(());
            }
            return Err(BackendError::SchemaConflict {
                table: table.to_string(),
                detail: format!("found {}, wanted {}", description.key_schema, schema),
            });
        }

        info!("Creating table {} with schema {}", table, schema);
        match self.tables.create_table(table, &schema, self.throughput).await {
            Ok(()) => {}
            // lost a race with another creator; re-check the shape it chose
            Err(BackendError::AlreadyExists(_)) => {
                return match self.tables.describe_table(table).await? {
                    Some(d) if d.key_schema == schema => Ok(()),
                    _ => Err(BackendError::SchemaConflict {
                        table: table.to_string(),
                        detail: format!("created concurrently with a schema other than {}", schema),
                    }),
                };
            }
            Err(e) => return Err(e),
        }

        if native_ttl {
            self.tables.enable_ttl(table, ATTR_EXPIRES).await?;
        }
        Ok(())
    }

    /// Drop `table`; a missing table is an error unless `ignore_not_found`
    pub async fn delete_table(&self, table: &str, ignore_not_found: bool) -> Result<()> {
        info!("Deleting table {}", table);
        match self.tables.delete_table(table).await {
            Err(BackendError::TableNotFound(_)) if ignore_not_found => Ok(()),
            other => other,
        }
    }

    /// Bring `table` to `Ok` before it serves traffic
    pub async fn ensure_ready(&self, table: &str) -> Result<TableStatus> {
        let status = self.status(table).await?;
        info!("Table {} status: {}", table, status);
        match status {
            TableStatus::Ok => {}
            TableStatus::Missing => self.create_table(table, SchemaGeneration::Current).await?,
            TableStatus::NeedsMigration | TableStatus::Migrating => self.migrate(table).await?,
        }
        Ok(TableStatus::Ok)
    }

    /// Move `table` from the legacy to the current key schema
    ///
    /// 1. copy every legacy item into `<table>.bak`
    /// 2. create `<table>.migrating` with the current schema
    /// 3. copy every legacy item into it, re-keyed
    /// 4. swap: drop the legacy table, recreate it with the current
    ///    schema, copy the working table in, drop the working table
    ///
    /// Live traffic keeps hitting the legacy table until step 4. While the
    /// legacy table exists a retry starts over from step 1 with fresh
    /// backup and working tables; once it is gone the retry resumes step 4.
    /// The backup table is left for the operator to remove.
    pub async fn migrate(&self, table: &str) -> Result<()> {
        let working = working_table_name(table);
        let working_exists = self.generation(&working).await?.is_some();

        match self.generation(table).await? {
            Some(SchemaGeneration::Legacy) => {
                let backup = backup_table_name(table);
                info!("Migrating table {} (backup {}, working {})", table, backup, working);

                // leftovers of an earlier attempt may hold items deleted since
                if working_exists {
                    warn!("Discarding stale working table {}", working);
                    self.delete_table(&working, true).await?;
                }
                self.delete_table(&backup, true).await?;

                self.create(&backup, SchemaGeneration::Legacy, false).await?;
                let copied = self.copy_items(table, &backup, Condition::Always, |item| Ok(item)).await?;
                info!("Backed up {} items from {} to {}", copied, table, backup);

                self.create(&working, SchemaGeneration::Current, false).await?;
                let copied = self
                    .copy_items(table, &working, Condition::Always, |item| rekey_legacy_item(&item))
                    .await?;
                info!("Re-keyed {} items from {} into {}", copied, table, working);

                self.delete_table(table, true).await?;
                self.finish_swap(table, &working).await
            }
            Some(SchemaGeneration::Current) | None if working_exists => {
                warn!("Resuming interrupted migration of table {}", table);
                self.finish_swap(table, &working).await
            }
            Some(SchemaGeneration::Current) => {
                debug!("Table {} already uses the current schema", table);
                Ok(())
            }
            None => Err(BackendError::TableNotFound(table.to_string())),
        }
    }

    /// Step 4 after the legacy table is gone
    async fn finish_swap(&self, table: &str, working: &str) -> Result<()> {
        self.create_table(table, SchemaGeneration::Current).await?;
        let copied = self
            .copy_items(
                working,
                table,
                Condition::AttributeNotExists(ATTR_FULL_PATH.to_string()),
                |item| Ok(item),
            )
            .await?;
        self.delete_table(working, true).await?;
        info!("Migration of table {} complete ({} items moved)", table, copied);
        Ok(())
    }

    /// Scan `from` page by page and put every (transformed) item into `to`
    ///
    /// Items rejected by `condition` are treated as already copied.
    async fn copy_items<F>(&self, from: &str, to: &str, condition: Condition, transform: F) -> Result<usize>
    where
        F: Fn(Item) -> Result<Item> + Send + Sync,
    {
        let mut copied = 0;
        let mut start = None;
        loop {
            let page = self.tables.scan(from, start, SCAN_PAGE_SIZE).await?;
            for item in page.items {
                let item = transform(item)?;
                match self.tables.put_item(to, item, condition.clone()).await {
                    Ok(()) => copied += 1,
                    Err(BackendError::CompareFailed(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            debug!("Copied {} items from {} to {} so far", copied, from, to);
            match page.last_evaluated_key {
                Some(key) => start = Some(key),
                None => return Ok(copied),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecureKey;
    use crate::record::{key_for_path, StorageRecord};
    use crate::storage::InMemoryTables;
    use aws_sdk_dynamodb::types::AttributeValue;
    use chrono::Utc;

    const LEGACY_TABLE: &str = "legacy.kv.t";
    const JSON: &[u8] = br#"{"some":"json","data":true}"#;

    fn manager() -> (Arc<InMemoryTables>, TableManager) {
        let tables = Arc::new(InMemoryTables::new());
        let manager = TableManager::new(
            tables.clone(),
            Throughput {
                read_capacity: 5,
                write_capacity: 5,
            },
        );
        (tables, manager)
    }

    async fn write_legacy(tables: &InMemoryTables, path: &str, value: &[u8]) -> StorageRecord {
        let mut record = StorageRecord::new(path, value, None, Utc::now()).unwrap();
        record
            .encrypt(&SecureKey::new(b"example key 1234".to_vec()), b"blob", "abcde-12345")
            .unwrap();
        tables
            .put_item(LEGACY_TABLE, record.to_legacy_item(), Condition::Always)
            .await
            .unwrap();
        record
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (_, manager) = manager();
        assert_eq!(manager.status("nonexisting.kv.t").await.unwrap(), TableStatus::Missing);

        manager.create_table(LEGACY_TABLE, SchemaGeneration::Legacy).await.unwrap();
        assert_eq!(manager.status(LEGACY_TABLE).await.unwrap(), TableStatus::NeedsMigration);

        manager.create_table("current.kv.t", SchemaGeneration::Current).await.unwrap();
        assert_eq!(manager.status("current.kv.t").await.unwrap(), TableStatus::Ok);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_detects_conflict() {
        let (tables, manager) = manager();
        manager.create_table("t", SchemaGeneration::Current).await.unwrap();
        manager.create_table("t", SchemaGeneration::Current).await.unwrap();

        let desc = tables.describe_table("t").await.unwrap().unwrap();
        assert_eq!(desc.ttl_attribute.as_deref(), Some(ATTR_EXPIRES));

        let err = manager.create_table("t", SchemaGeneration::Legacy).await.unwrap_err();
        assert!(matches!(err, BackendError::SchemaConflict { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_schema() {
        let (tables, manager) = manager();
        tables
            .create_table("odd", &KeySchema::hash("Id"), manager.throughput)
            .await
            .unwrap();
        let err = manager.status("odd").await.unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedSchema { .. }));
        assert!(manager.ensure_ready("odd").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_table() {
        let (_, manager) = manager();
        assert!(matches!(
            manager.delete_table("ghost", false).await,
            Err(BackendError::TableNotFound(_))
        ));
        manager.delete_table("ghost", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_migrate_preserves_items() {
        let (tables, manager) = manager();
        manager.create_table(LEGACY_TABLE, SchemaGeneration::Legacy).await.unwrap();
        let record = write_legacy(&tables, "a/directory/path", JSON).await;
        for i in 0..250 {
            write_legacy(&tables, &format!("ns{}/item/{}", i % 7, i), b"v").await;
        }

        manager.migrate(LEGACY_TABLE).await.unwrap();
        assert_eq!(manager.status(LEGACY_TABLE).await.unwrap(), TableStatus::Ok);
        assert_eq!(tables.item_count(LEGACY_TABLE), Some(251));
        assert_eq!(tables.item_count(&backup_table_name(LEGACY_TABLE)), Some(251));
        assert_eq!(tables.item_count(&working_table_name(LEGACY_TABLE)), None);

        let item = tables
            .get_item(LEGACY_TABLE, key_for_path("a/directory/path").unwrap())
            .await
            .unwrap()
            .unwrap();
        let mut migrated = StorageRecord::from_item(&item).unwrap();
        assert_eq!(migrated, record);
        migrated.decrypt(&SecureKey::new(b"example key 1234".to_vec())).unwrap();
        assert_eq!(migrated.value, JSON);
    }

    #[tokio::test]
    async fn test_migrate_twice_is_noop() {
        let (tables, manager) = manager();
        manager.create_table(LEGACY_TABLE, SchemaGeneration::Legacy).await.unwrap();
        write_legacy(&tables, "a/b", b"1").await;

        manager.migrate(LEGACY_TABLE).await.unwrap();
        manager.migrate(LEGACY_TABLE).await.unwrap();
        assert_eq!(manager.status(LEGACY_TABLE).await.unwrap(), TableStatus::Ok);
        assert_eq!(tables.item_count(LEGACY_TABLE), Some(1));

        assert!(matches!(
            manager.migrate("never.created").await,
            Err(BackendError::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_interrupted_rekey_leaves_legacy_intact() {
        let (tables, manager) = manager();
        manager.create_table(LEGACY_TABLE, SchemaGeneration::Legacy).await.unwrap();
        for i in 0..40 {
            write_legacy(&tables, &format!("a/{}", i), b"v").await;
        }

        let working = working_table_name(LEGACY_TABLE);
        // working table doesn't exist yet; budget applies once it does
        tables.fail_puts_after(&working, 15);
        assert!(manager.migrate(LEGACY_TABLE).await.is_err());

        assert_eq!(manager.status(LEGACY_TABLE).await.unwrap(), TableStatus::Migrating);
        assert_eq!(tables.item_count(LEGACY_TABLE), Some(40));
        assert_eq!(tables.item_count(&backup_table_name(LEGACY_TABLE)), Some(40));

        tables.clear_failures();
        assert_eq!(manager.ensure_ready(LEGACY_TABLE).await.unwrap(), TableStatus::Ok);
        assert_eq!(manager.status(LEGACY_TABLE).await.unwrap(), TableStatus::Ok);
        assert_eq!(tables.item_count(LEGACY_TABLE), Some(40));
    }

    #[tokio::test]
    async fn test_interrupted_swap_resumes() {
        let (tables, manager) = manager();
        manager.create_table(LEGACY_TABLE, SchemaGeneration::Legacy).await.unwrap();
        for i in 0..30 {
            write_legacy(&tables, &format!("b/{}", i), b"v").await;
        }

        // the new main table accepts 10 items, then the process "dies"
        tables.fail_puts_after(LEGACY_TABLE, 10);
        assert!(manager.migrate(LEGACY_TABLE).await.is_err());
        assert_eq!(manager.status(LEGACY_TABLE).await.unwrap(), TableStatus::Migrating);
        assert_eq!(tables.item_count(LEGACY_TABLE), Some(10));

        tables.clear_failures();
        manager.migrate(LEGACY_TABLE).await.unwrap();
        assert_eq!(manager.status(LEGACY_TABLE).await.unwrap(), TableStatus::Ok);
        assert_eq!(tables.item_count(LEGACY_TABLE), Some(30));
        assert_eq!(tables.item_count(&backup_table_name(LEGACY_TABLE)), Some(30));
    }

    #[tokio::test]
    async fn test_retry_after_failed_rekey_drops_deleted_items() {
        let (tables, manager) = manager();
        manager.create_table(LEGACY_TABLE, SchemaGeneration::Legacy).await.unwrap();
        for i in 1..=3 {
            write_legacy(&tables, &format!("a/{}", i), b"v").await;
        }

        let working = working_table_name(LEGACY_TABLE);
        tables.fail_puts_after(&working, 2);
        assert!(manager.migrate(LEGACY_TABLE).await.is_err());
        assert_eq!(tables.item_count(&working), Some(2));

        // live traffic still targets the legacy table and deletes a/1
        let legacy_key = Item::from([(ATTR_LEGACY_KEY.to_string(), AttributeValue::S("a/1".into()))]);
        assert!(tables.delete_item(LEGACY_TABLE, legacy_key).await.unwrap().is_some());

        tables.clear_failures();
        manager.migrate(LEGACY_TABLE).await.unwrap();
        assert_eq!(manager.status(LEGACY_TABLE).await.unwrap(), TableStatus::Ok);
        assert_eq!(tables.item_count(LEGACY_TABLE), Some(2));
        assert!(tables
            .get_item(LEGACY_TABLE, key_for_path("a/1").unwrap())
            .await
            .unwrap()
            .is_none());
        assert_eq!(tables.item_count(&backup_table_name(LEGACY_TABLE)), Some(2));
    }

    #[tokio::test]
    async fn test_resume_after_legacy_table_dropped() {
        let (tables, manager) = manager();
        let backup = backup_table_name(LEGACY_TABLE);
        let working = working_table_name(LEGACY_TABLE);

        // crash window: legacy dropped, new main table not created yet
        manager.create_table(&backup, SchemaGeneration::Legacy).await.unwrap();
        manager.create_table(&working, SchemaGeneration::Current).await.unwrap();
        for i in 0..12 {
            let record = StorageRecord::new(&format!("c/{}", i), b"v", None, Utc::now()).unwrap();
            tables.put_item(&backup, record.to_legacy_item(), Condition::Always).await.unwrap();
            tables.put_item(&working, record.to_item(), Condition::Always).await.unwrap();
        }

        assert_eq!(manager.status(LEGACY_TABLE).await.unwrap(), TableStatus::Migrating);
        assert_eq!(manager.ensure_ready(LEGACY_TABLE).await.unwrap(), TableStatus::Ok);
        assert_eq!(manager.status(LEGACY_TABLE).await.unwrap(), TableStatus::Ok);

        assert_eq!(tables.item_count(LEGACY_TABLE), Some(12));
        assert_eq!(tables.item_count(&working), None);
        assert_eq!(tables.item_count(&backup), Some(12));
        for i in 0..12 {
            let item = tables
                .get_item(LEGACY_TABLE, key_for_path(&format!("c/{}", i)).unwrap())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(StorageRecord::from_item(&item).unwrap().full_path, format!("c/{}", i));
        }
    }

    #[tokio::test]
    async fn test_ensure_ready_creates_missing() {
        let (tables, manager) = manager();
        assert_eq!(manager.ensure_ready("fresh").await.unwrap(), TableStatus::Ok);
        let desc = tables.describe_table("fresh").await.unwrap().unwrap();
        assert_eq!(desc.key_schema, SchemaGeneration::Current.key_schema());
    }
}
