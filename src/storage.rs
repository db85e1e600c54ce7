//! Storage abstraction over a partition/sort-key table service
//!
//! This module provides a trait-based interface to the backing store's
//! primitives (table admin, point reads and conditional writes, paginated
//! query and scan) that can be implemented for various backends. The
//! DynamoDB implementation lives in [`crate::dynamo`]; the in-memory one
//! here is used for development and tests.

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use crate::error::{BackendError, Result};

/// One stored item: attribute name to value
pub type Item = HashMap<String, AttributeValue>;

/// Declared primary key of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    pub hash_key: String,
    pub range_key: Option<String>,
}

impl KeySchema {
    /// Schema with a partition key only
    pub fn hash(hash_key: &str) -> Self {
        Self {
            hash_key: hash_key.to_string(),
            range_key: None,
        }
    }

    /// Schema with partition and sort keys
    pub fn hash_range(hash_key: &str, range_key: &str) -> Self {
        Self {
            hash_key: hash_key.to_string(),
            range_key: Some(range_key.to_string()),
        }
    }

    /// Project the primary-key attributes out of `item`
    pub fn key_of(&self, item: &Item) -> Result<Item> {
        let mut key = Item::new();
        for name in self.attribute_names() {
            let value = item
                .get(name)
                .ok_or_else(|| BackendError::BadParameter(format!("item is missing key attribute {}", name)))?;
            key.insert(name.to_string(), value.clone());
        }
        Ok(key)
    }

    /// Key attribute names, partition key first
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.hash_key.as_str()).chain(self.range_key.as_deref())
    }
}

impl std::fmt::Display for KeySchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.range_key {
            Some(range) => write!(f, "hash={},range={}", self.hash_key, range),
            None => write!(f, "hash={}", self.hash_key),
        }
    }
}

/// What `describe_table` reports
#[derive(Debug, Clone)]
pub struct TableDescription {
    pub name: String,
    pub key_schema: KeySchema,
    pub ttl_attribute: Option<String>,
}

/// Provisioned capacity for new tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub read_capacity: i64,
    pub write_capacity: i64,
}

/// Precondition evaluated atomically by the store on write
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Always,
    AttributeNotExists(String),
    AttributeEquals(String, AttributeValue),
}

/// Range query within one partition
#[derive(Debug, Clone)]
pub struct Query {
    pub hash_attribute: String,
    pub hash_value: String,
    pub range_attribute: String,
    pub range_prefix: String,
    pub start: Option<Item>,
    pub limit: i32,
}

/// One page of a query or scan
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    /// Key to resume from; `None` once the result set is exhausted
    pub last_evaluated_key: Option<Item>,
}

/// Backing store primitives
#[async_trait]
pub trait TableService: Send + Sync {
    /// `None` when the table does not exist
    async fn describe_table(&self, table: &str) -> Result<Option<TableDescription>>;

    /// Create and wait until usable; `AlreadyExists` if the name is taken
    async fn create_table(&self, table: &str, schema: &KeySchema, throughput: Throughput) -> Result<()>;

    /// Turn on native per-item expiration on a numeric epoch-seconds attribute
    async fn enable_ttl(&self, table: &str, attribute: &str) -> Result<()>;

    /// Delete and wait until gone; `TableNotFound` if absent
    async fn delete_table(&self, table: &str) -> Result<()>;

    /// Strongly consistent point read
    async fn get_item(&self, table: &str, key: Item) -> Result<Option<Item>>;

    /// Write `item`; `CompareFailed` when `condition` does not hold
    async fn put_item(&self, table: &str, item: Item, condition: Condition) -> Result<()>;

    /// Delete by key, returning the previous item if there was one
    async fn delete_item(&self, table: &str, key: Item) -> Result<Option<Item>>;

    /// Items in one partition whose range key begins with a prefix, in range-key order
    async fn query(&self, table: &str, query: Query) -> Result<Page>;

    /// Every item in the table, in no particular order
    async fn scan(&self, table: &str, start: Option<Item>, limit: i32) -> Result<Page>;
}

pub(crate) fn string_attr<'a>(item: &'a Item, name: &str) -> Option<&'a str> {
    item.get(name).and_then(|v| v.as_s().ok()).map(String::as_str)
}

type RowKey = (String, String);

struct MemTable {
    schema: KeySchema,
    ttl_attribute: Option<String>,
    items: BTreeMap<RowKey, Item>,
}

impl MemTable {
    fn row_key(&self, item: &Item) -> Result<RowKey> {
        let hash = string_attr(item, &self.schema.hash_key).ok_or_else(|| {
            BackendError::BadParameter(format!("missing string key attribute {}", self.schema.hash_key))
        })?;
        let range = match &self.schema.range_key {
            Some(name) => string_attr(item, name).ok_or_else(|| {
                BackendError::BadParameter(format!("missing string key attribute {}", name))
            })?,
            None => "",
        };
        Ok((hash.to_string(), range.to_string()))
    }

    fn page<'a>(&self, rows: impl Iterator<Item = (&'a RowKey, &'a Item)>, limit: i32) -> Page {
        let limit = limit.max(1) as usize;
        let mut rows = rows.peekable();
        let mut items = Vec::new();
        while items.len() < limit {
            match rows.next() {
                Some((_, item)) => items.push(item.clone()),
                None => break,
            }
        }
        let last_evaluated_key = match (rows.peek(), items.last()) {
            (Some(_), Some(last)) => self.schema.key_of(last).ok(),
            _ => None,
        };
        Page {
            items,
            last_evaluated_key,
        }
    }
}

/// In-memory implementation of TableService
///
/// Suitable for development and tests. Expired items are never reaped,
/// which is the worst case a reader of the real service can observe.
pub struct InMemoryTables {
    tables: RwLock<HashMap<String, MemTable>>,
    put_budgets: RwLock<HashMap<String, usize>>,
}

impl InMemoryTables {
    /// Create an empty store with no tables
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            put_budgets: RwLock::new(HashMap::new()),
        }
    }

    /// Let `count` more puts into `table` succeed, then fail every put with
    /// a storage error until [`clear_failures`](Self::clear_failures).
    pub fn fail_puts_after(&self, table: &str, count: usize) {
        self.put_budgets.write().insert(table.to_string(), count);
    }

    /// Let every put through again
    pub fn clear_failures(&self) {
        self.put_budgets.write().clear();
    }

    /// Number of stored items, `None` if the table does not exist
    pub fn item_count(&self, table: &str) -> Option<usize> {
        self.tables.read().get(table).map(|t| t.items.len())
    }

    /// Names of existing tables, sorted
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn charge_put(&self, table: &str) -> Result<()> {
        let mut budgets = self.put_budgets.write();
        if let Some(remaining) = budgets.get_mut(table) {
            if *remaining == 0 {
                return Err(BackendError::Storage(format!("injected put failure on {}", table)));
            }
            *remaining -= 1;
        }
        Ok(())
    }
}

impl Default for InMemoryTables {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(table: &str) -> BackendError {
    BackendError::TableNotFound(table.to_string())
}

#[async_trait]
impl TableService for InMemoryTables {
    async fn describe_table(&self, table: &str) -> Result<Option<TableDescription>> {
        Ok(self.tables.read().get(table).map(|t| TableDescription {
            name: table.to_string(),
            key_schema: t.schema.clone(),
            ttl_attribute: t.ttl_attribute.clone(),
        }))
    }

    async fn create_table(&self, table: &str, schema: &KeySchema, _throughput: Throughput) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(table) {
            return Err(BackendError::AlreadyExists(format!("table {}", table)));
        }
        tables.insert(
            table.to_string(),
            MemTable {
                schema: schema.clone(),
                ttl_attribute: None,
                items: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn enable_ttl(&self, table: &str, attribute: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| missing(table))?;
        t.ttl_attribute = Some(attribute.to_string());
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        self.tables
            .write()
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| missing(table))
    }

    async fn get_item(&self, table: &str, key: Item) -> Result<Option<Item>> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| missing(table))?;
        let row = t.row_key(&key)?;
        Ok(t.items.get(&row).cloned())
    }

    async fn put_item(&self, table: &str, item: Item, condition: Condition) -> Result<()> {
        self.charge_put(table)?;
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| missing(table))?;
        let row = t.row_key(&item)?;
        let existing = t.items.get(&row);

        let holds = match &condition {
            Condition::Always => true,
            Condition::AttributeNotExists(name) => existing.map_or(true, |e| !e.contains_key(name)),
            Condition::AttributeEquals(name, value) => {
                existing.and_then(|e| e.get(name)) == Some(value)
            }
        };
        if !holds {
            return Err(BackendError::CompareFailed(format!(
                "conditional check failed on table {}",
                table
            )));
        }

        t.items.insert(row, item);
        Ok(())
    }

    async fn delete_item(&self, table: &str, key: Item) -> Result<Option<Item>> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| missing(table))?;
        let row = t.row_key(&key)?;
        Ok(t.items.remove(&row))
    }

    async fn query(&self, table: &str, query: Query) -> Result<Page> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| missing(table))?;
        if t.schema.hash_key != query.hash_attribute
            || t.schema.range_key.as_deref() != Some(query.range_attribute.as_str())
        {
            return Err(BackendError::BadParameter(format!(
                "query attributes do not match key schema {} of table {}",
                t.schema, table
            )));
        }

        let lower = match &query.start {
            Some(start) => Bound::Excluded(t.row_key(start)?),
            None => Bound::Included((query.hash_value.clone(), query.range_prefix.clone())),
        };
        let rows = t
            .items
            .range((lower, Bound::Unbounded))
            .take_while(|((hash, _), _)| *hash == query.hash_value)
            .filter(|((_, range), _)| range.starts_with(&query.range_prefix));
        Ok(t.page(rows, query.limit))
    }

    async fn scan(&self, table: &str, start: Option<Item>, limit: i32) -> Result<Page> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| missing(table))?;
        let lower = match &start {
            Some(start) => Bound::Excluded(t.row_key(start)?),
            None => Bound::Unbounded,
        };
        let rows = t.items.range((lower, Bound::Unbounded));
        Ok(t.page(rows, limit))
    }
}
