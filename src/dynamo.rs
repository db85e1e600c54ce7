//! DynamoDB implementation of [`TableService`]

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_dynamodb::config::{Credentials, Region};
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, KeySchemaElement, KeyType, ProvisionedThroughput,
    ReturnValue, ScalarAttributeType, TableStatus as AwsTableStatus, TimeToLiveSpecification,
    TimeToLiveStatus,
};
use aws_sdk_dynamodb::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::DynamoConfig;
use crate::error::{BackendError, Result};
use crate::storage::{Condition, Item, KeySchema, Page, Query, TableDescription, TableService, Throughput};

const TABLE_WAIT_ATTEMPTS: u32 = 120;
const TABLE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Load shared AWS settings for `config`: region and static credentials
/// when given, the default provider chain otherwise.
pub async fn load_sdk_config(config: &DynamoConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &config.region {
        loader = loader.region(Region::new(region.clone()));
    }
    if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
        loader = loader.credentials_provider(Credentials::new(
            access_key.clone(),
            secret_key.clone(),
            None,
            None,
            "envelope-dynamo-static",
        ));
    }
    loader.load().await
}

pub struct DynamoTables {
    client: Arc<Client>,
}

impl DynamoTables {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    /// Client from shared settings; `endpoint` overrides DynamoDB only
    pub fn from_conf(sdk_config: &SdkConfig, endpoint: Option<&str>) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint {
            info!("Using DynamoDB endpoint {}", endpoint);
            builder = builder.endpoint_url(endpoint);
        }
        Self::new(Arc::new(Client::from_conf(builder.build())))
    }

    async fn raw_description(&self, table: &str) -> Result<Option<aws_sdk_dynamodb::types::TableDescription>> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(output) => Ok(output.table),
            Err(e) if error_code(&e).as_deref() == Some("ResourceNotFoundException") => Ok(None),
            Err(e) => Err(dynamo_error("describe table", table, e)),
        }
    }

    async fn ttl_attribute(&self, table: &str) -> Result<Option<String>> {
        let output = self
            .client
            .describe_time_to_live()
            .table_name(table)
            .send()
            .await
            .map_err(|e| dynamo_error("describe ttl", table, e))?;

        Ok(output.time_to_live_description().and_then(|ttl| {
            match ttl.time_to_live_status() {
                Some(TimeToLiveStatus::Enabled) | Some(TimeToLiveStatus::Enabling) => {
                    ttl.attribute_name().map(str::to_string)
                }
                _ => None,
            }
        }))
    }

    /// Poll until `table` is active (`exists`) or gone (`!exists`)
    async fn wait_for(&self, table: &str, exists: bool) -> Result<()> {
        for attempt in 0..TABLE_WAIT_ATTEMPTS {
            let ready = match self.raw_description(table).await? {
                Some(desc) => exists && desc.table_status() == Some(&AwsTableStatus::Active),
                None => !exists,
            };
            if ready {
                return Ok(());
            }
            debug!("Waiting for table {} (attempt {})", table, attempt + 1);
            sleep(TABLE_WAIT_INTERVAL).await;
        }
        Err(BackendError::Storage(format!(
            "timed out waiting for table {} to be {}",
            table,
            if exists { "active" } else { "deleted" }
        )))
    }
}

#[async_trait]
impl TableService for DynamoTables {
    async fn describe_table(&self, table: &str) -> Result<Option<TableDescription>> {
        let Some(desc) = self.raw_description(table).await? else {
            return Ok(None);
        };

        let mut hash_key = None;
        let mut range_key = None;
        for element in desc.key_schema() {
            match element.key_type() {
                KeyType::Hash => hash_key = Some(element.attribute_name().to_string()),
                KeyType::Range => range_key = Some(element.attribute_name().to_string()),
                _ => {}
            }
        }
        let hash_key = hash_key.ok_or_else(|| {
            BackendError::Storage(format!("table {} reports no hash key", table))
        })?;

        Ok(Some(TableDescription {
            name: table.to_string(),
            key_schema: KeySchema { hash_key, range_key },
            ttl_attribute: self.ttl_attribute(table).await?,
        }))
    }

    async fn create_table(&self, table: &str, schema: &KeySchema, throughput: Throughput) -> Result<()> {
        let mut definitions = Vec::new();
        let mut elements = Vec::new();
        let keys = std::iter::once((&schema.hash_key, KeyType::Hash))
            .chain(schema.range_key.as_ref().map(|r| (r, KeyType::Range)));
        for (name, key_type) in keys {
            definitions.push(
                AttributeDefinition::builder()
                    .attribute_name(name)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(build_error)?,
            );
            elements.push(
                KeySchemaElement::builder()
                    .attribute_name(name)
                    .key_type(key_type)
                    .build()
                    .map_err(build_error)?,
            );
        }
        let provisioned = ProvisionedThroughput::builder()
            .read_capacity_units(throughput.read_capacity)
            .write_capacity_units(throughput.write_capacity)
            .build()
            .map_err(build_error)?;

        let result = self
            .client
            .create_table()
            .table_name(table)
            .set_attribute_definitions(Some(definitions))
            .set_key_schema(Some(elements))
            .provisioned_throughput(provisioned)
            .send()
            .await;
        match result {
            Ok(_) => {}
            Err(e) if error_code(&e).as_deref() == Some("ResourceInUseException") => {
                return Err(BackendError::AlreadyExists(format!("table {}", table)));
            }
            Err(e) => return Err(dynamo_error("create table", table, e)),
        }

        self.wait_for(table, true).await?;
        info!("Table {} created with schema {}", table, schema);
        Ok(())
    }

    async fn enable_ttl(&self, table: &str, attribute: &str) -> Result<()> {
        if self.ttl_attribute(table).await?.as_deref() == Some(attribute) {
            return Ok(());
        }
        let specification = TimeToLiveSpecification::builder()
            .attribute_name(attribute)
            .enabled(true)
            .build()
            .map_err(build_error)?;
        self.client
            .update_time_to_live()
            .table_name(table)
            .time_to_live_specification(specification)
            .send()
            .await
            .map_err(|e| dynamo_error("enable ttl", table, e))?;
        info!("Enabled native expiration on {}.{}", table, attribute);
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        self.client
            .delete_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| dynamo_error("delete table", table, e))?;
        self.wait_for(table, false).await?;
        info!("Table {} deleted", table);
        Ok(())
    }

    async fn get_item(&self, table: &str, key: Item) -> Result<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(key))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| dynamo_error("get item", table, e))?;
        Ok(output.item)
    }

    async fn put_item(&self, table: &str, item: Item, condition: Condition) -> Result<()> {
        let mut request = self.client.put_item().table_name(table).set_item(Some(item));
        match condition {
            Condition::Always => {}
            Condition::AttributeNotExists(name) => {
                request = request
                    .condition_expression("attribute_not_exists(#c)")
                    .expression_attribute_names("#c", name);
            }
            Condition::AttributeEquals(name, value) => {
                request = request
                    .condition_expression("#c = :c")
                    .expression_attribute_names("#c", name)
                    .expression_attribute_values(":c", value);
            }
        }
        request
            .send()
            .await
            .map_err(|e| dynamo_error("put item", table, e))?;
        Ok(())
    }

    async fn delete_item(&self, table: &str, key: Item) -> Result<Option<Item>> {
        let output = self
            .client
            .delete_item()
            .table_name(table)
            .set_key(Some(key))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(|e| dynamo_error("delete item", table, e))?;
        Ok(output.attributes.filter(|old| !old.is_empty()))
    }

    async fn query(&self, table: &str, query: Query) -> Result<Page> {
        let mut request = self
            .client
            .query()
            .table_name(table)
            .expression_attribute_names("#h", query.hash_attribute)
            .expression_attribute_values(":h", AttributeValue::S(query.hash_value))
            .set_exclusive_start_key(query.start)
            .limit(query.limit)
            .consistent_read(true);
        request = if query.range_prefix.is_empty() {
            request.key_condition_expression("#h = :h")
        } else {
            request
                .key_condition_expression("#h = :h AND begins_with(#r, :p)")
                .expression_attribute_names("#r", query.range_attribute)
                .expression_attribute_values(":p", AttributeValue::S(query.range_prefix))
        };

        let output = request
            .send()
            .await
            .map_err(|e| dynamo_error("query", table, e))?;
        Ok(Page {
            items: output.items.unwrap_or_default(),
            last_evaluated_key: output.last_evaluated_key.filter(|k| !k.is_empty()),
        })
    }

    async fn scan(&self, table: &str, start: Option<Item>, limit: i32) -> Result<Page> {
        let output = self
            .client
            .scan()
            .table_name(table)
            .set_exclusive_start_key(start)
            .limit(limit)
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| dynamo_error("scan", table, e))?;
        Ok(Page {
            items: output.items.unwrap_or_default(),
            last_evaluated_key: output.last_evaluated_key.filter(|k| !k.is_empty()),
        })
    }
}

fn error_code<E, R>(err: &SdkError<E, R>) -> Option<String>
where
    E: ProvideErrorMetadata,
{
    err.as_service_error().and_then(|e| e.code()).map(str::to_string)
}

fn dynamo_error<E, R>(op: &str, table: &str, err: SdkError<E, R>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = error_code(&err);
    let message = format!("{} on table {}: {}", op, table, DisplayErrorContext(&err));
    match code.as_deref() {
        Some("ConditionalCheckFailedException") => BackendError::CompareFailed(message),
        Some("ResourceNotFoundException") => BackendError::TableNotFound(table.to_string()),
        _ => BackendError::Storage(message),
    }
}

fn build_error(err: impl std::fmt::Display) -> BackendError {
    BackendError::BadParameter(format!("invalid request: {}", err))
}
