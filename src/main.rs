//! Walks an in-memory deployment through a legacy-schema upgrade and the
//! everyday driver operations. No AWS account needed.

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use envelope_dynamo::config::DEFAULT_KEY_ALIAS;
use envelope_dynamo::{
    Backend, Condition, DynamoBackend, DynamoConfig, Expected, InMemoryTables, KeyManager, KeyRing, KeyService,
    LocalKeyService, SchemaGeneration, StorageRecord, SystemClock, TableManager, TableService,
    Throughput,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const TABLE: &str = "kv.dynamo.state";

fn b64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    if encoded.len() > 24 {
        format!("{}...{}", &encoded[..12], &encoded[encoded.len() - 6..])
    } else {
        encoded
    }
}

/// Fill a legacy single-key table the way an old release would have
async fn seed_legacy_table(
    tables: Arc<InMemoryTables>,
    key_service: Arc<dyn KeyService>,
) -> anyhow::Result<()> {
    let manager = TableManager::new(tables.clone(), Throughput { read_capacity: 10, write_capacity: 10 });
    manager.create_table(TABLE, SchemaGeneration::Legacy).await?;

    let keys = KeyRing::open(KeyManager::new(key_service), DEFAULT_KEY_ALIAS).await?;
    let data_key = keys.current();
    for (path, value) in [
        ("roles/admin", r#"{"allow":["*"]}"#),
        ("roles/auditor", r#"{"allow":["read"]}"#),
        ("nodes/node-1", r#"{"addr":"10.0.0.1:3022"}"#),
    ] {
        let mut record = StorageRecord::new(path, value.as_bytes(), None, Utc::now())?;
        record.encrypt(&data_key.plaintext, &data_key.ciphertext_blob, &data_key.key_id)?;
        tables.put_item(TABLE, record.to_legacy_item(), Condition::Always).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("=== Envelope-Encrypted DynamoDB Backend ===\n");

    let tables = Arc::new(InMemoryTables::new());
    let key_service: Arc<dyn KeyService> = Arc::new(LocalKeyService::with_alias(DEFAULT_KEY_ALIAS));

    seed_legacy_table(tables.clone(), key_service.clone()).await?;
    println!("[SEED] Legacy table {} holds {:?} items", TABLE, tables.item_count(TABLE));

    let backend = DynamoBackend::open(
        DynamoConfig::new(TABLE),
        tables.clone(),
        key_service,
        Arc::new(SystemClock),
    )
    .await
    .context("opening backend")?;
    println!("[OPEN] Table status after startup: {}", backend.table_status().await?);
    println!("[OPEN] Tables present: {:?}\n", tables.table_names());

    let admin = backend.get("roles/admin").await?;
    println!("[GET] roles/admin = {}", String::from_utf8_lossy(&admin));
    println!("[LIST] roles/ -> {:?}\n", backend.list("roles/").await?);

    backend.put("sessions/abc", b"session-data", Some(Duration::from_secs(30))).await?;
    let (_, ttl) = backend.get_with_ttl("sessions/abc").await?;
    println!("[PUT] sessions/abc, ttl left: {:?}", ttl);
    if let Some(raw) = tables.get_item(TABLE, envelope_dynamo::key_for_path("sessions/abc")?).await? {
        let stored = StorageRecord::from_item(&raw)?;
        println!("[PUT] Stored ciphertext: {}", b64(&stored.value));
    }

    backend
        .compare_and_swap("roles/auditor", &Expected::Value(br#"{"allow":["read"]}"#.to_vec()), br#"{"allow":["read","list"]}"#, None)
        .await?;
    println!("[CAS] roles/auditor updated");
    let stale = backend
        .compare_and_swap("roles/auditor", &Expected::Value(br#"{"allow":["read"]}"#.to_vec()), b"{}", None)
        .await;
    println!("[CAS] Stale swap rejected: {}\n", stale.is_err_and(|e| e.is_compare_failed()));

    backend.acquire_lock("rotation", Duration::from_secs(10)).await?;
    println!("[LOCK] Acquired rotation lock");
    backend.release_lock("rotation").await?;
    println!("[LOCK] Released rotation lock\n");

    let removed = backend.delete_prefix("sessions/").await?;
    println!("[DELETE] Removed {} session(s)", removed);

    backend.close().await?;
    println!("[CLOSE] Further calls fail: {}", backend.get("roles/admin").await.is_err());
    Ok(())
}
