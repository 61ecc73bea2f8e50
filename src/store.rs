//! Record Store
//!
//! The keyed store behind replicated writes. Writes are shallow merges of
//! a JSON object into the stored record, creating it if missing.

use std::collections::HashMap;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::Result;

/// Keyed record storage
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Merge `fields` into the record and return the merged record
    async fn apply(&self, resource_id: &str, fields: &Map<String, Value>) -> Result<Value>;

    /// Get a record
    async fn get(&self, resource_id: &str) -> Option<Value>;
}

/// Record store held in memory
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<String, Map<String, Value>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn apply(&self, resource_id: &str, fields: &Map<String, Value>) -> Result<Value> {
        let mut records = self.records.write().await;
        let record = records.entry(resource_id.to_string()).or_default();
        for (key, value) in fields {
            record.insert(key.clone(), value.clone());
        }
        tracing::debug!("Record {} updated ({} fields)", resource_id, fields.len());
        Ok(Value::Object(record.clone()))
    }

    async fn get(&self, resource_id: &str) -> Option<Value> {
        self.records
            .read()
            .await
            .get(resource_id)
            .map(|r| Value::Object(r.clone()))
    }
}
