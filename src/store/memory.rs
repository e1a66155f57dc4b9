use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{FlagReader, FlagWriter, StoreError};
use crate::flags::{Record, FLAGS_SCOPE};
use crate::query::{build_update, fully_qualified_name, ConditionOp, Update, Where};

/// Process-local document store holding records as JSON documents.
#[derive(Debug)]
pub struct MemoryStore {
    fqn: String,
    docs: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            fqn: fully_qualified_name("memory", FLAGS_SCOPE),
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlagReader for MemoryStore {
    async fn get(&self, id: &str) -> Result<Record, StoreError> {
        let docs = self.docs.read().await;
        let doc = docs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(serde_json::from_value(doc.clone())?)
    }
}

#[async_trait]
impl FlagWriter for MemoryStore {
    async fn create(&self, record: &Record) -> Result<(), StoreError> {
        let doc = serde_json::to_value(record)?;
        let mut docs = self.docs.write().await;
        if docs.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        docs.insert(record.id.clone(), doc);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.docs.write().await.remove(id);
        Ok(())
    }

    async fn update_fields(&self, id: &str, updates: &[Update]) -> Result<(), StoreError> {
        // same statement the query service would run, so bad updates fail alike
        let stmt = build_update(
            &self.fqn,
            updates,
            Some(&[Where::new("id", ConditionOp::Eq, id)]),
            Some(1),
        )?;
        debug!(statement = %stmt.text, "applying update in memory");

        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(id)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        for u in updates {
            doc.insert(u.field.clone(), u.value.clone());
        }
        Ok(())
    }
}
