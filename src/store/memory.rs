use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::broker::monitor::MonitoringSnapshot;
use crate::error::{PyplnError, Result};
use crate::store::{new_id, validate_id, Blob, BlobInfo, Document, DocumentStore, MonitoringSink};

/// In-process store, used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, Document>>,
    blobs: RwLock<HashMap<String, Blob>>,
    monitoring: RwLock<Vec<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots inserted so far, as stored.
    pub async fn snapshots(&self) -> Vec<Value> {
        self.monitoring.read().await.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, fields: Document) -> Result<String> {
        let id = new_id();
        self.documents.write().await.insert(id.clone(), fields);
        Ok(id)
    }

    async fn find_by_id(&self, id: &str) -> Result<Document> {
        self.documents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PyplnError::DocumentNotFound(id.to_string()))
    }

    async fn update_fields(&self, id: &str, fields: Document) -> Result<()> {
        validate_id(id)?;
        let mut documents = self.documents.write().await;
        documents.entry(id.to_string()).or_default().extend(fields);
        Ok(())
    }

    async fn get_blob(&self, id: &str) -> Result<Blob> {
        self.blobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PyplnError::BlobNotFound(id.to_string()))
    }

    async fn put_blob(&self, contents: Vec<u8>, name: &str) -> Result<String> {
        let id = new_id();
        let blob = Blob {
            info: BlobInfo {
                id: id.clone(),
                name: name.to_string(),
                length: contents.len() as u64,
                upload_date: Utc::now(),
            },
            contents,
        };
        self.blobs.write().await.insert(id.clone(), blob);
        Ok(id)
    }
}

#[async_trait]
impl MonitoringSink for MemoryStore {
    async fn insert_snapshot(&self, snapshot: &MonitoringSnapshot) -> Result<()> {
        let value = serde_json::to_value(snapshot)?;
        self.monitoring.write().await.push(value);
        Ok(())
    }
}
