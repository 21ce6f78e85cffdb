//! Document storage used by brokers and pipeline clients.
//!
//! Documents are field maps keyed by an opaque id; blobs hold raw file
//! contents; monitoring snapshots are append-only. [`MemoryStore`] keeps
//! everything in process, [`FileStore`] lays it out under a directory that
//! every broker host can reach.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::broker::monitor::MonitoringSnapshot;
use crate::error::{PyplnError, Result};

/// Field map of a stored document.
pub type Document = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobInfo {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub length: u64,
    #[serde(rename = "upload date")]
    pub upload_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub info: BlobInfo,
    pub contents: Vec<u8>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document and return its id.
    async fn insert(&self, fields: Document) -> Result<String>;

    /// Fails with [`PyplnError::DocumentNotFound`] on a lookup miss.
    async fn find_by_id(&self, id: &str) -> Result<Document>;

    /// Merge `fields` into the document, creating it if needed. Fields not
    /// named in `fields` are left alone.
    async fn update_fields(&self, id: &str, fields: Document) -> Result<()>;

    /// Fails with [`PyplnError::BlobNotFound`] on a lookup miss.
    async fn get_blob(&self, id: &str) -> Result<Blob>;

    async fn put_blob(&self, contents: Vec<u8>, name: &str) -> Result<String>;
}

/// Append-only collection of monitoring snapshots.
#[async_trait]
pub trait MonitoringSink: Send + Sync {
    async fn insert_snapshot(&self, snapshot: &MonitoringSnapshot) -> Result<()>;
}

/// Ids become path components in [`FileStore`], so only a conservative
/// alphabet is accepted everywhere.
pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PyplnError::Store(format!("invalid id: {:?}", id)))
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_restricted() {
        assert!(validate_id("5f2b9c").is_ok());
        assert!(validate_id("143-0").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a/b").is_err());
    }

    #[test]
    fn generated_ids_are_valid() {
        assert!(validate_id(&new_id()).is_ok());
    }
}
