use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::broker::monitor::MonitoringSnapshot;
use crate::config::StoreConfig;
use crate::error::{PyplnError, Result};
use crate::store::{new_id, validate_id, Blob, BlobInfo, Document, DocumentStore, MonitoringSink};

/// Directory-backed store shared by every process that mounts the same path.
///
/// Layout under the root:
///
/// ```text
/// <documents>/<id>/<field>.json    one file per field
/// <blobs>/<id>.bin                 raw contents
/// <blobs>/<id>.json                BlobInfo
/// <monitoring>.jsonl               one snapshot per line
/// ```
///
/// Each field is written to a temporary file and renamed into place, so two
/// workers updating different fields of one document never lose each other's
/// writes.
#[derive(Debug, Clone)]
pub struct FileStore {
    documents: PathBuf,
    blobs: PathBuf,
    monitoring: PathBuf,
}

impl FileStore {
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let store = Self {
            documents: config.path.join(&config.documents_collection),
            blobs: config.path.join(&config.blobs_collection),
            monitoring: config
                .path
                .join(format!("{}.jsonl", config.monitoring_collection)),
        };
        fs::create_dir_all(&store.documents).await?;
        fs::create_dir_all(&store.blobs).await?;
        tracing::debug!(path = %config.path.display(), "Opened file store");
        Ok(store)
    }

    fn document_dir(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.documents.join(id))
    }

    fn blob_paths(&self, id: &str) -> Result<(PathBuf, PathBuf)> {
        validate_id(id)?;
        Ok((
            self.blobs.join(format!("{}.bin", id)),
            self.blobs.join(format!("{}.json", id)),
        ))
    }

    async fn write_fields(&self, dir: &Path, fields: Document) -> Result<()> {
        fs::create_dir_all(dir).await?;
        for (key, value) in fields {
            let name = encode_field(&key);
            let bytes = serde_json::to_vec(&value)?;
            write_atomic(&dir.join(format!("{}.json", name)), &bytes).await?;
        }
        Ok(())
    }

    /// Every snapshot stored so far, oldest first.
    pub async fn snapshots(&self) -> Result<Vec<Value>> {
        let contents = match fs::read_to_string(&self.monitoring).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(PyplnError::from))
            .collect()
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn insert(&self, fields: Document) -> Result<String> {
        let id = new_id();
        let dir = self.document_dir(&id)?;
        self.write_fields(&dir, fields).await?;
        Ok(id)
    }

    async fn find_by_id(&self, id: &str) -> Result<Document> {
        let dir = self.document_dir(id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PyplnError::DocumentNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut document = Document::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            // Skip in-flight temporaries.
            if file_name.starts_with('.') {
                continue;
            }
            let Some(key) = file_name.strip_suffix(".json").and_then(decode_field) else {
                continue;
            };
            let bytes = fs::read(entry.path()).await?;
            document.insert(key, serde_json::from_slice(&bytes)?);
        }
        Ok(document)
    }

    async fn update_fields(&self, id: &str, fields: Document) -> Result<()> {
        let dir = self.document_dir(id)?;
        self.write_fields(&dir, fields).await
    }

    async fn get_blob(&self, id: &str) -> Result<Blob> {
        let (data_path, info_path) = self.blob_paths(id)?;
        let info = match fs::read(&info_path).await {
            Ok(bytes) => serde_json::from_slice::<BlobInfo>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PyplnError::BlobNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let contents = fs::read(&data_path).await?;
        Ok(Blob { info, contents })
    }

    async fn put_blob(&self, contents: Vec<u8>, name: &str) -> Result<String> {
        let id = new_id();
        let (data_path, info_path) = self.blob_paths(&id)?;
        let info = BlobInfo {
            id: id.clone(),
            name: name.to_string(),
            length: contents.len() as u64,
            upload_date: Utc::now(),
        };
        // Contents first: a blob is visible once its info file exists.
        write_atomic(&data_path, &contents).await?;
        write_atomic(&info_path, &serde_json::to_vec(&info)?).await?;
        Ok(id)
    }
}

#[async_trait]
impl MonitoringSink for FileStore {
    async fn insert_snapshot(&self, snapshot: &MonitoringSnapshot) -> Result<()> {
        let mut line = serde_json::to_vec(snapshot)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.monitoring)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PyplnError::Store(format!("no parent for {}", path.display())))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PyplnError::Store(format!("bad file name {}", path.display())))?;
    let tmp = dir.join(format!(".{}.{}", file_name, new_id()));
    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Field names may hold any character; anything outside `[A-Za-z0-9-]` is
/// written as `_XX` per UTF-8 byte.
fn encode_field(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}

fn decode_field(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let raw = name.as_bytes();
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'_' {
            let hex = name.get(i + 1..i + 3)?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_temp() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        let store = FileStore::open(&config).await.unwrap();
        (dir, store)
    }

    #[test]
    fn field_names_survive_encoding() {
        for key in ["text", "upload date", "_id", "pos/tags", "ação"] {
            assert_eq!(decode_field(&encode_field(key)).as_deref(), Some(key));
        }
        assert_eq!(encode_field("upload date"), "upload_20date");
    }

    #[tokio::test]
    async fn documents_round_trip_through_disk() {
        let (_dir, store) = open_temp().await;
        let fields = json!({"text": "Beautiful is better than ugly.", "tokens": ["Beautiful", "is"]});
        let id = store
            .insert(fields.as_object().cloned().unwrap())
            .await
            .unwrap();

        let found = store.find_by_id(&id).await.unwrap();
        assert_eq!(Value::Object(found), fields);
    }

    #[tokio::test]
    async fn updates_merge_into_existing_fields() {
        let (_dir, store) = open_temp().await;
        let id = store
            .insert(json!({"a": 1, "b": 2}).as_object().cloned().unwrap())
            .await
            .unwrap();
        store
            .update_fields(&id, json!({"b": 3, "c": 4}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let found = store.find_by_id(&id).await.unwrap();
        assert_eq!(Value::Object(found), json!({"a": 1, "b": 3, "c": 4}));
    }

    #[tokio::test]
    async fn missing_ids_are_reported() {
        let (_dir, store) = open_temp().await;
        assert!(matches!(
            store.find_by_id("0000").await,
            Err(PyplnError::DocumentNotFound(_))
        ));
        assert!(matches!(
            store.get_blob("0000").await,
            Err(PyplnError::BlobNotFound(_))
        ));
        assert!(matches!(
            store.find_by_id("../x").await,
            Err(PyplnError::Store(_))
        ));
    }

    #[tokio::test]
    async fn blobs_are_stored_with_info() {
        let (_dir, store) = open_temp().await;
        let id = store
            .put_blob(b"Flat is better than nested.".to_vec(), "zen.txt")
            .await
            .unwrap();
        let blob = store.get_blob(&id).await.unwrap();
        assert_eq!(blob.info.id, id);
        assert_eq!(blob.info.name, "zen.txt");
        assert_eq!(blob.info.length, 27);
        assert_eq!(blob.contents, b"Flat is better than nested.");
    }
}
