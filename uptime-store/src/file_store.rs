/*!
Directory-per-collection, file-per-record implementation of [`RecordStore`]
*/

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::error::{StoreError, StoreResult};
use crate::record_store::RecordStore;

const RECORD_EXTENSION: &str = "json";
const TEMP_SUFFIX_LEN: usize = 12;

/// Stores each record as `<base_dir>/<collection>/<key>.json`.
///
/// Writes land in a hidden temporary file next to the target and are renamed
/// over it, so readers only ever see a complete document. Writers to the same
/// file are serialized in-process.
pub struct FileStore {
    base_dir: PathBuf,
    writers: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Open (and create if missing) a store rooted at `base_dir`
    pub async fn open(base_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await.map_err(StoreError::Open)?;
        debug!("Opened record store at {:?}", base_dir);

        Ok(Self {
            base_dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn collection_dir(&self, collection: &str) -> StoreResult<PathBuf> {
        validate_name(collection)?;
        Ok(self.base_dir.join(collection))
    }

    fn record_path(&self, collection: &str, key: &str) -> StoreResult<PathBuf> {
        validate_name(key)?;
        Ok(self
            .collection_dir(collection)?
            .join(format!("{key}.{RECORD_EXTENSION}")))
    }

    /// Exclusive access to one record file for the duration of a write
    async fn lock_record(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut writers = self.writers.lock().await;
            // Entries nobody holds or waits on are only referenced by the map
            writers.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                writers
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    async fn exists(&self, collection: &str, key: &str, path: &Path) -> StoreResult<bool> {
        match fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error(collection, key, source)),
        }
    }

    async fn write_atomic(
        &self,
        collection: &str,
        key: &str,
        path: &Path,
        document: &Value,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(document).map_err(|source| StoreError::Encode {
            collection: collection.to_string(),
            key: key.to_string(),
            source,
        })?;

        let dir = self.collection_dir(collection)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| io_error(collection, key, source))?;

        let tmp = dir.join(format!(".{key}.{}.tmp", temp_suffix()));
        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, path).await
        }
        .await;

        if let Err(source) = written {
            error!("Failed to write record {}/{}: {}", collection, key, source);
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(collection, key, source));
        }

        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn create(&self, collection: &str, key: &str, document: &Value) -> StoreResult<()> {
        let path = self.record_path(collection, key)?;
        let _guard = self.lock_record(&path).await;

        if self.exists(collection, key, &path).await? {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }

        self.write_atomic(collection, key, &path, document).await?;
        debug!("Created record {}/{}", collection, key);
        Ok(())
    }

    async fn read(&self, collection: &str, key: &str) -> StoreResult<Value> {
        let path = self.record_path(collection, key)?;

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Record {}/{} is unreadable: {}", collection, key, e);
                }
                return Err(not_found(collection, key));
            }
        };

        serde_json::from_slice(&bytes).map_err(|source| {
            warn!("Record {}/{} is corrupt: {}", collection, key, source);
            StoreError::Corrupt {
                collection: collection.to_string(),
                key: key.to_string(),
                source,
            }
        })
    }

    async fn update(&self, collection: &str, key: &str, document: &Value) -> StoreResult<()> {
        let path = self.record_path(collection, key)?;
        let _guard = self.lock_record(&path).await;

        if !self.exists(collection, key, &path).await? {
            return Err(not_found(collection, key));
        }

        self.write_atomic(collection, key, &path, document).await?;
        debug!("Updated record {}/{}", collection, key);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> StoreResult<()> {
        let path = self.record_path(collection, key)?;
        let _guard = self.lock_record(&path).await;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted record {}/{}", collection, key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found(collection, key)),
            Err(source) => {
                error!("Failed to delete record {}/{}: {}", collection, key, source);
                Err(io_error(collection, key, source))
            }
        }
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<String>> {
        let dir = self.collection_dir(collection)?;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(collection, "*", source)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error(collection, "*", source))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Names become path components, so only a conservative alphabet is allowed
fn validate_name(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

fn temp_suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..TEMP_SUFFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn not_found(collection: &str, key: &str) -> StoreError {
    StoreError::NotFound {
        collection: collection.to_string(),
        key: key.to_string(),
    }
}

fn io_error(collection: &str, key: &str, source: std::io::Error) -> StoreError {
    StoreError::Io {
        collection: collection.to_string(),
        key: key.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::RecordStoreExt;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::open(dir.path().join("data"))
            .await
            .expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn create_then_read_returns_stored_document() {
        let (_dir, store) = store().await;
        let doc = json!({"firstName": "Ada", "checks": ["a", "b"], "nested": {"n": 1}});

        store.create("users", "5551234567", &doc).await.expect("create");
        let read = store.read("users", "5551234567").await.expect("read");

        assert_eq!(read, doc);
    }

    #[tokio::test]
    async fn create_refuses_to_overwrite() {
        let (_dir, store) = store().await;
        store.create("users", "k", &json!({"v": 1})).await.expect("create");

        let err = store.create("users", "k", &json!({"v": 2})).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.read("users", "k").await.expect("read"), json!({"v": 1}));
    }

    #[tokio::test]
    async fn update_replaces_whole_document() {
        let (_dir, store) = store().await;
        store
            .create("checks", "c1", &json!({"url": "a.com", "method": "get"}))
            .await
            .expect("create");

        store
            .update("checks", "c1", &json!({"url": "b.com"}))
            .await
            .expect("update");

        assert_eq!(
            store.read("checks", "c1").await.expect("read"),
            json!({"url": "b.com"})
        );
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let (_dir, store) = store().await;

        assert!(store.read("tokens", "nope").await.unwrap_err().is_not_found());
        assert!(
            store
                .update("tokens", "nope", &json!({}))
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(store.delete("tokens", "nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let (_dir, store) = store().await;
        store.create("tokens", "t1", &json!({"id": "t1"})).await.expect("create");

        store.delete("tokens", "t1").await.expect("delete");

        assert!(store.read("tokens", "t1").await.unwrap_err().is_not_found());
        assert!(store.list("tokens").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn list_of_unknown_collection_is_empty() {
        let (_dir, store) = store().await;
        assert!(store.list("checks").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn list_skips_temporary_and_foreign_files() {
        let (_dir, store) = store().await;
        store.create("checks", "b", &json!(1)).await.expect("create");
        store.create("checks", "a", &json!(2)).await.expect("create");
        let dir = store.base_dir().join("checks");
        std::fs::write(dir.join(".a.partial.tmp"), b"{").expect("write tmp");
        std::fs::write(dir.join("notes.txt"), b"x").expect("write txt");

        assert_eq!(store.list("checks").await.expect("list"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unparseable_file_is_corrupt() {
        let (_dir, store) = store().await;
        let dir = store.base_dir().join("users");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("broken.json"), b"{\"firstName\": ").expect("write");

        let err = store.read("users", "broken").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn path_like_names_are_rejected() {
        let (_dir, store) = store().await;

        for name in ["", "..", "../etc", "a/b", "a.b"] {
            let err = store.create("users", name, &json!({})).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidName(_)), "{name:?}");
        }
        let err = store.list("../users").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
    }

    #[tokio::test]
    async fn concurrent_updates_never_mix_documents() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);
        store
            .create("checks", "c", &json!({"writer": -1, "payload": ""}))
            .await
            .expect("create");

        let mut joins = Vec::new();
        for writer in 0..16 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                let doc = json!({"writer": writer, "payload": "x".repeat(4096 * (writer + 1))});
                store.update("checks", "c", &doc).await
            }));
        }
        for join in joins {
            join.await.expect("join").expect("update");
        }

        let doc = store.read("checks", "c").await.expect("read");
        let writer = doc["writer"].as_u64().expect("writer") as usize;
        assert_eq!(doc["payload"].as_str().expect("payload").len(), 4096 * (writer + 1));
        assert_eq!(store.list("checks").await.expect("list"), vec!["c"]);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        url: String,
        timeout: u8,
    }

    #[tokio::test]
    async fn typed_helpers_round_trip_through_json() {
        let (_dir, store) = store().await;
        let probe = Probe {
            url: "example.com".to_string(),
            timeout: 3,
        };

        store.create_as("checks", "p", &probe).await.expect("create");
        let read: Probe = store.read_as("checks", "p").await.expect("read");
        assert_eq!(read, probe);

        store.update("checks", "p", &json!({"url": 5})).await.expect("update");
        let err = store.read_as::<Probe>("checks", "p").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
