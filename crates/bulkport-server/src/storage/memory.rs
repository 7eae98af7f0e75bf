use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use super::{calculate_sha256, ObjectReader, ObjectStore, UploadResult};
use crate::error::{ImportError, ImportResult};

/// Object store held in process memory
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Arc::default(),
        }
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.lock().insert(key.into(), data.into());
    }

    /// Stored keys in lexicographic order
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn contents(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, data: Vec<u8>, _content_type: Option<&str>) -> ImportResult<UploadResult> {
        let result = UploadResult {
            key: key.to_string(),
            checksum: calculate_sha256(&data),
            size: data.len() as i64,
        };
        self.lock().insert(key.to_string(), data);
        Ok(result)
    }

    async fn get(&self, key: &str) -> ImportResult<Vec<u8>> {
        self.contents(key)
            .ok_or_else(|| ImportError::ObjectStore(format!("No such key: {key}")))
    }

    async fn open_read(&self, key: &str) -> ImportResult<ObjectReader> {
        let data = self.get(key).await?;
        Ok(Box::new(Cursor::new(data)))
    }
}
