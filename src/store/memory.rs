use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    apply_range, content_etag, ByteRange, Precondition, StorageBackend, StoreConfig,
    StoreMetadata,
};
use crate::error::{DbError, DbResult};

/// In-memory object store with native conditional PUT.
///
/// Clones share the same underlying map, so several clients can be pointed
/// at one `MemoryStore` to exercise concurrent-writer behavior in tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn list(&self, prefix: &str) -> DbResult<Vec<String>> {
        let objects = self.objects.read();
        Ok(objects
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, name: &str, range: Option<ByteRange>) -> DbResult<Vec<u8>> {
        let objects = self.objects.read();
        let bytes = objects
            .get(name)
            .ok_or_else(|| DbError::NotFound(name.to_string()))?;
        apply_range(bytes, range)
    }

    async fn put(
        &self,
        name: &str,
        bytes: &[u8],
        precondition: Precondition,
    ) -> DbResult<String> {
        let mut objects = self.objects.write();
        match &precondition {
            Precondition::None => {}
            Precondition::NotExists => {
                if objects.contains_key(name) {
                    return Err(DbError::Conflict(format!(
                        "object '{}' already exists",
                        name
                    )));
                }
            }
            Precondition::IfMatch(expected) => match objects.get(name) {
                Some(current) if &content_etag(current) == expected => {}
                Some(_) => {
                    return Err(DbError::Conflict(format!(
                        "object '{}' was modified concurrently",
                        name
                    )))
                }
                None => {
                    return Err(DbError::Conflict(format!(
                        "object '{}' vanished under if-match",
                        name
                    )))
                }
            },
        }
        objects.insert(name.to_string(), bytes.to_vec());
        Ok(content_etag(bytes))
    }

    async fn delete(&self, name: &str) -> DbResult<()> {
        let mut objects = self.objects.write();
        if objects.remove(name).is_none() {
            return Err(DbError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn metadata(&self) -> StoreMetadata {
        StoreMetadata {
            kind: "memory".to_string(),
            supports_cas: true,
            location: None,
        }
    }

    fn config(&self) -> StoreConfig {
        StoreConfig::Memory
    }
}
