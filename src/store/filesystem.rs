use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::Rng;
use tokio::fs;
use tokio::sync::Mutex;

use super::{
    apply_range, content_etag, ByteRange, Precondition, StorageBackend, StoreConfig,
    StoreMetadata,
};
use crate::error::{DbError, DbResult};

/// Object store backed by a local directory tree.
///
/// Object names map to relative paths under the root; writes go through a
/// temp file plus rename so a crash never leaves a partial object visible.
/// Conditional PUTs are serialized by an in-process lock, which is enough
/// for the single-session consistency the engine relies on.
pub struct FileSystemStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> DbResult<PathBuf> {
        if name.is_empty()
            || name.starts_with('/')
            || name.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(DbError::InvariantViolation(format!(
                "illegal object name '{}'",
                name
            )));
        }
        Ok(self.root.join(name))
    }

    async fn read_object(&self, name: &str) -> DbResult<Vec<u8>> {
        let path = self.resolve(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DbError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn collect_names(
        &self,
        dir: &Path,
        rel: &str,
        out: &mut Vec<String>,
    ) -> DbResult<()> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let child_rel = if rel.is_empty() {
                file_name.to_string()
            } else {
                format!("{}/{}", rel, file_name)
            };
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                Box::pin(self.collect_names(&entry.path(), &child_rel, out)).await?;
            } else if !file_name.ends_with(".tmp") {
                out.push(child_rel);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileSystemStore {
    async fn list(&self, prefix: &str) -> DbResult<Vec<String>> {
        let mut names = Vec::new();
        self.collect_names(&self.root.clone(), "", &mut names).await?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    async fn get(&self, name: &str, range: Option<ByteRange>) -> DbResult<Vec<u8>> {
        let bytes = self.read_object(name).await?;
        apply_range(&bytes, range)
    }

    async fn put(
        &self,
        name: &str,
        bytes: &[u8],
        precondition: Precondition,
    ) -> DbResult<String> {
        let path = self.resolve(name)?;
        let _guard = self.write_lock.lock().await;

        match &precondition {
            Precondition::None => {}
            Precondition::NotExists => {
                if fs::try_exists(&path).await? {
                    return Err(DbError::Conflict(format!(
                        "object '{}' already exists",
                        name
                    )));
                }
            }
            Precondition::IfMatch(expected) => match self.read_object(name).await {
                Ok(current) if &content_etag(&current) == expected => {}
                Ok(_) => {
                    return Err(DbError::Conflict(format!(
                        "object '{}' was modified concurrently",
                        name
                    )))
                }
                Err(DbError::NotFound(_)) => {
                    return Err(DbError::Conflict(format!(
                        "object '{}' vanished under if-match",
                        name
                    )))
                }
                Err(e) => return Err(e),
            },
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let suffix: u32 = rand::thread_rng().gen();
        let tmp = path.with_extension(format!("{:08x}.tmp", suffix));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(content_etag(bytes))
    }

    async fn delete(&self, name: &str) -> DbResult<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DbError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn metadata(&self) -> StoreMetadata {
        StoreMetadata {
            kind: "filesystem".to_string(),
            supports_cas: true,
            location: Some(self.root.display().to_string()),
        }
    }

    fn config(&self) -> StoreConfig {
        StoreConfig::FileSystem {
            root: self.root.clone(),
        }
    }
}
