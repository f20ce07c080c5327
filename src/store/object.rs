//! Blob storage for PDFs, page images, text and position files.

use crate::error::PipelineError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Key/value blob store.
///
/// Keys are `/`-separated paths as produced by [`crate::paths::ArtifactPaths`].
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a blob. Missing keys are [`PipelineError::ArtifactNotFound`].
    async fn get(&self, key: &str) -> Result<Vec<u8>, PipelineError>;

    /// Store a blob, replacing any previous value.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), PipelineError>;

    /// Remove a blob. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), PipelineError>;

    async fn exists(&self, key: &str) -> Result<bool, PipelineError>;

    /// Size of a blob in bytes.
    async fn size(&self, key: &str) -> Result<u64, PipelineError>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, PipelineError>;
}

/// Read and deserialize a JSON artifact.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<T, PipelineError> {
    let bytes = store.get(key).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Serialize and write a JSON artifact.
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
) -> Result<(), PipelineError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes).await
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Object store held in process memory.
///
/// `fail_next_reads` makes the next N reads fail with
/// [`PipelineError::StorageUnavailable`], for exercising retry paths;
/// `fail_puts_matching` does the same for writes to keys with a given suffix.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing_reads: AtomicU32,
    failing_puts: Mutex<Option<(String, u32)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_puts_matching(&self, suffix: impl Into<String>, n: u32) {
        if let Ok(mut failing) = self.failing_puts.lock() {
            *failing = Some((suffix.into(), n));
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn objects(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, PipelineError> {
        self.objects
            .lock()
            .map_err(|_| PipelineError::Internal("object store lock poisoned".into()))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_injected_put_failure(&self, key: &str) -> bool {
        let Ok(mut failing) = self.failing_puts.lock() else {
            return false;
        };
        match failing.as_mut() {
            Some((suffix, n)) if *n > 0 && key.ends_with(suffix.as_str()) => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        if self.take_injected_failure() {
            return Err(PipelineError::StorageUnavailable(format!(
                "injected failure reading {key}"
            )));
        }
        self.objects()?
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::ArtifactNotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), PipelineError> {
        if self.take_injected_put_failure(key) {
            return Err(PipelineError::StorageUnavailable(format!(
                "injected failure writing {key}"
            )));
        }
        self.objects()?.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        self.objects()?.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, PipelineError> {
        Ok(self.objects()?.contains_key(key))
    }

    async fn size(&self, key: &str) -> Result<u64, PipelineError> {
        self.objects()?
            .get(key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| PipelineError::ArtifactNotFound {
                key: key.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, PipelineError> {
        Ok(self
            .objects()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

// ── Local filesystem store ───────────────────────────────────────────────

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key under the root, refusing keys that escape it.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, PipelineError> {
        let rel = Path::new(key);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(PipelineError::Internal(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(rel))
    }

    fn not_found(key: &str, e: std::io::Error) -> PipelineError {
        if e.kind() == std::io::ErrorKind::NotFound {
            PipelineError::ArtifactNotFound {
                key: key.to_string(),
            }
        } else {
            e.into()
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Self::not_found(key, e))
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), PipelineError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write beside the target and rename so readers never see a torn file.
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        tokio::fs::write(&partial, &data).await?;
        tokio::fs::rename(&partial, &path).await?;
        debug!("Stored {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, PipelineError> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn size(&self, key: &str) -> Result<u64, PipelineError> {
        let path = self.path_for(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;
        Ok(meta.len())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, PipelineError> {
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir_part)?
        };

        let mut keys = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.ends_with(".partial") {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
