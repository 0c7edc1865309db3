//! Filesystem-backed collaborators.

use super::{BlobStorage, HistoryRecord, HistoryWriter};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const FILE_SCHEME: &str = "file://";

/// Sidecar suffix holding an object's metadata as JSON.
const META_SUFFIX: &str = ".meta.json";

/// Blob storage rooted at a local directory. URIs are `file://{absolute path}`.
#[derive(Debug, Clone)]
pub struct FsBlobStorage {
    root: PathBuf,
}

impl FsBlobStorage {
    /// Use `root` as the storage directory, creating it if missing.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` under the root, rejecting absolute keys and `..`.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        self.join_relative(Path::new(key))
            .ok_or_else(|| PipelineError::Storage(format!("invalid object key '{key}'")))
    }

    /// Join a path that may only descend from the root.
    fn join_relative(&self, relative: &Path) -> Option<PathBuf> {
        let mut components = relative.components().peekable();
        components.peek()?;
        components
            .all(|c| matches!(c, Component::Normal(_)))
            .then(|| self.root.join(relative))
    }

    /// Map a `file://` URI back to a path under the root. Anything after the
    /// root must be plain names, so `..` cannot climb out.
    fn resolve_uri(&self, uri: &str) -> Option<PathBuf> {
        let path = Path::new(uri.strip_prefix(FILE_SCHEME)?);
        let relative = path.strip_prefix(&self.root).ok()?;
        self.join_relative(relative)
    }

    fn path_from_uri(&self, uri: &str) -> Result<PathBuf> {
        self.resolve_uri(uri).ok_or_else(|| {
            PipelineError::Storage(format!(
                "uri '{uri}' is not an object under {}",
                self.root.display()
            ))
        })
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }
}

#[async_trait]
impl BlobStorage for FsBlobStorage {
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        overwrite: bool,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String> {
        let path = self.path_for(key)?;
        if !overwrite && tokio::fs::try_exists(&path).await? {
            return Err(PipelineError::Storage(format!(
                "object '{key}' already exists"
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        tokio::fs::write(Self::meta_path(&path), serde_json::to_vec(metadata)?).await?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "stored blob");
        Ok(format!("{FILE_SCHEME}{}", path.display()))
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.path_from_uri(uri)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PipelineError::Storage(format!("object '{}' not found", path.display()))
            }
            _ => PipelineError::Io(e),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PipelineError::Storage(format!("object '{key}' not found"))
            }
            _ => PipelineError::Io(e),
        })?;
        match tokio::fs::remove_file(Self::meta_path(&path)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn owns(&self, uri: &str) -> bool {
        self.resolve_uri(uri).is_some()
    }
}

/// Action history appended as JSON lines to a file.
#[derive(Debug)]
pub struct JsonlHistory {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record. A missing file reads as empty.
    pub async fn read_all(&self) -> Result<Vec<HistoryRecord>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(PipelineError::from))
            .collect()
    }
}

#[async_trait]
impl HistoryWriter for JsonlHistory {
    async fn append(&self, record: HistoryRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.write.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
