use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::flow::{Credentials, FlowConfig, FlowError};

pub const FLOWS_FILE: &str = "flows.json";
pub const CREDENTIALS_FILE: &str = "flows_cred.json";
const LIBRARY_DIR: &str = "library";

/// Poll cadence for detecting external edits to the storage files.
pub const FILE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored flows are unreadable: {0}")]
    Malformed(#[from] FlowError),
    #[error("stored credentials are unreadable: {0}")]
    MalformedCredentials(String),
    #[error("library entry `{0}` is not valid JSON")]
    MalformedLibrary(String),
    #[error("library path `{0}` is not allowed")]
    InvalidPath(String),
    #[error("library entry `{0}` not found")]
    NotFound(String),
}

/// Flat-file persistence rooted at the runtime directory: the flow
/// configuration, its credentials, and the shared library tree.
///
/// Writes go through a single gate and always land credentials before
/// flows, so a failure mid-save can strand an unused credential entry but
/// never a flow referencing credentials that were not written.
pub struct FileStorage {
    root: PathBuf,
    write_gate: Mutex<()>,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_gate: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn flows_path(&self) -> PathBuf {
        self.root.join(FLOWS_FILE)
    }

    fn credentials_path(&self) -> PathBuf {
        self.root.join(CREDENTIALS_FILE)
    }

    /// Read the persisted configuration. Missing files mean a fresh install
    /// and load as an empty configuration, not an error.
    pub async fn load_flows(&self) -> Result<(FlowConfig, Credentials), StorageError> {
        let config = match fs::read(self.flows_path()).await {
            Ok(bytes) => {
                let value: Value = serde_json::from_slice(&bytes)
                    .map_err(|e| FlowError::Malformed(e.to_string()))?;
                FlowConfig::from_value(value)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.flows_path().display(), "no stored flows");
                FlowConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        let credentials = match fs::read(self.credentials_path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::MalformedCredentials(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Credentials::new(),
            Err(e) => return Err(e.into()),
        };

        Ok((config, credentials))
    }

    /// Persist a configuration, credentials first.
    pub async fn save_flows(
        &self,
        config: &FlowConfig,
        credentials: &Credentials,
    ) -> Result<(), StorageError> {
        let _guard = self.write_gate.lock().await;
        fs::create_dir_all(&self.root).await?;

        write_json(&self.credentials_path(), &serde_json::to_value(credentials).unwrap_or_default())
            .await?;
        write_json(&self.flows_path(), &config.to_value()).await?;
        info!(path = %self.flows_path().display(), "flow configuration saved");
        Ok(())
    }

    /// Resolve a library entry path under the storage root, rejecting
    /// absolute paths and any `..` component.
    fn library_path(&self, kind: &str, entry: &str) -> Result<PathBuf, StorageError> {
        for part in [kind, entry] {
            let path = Path::new(part);
            if path.is_absolute()
                || path
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
            {
                return Err(StorageError::InvalidPath(part.to_string()));
            }
        }
        Ok(self.root.join(LIBRARY_DIR).join(kind).join(entry))
    }

    /// Fetch a library entry. A file path returns its JSON body; a
    /// directory path returns a listing of subdirectories and entries.
    pub async fn get_library_entry(&self, kind: &str, entry: &str) -> Result<Value, StorageError> {
        let path = self.library_path(kind, entry)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(entry.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if meta.is_file() {
            let bytes = fs::read(&path).await?;
            return serde_json::from_slice(&bytes)
                .map_err(|_| StorageError::MalformedLibrary(entry.to_string()));
        }

        let mut listing: Vec<Value> = Vec::new();
        let mut entries = fs::read_dir(&path).await?;
        while let Some(item) = entries.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if item.file_type().await?.is_dir() {
                listing.push(json!(name));
            } else {
                let mut record = Map::new();
                record.insert("fn".into(), json!(name));
                listing.push(Value::Object(record));
            }
        }
        listing.sort_by_key(|v| v.to_string());
        Ok(Value::Array(listing))
    }

    pub async fn save_library_entry(
        &self,
        kind: &str,
        entry: &str,
        body: &Value,
    ) -> Result<(), StorageError> {
        let _guard = self.write_gate.lock().await;
        let path = self.library_path(kind, entry)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_json(&path, body).await?;
        debug!(kind, entry, "library entry saved");
        Ok(())
    }
}

/// Write via a sibling temp file and rename, so readers never observe a
/// half-written document.
async fn write_json(path: &Path, value: &Value) -> Result<(), StorageError> {
    let body = serde_json::to_vec_pretty(value).unwrap_or_default();
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
