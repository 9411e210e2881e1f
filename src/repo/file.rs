use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::{evse_key, RepoError, Repository};
use crate::auth::TagSnapshot;
use crate::evse::EvseSnapshot;
use crate::ocpp::messages::KeyValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageFormat {
    #[default]
    Json,
    Yaml,
}

impl StorageFormat {
    /// "yaml"/"yml" select YAML, anything else JSON
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "yaml" | "yml" => StorageFormat::Yaml,
            _ => StorageFormat::Json,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            StorageFormat::Json => "json",
            StorageFormat::Yaml => "yaml",
        }
    }

    fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, RepoError> {
        Ok(match self {
            StorageFormat::Json => serde_json::to_vec_pretty(value)?,
            StorageFormat::Yaml => serde_yaml::to_string(value)?.into_bytes(),
        })
    }

    fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, RepoError> {
        Ok(match self {
            StorageFormat::Json => serde_json::from_slice(bytes)?,
            StorageFormat::Yaml => serde_yaml::from_slice(bytes)?,
        })
    }
}

/// One file per collection under `dir`, replaced atomically on every write.
#[derive(Debug)]
pub struct FileRepository {
    dir: PathBuf,
    format: StorageFormat,
    write_lock: Mutex<()>,
}

impl FileRepository {
    pub fn new(dir: impl Into<PathBuf>, format: StorageFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.{}", self.format.extension()))
    }

    async fn read<T: DeserializeOwned>(&self, collection: &str) -> Result<Option<T>, RepoError> {
        let path = self.path(collection);
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => self.format.decode(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn write<T: Serialize>(&self, collection: &str, value: &T) -> Result<(), RepoError> {
        let bytes = self.format.encode(value)?;
        let path = self.path(collection);
        let tmp = path.with_extension("tmp");

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| io_error(&path, e))?;

        debug!(path = %path.display(), bytes = bytes.len(), "state written");
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> RepoError {
    RepoError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn load_evses(&self) -> Result<Vec<EvseSnapshot>, RepoError> {
        let evses: Option<BTreeMap<String, EvseSnapshot>> = self.read("evses").await?;
        Ok(evses.map(|m| m.into_values().collect()).unwrap_or_default())
    }

    async fn save_evse(&self, snapshot: &EvseSnapshot) -> Result<(), RepoError> {
        let _guard = self.write_lock.lock().await;
        let mut evses: BTreeMap<String, EvseSnapshot> = self.read("evses").await?.unwrap_or_default();
        evses.insert(evse_key(snapshot.evse_id), snapshot.clone());
        self.write("evses", &evses).await
    }

    async fn load_tags(&self) -> Result<Option<TagSnapshot>, RepoError> {
        self.read("tags").await
    }

    async fn save_tags(&self, snapshot: &TagSnapshot) -> Result<(), RepoError> {
        let _guard = self.write_lock.lock().await;
        self.write("tags", snapshot).await
    }

    async fn load_configuration(&self) -> Result<Vec<KeyValue>, RepoError> {
        Ok(self.read("configuration").await?.unwrap_or_default())
    }

    async fn save_configuration(&self, entries: &[KeyValue]) -> Result<(), RepoError> {
        let _guard = self.write_lock.lock().await;
        self.write("configuration", &entries).await
    }
}
