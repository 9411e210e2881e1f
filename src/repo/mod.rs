//! Persistence of EVSE, tag and configuration state across restarts.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::auth::TagSnapshot;
use crate::config::StorageConfig;
use crate::evse::EvseSnapshot;
use crate::ocpp::messages::KeyValue;

pub mod file;
pub mod memory;

pub use file::{FileRepository, StorageFormat};
pub use memory::MemoryRepository;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Key under which an EVSE snapshot is stored
pub fn evse_key(evse_id: i32) -> String {
    format!("evse-{evse_id}")
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_evses(&self) -> Result<Vec<EvseSnapshot>, RepoError>;
    async fn save_evse(&self, snapshot: &EvseSnapshot) -> Result<(), RepoError>;
    async fn load_tags(&self) -> Result<Option<TagSnapshot>, RepoError>;
    async fn save_tags(&self, snapshot: &TagSnapshot) -> Result<(), RepoError>;
    async fn load_configuration(&self) -> Result<Vec<KeyValue>, RepoError>;
    async fn save_configuration(&self, entries: &[KeyValue]) -> Result<(), RepoError>;
}

/// Repository selected by the storage settings
pub fn from_config(cfg: &StorageConfig) -> Arc<dyn Repository> {
    if !cfg.enabled {
        return Arc::new(MemoryRepository::default());
    }
    Arc::new(FileRepository::new(&cfg.path, StorageFormat::from_name(&cfg.format)))
}
