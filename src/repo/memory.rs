use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::{evse_key, RepoError, Repository};
use crate::auth::TagSnapshot;
use crate::evse::EvseSnapshot;
use crate::ocpp::messages::KeyValue;

#[derive(Debug, Default)]
struct Stored {
    evses: BTreeMap<String, EvseSnapshot>,
    tags: Option<TagSnapshot>,
    configuration: Vec<KeyValue>,
}

/// Volatile repository, used when storage is disabled and in tests
#[derive(Debug, Default)]
pub struct MemoryRepository {
    stored: Mutex<Stored>,
}

impl MemoryRepository {
    pub fn evse(&self, evse_id: i32) -> Option<EvseSnapshot> {
        self.stored.lock().evses.get(&evse_key(evse_id)).cloned()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn load_evses(&self) -> Result<Vec<EvseSnapshot>, RepoError> {
        Ok(self.stored.lock().evses.values().cloned().collect())
    }

    async fn save_evse(&self, snapshot: &EvseSnapshot) -> Result<(), RepoError> {
        self.stored
            .lock()
            .evses
            .insert(evse_key(snapshot.evse_id), snapshot.clone());
        Ok(())
    }

    async fn load_tags(&self) -> Result<Option<TagSnapshot>, RepoError> {
        Ok(self.stored.lock().tags.clone())
    }

    async fn save_tags(&self, snapshot: &TagSnapshot) -> Result<(), RepoError> {
        self.stored.lock().tags = Some(snapshot.clone());
        Ok(())
    }

    async fn load_configuration(&self) -> Result<Vec<KeyValue>, RepoError> {
        Ok(self.stored.lock().configuration.clone())
    }

    async fn save_configuration(&self, entries: &[KeyValue]) -> Result<(), RepoError> {
        self.stored.lock().configuration = entries.to_vec();
        Ok(())
    }
}
