//! Tag authorization state
//!
//! [`TagManager`] is the single process-wide owner of the authorization
//! cache and the local authorization list. Both live behind one lock so the
//! cap check and the insert happen atomically under concurrent bursts.
//! The network half of authorization (Authorize requests, offline fallback,
//! revocation) lives in the charge point controller.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

pub mod cache;
pub mod local_list;

pub use cache::{AuthCache, CachedTag};
pub use local_list::LocalAuthList;

use crate::ocpp::configuration::{Key, OcppConfiguration};
use crate::ocpp::messages::{AuthorizationData, IdTagInfo, UpdateType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("local list version mismatch: current {current}, received {received}")]
    VersionMismatch { current: i32, received: i32 },

    #[error("local list would exceed {max} tags")]
    TagLimitReached { max: usize },

    #[error("local authorization list is disabled")]
    ListDisabled,
}

/// Where a locally known verdict came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSource {
    LocalList,
    Cache,
}

/// Persisted form of the tag state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSnapshot {
    pub cache_version: i32,
    pub max_cached_tags: usize,
    pub cache: BTreeMap<String, CachedTag>,
    pub local_list: Option<LocalAuthList>,
}

struct TagState {
    cache: AuthCache,
    local_list: LocalAuthList,
    cache_enabled: bool,
    local_list_enabled: bool,
}

pub struct TagManager {
    state: Mutex<TagState>,
}

impl TagManager {
    pub fn new(configuration: &OcppConfiguration) -> Self {
        let max_cached = configuration.get_or(Key::MaxCachedTags, cache::DEFAULT_MAX_CACHED_TAGS as i64);
        let max_list = configuration.get_or(Key::LocalAuthListMaxLength, local_list::DEFAULT_MAX_LENGTH);

        let mut cache = AuthCache::default();
        cache.set_max_cached_tags(max_cached);

        Self {
            state: Mutex::new(TagState {
                cache,
                local_list: LocalAuthList::new(max_list),
                cache_enabled: configuration.get_bool(Key::AuthorizationCacheEnabled, true),
                local_list_enabled: configuration.get_bool(Key::LocalAuthListEnabled, true),
            }),
        }
    }

    /// Last known verdict: the local list wins over the cache. Stale cache
    /// entries are returned too, for the offline fallback.
    pub fn get_tag(&self, tag_id: &str) -> Option<(IdTagInfo, TagSource)> {
        let state = self.state.lock();
        if state.local_list_enabled {
            if let Some(info) = state.local_list.get(tag_id) {
                return Some((info.clone(), TagSource::LocalList));
            }
        }
        if state.cache_enabled {
            if let Some(entry) = state.cache.get(tag_id) {
                return Some((entry.info.clone(), TagSource::Cache));
            }
        }
        None
    }

    /// True when a fresh local verdict grants charging right now.
    pub fn is_authorized_locally(&self, tag_id: &str, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        if state.local_list_enabled {
            if let Some(info) = state.local_list.get(tag_id) {
                return info.is_valid_at(now);
            }
        }
        state.cache_enabled && state.cache.is_authorized(tag_id, now)
    }

    /// Cache a Central System verdict. A full or disabled cache drops it silently.
    pub fn add_tag(&self, tag_id: &str, info: IdTagInfo) -> bool {
        let mut state = self.state.lock();
        if !state.cache_enabled {
            return false;
        }
        state.cache.add(tag_id, info, Utc::now())
    }

    pub fn remove_tag(&self, tag_id: &str) -> bool {
        self.state.lock().cache.remove(tag_id)
    }

    /// ClearCache
    pub fn clear_cache(&self) {
        self.state.lock().cache.flush();
        info!("authorization cache cleared");
    }

    pub fn cached_tags(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.cache_enabled = enabled;
        if !enabled {
            state.cache.flush();
        }
    }

    pub fn set_max_cached_tags(&self, max: i64) {
        self.state.lock().cache.set_max_cached_tags(max);
    }

    pub fn set_local_list_enabled(&self, enabled: bool) {
        self.state.lock().local_list_enabled = enabled;
    }

    /// GetLocalListVersion: -1 while the list is disabled
    pub fn local_list_version(&self) -> i32 {
        let state = self.state.lock();
        if state.local_list_enabled {
            state.local_list.version()
        } else {
            -1
        }
    }

    /// SendLocalList
    pub fn update_local_list(
        &self,
        version: i32,
        update_type: UpdateType,
        data: Vec<AuthorizationData>,
    ) -> Result<(), AuthError> {
        let mut state = self.state.lock();
        if !state.local_list_enabled {
            return Err(AuthError::ListDisabled);
        }
        state.local_list.apply(version, update_type, data)?;
        info!(version, tags = state.local_list.len(), "local authorization list updated");
        Ok(())
    }

    pub fn snapshot(&self) -> TagSnapshot {
        let state = self.state.lock();
        TagSnapshot {
            cache_version: state.cache.version(),
            max_cached_tags: state.cache.max_cached_tags(),
            cache: state.cache.entries().clone(),
            local_list: Some(state.local_list.clone()),
        }
    }

    /// Restore persisted tags. The configured caps stay authoritative.
    pub fn restore(&self, snapshot: TagSnapshot) {
        let mut state = self.state.lock();
        let now = Utc::now();
        state.cache.set_version(snapshot.cache_version);
        state.cache.load(snapshot.cache, now);

        if let Some(mut list) = snapshot.local_list {
            list.set_max_length(state.local_list.max_length());
            state.local_list = list;
        }
        info!(cached = state.cache.len(), local = state.local_list.len(), "restored tag state");
    }

    /// Drop expired cache entries; returns how many went.
    pub fn purge_expired(&self) -> usize {
        self.state.lock().cache.purge_expired(Utc::now())
    }
}
