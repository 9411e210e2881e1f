//! Authorization cache
//!
//! Last known verdict per tag, evicted at the tag's expiry date or after a
//! default TTL. The entry cap is a soft bound: inserts past it are dropped
//! silently so a full cache never blocks authorization.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::ocpp::messages::IdTagInfo;

pub const DEFAULT_MAX_CACHED_TAGS: usize = 100;
pub const DEFAULT_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTag {
    pub info: IdTagInfo,
    pub expires_at: DateTime<Utc>,
}

impl CachedTag {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct AuthCache {
    entries: BTreeMap<String, CachedTag>,
    version: i32,
    max_entries: usize,
    default_ttl: Duration,
}

impl Default for AuthCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHED_TAGS, Duration::minutes(DEFAULT_TTL_MINUTES))
    }
}

impl AuthCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            version: 0,
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    /// Insert or refresh a verdict. Returns false when the cap rejected the insert.
    pub fn add(&mut self, tag_id: &str, info: IdTagInfo, now: DateTime<Utc>) -> bool {
        let expires_at = info.expiry_date.unwrap_or(now + self.default_ttl);
        let entry = CachedTag { info, expires_at };

        if let Some(existing) = self.entries.get_mut(tag_id) {
            *existing = entry;
            return true;
        }

        if self.entries.len() >= self.max_entries {
            self.purge_expired(now);
        }
        if self.entries.len() >= self.max_entries {
            debug!(tag_id, max = self.max_entries, "authorization cache full, tag not cached");
            return false;
        }

        self.entries.insert(tag_id.to_string(), entry);
        true
    }

    /// Entry regardless of TTL
    pub fn get(&self, tag_id: &str) -> Option<&CachedTag> {
        self.entries.get(tag_id)
    }

    /// Accepted, inside the TTL and not past its expiry date
    pub fn is_authorized(&self, tag_id: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(tag_id)
            .map_or(false, |entry| !entry.is_expired(now) && entry.info.is_valid_at(now))
    }

    pub fn remove(&mut self, tag_id: &str) -> bool {
        self.entries.remove(tag_id).is_some()
    }

    /// Drop every tag but keep the version and the cap.
    pub fn flush(&mut self) {
        self.entries.clear();
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Non-positive values leave the limit unchanged.
    pub fn set_max_cached_tags(&mut self, max: i64) {
        if max <= 0 {
            debug!(max, "ignoring non-positive cache limit");
            return;
        }
        self.max_entries = usize::try_from(max).unwrap_or(usize::MAX);
    }

    pub fn max_cached_tags(&self) -> usize {
        self.max_entries
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn set_version(&mut self, version: i32) {
        self.version = version;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, CachedTag> {
        &self.entries
    }

    /// Replace contents from a persisted snapshot, honouring the cap.
    pub fn load(&mut self, entries: BTreeMap<String, CachedTag>, now: DateTime<Utc>) {
        self.entries = entries
            .into_iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .take(self.max_entries)
            .collect();
    }
}
