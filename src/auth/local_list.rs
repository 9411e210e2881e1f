//! Local authorization list pushed by the Central System with SendLocalList

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::AuthError;
use crate::ocpp::messages::{AuthorizationData, IdTagInfo, UpdateType};

pub const DEFAULT_MAX_LENGTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalAuthList {
    version: i32,
    entries: BTreeMap<String, IdTagInfo>,
    #[serde(skip, default = "default_max_length")]
    max_length: usize,
}

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

impl Default for LocalAuthList {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LENGTH)
    }
}

impl LocalAuthList {
    pub fn new(max_length: usize) -> Self {
        Self {
            version: 0,
            entries: BTreeMap::new(),
            max_length,
        }
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, tag_id: &str) -> Option<&IdTagInfo> {
        self.entries.get(tag_id)
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length;
    }

    /// Apply a SendLocalList update. On error the list is left untouched.
    pub fn apply(
        &mut self,
        version: i32,
        update_type: UpdateType,
        data: Vec<AuthorizationData>,
    ) -> Result<(), AuthError> {
        let updated = match update_type {
            UpdateType::Full => data
                .into_iter()
                .filter_map(|d| d.id_tag_info.map(|info| (d.id_tag, info)))
                .collect::<BTreeMap<_, _>>(),
            UpdateType::Differential => {
                if version <= self.version {
                    return Err(AuthError::VersionMismatch {
                        current: self.version,
                        received: version,
                    });
                }
                let mut updated = self.entries.clone();
                for item in data {
                    match item.id_tag_info {
                        Some(info) => {
                            updated.insert(item.id_tag, info);
                        }
                        None => {
                            updated.remove(&item.id_tag);
                        }
                    }
                }
                updated
            }
        };

        if updated.len() > self.max_length {
            return Err(AuthError::TagLimitReached { max: self.max_length });
        }

        self.entries = updated;
        self.version = version;
        Ok(())
    }
}
