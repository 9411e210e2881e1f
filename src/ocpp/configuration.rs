//! OCPP configuration key store
//!
//! String keyed, as the protocol exposes it through GetConfiguration and
//! ChangeConfiguration. Typed reads always take a fallback so a missing or
//! garbled value never stops the charge point.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

use super::messages::KeyValue;
use super::FeatureProfile;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("configuration key not found: {0}")]
    KeyNotFound(String),

    #[error("configuration key is read-only: {0}")]
    ReadOnly(String),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

/// Keys known to this charge point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr)]
pub enum Key {
    AllowOfflineTxForUnknownId,
    AuthorizationCacheEnabled,
    AuthorizeRemoteTxRequests,
    ClockAlignedDataInterval,
    ConnectionTimeOut,
    GetConfigurationMaxKeys,
    HeartbeatInterval,
    LocalAuthorizeOffline,
    LocalPreAuthorize,
    MeterValuesAlignedData,
    MeterValuesSampledData,
    MeterValueSampleInterval,
    NumberOfConnectors,
    ResetRetries,
    StopTransactionOnEVSideDisconnect,
    StopTransactionOnInvalidId,
    StopTxnAlignedData,
    StopTxnSampledData,
    SupportedFeatureProfiles,
    TransactionMessageAttempts,
    TransactionMessageRetryInterval,
    UnlockConnectorOnEVSideDisconnect,
    WebSocketPingInterval,
    LocalAuthListEnabled,
    LocalAuthListMaxLength,
    SendLocalListMaxLength,
    ReserveConnectorZeroSupported,
    MaxCachedTags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Integer,
    Boolean,
    List,
}

impl Key {
    fn default_value(self) -> &'static str {
        match self {
            Key::AllowOfflineTxForUnknownId => "false",
            Key::AuthorizationCacheEnabled => "true",
            Key::AuthorizeRemoteTxRequests => "false",
            Key::ClockAlignedDataInterval => "0",
            Key::ConnectionTimeOut => "60",
            Key::GetConfigurationMaxKeys => "50",
            Key::HeartbeatInterval => "60",
            Key::LocalAuthorizeOffline => "true",
            Key::LocalPreAuthorize => "false",
            Key::MeterValuesAlignedData => "Energy.Active.Import.Register",
            Key::MeterValuesSampledData => {
                "Energy.Active.Import.Register,Power.Active.Import,Current.Import,Voltage"
            }
            Key::MeterValueSampleInterval => "30",
            Key::NumberOfConnectors => "1",
            Key::ResetRetries => "3",
            Key::StopTransactionOnEVSideDisconnect => "true",
            Key::StopTransactionOnInvalidId => "true",
            Key::StopTxnAlignedData => "",
            Key::StopTxnSampledData => "Energy.Active.Import.Register",
            Key::SupportedFeatureProfiles => "Core,LocalAuthListManagement,Reservation,RemoteTrigger",
            Key::TransactionMessageAttempts => "5",
            Key::TransactionMessageRetryInterval => "30",
            Key::UnlockConnectorOnEVSideDisconnect => "true",
            Key::WebSocketPingInterval => "54",
            Key::LocalAuthListEnabled => "true",
            Key::LocalAuthListMaxLength => "10",
            Key::SendLocalListMaxLength => "10",
            Key::ReserveConnectorZeroSupported => "false",
            Key::MaxCachedTags => "100",
        }
    }

    fn is_read_only(self) -> bool {
        matches!(
            self,
            Key::NumberOfConnectors
                | Key::SupportedFeatureProfiles
                | Key::GetConfigurationMaxKeys
                | Key::LocalAuthListMaxLength
                | Key::SendLocalListMaxLength
                | Key::ReserveConnectorZeroSupported
        )
    }

    fn kind(self) -> ValueKind {
        match self {
            Key::AllowOfflineTxForUnknownId
            | Key::AuthorizationCacheEnabled
            | Key::AuthorizeRemoteTxRequests
            | Key::LocalAuthorizeOffline
            | Key::LocalPreAuthorize
            | Key::StopTransactionOnEVSideDisconnect
            | Key::StopTransactionOnInvalidId
            | Key::UnlockConnectorOnEVSideDisconnect
            | Key::LocalAuthListEnabled
            | Key::ReserveConnectorZeroSupported => ValueKind::Boolean,
            Key::MeterValuesAlignedData
            | Key::MeterValuesSampledData
            | Key::StopTxnAlignedData
            | Key::StopTxnSampledData
            | Key::SupportedFeatureProfiles => ValueKind::List,
            _ => ValueKind::Integer,
        }
    }

    fn accepts(self, value: &str) -> bool {
        match self.kind() {
            ValueKind::Integer => value.trim().parse::<i64>().map_or(false, |v| v >= 0),
            ValueKind::Boolean => parse_bool(value).is_some(),
            ValueKind::List => true,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    readonly: bool,
}

/// Thread-safe key store shared by the dispatcher, the tag manager and the orchestrator
#[derive(Debug)]
pub struct OcppConfiguration {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl Default for OcppConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

impl OcppConfiguration {
    pub fn new() -> Self {
        let entries = Key::iter()
            .map(|key| {
                (
                    key.to_string(),
                    Entry {
                        value: key.default_value().to_string(),
                        readonly: key.is_read_only(),
                    },
                )
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Defaults overlaid with persisted values. Read-only flags always come from the defaults.
    pub fn with_values(persisted: &[KeyValue]) -> Self {
        let config = Self::new();
        {
            let mut entries = config.entries.write();
            for kv in persisted {
                let Some(value) = kv.value.clone() else { continue };
                match entries.get_mut(&kv.key) {
                    Some(entry) => entry.value = value,
                    None => {
                        entries.insert(
                            kv.key.clone(),
                            Entry {
                                value,
                                readonly: kv.readonly,
                            },
                        );
                    }
                }
            }
        }
        config
    }

    pub fn get_value(&self, key: Key) -> Option<String> {
        self.entries.read().get(key.as_ref()).map(|e| e.value.clone())
    }

    /// Typed read falling back to `default` when absent or unparsable
    pub fn get_or<T: FromStr>(&self, key: Key, default: T) -> T {
        self.get_value(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: Key, default: bool) -> bool {
        self.get_value(key)
            .and_then(|v| parse_bool(&v))
            .unwrap_or(default)
    }

    /// Comma separated list value, empty items dropped
    pub fn get_list(&self, key: Key) -> Vec<String> {
        self.get_value(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// ChangeConfiguration entry point
    pub fn update_key(&self, key: &str, value: &str) -> Result<(), ConfigurationError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| ConfigurationError::KeyNotFound(key.to_string()))?;

        if entry.readonly {
            return Err(ConfigurationError::ReadOnly(key.to_string()));
        }

        if let Ok(known) = key.parse::<Key>() {
            if !known.accepts(value) {
                return Err(ConfigurationError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }

        entry.value = value.to_string();
        Ok(())
    }

    /// Set a value regardless of the read-only flag; used for values the charge point owns.
    pub fn set(&self, key: Key, value: impl ToString) {
        let mut entries = self.entries.write();
        entries
            .entry(key.to_string())
            .and_modify(|e| e.value = value.to_string())
            .or_insert_with(|| Entry {
                value: value.to_string(),
                readonly: key.is_read_only(),
            });
    }

    /// GetConfiguration: all keys when `keys` is empty, else the requested ones plus the unknown names.
    pub fn get_configuration(&self, keys: &[String]) -> (Vec<KeyValue>, Vec<String>) {
        let entries = self.entries.read();
        if keys.is_empty() {
            return (entries.iter().map(|(k, e)| to_key_value(k, e)).collect(), Vec::new());
        }

        let mut known = Vec::new();
        let mut unknown = Vec::new();
        for key in keys {
            match entries.get(key) {
                Some(entry) => known.push(to_key_value(key, entry)),
                None => unknown.push(key.clone()),
            }
        }
        (known, unknown)
    }

    pub fn entries(&self) -> Vec<KeyValue> {
        self.get_configuration(&[]).0
    }

    pub fn supported_profiles(&self) -> Vec<FeatureProfile> {
        self.get_list(Key::SupportedFeatureProfiles)
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect()
    }

    pub fn supports(&self, profile: FeatureProfile) -> bool {
        profile == FeatureProfile::Core || self.supported_profiles().contains(&profile)
    }
}

fn to_key_value(key: &str, entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        readonly: entry.readonly,
        value: Some(entry.value.clone()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        v if v.eq_ignore_ascii_case("true") => Some(true),
        v if v.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}
