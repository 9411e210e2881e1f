use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::domain::Color;
use crate::ocpp::messages::ChargePointStatus;

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_evses"))]
pub struct Config {
    #[validate(nested)]
    pub charge_point: ChargePointConfig,
    #[validate(nested)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    #[validate(nested)]
    pub evses: Vec<EvseConfig>,
    /// Initial values for OCPP configuration keys
    #[serde(default)]
    pub ocpp: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ChargePointConfig {
    #[validate(length(min = 1, message = "charge point id must not be empty"))]
    pub id: String,
    #[serde(default = "default_vendor")]
    pub vendor: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    /// Start charging on plug-in without a tag
    #[serde(default)]
    pub free_mode: bool,
    #[serde(default = "default_preparing_timeout")]
    pub preparing_timeout_seconds: u64,
}

impl ChargePointConfig {
    pub fn preparing_timeout(&self) -> Duration {
        Duration::from_secs(self.preparing_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ConnectionConfig {
    #[validate(length(min = 1, message = "server uri must not be empty"))]
    pub server_uri: String,
    #[serde(default = "default_reconnect")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect_delay_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_storage_path")]
    pub path: String,
    /// "json" or "yaml"
    #[serde(default = "default_storage_format")]
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_storage_path(),
            format: default_storage_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl EventsConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write daily-rolling JSON files here
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HardwareConfig {
    pub reader: Option<DeviceConfig>,
    pub display: Option<DeviceConfig>,
    pub indicator: Option<DeviceConfig>,
    #[serde(default)]
    pub colors: ColorScheme,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_kind")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EvseConfig {
    #[validate(range(min = 1, message = "EVSE ids start at 1"))]
    pub id: i32,
    #[serde(default = "default_max_current")]
    pub max_current: f32,
    /// 0 disables the limit
    #[serde(default)]
    pub max_charging_time_minutes: u64,
    #[serde(default = "default_evcc")]
    pub evcc: DeviceConfig,
    pub power_meter: Option<PowerMeterConfig>,
}

impl EvseConfig {
    pub fn max_charging_time(&self) -> Option<Duration> {
        (self.max_charging_time_minutes > 0).then(|| Duration::from_secs(self.max_charging_time_minutes * 60))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PowerMeterConfig {
    #[serde(default = "default_device_kind")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_phases")]
    pub phases: u8,
    #[serde(default)]
    pub jitter: f64,
}

/// Indicator colour per status
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColorScheme {
    pub available: Color,
    pub preparing: Color,
    pub charging: Color,
    pub suspended: Color,
    pub finishing: Color,
    pub reserved: Color,
    pub unavailable: Color,
    pub faulted: Color,
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self {
            available: Color::Green,
            preparing: Color::Yellow,
            charging: Color::Blue,
            suspended: Color::Orange,
            finishing: Color::Blue,
            reserved: Color::Yellow,
            unavailable: Color::Off,
            faulted: Color::Red,
        }
    }
}

impl ColorScheme {
    pub fn for_status(&self, status: ChargePointStatus) -> Color {
        match status {
            ChargePointStatus::Available => self.available,
            ChargePointStatus::Preparing => self.preparing,
            ChargePointStatus::Charging => self.charging,
            ChargePointStatus::SuspendedEV | ChargePointStatus::SuspendedEVSE => self.suspended,
            ChargePointStatus::Finishing => self.finishing,
            ChargePointStatus::Reserved => self.reserved,
            ChargePointStatus::Unavailable => self.unavailable,
            ChargePointStatus::Faulted => self.faulted,
        }
    }
}

fn default_vendor() -> String {
    "OpenChargePoint".into()
}
fn default_model() -> String {
    "OCP-1".into()
}
fn default_preparing_timeout() -> u64 {
    60
}
fn default_reconnect() -> u64 {
    5
}
fn default_max_reconnect() -> u64 {
    300
}
fn default_request_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_storage_path() -> String {
    "data".into()
}
fn default_storage_format() -> String {
    "json".into()
}
fn default_channel_capacity() -> usize {
    64
}
fn default_send_timeout() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info,tungstenite=warn,tokio_tungstenite=warn".into()
}
fn default_device_kind() -> String {
    "dummy".into()
}
fn default_evcc() -> DeviceConfig {
    DeviceConfig {
        kind: default_device_kind(),
    }
}
fn default_max_current() -> f32 {
    16.0
}
fn default_phases() -> u8 {
    1
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file("config/default.toml"))
                .merge(Env::prefixed("CHARGEPOINT__").split("__")),
        )
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract().context("failed to read configuration")?;
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}

/// At least one EVSE, each id once.
fn validate_evses(cfg: &Config) -> Result<(), ValidationError> {
    if cfg.evses.is_empty() {
        return Err(ValidationError::new("no_evses").with_message("at least one EVSE must be configured".into()));
    }
    let mut seen = std::collections::HashSet::new();
    if cfg.evses.iter().any(|e| !seen.insert(e.id)) {
        return Err(ValidationError::new("duplicate_evse").with_message("an EVSE id is configured twice".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [charge_point]
        id = "CP-001"

        [connection]
        server_uri = "ws://localhost:9000/ocpp"

        [[evses]]
        id = 1
        max_charging_time_minutes = 180

        [[evses]]
        id = 2
        power_meter = { kind = "dummy", phases = 3 }
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.charge_point.id, "CP-001");
        assert!(!cfg.charge_point.free_mode);
        assert_eq!(cfg.events.channel_capacity, 64);
        assert_eq!(cfg.events.send_timeout(), Duration::from_millis(2000));
        assert_eq!(cfg.connection.request_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.evses[0].max_charging_time(), Some(Duration::from_secs(180 * 60)));
        assert_eq!(cfg.evses[1].max_charging_time(), None);
        assert_eq!(cfg.evses[1].power_meter.as_ref().unwrap().phases, 3);
        assert!(cfg.storage.enabled);
    }

    #[test]
    fn test_validation_failures() {
        let no_id = MINIMAL.replace(r#"id = "CP-001""#, r#"id = """#);
        assert!(Config::from_toml_str(&no_id).is_err());

        let bad_evse = MINIMAL.replace("id = 2", "id = 0");
        assert!(Config::from_toml_str(&bad_evse).is_err());

        let duplicate = MINIMAL.replace("id = 2", "id = 1");
        assert!(Config::from_toml_str(&duplicate).is_err());

        let no_evses = r#"
            [charge_point]
            id = "CP-001"

            [connection]
            server_uri = "ws://localhost:9000/ocpp"
        "#;
        assert!(Config::from_toml_str(no_evses).is_err());
    }

    #[test]
    fn test_color_scheme_overrides() {
        let toml = format!("{MINIMAL}\n[hardware.colors]\navailable = \"white\"\n");
        let cfg = Config::from_toml_str(&toml).unwrap();
        let colors = &cfg.hardware.colors;
        assert_eq!(colors.for_status(ChargePointStatus::Available), Color::White);
        assert_eq!(colors.for_status(ChargePointStatus::SuspendedEVSE), Color::Orange);
        assert_eq!(colors.for_status(ChargePointStatus::Faulted), Color::Red);
    }
}
