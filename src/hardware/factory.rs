use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::{DeviceConfig, HardwareConfig, PowerMeterConfig};
use crate::domain::{
    Display, DummyDisplay, DummyEvcc, DummyIndicator, DummyPowerMeter, DummyReader, Evcc, Indicator, PowerMeter,
    TagReader,
};

/// Kinds of device the factory can build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// In-memory devices for development and testing
    Dummy,
}

impl DeviceKind {
    pub fn parse(kind: &str) -> Result<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "dummy" | "simulated" => Ok(DeviceKind::Dummy),
            other => bail!("unsupported device kind '{other}'"),
        }
    }
}

/// Builds hardware trait objects from configuration
pub struct DeviceFactory {
    hardware: HardwareConfig,
}

impl DeviceFactory {
    pub fn new(hardware: HardwareConfig) -> Self {
        Self { hardware }
    }

    pub fn create_evcc(&self, cfg: &DeviceConfig) -> Result<Arc<dyn Evcc>> {
        match DeviceKind::parse(&cfg.kind)? {
            DeviceKind::Dummy => Ok(Arc::new(DummyEvcc::new())),
        }
    }

    /// None when no meter is configured or it is disabled
    pub fn create_power_meter(&self, cfg: Option<&PowerMeterConfig>) -> Result<Option<Arc<dyn PowerMeter>>> {
        let Some(cfg) = cfg.filter(|c| c.enabled) else {
            return Ok(None);
        };
        match DeviceKind::parse(&cfg.kind)? {
            DeviceKind::Dummy => Ok(Some(Arc::new(DummyPowerMeter::new(cfg.phases, cfg.jitter)))),
        }
    }

    pub fn create_reader(&self) -> Result<Option<Arc<dyn TagReader>>> {
        let Some(cfg) = &self.hardware.reader else { return Ok(None) };
        match DeviceKind::parse(&cfg.kind)? {
            DeviceKind::Dummy => {
                info!("using dummy tag reader");
                Ok(Some(Arc::new(DummyReader::default())))
            }
        }
    }

    pub fn create_display(&self) -> Result<Option<Arc<dyn Display>>> {
        let Some(cfg) = &self.hardware.display else { return Ok(None) };
        match DeviceKind::parse(&cfg.kind)? {
            DeviceKind::Dummy => Ok(Some(Arc::new(DummyDisplay::default()))),
        }
    }

    pub fn create_indicator(&self) -> Result<Option<Arc<dyn Indicator>>> {
        let Some(cfg) = &self.hardware.indicator else { return Ok(None) };
        match DeviceKind::parse(&cfg.kind)? {
            DeviceKind::Dummy => Ok(Some(Arc::new(DummyIndicator::default()))),
        }
    }
}
