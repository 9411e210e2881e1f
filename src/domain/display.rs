use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display as StrumDisplay, EnumString};

use super::HardwareError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub top: String,
    pub bottom: String,
    pub duration: Duration,
}

impl DisplayMessage {
    pub fn new(top: impl Into<String>, bottom: impl Into<String>) -> Self {
        Self {
            top: top.into(),
            bottom: bottom.into(),
            duration: Duration::from_secs(5),
        }
    }
}

/// Character display
#[async_trait]
pub trait Display: Send + Sync {
    async fn show(&self, message: DisplayMessage) -> Result<(), HardwareError>;
    async fn cleanup(&self) -> Result<(), HardwareError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, StrumDisplay, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Color {
    Off,
    White,
    Red,
    Green,
    Blue,
    Yellow,
    Orange,
}

/// Status LED strip, one position per EVSE
#[async_trait]
pub trait Indicator: Send + Sync {
    async fn change_color(&self, index: usize, color: Color) -> Result<(), HardwareError>;
    async fn blink(&self, index: usize, times: u32, color: Color) -> Result<(), HardwareError>;
    async fn cleanup(&self) -> Result<(), HardwareError>;
}

/// Display that keeps what it was asked to show
#[derive(Debug, Default)]
pub struct DummyDisplay {
    shown: Mutex<Vec<DisplayMessage>>,
}

impl DummyDisplay {
    pub fn messages(&self) -> Vec<DisplayMessage> {
        self.shown.lock().clone()
    }
}

#[async_trait]
impl Display for DummyDisplay {
    async fn show(&self, message: DisplayMessage) -> Result<(), HardwareError> {
        self.shown.lock().push(message);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), HardwareError> {
        self.shown.lock().clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorCall {
    Color { index: usize, color: Color },
    Blink { index: usize, times: u32, color: Color },
}

#[derive(Debug, Default)]
pub struct DummyIndicator {
    calls: Mutex<Vec<IndicatorCall>>,
}

impl DummyIndicator {
    pub fn calls(&self) -> Vec<IndicatorCall> {
        self.calls.lock().clone()
    }

    pub fn last_color(&self, index: usize) -> Option<Color> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            IndicatorCall::Color { index: i, color } if *i == index => Some(*color),
            _ => None,
        })
    }
}

#[async_trait]
impl Indicator for DummyIndicator {
    async fn change_color(&self, index: usize, color: Color) -> Result<(), HardwareError> {
        self.calls.lock().push(IndicatorCall::Color { index, color });
        Ok(())
    }

    async fn blink(&self, index: usize, times: u32, color: Color) -> Result<(), HardwareError> {
        self.calls.lock().push(IndicatorCall::Blink { index, times, color });
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), HardwareError> {
        self.calls.lock().push(IndicatorCall::Color {
            index: 0,
            color: Color::Off,
        });
        Ok(())
    }
}
