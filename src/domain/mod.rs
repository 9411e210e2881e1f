//! Hardware collaborators the charge point drives, each with a dummy implementation.

use thiserror::Error;

pub mod display;
pub mod evcc;
pub mod power_meter;
pub mod reader;

pub use display::*;
pub use evcc::*;
pub use power_meter::*;
pub use reader::*;

/// Errors from readers, displays and indicators
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Device not available: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}
