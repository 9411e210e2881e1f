//! Construction of hardware collaborators from configuration.

pub mod factory;

pub use factory::{DeviceFactory, DeviceKind};
