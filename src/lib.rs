//! Open Charge Point
//!
//! OCPP 1.6J charge point core: per-EVSE state machines, tag authorization,
//! session accounting and the orchestrator that speaks to a Central System.

pub mod auth;
pub mod config;
pub mod controller;
pub mod domain;
pub mod evse;
pub mod hardware;
pub mod ocpp;
pub mod repo;
pub mod scheduler;
pub mod telemetry;

pub use controller::{ChargePoint, ChargePointBuilder, ChargePointError, CommandRouter};
