use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use strum::{Display, EnumString};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// EVCC-specific errors
#[derive(Debug, Error)]
pub enum EvccError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Invalid current: {0}A (out of supported range)")]
    InvalidCurrent(f32),
    #[error("Connector lock failure")]
    LockFailure,
    #[error("Controller in fault state: {0}")]
    Fault(String),
}

/// IEC 61851 control pilot states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
pub enum CarState {
    A1,
    A2,
    B1,
    B2,
    C1,
    C2,
    D1,
    D2,
    E,
    F,
}

impl CarState {
    /// State A: no vehicle plugged in
    pub fn is_disconnected(self) -> bool {
        matches!(self, CarState::A1 | CarState::A2)
    }

    /// State B: plugged in, not requesting energy
    pub fn is_connected_idle(self) -> bool {
        matches!(self, CarState::B1 | CarState::B2)
    }

    /// States C and D: vehicle requests energy
    pub fn requests_charge(self) -> bool {
        matches!(self, CarState::C1 | CarState::C2 | CarState::D1 | CarState::D2)
    }

    /// States E and F: pilot error or EVSE not available
    pub fn is_error(self) -> bool {
        matches!(self, CarState::E | CarState::F)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateNotification {
    pub car_state: CarState,
    pub error: Option<String>,
}

/// Electric vehicle communication controller: energizes the outlet and reports the pilot state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Evcc: Send + Sync {
    async fn init(&self) -> Result<(), EvccError>;
    async fn enable_charging(&self) -> Result<(), EvccError>;
    async fn disable_charging(&self) -> Result<(), EvccError>;
    async fn set_max_current(&self, amps: f32) -> Result<(), EvccError>;
    async fn lock(&self) -> Result<(), EvccError>;
    async fn unlock(&self) -> Result<(), EvccError>;
    /// Stream of pilot state changes
    fn state_changes(&self) -> broadcast::Receiver<StateNotification>;
    async fn cleanup(&self) -> Result<(), EvccError>;
    fn kind(&self) -> &'static str;
}

/// In-memory EVCC for development and testing
#[derive(Debug)]
pub struct DummyEvcc {
    charging: AtomicBool,
    locked: AtomicBool,
    fail_enable: AtomicBool,
    fail_unlock: AtomicBool,
    unlocks: AtomicUsize,
    max_current: Mutex<f32>,
    state: Mutex<CarState>,
    tx: broadcast::Sender<StateNotification>,
}

impl Default for DummyEvcc {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyEvcc {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            charging: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            fail_enable: AtomicBool::new(false),
            fail_unlock: AtomicBool::new(false),
            unlocks: AtomicUsize::new(0),
            max_current: Mutex::new(0.0),
            state: Mutex::new(CarState::A1),
            tx,
        }
    }

    /// Pretend the pilot moved to `state`
    pub fn simulate(&self, state: CarState) {
        *self.state.lock() = state;
        let _ = self.tx.send(StateNotification {
            car_state: state,
            error: None,
        });
    }

    /// Make the next enable calls fail until reset
    pub fn fail_enable(&self, fail: bool) {
        self.fail_enable.store(fail, Ordering::SeqCst);
    }

    /// Jam the connector lock until reset
    pub fn fail_unlock(&self, fail: bool) {
        self.fail_unlock.store(fail, Ordering::SeqCst);
    }

    /// Unlock attempts so far
    pub fn unlock_count(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    pub fn is_charging(&self) -> bool {
        self.charging.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn max_current(&self) -> f32 {
        *self.max_current.lock()
    }

    pub fn car_state(&self) -> CarState {
        *self.state.lock()
    }
}

#[async_trait]
impl Evcc for DummyEvcc {
    async fn init(&self) -> Result<(), EvccError> {
        debug!("dummy evcc initialised");
        Ok(())
    }

    async fn enable_charging(&self) -> Result<(), EvccError> {
        if self.fail_enable.load(Ordering::SeqCst) {
            return Err(EvccError::Communication("relay did not close".into()));
        }
        self.charging.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_charging(&self) -> Result<(), EvccError> {
        self.charging.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_max_current(&self, amps: f32) -> Result<(), EvccError> {
        if !(0.0..=80.0).contains(&amps) {
            return Err(EvccError::InvalidCurrent(amps));
        }
        *self.max_current.lock() = amps;
        Ok(())
    }

    async fn lock(&self) -> Result<(), EvccError> {
        self.locked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unlock(&self) -> Result<(), EvccError> {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        if self.fail_unlock.load(Ordering::SeqCst) {
            return Err(EvccError::LockFailure);
        }
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn state_changes(&self) -> broadcast::Receiver<StateNotification> {
        self.tx.subscribe()
    }

    async fn cleanup(&self) -> Result<(), EvccError> {
        self.charging.store(false, Ordering::SeqCst);
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "dummy"
    }
}
