//! EVSE engine
//!
//! One `Evse` owns one outlet: its EVCC, optional power meter, OCPP status
//! and the current charging session. All state sits behind a per-EVSE async
//! mutex so hardware calls and notifications for one EVSE are serialized,
//! while different EVSEs proceed independently.
//!
//! Status changes are announced through the shared [`Notifier`] while the
//! lock is held, which keeps notifications for one EVSE in transition order.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{CarState, Evcc, EvccError, PowerMeter, StateNotification};
use crate::ocpp::messages::{AvailabilityType, ChargePointErrorCode, ChargePointStatus, Measurand, Reason};
use crate::ocpp::{Key, OcppConfiguration};
use crate::repo::Repository;
use crate::scheduler::Scheduler;

pub mod manager;
pub mod notification;
mod sampling;
pub mod session;

pub use manager::{EvseManager, RegistryError};
pub use notification::{Notification, Notifier};
pub use session::{Session, SessionError, SessionSummary};

#[derive(Debug, Error)]
pub enum EvseError {
    #[error("Invalid EVSE id {0}")]
    InvalidEvseId(i32),
    #[error("Invalid reservation id {0}")]
    InvalidReservationId(i32),
    #[error("Operation not allowed in status {0}")]
    InvalidStatus(ChargePointStatus),
    #[error("EVSE is not charging")]
    NotCharging,
    #[error("A session is already active")]
    SessionActive,
    #[error("Invalid tag or transaction: {0}")]
    InvalidTagOrTransaction(#[from] SessionError),
    #[error("Session {transaction_id} exceeded the charging time limit")]
    SessionTimeLimitExceeded { transaction_id: String },
    #[error("Persisted session has no start time")]
    InvalidSession,
    #[error("EVCC error: {0}")]
    Evcc(#[from] EvccError),
}

/// Statuses during which the EVSE holds (or is about to hold) a session
pub fn holds_session(status: ChargePointStatus) -> bool {
    matches!(
        status,
        ChargePointStatus::Preparing | ChargePointStatus::Charging | ChargePointStatus::SuspendedEV
    )
}

/// Persisted form of an EVSE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvseSnapshot {
    pub evse_id: i32,
    pub status: ChargePointStatus,
    pub error_code: ChargePointErrorCode,
    pub availability: AvailabilityType,
    pub session: Session,
}

#[derive(Debug, Clone)]
pub struct EvseSettings {
    pub evse_id: i32,
    /// Current limit handed to the EVCC, in A
    pub max_current: f32,
    /// Sessions are stopped once they run this long
    pub max_charging_time: Option<Duration>,
}

impl EvseSettings {
    pub fn new(evse_id: i32) -> Self {
        Self {
            evse_id,
            max_current: 16.0,
            max_charging_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: i32,
    pub tag_id: String,
}

/// Outcome of an availability change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityChange {
    Applied,
    /// Takes effect when the running session ends
    Scheduled,
}

#[derive(Debug)]
struct EvseState {
    status: ChargePointStatus,
    error_code: ChargePointErrorCode,
    availability: AvailabilityType,
    pending_availability: Option<AvailabilityType>,
    reservation: Option<Reservation>,
    vehicle_connected: bool,
    session: Session,
}

impl Default for EvseState {
    fn default() -> Self {
        Self {
            status: ChargePointStatus::Available,
            error_code: ChargePointErrorCode::NoError,
            availability: AvailabilityType::Operative,
            pending_availability: None,
            reservation: None,
            vehicle_connected: false,
            session: Session::default(),
        }
    }
}

pub struct Evse {
    settings: EvseSettings,
    evcc: Arc<dyn Evcc>,
    power_meter: Option<Arc<dyn PowerMeter>>,
    scheduler: Scheduler,
    configuration: Arc<OcppConfiguration>,
    repository: Option<Arc<dyn Repository>>,
    notifier: RwLock<Option<Notifier>>,
    state: Mutex<EvseState>,
}

impl std::fmt::Debug for Evse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evse")
            .field("evse_id", &self.settings.evse_id)
            .field("evcc", &self.evcc.kind())
            .field("power_meter", &self.power_meter.as_ref().map(|m| m.kind()))
            .finish()
    }
}

impl Evse {
    pub fn new(
        settings: EvseSettings,
        evcc: Arc<dyn Evcc>,
        power_meter: Option<Arc<dyn PowerMeter>>,
        scheduler: Scheduler,
        configuration: Arc<OcppConfiguration>,
    ) -> Result<Self, EvseError> {
        if settings.evse_id <= 0 {
            return Err(EvseError::InvalidEvseId(settings.evse_id));
        }
        let settings = EvseSettings {
            max_charging_time: settings.max_charging_time.filter(|limit| !limit.is_zero()),
            ..settings
        };

        Ok(Self {
            settings,
            evcc,
            power_meter,
            scheduler,
            configuration,
            repository: None,
            notifier: RwLock::new(None),
            state: Mutex::new(EvseState::default()),
        })
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn set_notifier(&self, notifier: Notifier) {
        *self.notifier.write() = Some(notifier);
    }

    /// Initialise the hardware and start following the pilot state.
    pub async fn init(self: &Arc<Self>, token: CancellationToken) -> Result<(), EvseError> {
        self.evcc.init().await?;
        self.evcc.set_max_current(self.settings.max_current).await?;
        if let Some(meter) = &self.power_meter {
            if let Err(e) = meter.init().await {
                warn!(evse_id = self.id(), error = %e, "power meter init failed");
            }
        }

        let mut changes = self.evcc.state_changes();
        let evse = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    received = changes.recv() => received,
                };
                match received {
                    Ok(notification) => {
                        let Some(evse) = evse.upgrade() else { break };
                        evse.on_car_state(notification).await;
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "car state updates lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!(evse_id = self.id(), evcc = self.evcc.kind(), "EVSE initialised");
        Ok(())
    }

    pub fn id(&self) -> i32 {
        self.settings.evse_id
    }

    pub fn max_charging_time(&self) -> Option<Duration> {
        self.settings.max_charging_time
    }

    pub fn has_power_meter(&self) -> bool {
        self.power_meter.is_some()
    }

    /// Tag carried by every scheduled job of this EVSE
    pub fn job_tag(&self) -> String {
        format!("evse-{}", self.id())
    }

    fn timer_tag(&self) -> String {
        format!("evse-{}-timer", self.id())
    }

    fn sampling_tag(&self) -> String {
        format!("evse-{}-sampling", self.id())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Energy register of the power meter, in Wh
    pub async fn energy_register(&self) -> Option<f64> {
        let meter = self.power_meter.as_ref()?;
        match meter.energy().await {
            Ok(wh) => Some(wh),
            Err(e) => {
                warn!(evse_id = self.id(), error = %e, "energy register unreadable");
                None
            }
        }
    }

    /// Start a session and energize the outlet, reading the meter start from the power meter.
    pub async fn start_charging(self: &Arc<Self>, transaction_id: &str, tag_id: &str) -> Result<(), EvseError> {
        let meter_start = self.energy_register().await.unwrap_or_default();
        self.start_charging_from(transaction_id, tag_id, meter_start).await
    }

    /// Start a session whose meter start (Wh) was already reported.
    pub async fn start_charging_from(
        self: &Arc<Self>,
        transaction_id: &str,
        tag_id: &str,
        meter_start: f64,
    ) -> Result<(), EvseError> {
        let mut state = self.state.lock().await;
        if state.availability == AvailabilityType::Inoperative {
            return Err(EvseError::InvalidStatus(state.status));
        }
        match state.status {
            ChargePointStatus::Available | ChargePointStatus::Preparing => {}
            ChargePointStatus::Reserved
                if state
                    .reservation
                    .as_ref()
                    .is_some_and(|r| r.tag_id.eq_ignore_ascii_case(tag_id)) => {}
            status => return Err(EvseError::InvalidStatus(status)),
        }
        if state.session.is_active {
            return Err(EvseError::SessionActive);
        }

        state.session.start(transaction_id, tag_id, Utc::now())?;
        state.session.meter_start = meter_start;
        let previous_status = state.status;
        let previous_reservation = state.reservation.take();
        self.transition(&mut state, ChargePointStatus::Preparing, ChargePointErrorCode::NoError)
            .await;

        if let Err(e) = self.evcc.enable_charging().await {
            error!(evse_id = self.id(), error = %e, "failed to enable charging");
            state.session = Session::default();
            state.reservation = previous_reservation;
            self.transition(&mut state, previous_status, ChargePointErrorCode::NoError)
                .await;
            self.persist(&state).await;
            return Err(e.into());
        }
        if let Err(e) = self.evcc.lock().await {
            warn!(evse_id = self.id(), error = %e, "connector lock failed");
        }

        state.vehicle_connected = true;
        self.transition(&mut state, ChargePointStatus::Charging, ChargePointErrorCode::NoError)
            .await;
        self.arm_session_jobs(self.settings.max_charging_time);
        self.persist(&state).await;

        info!(evse_id = self.id(), transaction_id, tag_id, "charging started");
        Ok(())
    }

    /// Resume a session persisted before a restart. Idempotent for the same transaction.
    pub async fn resume_charging(self: &Arc<Self>, persisted: &Session) -> Result<(), EvseError> {
        let mut state = self.state.lock().await;
        if state.session.is_active {
            if state.session.transaction_id == persisted.transaction_id {
                return Ok(());
            }
            return Err(EvseError::SessionActive);
        }
        if persisted.transaction_id.is_empty() {
            return Err(SessionError::InvalidTransactionId(String::new()).into());
        }

        // Keep the recovered ids even if resuming fails so the transaction can still be closed.
        state.session = Session {
            is_active: false,
            ended_at: None,
            ..persisted.clone()
        };

        let started = persisted.started_at.ok_or(EvseError::InvalidSession)?;
        let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
        let remaining = match self.settings.max_charging_time {
            Some(limit) if elapsed >= limit => {
                return Err(EvseError::SessionTimeLimitExceeded {
                    transaction_id: persisted.transaction_id.clone(),
                });
            }
            Some(limit) => Some(limit - elapsed),
            None => None,
        };

        self.evcc.enable_charging().await?;
        state.session.is_active = true;
        state.vehicle_connected = true;
        self.transition(&mut state, ChargePointStatus::Charging, ChargePointErrorCode::NoError)
            .await;
        self.arm_session_jobs(remaining);
        self.persist(&state).await;

        info!(
            evse_id = self.id(),
            transaction_id = %persisted.transaction_id,
            remaining_secs = remaining.map(|r| r.as_secs()),
            "charging resumed"
        );
        Ok(())
    }

    /// Stop the running session on request. The caller reports the transaction.
    pub async fn stop_charging(&self, reason: Reason) -> Result<SessionSummary, EvseError> {
        let mut state = self.state.lock().await;
        let summary = self.stop_locked(&mut state, reason, false).await?;
        self.persist(&state).await;
        Ok(summary)
    }

    /// Stop the running session on the EVSE's own initiative and announce it.
    pub async fn end_session(&self, reason: Reason) -> Result<SessionSummary, EvseError> {
        let mut state = self.state.lock().await;
        let summary = self.stop_locked(&mut state, reason, true).await?;
        self.persist(&state).await;
        Ok(summary)
    }

    /// Close a recovered session that could not be resumed.
    pub async fn discard_recovered_session(&self, reason: Reason) -> Option<SessionSummary> {
        let mut state = self.state.lock().await;
        if state.session.is_active || state.session.transaction_id.is_empty() {
            return None;
        }

        let summary = SessionSummary::capture(self.id(), &state.session, reason, Utc::now());
        state.session = Session::default();
        self.emit(Notification::TransactionEnded(summary.clone())).await;

        let next = match state.availability {
            AvailabilityType::Inoperative => ChargePointStatus::Unavailable,
            AvailabilityType::Operative => ChargePointStatus::Available,
        };
        self.transition(&mut state, next, ChargePointErrorCode::NoError).await;
        self.persist(&state).await;

        info!(evse_id = self.id(), transaction_id = %summary.transaction_id, %reason, "recovered session closed");
        Some(summary)
    }

    /// Apply a persisted snapshot that carries no session to resume.
    pub async fn restore_status(&self, snapshot: &EvseSnapshot) {
        let mut state = self.state.lock().await;
        state.availability = snapshot.availability;
        let (status, error_code) = match (snapshot.availability, snapshot.status) {
            (AvailabilityType::Inoperative, _) => (ChargePointStatus::Unavailable, ChargePointErrorCode::NoError),
            (_, ChargePointStatus::Faulted) => (ChargePointStatus::Faulted, snapshot.error_code),
            // Nothing to bring back; the live pilot state stands
            _ => return,
        };
        self.transition(&mut state, status, error_code).await;
        self.persist(&state).await;
    }

    /// End the session, leaving the status at Finishing. The caller picks the next status.
    async fn finish_session(
        &self,
        state: &mut EvseState,
        reason: Reason,
        announce: bool,
    ) -> Result<SessionSummary, EvseError> {
        if !holds_session(state.status) {
            return Err(EvseError::NotCharging);
        }

        self.scheduler.remove_by_tag(&self.job_tag());
        if let Err(e) = self.evcc.disable_charging().await {
            error!(evse_id = self.id(), error = %e, "failed to disable charging");
        }
        self.transition(state, ChargePointStatus::Finishing, ChargePointErrorCode::NoError)
            .await;

        let now = Utc::now();
        let summary = SessionSummary::capture(self.id(), &state.session, reason, now);
        state.session.end(now);
        if announce && summary.has_transaction() {
            self.emit(Notification::TransactionEnded(summary.clone())).await;
        }
        if let Err(e) = self.evcc.unlock().await {
            warn!(evse_id = self.id(), error = %e, "connector unlock failed");
        }

        info!(
            evse_id = self.id(),
            transaction_id = %summary.transaction_id,
            %reason,
            energy_wh = summary.energy_wh,
            "charging stopped"
        );
        Ok(summary)
    }

    async fn stop_locked(
        &self,
        state: &mut EvseState,
        reason: Reason,
        announce: bool,
    ) -> Result<SessionSummary, EvseError> {
        let summary = self.finish_session(state, reason, announce).await?;

        if let Some(pending) = state.pending_availability.take() {
            debug!(evse_id = self.id(), ?pending, "applying scheduled availability");
            state.availability = pending;
        }
        let next = match reason {
            _ if state.availability == AvailabilityType::Inoperative => ChargePointStatus::Unavailable,
            Reason::EVDisconnected if state.vehicle_connected => ChargePointStatus::SuspendedEVSE,
            Reason::UnlockCommand => ChargePointStatus::Unavailable,
            _ => ChargePointStatus::Available,
        };
        self.transition(state, next, ChargePointErrorCode::NoError).await;
        Ok(summary)
    }

    fn arm_session_jobs(self: &Arc<Self>, limit: Option<Duration>) {
        let tag = self.job_tag();
        self.scheduler.remove_by_tag(&tag);

        if let Some(limit) = limit {
            let evse = Arc::downgrade(self);
            self.scheduler.once(limit, &[&tag, &self.timer_tag()], move || async move {
                if let Some(evse) = evse.upgrade() {
                    evse.on_time_limit().await;
                }
            });
        }

        if self.power_meter.is_some() {
            let seconds: u64 = self.configuration.get_or(Key::MeterValueSampleInterval, 10);
            if seconds == 0 {
                return;
            }
            let measurands = Measurand::parse_list(
                &self
                    .configuration
                    .get_value(Key::MeterValuesSampledData)
                    .unwrap_or_default(),
            );
            let evse = Arc::downgrade(self);
            self.scheduler
                .every(Duration::from_secs(seconds), &[&tag, &self.sampling_tag()], move || {
                    let evse = evse.clone();
                    let measurands = measurands.clone();
                    async move {
                        if let Some(evse) = evse.upgrade() {
                            evse.sample_session(&measurands).await;
                        }
                    }
                });
        }
    }

    async fn on_time_limit(&self) {
        warn!(evse_id = self.id(), "charging time limit reached");
        match self.end_session(Reason::Local).await {
            Ok(_) | Err(EvseError::NotCharging) => {}
            Err(e) => error!(evse_id = self.id(), error = %e, "failed to stop session at time limit"),
        }
    }

    // ------------------------------------------------------------------
    // Reservations and availability
    // ------------------------------------------------------------------

    pub async fn reserve(&self, reservation_id: i32, tag_id: &str) -> Result<(), EvseError> {
        if reservation_id <= 0 {
            return Err(EvseError::InvalidReservationId(reservation_id));
        }
        let mut state = self.state.lock().await;
        if state.status != ChargePointStatus::Available || state.availability == AvailabilityType::Inoperative {
            return Err(EvseError::InvalidStatus(state.status));
        }

        state.reservation = Some(Reservation {
            id: reservation_id,
            tag_id: tag_id.to_string(),
        });
        self.transition(&mut state, ChargePointStatus::Reserved, ChargePointErrorCode::NoError)
            .await;
        self.persist(&state).await;
        Ok(())
    }

    pub async fn remove_reservation(&self) -> Result<(), EvseError> {
        let mut state = self.state.lock().await;
        if state.status != ChargePointStatus::Reserved {
            return Err(EvseError::InvalidStatus(state.status));
        }
        state.reservation = None;
        self.transition(&mut state, ChargePointStatus::Available, ChargePointErrorCode::NoError)
            .await;
        self.persist(&state).await;
        Ok(())
    }

    pub async fn set_availability(&self, availability: AvailabilityType) -> AvailabilityChange {
        let mut state = self.state.lock().await;
        match availability {
            AvailabilityType::Inoperative if state.session.is_active => {
                state.pending_availability = Some(AvailabilityType::Inoperative);
                info!(evse_id = self.id(), "unavailability scheduled after the running session");
                return AvailabilityChange::Scheduled;
            }
            AvailabilityType::Inoperative => {
                state.pending_availability = None;
                state.availability = AvailabilityType::Inoperative;
                state.reservation = None;
                self.transition(&mut state, ChargePointStatus::Unavailable, ChargePointErrorCode::NoError)
                    .await;
            }
            AvailabilityType::Operative => {
                state.pending_availability = None;
                state.availability = AvailabilityType::Operative;
                if matches!(state.status, ChargePointStatus::Unavailable | ChargePointStatus::Faulted) {
                    self.transition(&mut state, ChargePointStatus::Available, ChargePointErrorCode::NoError)
                        .await;
                }
            }
        }
        self.persist(&state).await;
        AvailabilityChange::Applied
    }

    /// Back to Available when Preparing never turned into a session.
    pub async fn revert_preparing(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status != ChargePointStatus::Preparing || state.session.is_active {
            return false;
        }
        self.transition(&mut state, ChargePointStatus::Available, ChargePointErrorCode::NoError)
            .await;
        self.persist(&state).await;
        true
    }

    /// Release the connector lock. The outlet is de-energized first when a
    /// session is still running.
    pub async fn unlock(&self) -> Result<(), EvseError> {
        let state = self.state.lock().await;
        if state.session.is_active {
            if let Err(e) = self.evcc.disable_charging().await {
                error!(evse_id = self.id(), error = %e, "failed to disable charging before unlock");
            }
        }
        self.evcc.unlock().await?;
        info!(evse_id = self.id(), "connector unlocked");
        Ok(())
    }

    /// Move to Faulted, ending any running session first.
    pub async fn fault(&self, error_code: ChargePointErrorCode, reason: Reason) {
        let mut state = self.state.lock().await;
        if holds_session(state.status) {
            if let Err(e) = self.finish_session(&mut state, reason, true).await {
                error!(evse_id = self.id(), error = %e, "failed to end session on fault");
            }
        }
        state.reservation = None;
        self.transition(&mut state, ChargePointStatus::Faulted, error_code).await;
        self.persist(&state).await;
    }

    // ------------------------------------------------------------------
    // Pilot state
    // ------------------------------------------------------------------

    async fn on_car_state(&self, notification: StateNotification) {
        let car_state = notification.car_state;
        debug!(evse_id = self.id(), %car_state, error = ?notification.error, "car state changed");

        if car_state.is_error() {
            warn!(evse_id = self.id(), %car_state, "pilot reports an error");
            self.fault(ChargePointErrorCode::EVCommunicationError, Reason::EmergencyStop)
                .await;
            return;
        }

        let mut state = self.state.lock().await;
        let next = match car_state {
            CarState::A1 | CarState::A2 => {
                state.vehicle_connected = false;
                match state.status {
                    ChargePointStatus::Preparing if !state.session.is_active => Some(ChargePointStatus::Available),
                    ChargePointStatus::Preparing | ChargePointStatus::Charging if state.session.is_active => {
                        Some(ChargePointStatus::SuspendedEV)
                    }
                    ChargePointStatus::SuspendedEVSE => Some(ChargePointStatus::Available),
                    ChargePointStatus::Unavailable if state.availability == AvailabilityType::Operative => {
                        Some(ChargePointStatus::Available)
                    }
                    _ => None,
                }
            }
            CarState::B1 | CarState::B2 => {
                state.vehicle_connected = true;
                match state.status {
                    ChargePointStatus::Available => Some(ChargePointStatus::Preparing),
                    ChargePointStatus::Charging => Some(ChargePointStatus::SuspendedEV),
                    _ => None,
                }
            }
            CarState::C1 | CarState::C2 | CarState::D1 | CarState::D2 => {
                state.vehicle_connected = true;
                match state.status {
                    ChargePointStatus::SuspendedEV if state.session.is_active => Some(ChargePointStatus::Charging),
                    ChargePointStatus::Available => Some(ChargePointStatus::Preparing),
                    _ => None,
                }
            }
            CarState::E | CarState::F => None,
        };

        if let Some(next) = next {
            self.transition(&mut state, next, ChargePointErrorCode::NoError).await;
            self.persist(&state).await;
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn status(&self) -> (ChargePointStatus, ChargePointErrorCode) {
        let state = self.state.lock().await;
        (state.status, state.error_code)
    }

    pub async fn availability(&self) -> AvailabilityType {
        self.state.lock().await.availability
    }

    pub async fn is_available(&self) -> bool {
        let state = self.state.lock().await;
        state.status == ChargePointStatus::Available && state.availability == AvailabilityType::Operative
    }

    pub async fn is_charging(&self) -> bool {
        self.state.lock().await.status == ChargePointStatus::Charging
    }

    pub async fn is_preparing(&self) -> bool {
        self.state.lock().await.status == ChargePointStatus::Preparing
    }

    pub async fn has_active_session(&self) -> bool {
        self.state.lock().await.session.is_active
    }

    pub async fn vehicle_connected(&self) -> bool {
        self.state.lock().await.vehicle_connected
    }

    /// Transaction id of the active or recovered session
    pub async fn transaction_id(&self) -> Option<String> {
        let state = self.state.lock().await;
        Some(state.session.transaction_id.clone()).filter(|id| !id.is_empty())
    }

    pub async fn tag_id(&self) -> Option<String> {
        let state = self.state.lock().await;
        Some(state.session.tag_id.clone()).filter(|id| !id.is_empty())
    }

    pub async fn session(&self) -> Session {
        self.state.lock().await.session.clone()
    }

    pub async fn reservation(&self) -> Option<Reservation> {
        self.state.lock().await.reservation.clone()
    }

    pub async fn reservation_id(&self) -> Option<i32> {
        self.state.lock().await.reservation.as_ref().map(|r| r.id)
    }

    pub async fn snapshot(&self) -> EvseSnapshot {
        let state = self.state.lock().await;
        self.snapshot_of(&state)
    }

    /// Turn the outlet off and release the hardware.
    pub async fn cleanup(&self) {
        self.scheduler.remove_by_tag(&self.job_tag());
        if let Err(e) = self.evcc.disable_charging().await {
            warn!(evse_id = self.id(), error = %e, "disable on cleanup failed");
        }
        if let Err(e) = self.evcc.cleanup().await {
            warn!(evse_id = self.id(), error = %e, "EVCC cleanup failed");
        }
        if let Some(meter) = &self.power_meter {
            if let Err(e) = meter.cleanup().await {
                warn!(evse_id = self.id(), error = %e, "power meter cleanup failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn transition(&self, state: &mut EvseState, status: ChargePointStatus, error_code: ChargePointErrorCode) {
        if state.status == status && state.error_code == error_code {
            return;
        }
        info!(evse_id = self.id(), from = %state.status, to = %status, %error_code, "status changed");
        state.status = status;
        state.error_code = error_code;
        self.emit(Notification::Status {
            evse_id: self.id(),
            status,
            error_code,
        })
        .await;
    }

    async fn emit(&self, notification: Notification) {
        let notifier = self.notifier.read().clone();
        match notifier {
            Some(notifier) => {
                notifier.notify(notification).await;
            }
            None => debug!(evse_id = self.id(), "no notifier attached"),
        }
    }

    fn snapshot_of(&self, state: &EvseState) -> EvseSnapshot {
        EvseSnapshot {
            evse_id: self.id(),
            status: state.status,
            error_code: state.error_code,
            availability: state.pending_availability.unwrap_or(state.availability),
            session: state.session.clone(),
        }
    }

    async fn persist(&self, state: &EvseState) {
        let Some(repository) = &self.repository else { return };
        if let Err(e) = repository.save_evse(&self.snapshot_of(state)).await {
            warn!(evse_id = self.id(), error = %e, "failed to persist EVSE state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DummyEvcc, DummyPowerMeter};
    use crate::repo::MemoryRepository;
    use rstest::rstest;
    use tokio::sync::mpsc;

    struct Fixture {
        evse: Arc<Evse>,
        evcc: Arc<DummyEvcc>,
        scheduler: Scheduler,
        repository: Arc<MemoryRepository>,
        rx: mpsc::Receiver<Notification>,
    }

    fn fixture(max_charging_time: Option<Duration>) -> Fixture {
        let evcc = Arc::new(DummyEvcc::new());
        let scheduler = Scheduler::new();
        let repository = Arc::new(MemoryRepository::default());
        let settings = EvseSettings {
            max_charging_time,
            ..EvseSettings::new(1)
        };
        let evse = Evse::new(
            settings,
            evcc.clone(),
            Some(Arc::new(DummyPowerMeter::default())),
            scheduler.clone(),
            Arc::new(OcppConfiguration::new()),
        )
        .unwrap()
        .with_repository(repository.clone());
        let (notifier, rx) = Notifier::channel(64, Duration::from_millis(100));
        evse.set_notifier(notifier);

        Fixture {
            evse: Arc::new(evse),
            evcc,
            scheduler,
            repository,
            rx,
        }
    }

    fn statuses(rx: &mut mpsc::Receiver<Notification>) -> Vec<ChargePointStatus> {
        let mut seen = Vec::new();
        while let Ok(n) = rx.try_recv() {
            if let Notification::Status { status, .. } = n {
                seen.push(status);
            }
        }
        seen
    }

    #[test]
    fn test_rejects_invalid_id() {
        let result = Evse::new(
            EvseSettings::new(0),
            Arc::new(DummyEvcc::new()),
            None,
            Scheduler::new(),
            Arc::new(OcppConfiguration::new()),
        );
        assert!(matches!(result, Err(EvseError::InvalidEvseId(0))));
    }

    #[tokio::test]
    async fn test_start_and_stop_round_trip() {
        let mut f = fixture(None);
        f.evse.start_charging("42", "TAGA").await.unwrap();

        assert!(f.evcc.is_charging());
        assert!(f.evse.is_charging().await);
        assert_eq!(f.evse.transaction_id().await.as_deref(), Some("42"));
        assert!(f.scheduler.has_tag("evse-1-sampling"));
        assert_eq!(
            f.repository.evse(1).unwrap().status,
            ChargePointStatus::Charging
        );

        let summary = f.evse.stop_charging(Reason::Local).await.unwrap();
        assert_eq!(summary.transaction_id, "42");
        assert_eq!(summary.tag_id, "TAGA");
        assert!(!f.evcc.is_charging());
        assert!(!f.scheduler.has_tag("evse-1"));
        assert!(f.evse.transaction_id().await.is_none());
        assert!(!f.evse.has_active_session().await);

        assert_eq!(
            statuses(&mut f.rx),
            vec![
                ChargePointStatus::Preparing,
                ChargePointStatus::Charging,
                ChargePointStatus::Finishing,
                ChargePointStatus::Available,
            ]
        );
        // explicit stops are reported by the caller
        assert!(matches!(f.evse.stop_charging(Reason::Local).await, Err(EvseError::NotCharging)));
    }

    #[rstest]
    #[case(Reason::Local, ChargePointStatus::Available)]
    #[case(Reason::Remote, ChargePointStatus::Available)]
    #[case(Reason::EVDisconnected, ChargePointStatus::SuspendedEVSE)]
    #[case(Reason::UnlockCommand, ChargePointStatus::Unavailable)]
    #[tokio::test]
    async fn test_stop_reason_decides_final_status(#[case] reason: Reason, #[case] expected: ChargePointStatus) {
        let f = fixture(None);
        f.evse.start_charging("7", "TAG").await.unwrap();
        f.evse.stop_charging(reason).await.unwrap();
        assert_eq!(f.evse.status().await.0, expected);
    }

    #[tokio::test]
    async fn test_start_rejected_while_charging_or_invalid() {
        let f = fixture(None);
        assert!(matches!(
            f.evse.start_charging("tx-1", "TAG").await,
            Err(EvseError::InvalidTagOrTransaction(_))
        ));
        assert_eq!(f.evse.status().await.0, ChargePointStatus::Available);

        f.evse.start_charging("1", "TAG").await.unwrap();
        assert!(matches!(
            f.evse.start_charging("2", "TAG").await,
            Err(EvseError::InvalidStatus(ChargePointStatus::Charging))
        ));
    }

    #[tokio::test]
    async fn test_evcc_failure_reverts_start() {
        let f = fixture(None);
        f.evcc.fail_enable(true);
        assert!(matches!(f.evse.start_charging("1", "TAG").await, Err(EvseError::Evcc(_))));
        assert_eq!(f.evse.status().await.0, ChargePointStatus::Available);
        assert!(!f.evse.has_active_session().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_limit_ends_session() {
        let mut f = fixture(Some(Duration::from_secs(60)));
        f.evse.start_charging("9", "TAG").await.unwrap();
        assert!(f.scheduler.has_tag("evse-1-timer"));

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(f.evse.status().await.0, ChargePointStatus::Available);
        let mut ended = None;
        while let Ok(n) = f.rx.try_recv() {
            if let Notification::TransactionEnded(summary) = n {
                ended = Some(summary);
            }
        }
        let ended = ended.expect("transaction end announced");
        assert_eq!(ended.transaction_id, "9");
        assert_eq!(ended.reason, Reason::Local);
    }

    #[tokio::test]
    async fn test_resume_within_limit_is_idempotent() {
        let f = fixture(Some(Duration::from_secs(3600)));
        let persisted = Session {
            is_active: true,
            transaction_id: "55".into(),
            tag_id: "TAG".into(),
            started_at: Some(Utc::now() - chrono::Duration::minutes(10)),
            ended_at: None,
            meter_start: 0.0,
            consumption: Vec::new(),
        };

        f.evse.resume_charging(&persisted).await.unwrap();
        f.evse.resume_charging(&persisted).await.unwrap();

        assert!(f.evse.is_charging().await);
        assert_eq!(f.scheduler.count_by_tag("evse-1-timer"), 1);
        assert_eq!(f.evse.transaction_id().await.as_deref(), Some("55"));
    }

    #[tokio::test]
    async fn test_resume_past_limit_keeps_transaction_id() {
        let mut f = fixture(Some(Duration::from_secs(60)));
        let persisted = Session {
            is_active: true,
            transaction_id: "77".into(),
            tag_id: "TAG".into(),
            started_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            ended_at: None,
            meter_start: 0.0,
            consumption: Vec::new(),
        };

        let result = f.evse.resume_charging(&persisted).await;
        assert!(matches!(
            result,
            Err(EvseError::SessionTimeLimitExceeded { ref transaction_id }) if transaction_id == "77"
        ));
        assert!(!f.evcc.is_charging());
        assert_eq!(f.evse.transaction_id().await.as_deref(), Some("77"));

        let summary = f.evse.discard_recovered_session(Reason::Local).await.unwrap();
        assert_eq!(summary.transaction_id, "77");
        assert!(f.evse.transaction_id().await.is_none());
        let announced = std::iter::from_fn(|| f.rx.try_recv().ok())
            .any(|n| matches!(n, Notification::TransactionEnded(ref s) if s.transaction_id == "77"));
        assert!(announced);
    }

    #[tokio::test]
    async fn test_reservation_lifecycle() {
        let f = fixture(None);
        assert!(matches!(f.evse.reserve(0, "TAG").await, Err(EvseError::InvalidReservationId(0))));

        f.evse.reserve(3, "TAGR").await.unwrap();
        assert_eq!(f.evse.reservation_id().await, Some(3));
        assert!(!f.evse.is_available().await);
        assert!(matches!(f.evse.reserve(4, "TAG").await, Err(EvseError::InvalidStatus(_))));

        // someone else cannot use the reserved outlet
        assert!(f.evse.start_charging("1", "OTHER").await.is_err());
        f.evse.start_charging("1", "tagr").await.unwrap();
        assert_eq!(f.evse.reservation_id().await, None);
        f.evse.stop_charging(Reason::Local).await.unwrap();

        f.evse.reserve(5, "TAGR").await.unwrap();
        f.evse.remove_reservation().await.unwrap();
        assert!(f.evse.is_available().await);
        assert!(f.evse.remove_reservation().await.is_err());
    }

    #[tokio::test]
    async fn test_inoperative_is_scheduled_during_session() {
        let f = fixture(None);
        f.evse.start_charging("1", "TAG").await.unwrap();
        assert_eq!(
            f.evse.set_availability(AvailabilityType::Inoperative).await,
            AvailabilityChange::Scheduled
        );
        assert!(f.evse.is_charging().await);

        f.evse.stop_charging(Reason::Local).await.unwrap();
        assert_eq!(f.evse.status().await.0, ChargePointStatus::Unavailable);
        assert!(f.evse.start_charging("2", "TAG").await.is_err());

        assert_eq!(
            f.evse.set_availability(AvailabilityType::Operative).await,
            AvailabilityChange::Applied
        );
        assert!(f.evse.is_available().await);
    }

    #[tokio::test]
    async fn test_car_states_drive_status() {
        let f = fixture(None);
        f.evse.on_car_state(StateNotification { car_state: CarState::B1, error: None }).await;
        assert!(f.evse.is_preparing().await);
        f.evse.on_car_state(StateNotification { car_state: CarState::A1, error: None }).await;
        assert!(f.evse.is_available().await);

        f.evse.start_charging("1", "TAG").await.unwrap();
        f.evse.on_car_state(StateNotification { car_state: CarState::B2, error: None }).await;
        assert_eq!(f.evse.status().await.0, ChargePointStatus::SuspendedEV);
        f.evse.on_car_state(StateNotification { car_state: CarState::C2, error: None }).await;
        assert!(f.evse.is_charging().await);

        f.evse.on_car_state(StateNotification { car_state: CarState::F, error: None }).await;
        assert_eq!(
            f.evse.status().await,
            (ChargePointStatus::Faulted, ChargePointErrorCode::EVCommunicationError)
        );
        assert!(!f.evse.has_active_session().await);
        assert!(!f.evcc.is_charging());

        f.evse.set_availability(AvailabilityType::Operative).await;
        assert!(f.evse.is_available().await);
    }

    #[tokio::test]
    async fn test_unplug_during_session_then_stop_frees_outlet() {
        let f = fixture(None);
        f.evse.start_charging("1", "TAG").await.unwrap();
        f.evse.on_car_state(StateNotification { car_state: CarState::A1, error: None }).await;
        assert_eq!(f.evse.status().await.0, ChargePointStatus::SuspendedEV);
        assert!(!f.evse.vehicle_connected().await);

        f.evse.stop_charging(Reason::EVDisconnected).await.unwrap();
        assert!(f.evse.is_available().await);
    }

    #[tokio::test]
    async fn test_revert_preparing_only_without_session() {
        let f = fixture(None);
        assert!(!f.evse.revert_preparing().await);
        f.evse.on_car_state(StateNotification { car_state: CarState::B1, error: None }).await;
        assert!(f.evse.revert_preparing().await);
        assert!(f.evse.is_available().await);
    }

    #[tokio::test]
    async fn test_unlock_drives_the_evcc_and_reports_failure() {
        let mut evcc = crate::domain::MockEvcc::new();
        let mut attempts = mockall::Sequence::new();
        evcc.expect_unlock()
            .times(1)
            .in_sequence(&mut attempts)
            .returning(|| Ok(()));
        evcc.expect_unlock()
            .times(1)
            .in_sequence(&mut attempts)
            .returning(|| Err(crate::domain::EvccError::LockFailure));
        let evse = Evse::new(
            EvseSettings::new(1),
            Arc::new(evcc),
            None,
            Scheduler::new(),
            Arc::new(OcppConfiguration::new()),
        )
        .unwrap();

        evse.unlock().await.unwrap();
        assert!(matches!(
            evse.unlock().await,
            Err(EvseError::Evcc(crate::domain::EvccError::LockFailure))
        ));
    }

    #[tokio::test]
    async fn test_unlock_during_session_cuts_power_first() {
        let f = fixture(None);
        f.evse.start_charging("5", "TAG").await.unwrap();
        assert!(f.evcc.is_locked());

        f.evse.unlock().await.unwrap();
        assert!(!f.evcc.is_charging());
        assert!(!f.evcc.is_locked());
        assert_eq!(f.evcc.unlock_count(), 1);
    }
}
