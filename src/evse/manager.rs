use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{holds_session, Evse, EvseError, EvseSnapshot, Notifier, SessionSummary};
use crate::ocpp::messages::{ChargePointErrorCode, ChargePointStatus, Reason};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("EVSE {0} already registered")]
    AlreadyExists(i32),
    #[error("EVSE {0} not found")]
    NotFound(i32),
    #[error("EVSE {evse_id}: {source}")]
    Evse {
        evse_id: i32,
        #[source]
        source: EvseError,
    },
}

impl RegistryError {
    fn evse(evse_id: i32) -> impl FnOnce(EvseError) -> RegistryError {
        move |source| RegistryError::Evse { evse_id, source }
    }
}

/// Registry of the EVSEs of one charge point, keyed by id
pub struct EvseManager {
    evses: RwLock<BTreeMap<i32, Arc<Evse>>>,
    notifier: Notifier,
    token: CancellationToken,
}

impl EvseManager {
    pub fn new(notifier: Notifier, token: CancellationToken) -> Self {
        Self {
            evses: RwLock::new(BTreeMap::new()),
            notifier,
            token,
        }
    }

    /// Register and initialise an EVSE.
    pub async fn add_evse(&self, evse: Arc<Evse>) -> Result<(), RegistryError> {
        let evse_id = evse.id();
        if self.evses.read().contains_key(&evse_id) {
            return Err(RegistryError::AlreadyExists(evse_id));
        }

        evse.set_notifier(self.notifier.clone());
        evse.init(self.token.child_token())
            .await
            .map_err(RegistryError::evse(evse_id))?;

        let mut evses = self.evses.write();
        if evses.contains_key(&evse_id) {
            return Err(RegistryError::AlreadyExists(evse_id));
        }
        evses.insert(evse_id, evse);
        info!(evse_id, "EVSE registered");
        Ok(())
    }

    pub fn find_evse(&self, evse_id: i32) -> Result<Arc<Evse>, RegistryError> {
        self.evses
            .read()
            .get(&evse_id)
            .cloned()
            .ok_or(RegistryError::NotFound(evse_id))
    }

    /// All EVSEs in id order
    pub fn evses(&self) -> Vec<Arc<Evse>> {
        self.evses.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.evses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First EVSE (lowest id) that is Available and Operative
    pub async fn find_available(&self) -> Option<Arc<Evse>> {
        for evse in self.evses() {
            if evse.is_available().await {
                return Some(evse);
            }
        }
        None
    }

    /// First EVSE in Preparing without a session, i.e. waiting for a tag
    pub async fn find_preparing(&self) -> Option<Arc<Evse>> {
        for evse in self.evses() {
            if evse.is_preparing().await && !evse.has_active_session().await {
                return Some(evse);
            }
        }
        None
    }

    pub async fn find_by_tag_id(&self, tag_id: &str) -> Option<Arc<Evse>> {
        for evse in self.evses() {
            if evse
                .tag_id()
                .await
                .is_some_and(|t| t.eq_ignore_ascii_case(tag_id))
            {
                return Some(evse);
            }
        }
        None
    }

    pub async fn find_by_transaction_id(&self, transaction_id: &str) -> Option<Arc<Evse>> {
        for evse in self.evses() {
            if evse.transaction_id().await.as_deref() == Some(transaction_id) {
                return Some(evse);
            }
        }
        None
    }

    pub async fn find_by_reservation_id(&self, reservation_id: i32) -> Option<Arc<Evse>> {
        for evse in self.evses() {
            if evse.reservation_id().await == Some(reservation_id) {
                return Some(evse);
            }
        }
        None
    }

    pub async fn start_charging(&self, evse_id: i32, transaction_id: &str, tag_id: &str) -> Result<(), RegistryError> {
        let evse = self.find_evse(evse_id)?;
        evse.start_charging(transaction_id, tag_id)
            .await
            .map_err(RegistryError::evse(evse_id))
    }

    pub async fn stop_charging(&self, evse_id: i32, reason: Reason) -> Result<SessionSummary, RegistryError> {
        let evse = self.find_evse(evse_id)?;
        evse.stop_charging(reason).await.map_err(RegistryError::evse(evse_id))
    }

    /// Stop every EVSE that holds a session. Keeps going past failures and
    /// returns the stopped sessions, or the last error.
    pub async fn stop_all(&self, reason: Reason) -> Result<Vec<SessionSummary>, RegistryError> {
        let mut stopped = Vec::new();
        let mut last_error = None;

        for evse in self.evses() {
            let (status, _) = evse.status().await;
            if !holds_session(status) {
                continue;
            }
            match evse.stop_charging(reason).await {
                Ok(summary) => stopped.push(summary),
                Err(EvseError::NotCharging) => {}
                Err(e) => {
                    error!(evse_id = evse.id(), error = %e, "failed to stop charging");
                    last_error = Some(RegistryError::Evse {
                        evse_id: evse.id(),
                        source: e,
                    });
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(stopped),
        }
    }

    /// Bring EVSEs back to their persisted state, resuming sessions that are
    /// still within their time limit. Returns the EVSEs whose session resumed.
    pub async fn restore_all(&self, snapshots: Vec<EvseSnapshot>) -> Vec<i32> {
        let mut resumed = Vec::new();

        for snapshot in snapshots {
            let evse = match self.find_evse(snapshot.evse_id) {
                Ok(evse) => evse,
                Err(_) => {
                    warn!(evse_id = snapshot.evse_id, "persisted EVSE is no longer configured");
                    continue;
                }
            };

            let session_pending = holds_session(snapshot.status) && !snapshot.session.transaction_id.is_empty();
            if !session_pending {
                evse.restore_status(&snapshot).await;
                continue;
            }

            match evse.resume_charging(&snapshot.session).await {
                Ok(()) => resumed.push(snapshot.evse_id),
                Err(EvseError::SessionTimeLimitExceeded { transaction_id }) => {
                    info!(evse_id = snapshot.evse_id, %transaction_id, "recovered session expired");
                    evse.discard_recovered_session(Reason::Local).await;
                }
                Err(e) => {
                    error!(evse_id = snapshot.evse_id, error = %e, "failed to resume session");
                    evse.fault(ChargePointErrorCode::InternalError, Reason::Other).await;
                }
            }
        }

        resumed
    }

    /// Current status of every EVSE
    pub async fn statuses(&self) -> Vec<(i32, ChargePointStatus, ChargePointErrorCode)> {
        let mut statuses = Vec::new();
        for evse in self.evses() {
            let (status, error_code) = evse.status().await;
            statuses.push((evse.id(), status, error_code));
        }
        statuses
    }

    pub async fn cleanup(&self) {
        self.token.cancel();
        for evse in self.evses() {
            evse.cleanup().await;
        }
    }
}
