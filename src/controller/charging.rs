use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{ChargePoint, ChargePointError};
use crate::evse::{holds_session, Evse, EvseError, SessionSummary};
use crate::ocpp::messages::{
    AuthorizationStatus, AuthorizeRequest, AvailabilityType, ChargePointStatus, IdTagInfo, Reason,
    StartTransactionRequest, StopTransactionRequest,
};
use crate::ocpp::{Dispatcher, Key, OcppError};

const REAUTHORIZE_DELAY: Duration = Duration::from_secs(10);

pub(super) fn reservation_tag(reservation_id: i32) -> String {
    format!("reservation-{reservation_id}")
}

/// StopTransaction payload for a captured session
pub(super) fn stop_transaction_request(summary: &SessionSummary) -> Result<StopTransactionRequest, ChargePointError> {
    let transaction_id = summary
        .transaction_id
        .parse::<i32>()
        .map_err(|_| ChargePointError::InvalidTransactionId(summary.transaction_id.clone()))?;
    Ok(StopTransactionRequest {
        id_tag: Some(summary.tag_id.clone()).filter(|tag| !tag.is_empty()),
        meter_stop: summary.meter_stop(),
        timestamp: summary.stopped_at,
        transaction_id,
        reason: Some(summary.reason),
        transaction_data: summary.meter_values.clone(),
    })
}

/// Whether `evse` could take a new session for `tag_id` right now
pub(super) async fn can_start(evse: &Evse, tag_id: &str) -> bool {
    if evse.availability().await == AvailabilityType::Inoperative {
        return false;
    }
    match evse.status().await.0 {
        ChargePointStatus::Available | ChargePointStatus::Preparing => !evse.has_active_session().await,
        ChargePointStatus::Reserved => evse
            .reservation()
            .await
            .is_some_and(|r| r.tag_id.eq_ignore_ascii_case(tag_id)),
        _ => false,
    }
}

impl ChargePoint {
    /// Decide whether `tag_id` may charge.
    ///
    /// With `LocalPreAuthorize` a valid local verdict answers immediately and
    /// the tag is re-checked with the Central System in the background.
    /// Otherwise the Central System decides; if it cannot be reached and
    /// `LocalAuthorizeOffline` is set, the last known verdict is used.
    pub async fn authorize_tag(self: &Arc<Self>, tag_id: &str) -> bool {
        let now = Utc::now();

        if self.configuration.get_bool(Key::LocalPreAuthorize, false) && self.tags.is_authorized_locally(tag_id, now) {
            debug!(tag_id, "tag pre-authorized locally");
            let cp = Arc::downgrade(self);
            let tag = tag_id.to_string();
            self.scheduler.once(REAUTHORIZE_DELAY, &["reauthorize"], move || async move {
                if let Some(cp) = cp.upgrade() {
                    if let Err(e) = cp.send_authorize(&tag).await {
                        debug!(tag_id = %tag, error = %e, "background re-authorization failed");
                    }
                }
            });
            return true;
        }

        match self.send_authorize(tag_id).await {
            Ok(info) => {
                let authorized = info.is_valid_at(now);
                info!(tag_id, status = %info.status, authorized, "tag authorized by central system");
                authorized
            }
            Err(e) if self.configuration.get_bool(Key::LocalAuthorizeOffline, true) => {
                warn!(tag_id, error = %e, "authorize failed, using the last known verdict");
                match self.tags.get_tag(tag_id) {
                    Some((info, source)) => {
                        debug!(tag_id, ?source, status = %info.status, "offline verdict");
                        if info.status.is_revoked() {
                            self.revoke(tag_id).await;
                        }
                        info.status.is_accepted()
                    }
                    None => false,
                }
            }
            Err(e) => {
                warn!(tag_id, error = %e, "authorize failed");
                false
            }
        }
    }

    async fn send_authorize(&self, tag_id: &str) -> Result<IdTagInfo, OcppError> {
        let response = self
            .dispatcher
            .request(AuthorizeRequest {
                id_tag: tag_id.to_string(),
            })
            .await?;
        let info = response.id_tag_info;
        if info.status.is_revoked() {
            self.revoke(tag_id).await;
        }
        self.tags.add_tag(tag_id, info.clone());
        Ok(info)
    }

    /// Force-stop a session held by a tag that lost its right to charge.
    async fn revoke(&self, tag_id: &str) {
        if !self.configuration.get_bool(Key::StopTransactionOnInvalidId, true) {
            return;
        }
        let Some(evse) = self.evses.find_by_tag_id(tag_id).await else { return };
        if !evse.has_active_session().await {
            return;
        }
        warn!(evse_id = evse.id(), tag_id, "tag revoked, stopping its session");
        if let Err(e) = self.stop_charging(evse.id(), Reason::DeAuthorized).await {
            error!(evse_id = evse.id(), error = %e, "failed to stop revoked session");
        }
    }

    /// Authorize `tag_id` and request a transaction on `evse_id`, or on the
    /// first available EVSE. Charging begins once the Central System accepts.
    pub async fn start_charging(self: &Arc<Self>, evse_id: Option<i32>, tag_id: &str) -> Result<(), ChargePointError> {
        if !self.is_operative() {
            return Err(ChargePointError::Unavailable);
        }
        let evse = match evse_id {
            Some(evse_id) => self.evses.find_evse(evse_id)?,
            None => self
                .evses
                .find_available()
                .await
                .ok_or(ChargePointError::NoAvailableEvse)?,
        };
        if !can_start(&evse, tag_id).await {
            return Err(EvseError::InvalidStatus(evse.status().await.0).into());
        }
        if !self.authorize_tag(tag_id).await {
            return Err(ChargePointError::Unauthorized(tag_id.to_string()));
        }
        self.start_transaction(evse, tag_id).await
    }

    /// Send StartTransaction and start the EVSE once it is accepted.
    pub(super) async fn start_transaction(&self, evse: Arc<Evse>, tag_id: &str) -> Result<(), ChargePointError> {
        let reservation_id = evse.reservation_id().await;
        let meter_start = evse.energy_register().await.unwrap_or_default();
        let request = StartTransactionRequest {
            connector_id: evse.id(),
            id_tag: tag_id.to_string(),
            meter_start: whole_wh(meter_start),
            reservation_id,
            timestamp: Utc::now(),
        };

        let tag = tag_id.to_string();
        let tags = self.tags.clone();
        let scheduler = self.scheduler.clone();
        let dispatcher = self.dispatcher.clone();
        self.dispatcher
            .send_request(request, move |result| async move {
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        error!(evse_id = evse.id(), error = %e, "start transaction failed");
                        return;
                    }
                };
                tags.add_tag(&tag, response.id_tag_info.clone());

                let status = response.id_tag_info.status;
                if status != AuthorizationStatus::Accepted || response.transaction_id <= 0 {
                    warn!(evse_id = evse.id(), tag_id = %tag, %status, "transaction not accepted");
                    return;
                }

                let transaction_id = response.transaction_id.to_string();
                match evse.start_charging_from(&transaction_id, &tag, meter_start).await {
                    Ok(()) => {
                        if let Some(reservation_id) = reservation_id {
                            scheduler.remove_by_tag(&reservation_tag(reservation_id));
                        }
                    }
                    Err(e) => {
                        error!(evse_id = evse.id(), %transaction_id, error = %e, "unable to start charging");
                        close_orphan_transaction(&dispatcher, response.transaction_id, &tag, whole_wh(meter_start))
                            .await;
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Report the session on `evse_id` as stopped and stop the EVSE once the
    /// Central System has the StopTransaction.
    pub async fn stop_charging(&self, evse_id: i32, reason: Reason) -> Result<(), ChargePointError> {
        let evse = self.evses.find_evse(evse_id)?;
        let (status, _) = evse.status().await;
        if !holds_session(status) {
            return Err(EvseError::NotCharging.into());
        }

        let session = evse.session().await;
        if !session.is_active {
            evse.stop_charging(reason).await?;
            return Ok(());
        }

        let summary = SessionSummary::capture(evse_id, &session, reason, Utc::now());
        let request = match stop_transaction_request(&summary) {
            Ok(request) => request,
            Err(e) => {
                warn!(evse_id, error = %e, "session cannot be reported, stopping locally");
                evse.stop_charging(reason).await?;
                return Err(e);
            }
        };

        let stopping = evse.clone();
        let sent = self
            .dispatcher
            .send_request(request, move |result| async move {
                if let Err(e) = result {
                    warn!(evse_id, error = %e, "stop transaction not confirmed");
                }
                match stopping.stop_charging(reason).await {
                    Ok(_) | Err(EvseError::NotCharging) => {}
                    Err(e) => error!(evse_id, error = %e, "unable to stop charging"),
                }
            })
            .await;

        if let Err(e) = sent {
            warn!(evse_id, error = %e, "stop transaction undeliverable, stopping locally");
            match evse.stop_charging(reason).await {
                Ok(_) | Err(EvseError::NotCharging) => {}
                Err(stop_error) => return Err(stop_error.into()),
            }
            return Err(e.into());
        }
        info!(evse_id, transaction_id = %summary.transaction_id, %reason, "stop requested");
        Ok(())
    }

    /// Report a session the EVSE already closed on its own.
    pub(super) async fn send_stop_transaction(&self, summary: &SessionSummary) {
        let request = match stop_transaction_request(summary) {
            Ok(request) => request,
            Err(e) => {
                warn!(evse_id = summary.evse_id, error = %e, "ended session cannot be reported");
                return;
            }
        };
        let evse_id = summary.evse_id;
        let sent = self
            .dispatcher
            .send_request(request, move |result| async move {
                if let Err(e) = result {
                    warn!(evse_id, error = %e, "stop transaction not confirmed");
                }
            })
            .await;
        if let Err(e) = sent {
            error!(evse_id, error = %e, "stop transaction could not be delivered");
        }
    }

    /// Close every session on the shutdown path: stop first, report after.
    pub(super) async fn stop_all_transactions(&self, reason: Reason) -> Result<(), ChargePointError> {
        let mut last_error = None;

        for evse in self.evses.evses() {
            if !evse.has_active_session().await {
                continue;
            }
            match evse.stop_charging(reason).await {
                Ok(summary) if self.dispatcher.is_connected() => self.send_stop_transaction(&summary).await,
                Ok(summary) => warn!(
                    evse_id = summary.evse_id,
                    transaction_id = %summary.transaction_id,
                    "offline, stop transaction not sent"
                ),
                Err(EvseError::NotCharging) => {}
                Err(e) => last_error = Some(ChargePointError::Evse(e)),
            }
        }

        if let Err(e) = self.evses.stop_all(reason).await {
            last_error = Some(e.into());
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// An accepted transaction the EVSE could not start is closed right away.
async fn close_orphan_transaction(dispatcher: &Dispatcher, transaction_id: i32, tag_id: &str, meter_stop: i32) {
    let request = StopTransactionRequest {
        id_tag: Some(tag_id.to_string()),
        meter_stop,
        timestamp: Utc::now(),
        transaction_id,
        reason: Some(Reason::Other),
        transaction_data: Vec::new(),
    };
    let sent = dispatcher
        .send_request(request, move |result| async move {
            if let Err(e) = result {
                warn!(transaction_id, error = %e, "orphan transaction not confirmed");
            }
        })
        .await;
    if let Err(e) = sent {
        error!(transaction_id, error = %e, "orphan transaction could not be closed");
    }
}

fn whole_wh(wh: f64) -> i32 {
    wh.round().clamp(0.0, i32::MAX as f64) as i32
}
