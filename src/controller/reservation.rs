use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::charging::reservation_tag;
use super::ChargePoint;
use crate::evse::EvseError;
use crate::ocpp::messages::{
    CancelReservationRequest, CancelReservationResponse, CancelReservationStatus, ChargePointStatus,
    ReservationStatus, ReserveNowRequest, ReserveNowResponse,
};

impl ChargePoint {
    pub async fn reserve_now(self: &Arc<Self>, request: ReserveNowRequest) -> ReserveNowResponse {
        let status = self.try_reserve(&request).await;
        info!(
            reservation_id = request.reservation_id,
            connector_id = request.connector_id,
            ?status,
            "reserve now"
        );
        ReserveNowResponse { status }
    }

    async fn try_reserve(self: &Arc<Self>, request: &ReserveNowRequest) -> ReservationStatus {
        // Reserving connector 0 is not offered
        if request.connector_id <= 0 || request.expiry_date <= Utc::now() {
            return ReservationStatus::Rejected;
        }
        let Ok(evse) = self.evses.find_evse(request.connector_id) else {
            return ReservationStatus::Rejected;
        };
        if !self.is_operative() {
            return ReservationStatus::Unavailable;
        }

        match evse.reserve(request.reservation_id, &request.id_tag).await {
            Ok(()) => {}
            Err(EvseError::InvalidStatus(ChargePointStatus::Faulted)) => return ReservationStatus::Faulted,
            Err(EvseError::InvalidStatus(ChargePointStatus::Unavailable)) => return ReservationStatus::Unavailable,
            Err(EvseError::InvalidStatus(_)) => return ReservationStatus::Occupied,
            Err(e) => {
                warn!(reservation_id = request.reservation_id, error = %e, "reservation refused");
                return ReservationStatus::Rejected;
            }
        }

        let reservation_id = request.reservation_id;
        let tag = reservation_tag(reservation_id);
        self.scheduler.remove_by_tag(&tag);
        let expiring = evse.clone();
        self.scheduler.at(request.expiry_date, &[tag.as_str()], move || async move {
            if expiring.reservation_id().await == Some(reservation_id) {
                info!(reservation_id, evse_id = expiring.id(), "reservation expired");
                if let Err(e) = expiring.remove_reservation().await {
                    warn!(reservation_id, error = %e, "expired reservation could not be removed");
                }
            }
        });
        ReservationStatus::Accepted
    }

    pub async fn cancel_reservation(&self, request: CancelReservationRequest) -> CancelReservationResponse {
        let reservation_id = request.reservation_id;
        let Some(evse) = self.evses.find_by_reservation_id(reservation_id).await else {
            warn!(reservation_id, "cancel for unknown reservation");
            return CancelReservationResponse {
                status: CancelReservationStatus::Rejected,
            };
        };

        self.scheduler.remove_by_tag(&reservation_tag(reservation_id));
        let status = match evse.remove_reservation().await {
            Ok(()) => CancelReservationStatus::Accepted,
            Err(e) => {
                warn!(reservation_id, error = %e, "reservation could not be cancelled");
                CancelReservationStatus::Rejected
            }
        };
        CancelReservationResponse { status }
    }
}
