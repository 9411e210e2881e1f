use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::ChargePoint;
use crate::ocpp::messages::{
    AvailabilityType, BootNotificationRequest, BootNotificationResponse, ChargePointErrorCode, ChargePointStatus,
    HeartbeatRequest, RegistrationStatus, StatusNotificationRequest,
};
use crate::ocpp::{Key, OcppError};

const BOOT_TAG: &str = "boot";
const HEARTBEAT_TAG: &str = "heartbeat";
const BOOT_RETRY_AFTER_FAILURE: Duration = Duration::from_secs(30);
const BOOT_RETRY_DEFAULT: Duration = Duration::from_secs(60);
const DEFAULT_HEARTBEAT_SECS: u64 = 60;

impl ChargePoint {
    /// Called whenever the transport (re)connects.
    ///
    /// Statuses are not sent while offline, so a reconnect after registration
    /// announces the current ones again.
    pub async fn on_connected(self: &Arc<Self>) {
        if self.is_registered() {
            info!("reconnected, announcing current statuses");
            self.notify_charge_point_status();
            self.notify_all_statuses().await;
            return;
        }
        if self.scheduler.has_tag(BOOT_TAG) {
            debug!("connected, boot retry already pending");
            return;
        }
        self.boot().await;
    }

    /// Send a BootNotification; the answer decides what happens next.
    pub async fn boot(self: &Arc<Self>) {
        let request = BootNotificationRequest {
            charge_point_vendor: self.identity.vendor.clone(),
            charge_point_model: self.identity.model.clone(),
            charge_point_serial_number: self.identity.serial_number.clone(),
            charge_box_serial_number: None,
            firmware_version: Some(
                self.identity
                    .firmware_version
                    .clone()
                    .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            ),
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        };

        info!(charge_point_id = %self.identity.id, "sending boot notification");
        let cp = Arc::downgrade(self);
        let sent = self
            .dispatcher
            .send_request(request, move |result| async move {
                if let Some(cp) = cp.upgrade() {
                    cp.on_boot_result(result).await;
                }
            })
            .await;

        if let Err(e) = sent {
            error!(error = %e, "boot notification could not be delivered");
            self.schedule_boot(BOOT_RETRY_AFTER_FAILURE);
        }
    }

    async fn on_boot_result(self: &Arc<Self>, result: Result<BootNotificationResponse, OcppError>) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "boot notification failed");
                self.schedule_boot(BOOT_RETRY_AFTER_FAILURE);
                return;
            }
        };

        match response.status {
            RegistrationStatus::Accepted => {
                info!(interval = response.interval, "accepted by the central system");
                self.registered.store(true, Ordering::SeqCst);
                if response.interval > 0 {
                    self.configuration.set(Key::HeartbeatInterval, response.interval);
                }
                self.arm_heartbeat();
                self.notify_charge_point_status();

                if !self.restored.swap(true, Ordering::SeqCst) {
                    self.restore_state().await;
                }
                self.notify_all_statuses().await;
            }
            status => {
                let retry = u64::try_from(response.interval)
                    .ok()
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
                    .unwrap_or(BOOT_RETRY_DEFAULT);
                warn!(?status, retry_secs = retry.as_secs(), "registration not accepted");
                self.schedule_boot(retry);
            }
        }
    }

    fn schedule_boot(self: &Arc<Self>, delay: Duration) {
        self.scheduler.remove_by_tag(BOOT_TAG);
        let cp = Arc::downgrade(self);
        self.scheduler.once(delay, &[BOOT_TAG], move || async move {
            if let Some(cp) = cp.upgrade() {
                cp.boot().await;
            }
        });
    }

    /// (Re)arm the heartbeat from `HeartbeatInterval`.
    pub(super) fn arm_heartbeat(self: &Arc<Self>) {
        self.scheduler.remove_by_tag(HEARTBEAT_TAG);
        let seconds = self.configuration.get_or(Key::HeartbeatInterval, DEFAULT_HEARTBEAT_SECS);
        if seconds == 0 {
            info!("heartbeat disabled");
            return;
        }

        let cp = Arc::downgrade(self);
        self.scheduler
            .every(Duration::from_secs(seconds), &[HEARTBEAT_TAG], move || {
                let cp = cp.clone();
                async move {
                    if let Some(cp) = cp.upgrade() {
                        cp.heartbeat().await;
                    }
                }
            });
        debug!(interval_secs = seconds, "heartbeat armed");
    }

    pub async fn heartbeat(&self) {
        let sent = self
            .dispatcher
            .send_request(HeartbeatRequest {}, |result| async move {
                match result {
                    Ok(response) => debug!(server_time = %response.current_time, "heartbeat acknowledged"),
                    Err(e) => warn!(error = %e, "heartbeat failed"),
                }
            })
            .await;
        if let Err(e) = sent {
            warn!(error = %e, "heartbeat could not be delivered");
        }
    }

    /// Bring EVSEs back to their persisted state after the first accepted boot.
    async fn restore_state(&self) {
        let snapshots = match self.repository.load_evses().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(error = %e, "failed to load persisted EVSE state");
                return;
            }
        };
        let resumed = self.evses.restore_all(snapshots).await;
        info!(?resumed, "EVSE state restored");
    }

    /// StatusNotification for connector 0, the charge point itself
    pub(super) fn notify_charge_point_status(&self) {
        let status = match self.availability() {
            AvailabilityType::Operative => ChargePointStatus::Available,
            AvailabilityType::Inoperative => ChargePointStatus::Unavailable,
        };
        self.send_status(0, status, ChargePointErrorCode::NoError);
    }

    pub(super) async fn notify_all_statuses(&self) {
        for (evse_id, status, error_code) in self.evses.statuses().await {
            self.send_status(evse_id, status, error_code);
        }
    }

    /// Queue a StatusNotification on the status lane. Statuses leave in the
    /// order they were queued, without holding up the caller.
    pub(super) fn send_status(&self, connector_id: i32, status: ChargePointStatus, error_code: ChargePointErrorCode) {
        let request = StatusNotificationRequest {
            connector_id,
            error_code,
            status,
            info: None,
            timestamp: Some(Utc::now()),
            vendor_id: None,
            vendor_error_code: None,
        };
        if self.status_lane.send(request).is_err() {
            debug!(connector_id, %status, "status lane closed, notification dropped");
        }
    }

    /// Deliver one queued status. While offline it is skipped; the next
    /// reconnect announces the current state instead.
    pub(super) async fn deliver_status(&self, request: StatusNotificationRequest) {
        let connector_id = request.connector_id;
        let status = request.status;
        if !self.dispatcher.is_connected() {
            debug!(connector_id, %status, "offline, status left for the next announcement");
            return;
        }
        let sent = self
            .dispatcher
            .send_request(request, move |result| async move {
                if let Err(e) = result {
                    warn!(connector_id, error = %e, "status notification failed");
                }
            })
            .await;
        if let Err(e) = sent {
            warn!(connector_id, %status, error = %e, "status notification could not be delivered");
        }
    }
}
