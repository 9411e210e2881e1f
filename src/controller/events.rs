//! Event pipeline: EVSE notifications and tag reads turned into protocol traffic

use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ChargePoint, ChargePointError};
use crate::domain::{Color, DisplayMessage};
use crate::evse::{Evse, Notification};
use crate::ocpp::messages::{
    ChargePointErrorCode, ChargePointStatus, MeterValuesRequest, Reason, StatusNotificationRequest,
};
use crate::ocpp::Key;

const TAG_BLINKS: u32 = 3;

fn preparing_tag(evse_id: i32) -> String {
    format!("preparing-{evse_id}")
}

fn status_text(status: ChargePointStatus) -> &'static str {
    match status {
        ChargePointStatus::Available => "Ready",
        ChargePointStatus::Preparing => "Present your tag",
        ChargePointStatus::Charging => "Charging",
        ChargePointStatus::SuspendedEV | ChargePointStatus::SuspendedEVSE => "Paused",
        ChargePointStatus::Finishing => "Finishing",
        ChargePointStatus::Reserved => "Reserved",
        ChargePointStatus::Unavailable => "Out of service",
        ChargePointStatus::Faulted => "Fault",
    }
}

impl ChargePoint {
    pub(super) fn spawn_event_loop(self: &Arc<Self>, mut notifications: mpsc::Receiver<Notification>) {
        let cp: Weak<ChargePoint> = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = token.cancelled() => break,
                    received = notifications.recv() => match received {
                        Some(notification) => notification,
                        None => break,
                    },
                };
                let Some(cp) = cp.upgrade() else { break };
                cp.handle_notification(notification).await;
            }
            debug!("event loop stopped");
        });
    }

    /// Single consumer of queued StatusNotifications, so they reach the
    /// Central System in emission order without blocking the event loop.
    pub(super) fn spawn_status_lane(self: &Arc<Self>, mut statuses: mpsc::UnboundedReceiver<StatusNotificationRequest>) {
        let cp: Weak<ChargePoint> = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = token.cancelled() => break,
                    received = statuses.recv() => match received {
                        Some(request) => request,
                        None => break,
                    },
                };
                let Some(cp) = cp.upgrade() else { break };
                cp.deliver_status(request).await;
            }
            debug!("status lane stopped");
        });
    }

    async fn handle_notification(self: &Arc<Self>, notification: Notification) {
        match notification {
            Notification::Status {
                evse_id,
                status,
                error_code,
            } => self.on_status(evse_id, status, error_code).await,
            Notification::MeterValues {
                evse_id,
                transaction_id,
                meter_values,
            } => {
                let request = MeterValuesRequest {
                    connector_id: evse_id,
                    transaction_id: transaction_id.and_then(|id| id.parse().ok()),
                    meter_value: meter_values,
                };
                let cp = self.clone();
                tokio::spawn(async move {
                    let sent = cp
                        .dispatcher
                        .send_request(request, move |result| async move {
                            if let Err(e) = result {
                                warn!(evse_id, error = %e, "meter values failed");
                            }
                        })
                        .await;
                    if let Err(e) = sent {
                        warn!(evse_id, error = %e, "meter values could not be delivered");
                    }
                });
            }
            Notification::TransactionEnded(summary) => {
                info!(
                    evse_id = summary.evse_id,
                    transaction_id = %summary.transaction_id,
                    reason = %summary.reason,
                    "session ended by the EVSE"
                );
                let cp = self.clone();
                tokio::spawn(async move { cp.send_stop_transaction(&summary).await });
            }
        }
    }

    async fn on_status(self: &Arc<Self>, evse_id: i32, status: ChargePointStatus, error_code: ChargePointErrorCode) {
        self.show_status(evse_id, status);
        if let Ok(evse) = self.evses.find_evse(evse_id) {
            self.apply_status_policy(evse, status).await;
        }
        if !self.is_registered() {
            debug!(evse_id, %status, "not registered, status notification deferred");
        } else if !self.dispatcher.is_connected() {
            debug!(evse_id, %status, "offline, status announced on reconnect");
        } else {
            self.send_status(evse_id, status, error_code);
        }
    }

    fn show_status(&self, evse_id: i32, status: ChargePointStatus) {
        if let Some(indicator) = self.peripherals.indicator.clone() {
            let color = self.colors.for_status(status);
            let index = usize::try_from(evse_id - 1).unwrap_or_default();
            tokio::spawn(async move {
                if let Err(e) = indicator.change_color(index, color).await {
                    warn!(evse_id, error = %e, "indicator update failed");
                }
            });
        }
        if let Some(display) = self.peripherals.display.clone() {
            let message = DisplayMessage::new(format!("EVSE {evse_id}"), status_text(status));
            tokio::spawn(async move {
                if let Err(e) = display.show(message).await {
                    warn!(evse_id, error = %e, "display update failed");
                }
            });
        }
    }

    /// Charge point reactions to an EVSE entering `status`.
    async fn apply_status_policy(self: &Arc<Self>, evse: Arc<Evse>, status: ChargePointStatus) {
        let evse_id = evse.id();
        if status != ChargePointStatus::Preparing {
            self.scheduler.remove_by_tag(&preparing_tag(evse_id));
        }

        match status {
            ChargePointStatus::Preparing if !evse.has_active_session().await => {
                if self.identity.free_mode {
                    let cp = self.clone();
                    let tag_id = self.identity.id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = cp.start_transaction(evse, &tag_id).await {
                            error!(evse_id, error = %e, "free mode start failed");
                        }
                    });
                    return;
                }
                let tag = preparing_tag(evse_id);
                self.scheduler.remove_by_tag(&tag);
                self.scheduler
                    .once(self.identity.preparing_timeout(), &[tag.as_str()], move || async move {
                        if evse.revert_preparing().await {
                            info!(evse_id, "no tag presented, back to available");
                        }
                    });
            }
            ChargePointStatus::SuspendedEV
                if !evse.vehicle_connected().await
                    && evse.has_active_session().await
                    && self.configuration.get_bool(Key::StopTransactionOnEVSideDisconnect, true) =>
            {
                let cp = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = cp.stop_charging(evse_id, Reason::EVDisconnected).await {
                        error!(evse_id, error = %e, "stop on EV disconnect failed");
                    }
                });
            }
            _ => {}
        }
    }

    pub(super) fn spawn_reader_loop(self: &Arc<Self>) {
        let Some(reader) = self.peripherals.reader.clone() else { return };
        let mut tags = reader.subscribe();
        let cp = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                let tag_id = tokio::select! {
                    _ = token.cancelled() => break,
                    received = tags.recv() => match received {
                        Ok(tag_id) => tag_id,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "tag reader lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                let Some(cp) = cp.upgrade() else { break };
                if let Err(e) = cp.handle_tag(&tag_id).await {
                    warn!(error = %e, "tag not handled");
                }
                if let Err(e) = reader.reset().await {
                    warn!(error = %e, "tag reader reset failed");
                }
            }
            debug!("tag reader loop stopped");
        });
    }

    /// A tag presented at the reader.
    ///
    /// Stops the session it owns, or starts one on the EVSE waiting in
    /// Preparing, on an EVSE reserved for it, or on the first available EVSE.
    pub async fn handle_tag(self: &Arc<Self>, tag_id: &str) -> Result<(), ChargePointError> {
        let tag_id = tag_id.trim().to_uppercase();
        info!(tag_id = %tag_id, "tag presented");

        if let Some(indicator) = self.peripherals.indicator.clone() {
            let index = self.evses.len();
            tokio::spawn(async move {
                if let Err(e) = indicator.blink(index, TAG_BLINKS, Color::White).await {
                    debug!(error = %e, "tag blink failed");
                }
            });
        }

        if let Some(evse) = self.evses.find_by_tag_id(&tag_id).await {
            if evse.has_active_session().await {
                return self.stop_charging(evse.id(), Reason::Local).await;
            }
        }

        if let Some(evse) = self.evses.find_preparing().await {
            return self.start_charging(Some(evse.id()), &tag_id).await;
        }

        for evse in self.evses.evses() {
            let reserved_for_tag = evse
                .reservation()
                .await
                .is_some_and(|r| r.tag_id.eq_ignore_ascii_case(&tag_id));
            if reserved_for_tag {
                return self.start_charging(Some(evse.id()), &tag_id).await;
            }
        }

        match self.evses.find_available().await {
            Some(evse) => self.start_charging(Some(evse.id()), &tag_id).await,
            None => Err(ChargePointError::NoAvailableEvse),
        }
    }
}
