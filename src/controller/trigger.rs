use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::ChargePoint;
use crate::evse::Evse;
use crate::ocpp::messages::{
    Measurand, MessageTrigger, TriggerMessageRequest, TriggerMessageResponse, TriggerMessageStatus,
};
use crate::ocpp::Key;

/// Triggered messages go out after the TriggerMessage answer.
const TRIGGER_DELAY: Duration = Duration::from_secs(2);

impl ChargePoint {
    pub async fn trigger_message(self: &Arc<Self>, request: TriggerMessageRequest) -> TriggerMessageResponse {
        let status = self.try_trigger(request.requested_message, request.connector_id).await;
        info!(
            message = %request.requested_message,
            connector_id = ?request.connector_id,
            ?status,
            "trigger message"
        );
        TriggerMessageResponse { status }
    }

    async fn try_trigger(self: &Arc<Self>, message: MessageTrigger, connector_id: Option<i32>) -> TriggerMessageStatus {
        let evse = match connector_id.filter(|id| *id > 0) {
            Some(id) => match self.evses.find_evse(id) {
                Ok(evse) => Some(evse),
                Err(_) => return TriggerMessageStatus::Rejected,
            },
            None => None,
        };

        let cp = Arc::downgrade(self);
        match message {
            MessageTrigger::BootNotification => {
                self.scheduler.once(TRIGGER_DELAY, &["trigger"], move || async move {
                    if let Some(cp) = cp.upgrade() {
                        cp.boot().await;
                    }
                });
            }
            MessageTrigger::Heartbeat => {
                self.scheduler.once(TRIGGER_DELAY, &["trigger"], move || async move {
                    if let Some(cp) = cp.upgrade() {
                        cp.heartbeat().await;
                    }
                });
            }
            MessageTrigger::StatusNotification => {
                self.scheduler.once(TRIGGER_DELAY, &["trigger"], move || async move {
                    let Some(cp) = cp.upgrade() else { return };
                    match (connector_id, evse) {
                        (_, Some(evse)) => {
                            let (status, error_code) = evse.status().await;
                            cp.send_status(evse.id(), status, error_code);
                        }
                        (Some(0), None) => cp.notify_charge_point_status(),
                        _ => {
                            cp.notify_charge_point_status();
                            cp.notify_all_statuses().await;
                        }
                    }
                });
            }
            MessageTrigger::MeterValues => {
                let targets: Vec<Arc<Evse>> = match evse {
                    Some(evse) => vec![evse],
                    None => self.evses.evses(),
                };
                let targets: Vec<Arc<Evse>> = targets.into_iter().filter(|e| e.has_power_meter()).collect();
                if targets.is_empty() {
                    return TriggerMessageStatus::Rejected;
                }
                self.scheduler.once(TRIGGER_DELAY, &["trigger"], move || async move {
                    if let Some(cp) = cp.upgrade() {
                        for evse in targets {
                            cp.send_meter_values_now(&evse).await;
                        }
                    }
                });
            }
            MessageTrigger::DiagnosticsStatusNotification | MessageTrigger::FirmwareStatusNotification => {
                return TriggerMessageStatus::NotImplemented;
            }
        }
        TriggerMessageStatus::Accepted
    }

    /// Sample `evse` on demand. The reading reaches the Central System
    /// through the event loop like any other meter values notification.
    async fn send_meter_values_now(&self, evse: &Evse) {
        let measurands = Measurand::parse_list(
            &self
                .configuration
                .get_value(Key::MeterValuesSampledData)
                .unwrap_or_default(),
        );
        if evse.sample_power_meter(&measurands).await.is_none() {
            warn!(evse_id = evse.id(), "no reading for triggered meter values");
        }
    }
}
