use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::charging::can_start;
use super::ChargePoint;
use crate::domain::DisplayMessage;
use crate::evse::AvailabilityChange;
use crate::ocpp::messages::{
    AvailabilityStatus, ChangeAvailabilityRequest, ChangeAvailabilityResponse, ChangeConfigurationRequest,
    ChangeConfigurationResponse, ClearCacheResponse, ClearCacheStatus, ConfigurationStatus, DataTransferRequest,
    DataTransferResponse, DataTransferStatus, GetConfigurationRequest, GetConfigurationResponse, Reason,
    RemoteStartStopStatus, RemoteStartTransactionRequest, RemoteStartTransactionResponse,
    RemoteStopTransactionRequest, RemoteStopTransactionResponse, ResetRequest, ResetResponse, ResetStatus, ResetType,
    UnlockConnectorRequest, UnlockConnectorResponse, UnlockStatus,
};
use crate::ocpp::{ConfigurationError, Key};

const RESET_DELAY: Duration = Duration::from_secs(3);
const RESET_RETRY_INTERVAL: Duration = Duration::from_secs(10);
const RESTART_DELAY: Duration = Duration::from_secs(2);
const UNLOCK_DELAY: Duration = Duration::from_secs(2);
const REMOTE_COMMAND_DELAY: Duration = Duration::from_secs(3);

/// DataTransfer message id that puts text on the display
const DISPLAY_MESSAGE_ID: &str = "DisplayMessage";

impl ChargePoint {
    pub async fn change_availability(&self, request: ChangeAvailabilityRequest) -> ChangeAvailabilityResponse {
        let status = if request.connector_id == 0 {
            *self.availability.write() = request.kind;
            let mut scheduled = false;
            for evse in self.evses.evses() {
                scheduled |= evse.set_availability(request.kind).await == AvailabilityChange::Scheduled;
            }
            if self.is_registered() {
                self.notify_charge_point_status();
            }
            if scheduled {
                AvailabilityStatus::Scheduled
            } else {
                AvailabilityStatus::Accepted
            }
        } else {
            match self.evses.find_evse(request.connector_id) {
                Ok(evse) => match evse.set_availability(request.kind).await {
                    AvailabilityChange::Applied => AvailabilityStatus::Accepted,
                    AvailabilityChange::Scheduled => AvailabilityStatus::Scheduled,
                },
                Err(e) => {
                    warn!(connector_id = request.connector_id, error = %e, "availability change rejected");
                    AvailabilityStatus::Rejected
                }
            }
        };
        info!(connector_id = request.connector_id, kind = %request.kind, ?status, "availability changed");
        ChangeAvailabilityResponse { status }
    }

    pub async fn change_configuration(
        self: &Arc<Self>,
        request: ChangeConfigurationRequest,
    ) -> ChangeConfigurationResponse {
        let status = match self.configuration.update_key(&request.key, &request.value) {
            Ok(()) => {
                self.apply_configuration_change(&request.key);
                self.persist_configuration().await;
                ConfigurationStatus::Accepted
            }
            Err(ConfigurationError::KeyNotFound(_)) => ConfigurationStatus::NotSupported,
            Err(e) => {
                warn!(key = %request.key, error = %e, "configuration change rejected");
                ConfigurationStatus::Rejected
            }
        };
        info!(key = %request.key, value = %request.value, ?status, "change configuration");
        ChangeConfigurationResponse { status }
    }

    /// Push a changed key into the components that cache it.
    fn apply_configuration_change(self: &Arc<Self>, key: &str) {
        let Ok(key) = key.parse::<Key>() else { return };
        match key {
            Key::HeartbeatInterval if self.is_registered() => self.arm_heartbeat(),
            Key::AuthorizationCacheEnabled => self
                .tags
                .set_cache_enabled(self.configuration.get_bool(key, true)),
            Key::MaxCachedTags => self.tags.set_max_cached_tags(self.configuration.get_or(key, 100)),
            Key::LocalAuthListEnabled => self
                .tags
                .set_local_list_enabled(self.configuration.get_bool(key, true)),
            _ => {}
        }
    }

    pub async fn clear_cache(&self) -> ClearCacheResponse {
        if !self.configuration.get_bool(Key::AuthorizationCacheEnabled, true) {
            return ClearCacheResponse {
                status: ClearCacheStatus::Rejected,
            };
        }
        self.tags.clear_cache();
        self.persist_tags().await;
        ClearCacheResponse {
            status: ClearCacheStatus::Accepted,
        }
    }

    pub fn get_configuration(&self, request: GetConfigurationRequest) -> GetConfigurationResponse {
        let max_keys = self.configuration.get_or(Key::GetConfigurationMaxKeys, 50usize);
        let mut keys = request.key.unwrap_or_default();
        keys.truncate(max_keys);

        let (mut configuration_key, unknown_key) = self.configuration.get_configuration(&keys);
        configuration_key.truncate(max_keys);
        GetConfigurationResponse {
            configuration_key,
            unknown_key,
        }
    }

    pub async fn data_transfer(&self, request: DataTransferRequest) -> DataTransferResponse {
        if request.vendor_id != self.identity.vendor {
            debug!(vendor_id = %request.vendor_id, "data transfer for another vendor");
            return DataTransferResponse {
                status: DataTransferStatus::UnknownVendorId,
                data: None,
            };
        }

        match request.message_id.as_deref() {
            Some(DISPLAY_MESSAGE_ID) => {
                let text = request.data.unwrap_or_default();
                let mut lines = text.splitn(2, '\n');
                let message = DisplayMessage::new(lines.next().unwrap_or_default(), lines.next().unwrap_or_default());
                if let Some(display) = &self.peripherals.display {
                    if let Err(e) = display.show(message).await {
                        warn!(error = %e, "display message failed");
                        return DataTransferResponse {
                            status: DataTransferStatus::Rejected,
                            data: None,
                        };
                    }
                }
                DataTransferResponse {
                    status: DataTransferStatus::Accepted,
                    data: None,
                }
            }
            _ => DataTransferResponse {
                status: DataTransferStatus::UnknownMessageId,
                data: None,
            },
        }
    }

    /// Accept the reset, then tear down and ask `main` to rebuild.
    pub fn reset(self: &Arc<Self>, request: ResetRequest) -> ResetResponse {
        info!(kind = %request.kind, "reset requested");
        let cp = Arc::downgrade(self);
        self.scheduler.once(RESET_DELAY, &["reset"], move || async move {
            if let Some(cp) = cp.upgrade() {
                cp.perform_reset(request.kind).await;
            }
        });
        ResetResponse {
            status: ResetStatus::Accepted,
        }
    }

    async fn perform_reset(&self, kind: ResetType) {
        let reason = kind.reason();
        let retries = self.configuration.get_or(Key::ResetRetries, 3u32).max(1);
        for attempt in 1..=retries {
            match self.stop_all_transactions(reason).await {
                Ok(()) => break,
                Err(e) if attempt < retries => {
                    warn!(attempt, error = %e, "stopping sessions for reset failed, retrying");
                    tokio::time::sleep(RESET_RETRY_INTERVAL).await;
                }
                Err(e) => error!(attempt, error = %e, "resetting with sessions still open"),
            }
        }

        self.cleanup(reason).await;
        tokio::time::sleep(RESTART_DELAY).await;
        info!(%kind, "restarting charge point");
        self.restart.cancel();
    }

    pub async fn unlock_connector(self: &Arc<Self>, request: UnlockConnectorRequest) -> UnlockConnectorResponse {
        let evse = match self.evses.find_evse(request.connector_id) {
            Ok(evse) => evse,
            Err(e) => {
                warn!(connector_id = request.connector_id, error = %e, "unlock failed");
                return UnlockConnectorResponse {
                    status: UnlockStatus::UnlockFailed,
                };
            }
        };

        if evse.has_active_session().await {
            let evse_id = evse.id();
            let cp = Arc::downgrade(self);
            self.scheduler
                .once(UNLOCK_DELAY, &[format!("unlock-{evse_id}").as_str()], move || async move {
                    if let Some(cp) = cp.upgrade() {
                        if let Err(e) = cp.stop_charging(evse_id, Reason::UnlockCommand).await {
                            error!(evse_id, error = %e, "stop on unlock failed");
                        }
                    }
                });
        }

        let status = match evse.unlock().await {
            Ok(()) => UnlockStatus::Unlocked,
            Err(e) => {
                warn!(connector_id = request.connector_id, error = %e, "connector did not unlock");
                UnlockStatus::UnlockFailed
            }
        };
        UnlockConnectorResponse { status }
    }

    pub async fn remote_start_transaction(
        self: &Arc<Self>,
        request: RemoteStartTransactionRequest,
    ) -> RemoteStartTransactionResponse {
        let rejected = RemoteStartTransactionResponse {
            status: RemoteStartStopStatus::Rejected,
        };
        if !self.is_operative() {
            warn!(tag_id = %request.id_tag, "remote start while inoperative");
            return rejected;
        }

        let evse = match request.connector_id.filter(|id| *id > 0) {
            Some(connector_id) => self.evses.find_evse(connector_id).ok(),
            None => self.evses.find_available().await,
        };
        let Some(evse) = evse else {
            warn!(connector_id = ?request.connector_id, "no EVSE for remote start");
            return rejected;
        };
        if !can_start(&evse, &request.id_tag).await {
            warn!(evse_id = evse.id(), "EVSE cannot take a remote start");
            return rejected;
        }

        let evse_id = evse.id();
        let tag_id = request.id_tag;
        let cp = Arc::downgrade(self);
        self.scheduler
            .once(REMOTE_COMMAND_DELAY, &[format!("remote-start-{evse_id}").as_str()], move || async move {
                if let Some(cp) = cp.upgrade() {
                    cp.remote_start(evse_id, &tag_id).await;
                }
            });
        RemoteStartTransactionResponse {
            status: RemoteStartStopStatus::Accepted,
        }
    }

    async fn remote_start(self: &Arc<Self>, evse_id: i32, tag_id: &str) {
        if self.configuration.get_bool(Key::AuthorizeRemoteTxRequests, false) && !self.authorize_tag(tag_id).await {
            warn!(evse_id, tag_id, "remote start not authorized");
            return;
        }
        let evse = match self.evses.find_evse(evse_id) {
            Ok(evse) => evse,
            Err(e) => {
                error!(evse_id, error = %e, "remote start lost its EVSE");
                return;
            }
        };
        if let Err(e) = self.start_transaction(evse, tag_id).await {
            error!(evse_id, tag_id, error = %e, "remote start failed");
        }
    }

    pub async fn remote_stop_transaction(
        self: &Arc<Self>,
        request: RemoteStopTransactionRequest,
    ) -> RemoteStopTransactionResponse {
        let transaction_id = request.transaction_id.to_string();
        let evse = match self.evses.find_by_transaction_id(&transaction_id).await {
            Some(evse) if evse.has_active_session().await => evse,
            _ => {
                warn!(%transaction_id, "remote stop for unknown transaction");
                return RemoteStopTransactionResponse {
                    status: RemoteStartStopStatus::Rejected,
                };
            }
        };

        let evse_id = evse.id();
        let cp = Arc::downgrade(self);
        self.scheduler
            .once(REMOTE_COMMAND_DELAY, &[format!("remote-stop-{evse_id}").as_str()], move || async move {
                if let Some(cp) = cp.upgrade() {
                    if let Err(e) = cp.stop_charging(evse_id, Reason::Remote).await {
                        error!(evse_id, error = %e, "remote stop failed");
                    }
                }
            });
        RemoteStopTransactionResponse {
            status: RemoteStartStopStatus::Accepted,
        }
    }
}
