use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::ChargePoint;
use crate::ocpp::{Action, CallFailure, CallHandler, ErrorCode};

/// Answers calls initiated by the Central System.
pub struct CommandRouter {
    cp: Arc<ChargePoint>,
}

impl CommandRouter {
    pub fn new(cp: Arc<ChargePoint>) -> Self {
        Self { cp }
    }
}

fn decode<T: DeserializeOwned>(action: Action, payload: Value) -> Result<T, CallFailure> {
    serde_json::from_value(payload)
        .map_err(|e| CallFailure::new(ErrorCode::FormationViolation, format!("invalid {action} payload: {e}")))
}

fn encode<T: Serialize>(response: T) -> Result<Value, CallFailure> {
    serde_json::to_value(response).map_err(|e| CallFailure::new(ErrorCode::InternalError, e.to_string()))
}

#[async_trait]
impl CallHandler for CommandRouter {
    async fn handle_call(&self, action: &str, payload: Value) -> Result<Value, CallFailure> {
        let Ok(action) = action.parse::<Action>() else {
            warn!(action, "unknown action");
            return Err(CallFailure::new(
                ErrorCode::NotImplemented,
                format!("{action} is not implemented"),
            ));
        };
        if !self.cp.configuration.supports(action.profile()) {
            return Err(CallFailure::new(
                ErrorCode::NotSupported,
                format!("{} profile is not supported", action.profile()),
            ));
        }
        debug!(%action, "inbound call");

        let cp = &self.cp;
        match action {
            Action::ChangeAvailability => encode(cp.change_availability(decode(action, payload)?).await),
            Action::ChangeConfiguration => encode(cp.change_configuration(decode(action, payload)?).await),
            Action::ClearCache => encode(cp.clear_cache().await),
            Action::GetConfiguration => encode(cp.get_configuration(decode(action, payload)?)),
            Action::DataTransfer => encode(cp.data_transfer(decode(action, payload)?).await),
            Action::RemoteStartTransaction => encode(cp.remote_start_transaction(decode(action, payload)?).await),
            Action::RemoteStopTransaction => encode(cp.remote_stop_transaction(decode(action, payload)?).await),
            Action::Reset => encode(cp.reset(decode(action, payload)?)),
            Action::UnlockConnector => encode(cp.unlock_connector(decode(action, payload)?).await),
            Action::ReserveNow => encode(cp.reserve_now(decode(action, payload)?).await),
            Action::CancelReservation => encode(cp.cancel_reservation(decode(action, payload)?).await),
            Action::TriggerMessage => encode(cp.trigger_message(decode(action, payload)?).await),
            Action::GetLocalListVersion => encode(cp.get_local_list_version()),
            Action::SendLocalList => encode(cp.send_local_list(decode(action, payload)?).await),
            other => Err(CallFailure::new(
                ErrorCode::NotImplemented,
                format!("{other} is not implemented"),
            )),
        }
    }
}
