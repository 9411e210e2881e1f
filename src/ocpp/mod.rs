//! OCPP 1.6J protocol layer for the charge point side
//!
//! # Architecture
//! - OCPP-J framing (`[2,id,action,payload]`, `[3,id,payload]`, `[4,id,code,description,details]`)
//! - Typed 1.6 payloads in [`messages`]
//! - Runtime configuration keys in [`configuration`]
//! - A [`transport::Transport`] seam with a retrying [`dispatcher::Dispatcher`] on top
//! - A WebSocket client behind the `ocpp` feature

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

pub mod configuration;
pub mod dispatcher;
pub mod messages;
pub mod transport;

#[cfg(feature = "ocpp")]
pub mod client;

pub use configuration::{ConfigurationError, Key, OcppConfiguration};
pub use dispatcher::Dispatcher;
pub use transport::{CallFailure, CallHandler, PendingResponse, Transport};

/// OCPP Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_id(id: u64) -> Option<Self> {
        match id {
            2 => Some(Self::Call),
            3 => Some(Self::CallResult),
            4 => Some(Self::CallError),
            _ => None,
        }
    }
}

/// OCPP Error Codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

/// Feature profiles a charge point can advertise in `SupportedFeatureProfiles`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum FeatureProfile {
    Core,
    FirmwareManagement,
    LocalAuthListManagement,
    Reservation,
    SmartCharging,
    RemoteTrigger,
}

/// Every 1.6 action this charge point sends or answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
pub enum Action {
    // Charge point initiated
    Authorize,
    BootNotification,
    Heartbeat,
    MeterValues,
    StartTransaction,
    StatusNotification,
    StopTransaction,
    DataTransfer,
    // Central system initiated
    ChangeAvailability,
    ChangeConfiguration,
    ClearCache,
    GetConfiguration,
    RemoteStartTransaction,
    RemoteStopTransaction,
    Reset,
    UnlockConnector,
    ReserveNow,
    CancelReservation,
    TriggerMessage,
    GetLocalListVersion,
    SendLocalList,
    GetDiagnostics,
    UpdateFirmware,
    SetChargingProfile,
    ClearChargingProfile,
    GetCompositeSchedule,
}

impl Action {
    pub fn profile(self) -> FeatureProfile {
        match self {
            Action::ReserveNow | Action::CancelReservation => FeatureProfile::Reservation,
            Action::TriggerMessage => FeatureProfile::RemoteTrigger,
            Action::GetLocalListVersion | Action::SendLocalList => FeatureProfile::LocalAuthListManagement,
            Action::GetDiagnostics | Action::UpdateFirmware => FeatureProfile::FirmwareManagement,
            Action::SetChargingProfile | Action::ClearChargingProfile | Action::GetCompositeSchedule => {
                FeatureProfile::SmartCharging
            }
            _ => FeatureProfile::Core,
        }
    }
}

/// OCPP Call message
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// New call with a fresh UUID message id
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
        }
    }
}

/// OCPP CallResult message
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

/// OCPP CallError message
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

/// One decoded OCPP-J frame
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    pub fn parse(text: &str) -> Result<Self, OcppError> {
        let frame: Vec<Value> = serde_json::from_str(text)?;

        let type_id = frame
            .first()
            .and_then(Value::as_u64)
            .and_then(MessageType::from_id)
            .ok_or_else(|| OcppError::InvalidFormat("missing or unknown message type".into()))?;

        let message_id = frame
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| OcppError::InvalidFormat("missing message id".into()))?
            .to_string();

        match type_id {
            MessageType::Call => {
                if frame.len() != 4 {
                    return Err(OcppError::InvalidFormat("CALL must have 4 elements".into()));
                }
                let action = frame[2]
                    .as_str()
                    .ok_or_else(|| OcppError::InvalidFormat("action must be a string".into()))?
                    .to_string();
                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: frame[3].clone(),
                }))
            }
            MessageType::CallResult => {
                if frame.len() != 3 {
                    return Err(OcppError::InvalidFormat("CALLRESULT must have 3 elements".into()));
                }
                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    payload: frame[2].clone(),
                }))
            }
            MessageType::CallError => {
                if frame.len() < 4 {
                    return Err(OcppError::InvalidFormat("CALLERROR must have at least 4 elements".into()));
                }
                let error_code = frame[2]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(ErrorCode::GenericError);
                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description: frame[3].as_str().unwrap_or_default().to_string(),
                    error_details: frame.get(4).cloned().unwrap_or_else(|| Value::Object(Default::default())),
                }))
            }
        }
    }

    pub fn to_json(&self) -> String {
        let frame = match self {
            OcppMessage::Call(call) => serde_json::json!([
                MessageType::Call as u8,
                call.message_id,
                call.action,
                call.payload
            ]),
            OcppMessage::CallResult(result) => serde_json::json!([
                MessageType::CallResult as u8,
                result.message_id,
                result.payload
            ]),
            OcppMessage::CallError(error) => serde_json::json!([
                MessageType::CallError as u8,
                error.message_id,
                error.error_code.to_string(),
                error.error_description,
                error.error_details
            ]),
        };
        frame.to_string()
    }

    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(call) => &call.message_id,
            OcppMessage::CallResult(result) => &result.message_id,
            OcppMessage::CallError(error) => &error.message_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("remote error {code}: {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected to the central system")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),
}

impl OcppError {
    /// Errors raised before the message reached the wire
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            OcppError::NotConnected | OcppError::ConnectionClosed | OcppError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_call() {
        let msg = OcppMessage::parse(r#"[2,"abc","Reset",{"type":"Soft"}]"#).unwrap();
        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "abc");
                assert_eq!(call.action, "Reset");
                assert_eq!(call.payload, json!({"type": "Soft"}));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_parse_call_error_defaults_unknown_code() {
        let msg = OcppMessage::parse(r#"[4,"id-1","Bogus","oops"]"#).unwrap();
        match msg {
            OcppMessage::CallError(err) => {
                assert_eq!(err.error_code, ErrorCode::GenericError);
                assert_eq!(err.error_description, "oops");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(OcppMessage::parse(r#"[9,"id"]"#).is_err());
        assert!(OcppMessage::parse(r#"[2,"id","Heartbeat"]"#).is_err());
        assert!(OcppMessage::parse(r#"{"not":"an array"}"#).is_err());
    }

    #[test]
    fn test_encode_call_result() {
        let msg = OcppMessage::CallResult(CallResult {
            message_id: "42".into(),
            payload: json!({"status": "Accepted"}),
        });
        assert_eq!(msg.to_json(), r#"[3,"42",{"status":"Accepted"}]"#);
    }

    #[test]
    fn test_action_profiles() {
        assert_eq!(Action::ReserveNow.profile(), FeatureProfile::Reservation);
        assert_eq!(Action::SendLocalList.profile(), FeatureProfile::LocalAuthListManagement);
        assert_eq!(Action::Reset.profile(), FeatureProfile::Core);
        assert_eq!("TriggerMessage".parse::<Action>().unwrap(), Action::TriggerMessage);
    }
}
