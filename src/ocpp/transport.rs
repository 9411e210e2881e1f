//! Seams between the protocol layer and whatever carries the frames

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

use super::{Call, ErrorCode, OcppError};

pub type ResponseSender = oneshot::Sender<Result<Value, OcppError>>;

/// Response to a delivered call, resolved when the Central System answers
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Value, OcppError>>,
}

impl PendingResponse {
    pub fn channel() -> (ResponseSender, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        (tx, PendingResponse { rx })
    }

    /// Already answered; used by in-process transports
    pub fn ready(result: Result<Value, OcppError>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    pub async fn wait(self, limit: Duration) -> Result<Value, OcppError> {
        match timeout(limit, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_) => Err(OcppError::Timeout),
        }
    }
}

/// Outbound half of the protocol session
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Put a call on the wire. Errors mean the call was never delivered.
    async fn send(&self, call: Call) -> Result<PendingResponse, OcppError>;

    fn is_connected(&self) -> bool;
}

/// Failure answer to an inbound call, sent back as a CALLERROR
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub code: ErrorCode,
    pub description: String,
}

impl CallFailure {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Inbound half: answers calls initiated by the Central System
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn handle_call(&self, action: &str, payload: Value) -> Result<Value, CallFailure>;
}
