use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::warn;

use super::session::SessionSummary;
use crate::ocpp::messages::{ChargePointErrorCode, ChargePointStatus, MeterValue};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(2000);

/// Event emitted by an EVSE towards the charge point
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Status {
        evse_id: i32,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
    },
    MeterValues {
        evse_id: i32,
        transaction_id: Option<String>,
        meter_values: Vec<MeterValue>,
    },
    /// A session ended without an explicit stop request
    TransactionEnded(SessionSummary),
}

impl Notification {
    pub fn evse_id(&self) -> i32 {
        match self {
            Notification::Status { evse_id, .. } | Notification::MeterValues { evse_id, .. } => *evse_id,
            Notification::TransactionEnded(summary) => summary.evse_id,
        }
    }
}

/// Sending half of the bounded notification channel.
///
/// A full channel blocks the sender for at most `timeout`; after that the
/// notification is dropped with a warning.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
    timeout: Duration,
}

impl Notifier {
    pub fn channel(capacity: usize, timeout: Duration) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, timeout }, rx)
    }

    /// Returns false when the notification was dropped.
    pub async fn notify(&self, notification: Notification) -> bool {
        match self.tx.send_timeout(notification, self.timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(n)) => {
                warn!(evse_id = n.evse_id(), "notification channel full, dropping {:?}", n);
                false
            }
            Err(SendTimeoutError::Closed(n)) => {
                warn!(evse_id = n.evse_id(), "notification channel closed");
                false
            }
        }
    }
}
