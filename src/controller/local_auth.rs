use tracing::{info, warn};

use super::ChargePoint;
use crate::auth::AuthError;
use crate::ocpp::messages::{GetLocalListVersionResponse, SendLocalListRequest, SendLocalListResponse, UpdateStatus};
use crate::ocpp::Key;

impl ChargePoint {
    pub fn get_local_list_version(&self) -> GetLocalListVersionResponse {
        GetLocalListVersionResponse {
            list_version: self.tags.local_list_version(),
        }
    }

    pub async fn send_local_list(&self, request: SendLocalListRequest) -> SendLocalListResponse {
        let max_length = self.configuration.get_or(Key::SendLocalListMaxLength, 10usize);
        if request.local_authorization_list.len() > max_length {
            warn!(
                entries = request.local_authorization_list.len(),
                max_length, "local list update too large"
            );
            return SendLocalListResponse {
                status: UpdateStatus::Failed,
            };
        }

        let version = request.list_version;
        let status = match self
            .tags
            .update_local_list(version, request.update_type, request.local_authorization_list)
        {
            Ok(()) => {
                self.persist_tags().await;
                UpdateStatus::Accepted
            }
            Err(AuthError::ListDisabled) => UpdateStatus::NotSupported,
            Err(AuthError::VersionMismatch { .. }) => UpdateStatus::VersionMismatch,
            Err(e @ AuthError::TagLimitReached { .. }) => {
                warn!(version, error = %e, "local list update refused");
                UpdateStatus::Failed
            }
        };
        info!(version, ?status, "send local list");
        SendLocalListResponse { status }
    }
}
