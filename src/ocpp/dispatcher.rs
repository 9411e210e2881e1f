//! Retrying request dispatcher
//!
//! Retries the delivery of a request, never its semantic outcome. The
//! answer is handed to a callback on its own task so the caller is free as
//! soon as the request is on the wire.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::configuration::{Key, OcppConfiguration};
use super::messages::OcppRequest;
use super::transport::{PendingResponse, Transport};
use super::{Action, Call, OcppError};

/// Delivery retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_ATTEMPTS: u32 = 5;
    pub const DEFAULT_INTERVAL_SECS: u64 = 30;

    pub fn from_configuration(configuration: &OcppConfiguration) -> Self {
        let attempts = configuration.get_or(Key::TransactionMessageAttempts, Self::DEFAULT_ATTEMPTS);
        let interval = configuration.get_or(Key::TransactionMessageRetryInterval, Self::DEFAULT_INTERVAL_SECS);
        Self {
            attempts: if attempts == 0 { Self::DEFAULT_ATTEMPTS } else { attempts },
            interval: Duration::from_secs(interval),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: Self::DEFAULT_ATTEMPTS,
            interval: Duration::from_secs(Self::DEFAULT_INTERVAL_SECS),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    configuration: Arc<OcppConfiguration>,
    response_timeout: Duration,
    token: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        configuration: Arc<OcppConfiguration>,
        response_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            configuration,
            response_timeout,
            token,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_configuration(&self.configuration)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Deliver `request` and hand the eventual answer to `on_result`.
    ///
    /// Returns once delivery succeeded or the retry budget ran out.
    pub async fn send_request<R, F, Fut>(&self, request: R, on_result: F) -> Result<(), OcppError>
    where
        R: OcppRequest,
        F: FnOnce(Result<R::Response, OcppError>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let payload = serde_json::to_value(&request)?;
        let pending = self.deliver(R::ACTION, payload).await?;
        let limit = self.response_timeout;
        let action = R::ACTION;

        tokio::spawn(async move {
            let result = pending.wait(limit).await.and_then(decode::<R::Response>);
            if let Err(e) = &result {
                debug!(%action, error = %e, "request failed");
            }
            on_result(result).await;
        });

        Ok(())
    }

    /// Deliver `request` and wait for the answer.
    pub async fn request<R: OcppRequest>(&self, request: R) -> Result<R::Response, OcppError> {
        let payload = serde_json::to_value(&request)?;
        let pending = self.deliver(R::ACTION, payload).await?;
        pending.wait(self.response_timeout).await.and_then(decode::<R::Response>)
    }

    async fn deliver(&self, action: Action, payload: Value) -> Result<PendingResponse, OcppError> {
        let policy = self.retry_policy();
        let mut attempt = 1;

        loop {
            let call = Call::new(action.as_ref(), payload.clone());
            match self.transport.send(call).await {
                Ok(pending) => return Ok(pending),
                Err(e) if attempt >= policy.attempts => {
                    warn!(%action, attempts = attempt, error = %e, "giving up on request");
                    return Err(e);
                }
                Err(e) => {
                    warn!(%action, attempt, error = %e, retry_in_secs = policy.interval.as_secs(), "request delivery failed, retrying");
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(e),
                        _ = sleep(policy.interval) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, OcppError> {
    Ok(serde_json::from_value(value)?)
}
