//! OCPP WebSocket client
//!
//! Keeps one connection to the Central System alive:
//! - WebSocket connection with the `ocpp1.6` subprotocol
//! - Automatic reconnection with exponential backoff
//! - Request/response correlation through a pending map
//! - Inbound calls answered through a [`CallHandler`]
//! - Keep-alive pings every `WebSocketPingInterval` seconds

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, Duration, Interval, MissedTickBehavior};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::configuration::{Key, OcppConfiguration};
use super::transport::{CallHandler, PendingResponse, ResponseSender, Transport};
use super::{Call, CallError, CallResult, OcppError, OcppMessage};

/// OCPP 1.6 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Central System URL without the charge point id
    pub server_uri: String,
    pub charge_point_id: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

pub struct WebSocketClient {
    settings: ClientSettings,
    configuration: Arc<OcppConfiguration>,
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    pending: Mutex<HashMap<String, ResponseSender>>,
    connected: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl WebSocketClient {
    pub fn new(settings: ClientSettings, configuration: Arc<OcppConfiguration>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            settings,
            configuration,
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn url(&self) -> String {
        build_ocpp_url(&self.settings.server_uri, &self.settings.charge_point_id)
    }

    /// Run the connection loop until `token` is cancelled.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn CallHandler>, token: CancellationToken) {
        let mut delay = self.settings.reconnect_delay;

        loop {
            if token.is_cancelled() {
                break;
            }

            info!(url = %self.url(), "connecting to central system");
            match self.connect_and_serve(&handler, &token).await {
                Ok(()) => {
                    delay = self.settings.reconnect_delay;
                }
                Err(e) => {
                    error!(error = %e, "connection error");
                }
            }
            self.mark_disconnected();

            if token.is_cancelled() {
                break;
            }

            info!(delay_secs = delay.as_secs(), "reconnecting");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(delay) => {}
            }
            delay = std::cmp::min(delay * 2, self.settings.max_reconnect_delay);
        }

        info!("websocket client stopped");
    }

    async fn connect_and_serve(
        self: &Arc<Self>,
        handler: &Arc<dyn CallHandler>,
        token: &CancellationToken,
    ) -> Result<(), OcppError> {
        let mut request = self
            .url()
            .into_client_request()
            .map_err(|e| OcppError::Transport(e.to_string()))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| OcppError::Transport(e.to_string()))?;

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(OCPP_SUBPROTOCOL) {
            warn!(?accepted, "central system did not confirm the ocpp1.6 subprotocol");
        }

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::channel::<Message>(64);

        let writer = tokio::spawn(async move {
            while let Some(msg) = send_rx.recv().await {
                if let Err(e) = ws_tx.send(msg).await {
                    error!(error = %e, "failed to write websocket frame");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        *self.outgoing.lock() = Some(send_tx.clone());
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Connected);
        info!("websocket connected");

        let mut pinger = ping_ticker(self.configuration.get_or(Key::WebSocketPingInterval, 54u64));

        let result = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = send_tx.send(Message::Close(None)).await;
                    break Ok(());
                }
                _ = tick(&mut pinger) => {
                    if send_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break Err(OcppError::ConnectionClosed);
                    }
                }
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        debug!(%text, "received frame");
                        self.dispatch_frame(&text, handler, &send_tx);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("websocket closed by server");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(OcppError::Transport(e.to_string())),
                    None => break Err(OcppError::ConnectionClosed),
                },
            }
        };

        drop(send_tx);
        *self.outgoing.lock() = None;
        if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
            debug!("websocket writer did not finish in time");
        }
        result
    }

    fn dispatch_frame(&self, text: &str, handler: &Arc<dyn CallHandler>, send_tx: &mpsc::Sender<Message>) {
        match OcppMessage::parse(text) {
            Ok(OcppMessage::Call(call)) => {
                let handler = handler.clone();
                let send_tx = send_tx.clone();
                tokio::spawn(async move {
                    let reply = answer_call(handler.as_ref(), call).await;
                    if send_tx.send(Message::Text(reply.to_json())).await.is_err() {
                        warn!("connection closed before the reply could be sent");
                    }
                });
            }
            Ok(OcppMessage::CallResult(result)) => {
                if let Some(tx) = self.pending.lock().remove(&result.message_id) {
                    let _ = tx.send(Ok(result.payload));
                } else {
                    debug!(message_id = %result.message_id, "unmatched call result");
                }
            }
            Ok(OcppMessage::CallError(err)) => {
                if let Some(tx) = self.pending.lock().remove(&err.message_id) {
                    let _ = tx.send(Err(OcppError::Remote {
                        code: err.error_code,
                        description: err.error_description,
                        details: err.error_details,
                    }));
                }
            }
            Err(e) => warn!(error = %e, "failed to parse OCPP frame"),
        }
    }

    fn mark_disconnected(&self) {
        *self.outgoing.lock() = None;
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(OcppError::ConnectionClosed));
        }
    }
}

#[async_trait]
impl Transport for WebSocketClient {
    async fn send(&self, call: Call) -> Result<PendingResponse, OcppError> {
        let sender = self.outgoing.lock().clone().ok_or(OcppError::NotConnected)?;
        let (tx, pending) = PendingResponse::channel();
        let message_id = call.message_id.clone();
        let text = OcppMessage::Call(call).to_json();

        self.pending.lock().insert(message_id.clone(), tx);
        if sender.send(Message::Text(text)).await.is_err() {
            self.pending.lock().remove(&message_id);
            return Err(OcppError::ConnectionClosed);
        }
        Ok(pending)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Turn an inbound call into exactly one reply frame.
pub async fn answer_call(handler: &dyn CallHandler, call: Call) -> OcppMessage {
    match handler.handle_call(&call.action, call.payload).await {
        Ok(payload) => OcppMessage::CallResult(CallResult {
            message_id: call.message_id,
            payload,
        }),
        Err(failure) => OcppMessage::CallError(CallError {
            message_id: call.message_id,
            error_code: failure.code,
            error_description: failure.description,
            error_details: serde_json::json!({}),
        }),
    }
}

fn ping_ticker(seconds: u64) -> Option<Interval> {
    (seconds > 0).then(|| {
        let mut ticker = interval(Duration::from_secs(seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();
        ticker
    })
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, charge_point_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), charge_point_id)
}
