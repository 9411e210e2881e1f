//! In-process Central System and charge point assembly for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use open_charge_point::config::Config;
use open_charge_point::controller::Peripherals;
use open_charge_point::domain::{DummyDisplay, DummyEvcc, DummyIndicator, DummyPowerMeter, DummyReader, PowerMeter};
use open_charge_point::evse::{Evse, EvseSettings};
use open_charge_point::ocpp::{Call, OcppError, PendingResponse, Transport};
use open_charge_point::repo::MemoryRepository;
use open_charge_point::ChargePoint;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const CHARGE_POINT_ID: &str = "CP-TEST";
pub const VENDOR: &str = "OpenChargePoint";

/// Answers every call immediately, with scripted payloads per action.
pub struct FakeCentralSystem {
    connected: AtomicBool,
    calls: Mutex<Vec<Call>>,
    responses: Mutex<HashMap<String, Value>>,
    next_transaction_id: AtomicI32,
}

impl FakeCentralSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            next_transaction_id: AtomicI32::new(1),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Answer every later `action` call with `payload`.
    pub fn respond(&self, action: &str, payload: Value) {
        self.responses.lock().insert(action.to_string(), payload);
    }

    /// Payloads of the `action` calls received so far
    pub fn calls(&self, action: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.action == action)
            .map(|call| call.payload.clone())
            .collect()
    }

    /// Wait until at least `count` calls of `action` arrived.
    pub async fn wait_for(&self, action: &str, count: usize) -> Vec<Value> {
        for _ in 0..500 {
            let calls = self.calls(action);
            if calls.len() >= count {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} {action} calls, got {}", self.calls(action).len());
    }

    fn default_response(&self, action: &str) -> Value {
        match action {
            "BootNotification" => json!({
                "status": "Accepted",
                "currentTime": Utc::now().to_rfc3339(),
                "interval": 60
            }),
            "Heartbeat" => json!({ "currentTime": Utc::now().to_rfc3339() }),
            "Authorize" => json!({ "idTagInfo": { "status": "Accepted" } }),
            "StartTransaction" => json!({
                "idTagInfo": { "status": "Accepted" },
                "transactionId": self.next_transaction_id.fetch_add(1, Ordering::SeqCst)
            }),
            _ => json!({}),
        }
    }
}

#[async_trait]
impl Transport for FakeCentralSystem {
    async fn send(&self, call: Call) -> Result<PendingResponse, OcppError> {
        if !self.is_connected() {
            return Err(OcppError::NotConnected);
        }
        let scripted = self.responses.lock().get(&call.action).cloned();
        let response = scripted.unwrap_or_else(|| self.default_response(&call.action));
        self.calls.lock().push(call);
        Ok(PendingResponse::ready(Ok(response)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// `charge_point` lands in the `[charge_point]` table, `extra` after the EVSEs.
pub fn config(charge_point: &str, extra: &str) -> Config {
    let toml = format!(
        r#"
        [charge_point]
        id = "{CHARGE_POINT_ID}"
        vendor = "{VENDOR}"
        {charge_point}

        [connection]
        server_uri = "ws://localhost:9000/ocpp"

        [[evses]]
        id = 1

        {extra}
        "#
    );
    Config::from_toml_str(&toml).expect("test configuration")
}

pub struct Harness {
    pub cp: Arc<ChargePoint>,
    pub csms: Arc<FakeCentralSystem>,
    pub repository: Arc<MemoryRepository>,
    pub evccs: Vec<Arc<DummyEvcc>>,
    /// One per EVSE when built with `power_meters()`
    pub meters: Vec<Arc<DummyPowerMeter>>,
    pub reader: Arc<DummyReader>,
    pub display: Arc<DummyDisplay>,
    pub indicator: Arc<DummyIndicator>,
}

impl Harness {
    pub fn evse(&self, evse_id: i32) -> Arc<Evse> {
        self.cp.evses().find_evse(evse_id).expect("configured EVSE")
    }

    /// Connect and wait for the accepted boot.
    pub async fn boot(&self) {
        self.cp.on_connected().await;
        let cp = self.cp.clone();
        eventually(move || {
            let cp = cp.clone();
            async move { cp.is_registered() }
        })
        .await;
    }
}

pub struct HarnessBuilder {
    charge_point: String,
    extra: String,
    evses: Vec<EvseSettings>,
    repository: Option<Arc<MemoryRepository>>,
    power_meters: bool,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            charge_point: String::new(),
            extra: String::new(),
            evses: vec![EvseSettings::new(1)],
            repository: None,
            power_meters: false,
        }
    }

    pub fn charge_point(mut self, lines: &str) -> Self {
        self.charge_point = lines.to_string();
        self
    }

    pub fn toml(mut self, extra: &str) -> Self {
        self.extra = extra.to_string();
        self
    }

    pub fn evses(mut self, evses: Vec<EvseSettings>) -> Self {
        self.evses = evses;
        self
    }

    /// Share persisted state with an earlier harness.
    pub fn repository(mut self, repository: Arc<MemoryRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Give every EVSE a single-phase dummy meter.
    pub fn power_meters(mut self) -> Self {
        self.power_meters = true;
        self
    }

    pub async fn start(self) -> Harness {
        let csms = FakeCentralSystem::new();
        let repository = self.repository.unwrap_or_default();
        let reader = Arc::new(DummyReader::default());
        let display = Arc::new(DummyDisplay::default());
        let indicator = Arc::new(DummyIndicator::default());

        let mut builder = ChargePoint::builder(config(&self.charge_point, &self.extra))
            .transport(csms.clone())
            .repository(repository.clone())
            .peripherals(Peripherals {
                reader: Some(reader.clone()),
                display: Some(display.clone()),
                indicator: Some(indicator.clone()),
            });
        let mut evccs = Vec::new();
        let mut meters = Vec::new();
        for settings in self.evses {
            let evcc = Arc::new(DummyEvcc::new());
            evccs.push(evcc.clone());
            let meter = self.power_meters.then(|| Arc::new(DummyPowerMeter::default()));
            if let Some(meter) = &meter {
                meters.push(meter.clone());
            }
            builder = builder.evse(settings, evcc, meter.map(|m| m as Arc<dyn PowerMeter>));
        }

        let cp = builder.build().await.expect("charge point");
        cp.start();
        Harness {
            cp,
            csms,
            repository,
            evccs,
            meters,
            reader,
            display,
            indicator,
        }
    }
}

pub async fn harness() -> Harness {
    HarnessBuilder::new().start().await
}

/// Poll `check` until it holds, letting paused time advance in small steps.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
