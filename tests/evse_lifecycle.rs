mod common;

use common::{eventually, harness, Harness, HarnessBuilder, CHARGE_POINT_ID};
use open_charge_point::domain::{CarState, Color, IndicatorCall};
use open_charge_point::evse::EvseSettings;
use open_charge_point::ocpp::messages::{ChargePointErrorCode, ChargePointStatus, Reason};
use open_charge_point::repo::MemoryRepository;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for_status(h: &Harness, evse_id: i32, expected: ChargePointStatus) {
    let evse = h.evse(evse_id);
    eventually(move || {
        let evse = evse.clone();
        async move { evse.status().await.0 == expected }
    })
    .await;
}

async fn start_session(h: &Harness, evse_id: i32, tag: &str) {
    h.cp.start_charging(Some(evse_id), tag).await.unwrap();
    wait_for_status(h, evse_id, ChargePointStatus::Charging).await;
}

#[tokio::test(start_paused = true)]
async fn test_ev_disconnect_stops_session() {
    let h = harness().await;
    h.boot().await;
    start_session(&h, 1, "TAG1").await;

    h.evccs[0].simulate(CarState::A1);

    let stop = h.csms.wait_for("StopTransaction", 1).await;
    assert_eq!(stop[0]["reason"], "EVDisconnected");
    wait_for_status(&h, 1, ChargePointStatus::Available).await;
    assert!(!h.evccs[0].is_charging());
}

#[tokio::test(start_paused = true)]
async fn test_ev_disconnect_can_leave_session_open() {
    let h = HarnessBuilder::new()
        .toml("[ocpp]\nStopTransactionOnEVSideDisconnect = \"false\"")
        .start()
        .await;
    h.boot().await;
    start_session(&h, 1, "TAG1").await;

    h.evccs[0].simulate(CarState::A1);
    wait_for_status(&h, 1, ChargePointStatus::SuspendedEV).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.csms.calls("StopTransaction").is_empty());
    assert!(h.evse(1).has_active_session().await);

    // Plugged back in and requesting energy
    h.evccs[0].simulate(CarState::C2);
    wait_for_status(&h, 1, ChargePointStatus::Charging).await;
}

#[tokio::test(start_paused = true)]
async fn test_vehicle_pause_is_suspended_ev() {
    let h = harness().await;
    h.boot().await;
    start_session(&h, 1, "TAG1").await;

    h.evccs[0].simulate(CarState::B2);
    wait_for_status(&h, 1, ChargePointStatus::SuspendedEV).await;
    assert!(h.evse(1).vehicle_connected().await);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.csms.calls("StopTransaction").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_free_mode_starts_on_plug_in() {
    let h = HarnessBuilder::new().charge_point("free_mode = true").start().await;
    h.boot().await;

    h.evccs[0].simulate(CarState::B1);

    let start = h.csms.wait_for("StartTransaction", 1).await;
    assert_eq!(start[0]["idTag"], CHARGE_POINT_ID);
    assert!(h.csms.calls("Authorize").is_empty());
    wait_for_status(&h, 1, ChargePointStatus::Charging).await;
}

#[tokio::test(start_paused = true)]
async fn test_preparing_times_out_without_tag() {
    let h = HarnessBuilder::new()
        .charge_point("preparing_timeout_seconds = 5")
        .start()
        .await;

    h.evccs[0].simulate(CarState::B1);
    wait_for_status(&h, 1, ChargePointStatus::Preparing).await;
    assert!(h.cp.scheduler().has_tag("preparing-1"));

    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_for_status(&h, 1, ChargePointStatus::Available).await;
    assert!(!h.cp.scheduler().has_tag("preparing-1"));
}

#[tokio::test(start_paused = true)]
async fn test_tag_starts_on_preparing_evse() {
    let h = HarnessBuilder::new()
        .evses(vec![EvseSettings::new(1), EvseSettings::new(2)])
        .start()
        .await;
    h.boot().await;

    h.evccs[1].simulate(CarState::B1);
    wait_for_status(&h, 2, ChargePointStatus::Preparing).await;

    h.cp.handle_tag("driver").await.unwrap();
    let start = h.csms.wait_for("StartTransaction", 1).await;
    assert_eq!(start[0]["connectorId"], 2);
    wait_for_status(&h, 2, ChargePointStatus::Charging).await;
    assert_eq!(h.evse(1).status().await.0, ChargePointStatus::Available);
    let cp = h.cp.clone();
    eventually(move || {
        let cp = cp.clone();
        async move { !cp.scheduler().has_tag("preparing-2") }
    })
    .await;

    // Blink position sits after the EVSE lights
    let indicator = h.indicator.clone();
    eventually(move || {
        let indicator = indicator.clone();
        async move {
            indicator.calls().contains(&IndicatorCall::Blink {
                index: 2,
                times: 3,
                color: Color::White,
            })
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_second_tag_takes_next_available_evse() {
    let h = HarnessBuilder::new()
        .evses(vec![EvseSettings::new(1), EvseSettings::new(2)])
        .start()
        .await;
    h.boot().await;

    h.cp.handle_tag("first").await.unwrap();
    wait_for_status(&h, 1, ChargePointStatus::Charging).await;
    h.cp.handle_tag("second").await.unwrap();
    wait_for_status(&h, 2, ChargePointStatus::Charging).await;

    assert_eq!(h.evse(1).tag_id().await.as_deref(), Some("FIRST"));
    assert_eq!(h.evse(2).tag_id().await.as_deref(), Some("SECOND"));
    assert_eq!(h.evse(2).transaction_id().await.as_deref(), Some("2"));
}

#[tokio::test(start_paused = true)]
async fn test_charging_time_limit_ends_session() {
    let mut settings = EvseSettings::new(1);
    settings.max_charging_time = Some(Duration::from_secs(60));
    let h = HarnessBuilder::new().evses(vec![settings]).start().await;
    h.boot().await;
    start_session(&h, 1, "TAG1").await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    let stop = h.csms.wait_for("StopTransaction", 1).await;
    assert_eq!(stop[0]["reason"], "Local");
    assert_eq!(stop[0]["transactionId"], 1);
    wait_for_status(&h, 1, ChargePointStatus::Available).await;
}

#[tokio::test(start_paused = true)]
async fn test_pilot_error_faults_evse() {
    let h = harness().await;
    h.boot().await;
    start_session(&h, 1, "TAG1").await;

    h.evccs[0].simulate(CarState::E);

    wait_for_status(&h, 1, ChargePointStatus::Faulted).await;
    let (_, error_code) = h.evse(1).status().await;
    assert_eq!(error_code, ChargePointErrorCode::EVCommunicationError);

    let stop = h.csms.wait_for("StopTransaction", 1).await;
    assert_eq!(stop[0]["reason"], "EmergencyStop");
    assert!(!h.evccs[0].is_charging());

    let csms = h.csms.clone();
    eventually(move || {
        let csms = csms.clone();
        async move {
            csms.calls("StatusNotification")
                .iter()
                .any(|s| s["status"] == "Faulted" && s["errorCode"] == "EVCommunicationError")
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_statuses_before_registration_are_reported_at_boot() {
    let h = harness().await;

    h.evccs[0].simulate(CarState::B1);
    wait_for_status(&h, 1, ChargePointStatus::Preparing).await;
    let indicator = h.indicator.clone();
    eventually(move || {
        let indicator = indicator.clone();
        async move { indicator.last_color(0) == Some(Color::Yellow) }
    })
    .await;
    assert!(h.csms.calls("StatusNotification").is_empty());

    h.boot().await;
    let statuses = h.csms.wait_for("StatusNotification", 2).await;
    assert_eq!(statuses[0]["connectorId"], 0);
    assert!(statuses
        .iter()
        .any(|s| s["connectorId"] == 1 && s["status"] == "Preparing"));
}

#[tokio::test(start_paused = true)]
async fn test_session_survives_restart() {
    let repository = Arc::new(MemoryRepository::default());
    let first = HarnessBuilder::new().repository(repository.clone()).start().await;
    first.boot().await;
    start_session(&first, 1, "TAG1").await;
    assert!(repository.evse(1).unwrap().session.is_active);

    let second = HarnessBuilder::new().repository(repository).start().await;
    assert_eq!(second.evse(1).status().await.0, ChargePointStatus::Available);

    second.boot().await;
    wait_for_status(&second, 1, ChargePointStatus::Charging).await;
    assert_eq!(second.evse(1).transaction_id().await.as_deref(), Some("1"));
    assert_eq!(second.evse(1).tag_id().await.as_deref(), Some("TAG1"));
    assert!(second.evccs[0].is_charging());
}

#[tokio::test(start_paused = true)]
async fn test_failed_enable_closes_accepted_transaction() {
    let h = harness().await;
    h.boot().await;
    h.evccs[0].fail_enable(true);

    h.cp.start_charging(Some(1), "TAG1").await.unwrap();

    let stop = h.csms.wait_for("StopTransaction", 1).await;
    assert_eq!(stop[0]["transactionId"], 1);
    assert_eq!(stop[0]["reason"], "Other");
    assert_eq!(stop[0]["meterStop"], 0);
    wait_for_status(&h, 1, ChargePointStatus::Available).await;
    assert!(!h.evse(1).has_active_session().await);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_transaction_leaves_evse_idle() {
    let h = harness().await;
    h.boot().await;
    h.csms.respond(
        "StartTransaction",
        serde_json::json!({"idTagInfo": {"status": "ConcurrentTx"}, "transactionId": 5}),
    );

    h.cp.start_charging(Some(1), "TAG1").await.unwrap();
    h.csms.wait_for("StartTransaction", 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.evse(1).status().await.0, ChargePointStatus::Available);
    assert!(h.csms.calls("StopTransaction").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_offline_status_changes_keep_other_evses_moving() {
    let h = HarnessBuilder::new()
        .charge_point("preparing_timeout_seconds = 5")
        .evses(vec![EvseSettings::new(1), EvseSettings::new(2)])
        .start()
        .await;
    h.boot().await;
    h.csms.set_connected(false);

    h.evccs[0].simulate(CarState::B1);
    h.evccs[1].simulate(CarState::B1);
    wait_for_status(&h, 1, ChargePointStatus::Preparing).await;
    wait_for_status(&h, 2, ChargePointStatus::Preparing).await;

    // Both preparing timers fire while nothing reaches the Central System
    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_for_status(&h, 1, ChargePointStatus::Available).await;
    wait_for_status(&h, 2, ChargePointStatus::Available).await;
    assert!(!h.cp.scheduler().has_tag("preparing-1"));
    assert!(!h.cp.scheduler().has_tag("preparing-2"));
    let before = h.csms.calls("StatusNotification").len();

    h.csms.set_connected(true);
    h.cp.on_connected().await;
    let statuses = h.csms.wait_for("StatusNotification", before + 3).await;
    let announced: Vec<_> = statuses[before..]
        .iter()
        .map(|s| (s["connectorId"].as_i64(), s["status"].as_str().map(str::to_string)))
        .collect();
    assert!(announced.contains(&(Some(0), Some("Available".to_string()))));
    assert!(announced.contains(&(Some(1), Some("Available".to_string()))));
    assert!(announced.contains(&(Some(2), Some("Available".to_string()))));
    assert_eq!(h.csms.calls("BootNotification").len(), 1);
}

const REGISTER_SAMPLING: &str = "[ocpp]\nMeterValueSampleInterval = \"10\"\nMeterValuesSampledData = \"Energy.Active.Import.Register\"";

#[tokio::test(start_paused = true)]
async fn test_register_sampled_at_zero_counts_toward_meter_stop() {
    let h = HarnessBuilder::new().toml(REGISTER_SAMPLING).power_meters().start().await;
    h.boot().await;
    start_session(&h, 1, "TAG1").await;
    let start = h.csms.wait_for("StartTransaction", 1).await;
    assert_eq!(start[0]["meterStart"], 0);

    // Samples at 0, 100 and 300 Wh
    tokio::time::sleep(Duration::from_secs(11)).await;
    h.meters[0].advance(100.0);
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.meters[0].advance(200.0);
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.csms.wait_for("MeterValues", 3).await;

    h.cp.stop_charging(1, Reason::Local).await.unwrap();
    let stop = h.csms.wait_for("StopTransaction", 1).await;
    assert_eq!(stop[0]["meterStop"], 300);
}

#[tokio::test(start_paused = true)]
async fn test_meter_start_reads_the_energy_register() {
    let h = HarnessBuilder::new().toml(REGISTER_SAMPLING).power_meters().start().await;
    h.boot().await;
    h.meters[0].advance(1200.0);
    start_session(&h, 1, "TAG1").await;

    let start = h.csms.wait_for("StartTransaction", 1).await;
    assert_eq!(start[0]["meterStart"], 1200);

    h.cp.stop_charging(1, Reason::Local).await.unwrap();
    let stop = h.csms.wait_for("StopTransaction", 1).await;
    assert!(stop[0]["meterStop"].as_i64().unwrap_or_default() >= 1200);
}
