mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{eventually, harness, Harness, HarnessBuilder, VENDOR};
use open_charge_point::ocpp::messages::ChargePointStatus;
use open_charge_point::ocpp::{CallHandler, ErrorCode};
use open_charge_point::repo::Repository;
use open_charge_point::CommandRouter;
use rstest::rstest;
use serde_json::{json, Value};
use std::time::Duration;

async fn call(h: &Harness, action: &str, payload: Value) -> Value {
    CommandRouter::new(h.cp.clone())
        .handle_call(action, payload)
        .await
        .unwrap_or_else(|e| panic!("{action} failed: {e:?}"))
}

async fn charging_harness() -> Harness {
    let h = harness().await;
    h.boot().await;
    h.cp.start_charging(Some(1), "TAG1").await.unwrap();
    let evse = h.evse(1);
    eventually(move || {
        let evse = evse.clone();
        async move { evse.is_charging().await }
    })
    .await;
    h
}

#[tokio::test(start_paused = true)]
async fn test_router_error_codes() {
    let h = harness().await;
    let router = CommandRouter::new(h.cp.clone());

    let unknown = router.handle_call("Teleport", json!({})).await.unwrap_err();
    assert_eq!(unknown.code, ErrorCode::NotImplemented);

    let firmware = router
        .handle_call("UpdateFirmware", json!({"location": "ftp://x", "retrieveDate": Utc::now()}))
        .await
        .unwrap_err();
    assert_eq!(firmware.code, ErrorCode::NotSupported);

    let malformed = router.handle_call("Reset", json!({"type": "Sideways"})).await.unwrap_err();
    assert_eq!(malformed.code, ErrorCode::FormationViolation);
}

#[tokio::test(start_paused = true)]
async fn test_profiles_limit_accepted_actions() {
    let h = HarnessBuilder::new()
        .toml("[ocpp]\nSupportedFeatureProfiles = \"Core\"")
        .start()
        .await;
    let router = CommandRouter::new(h.cp.clone());

    let reserve = router
        .handle_call(
            "ReserveNow",
            json!({"connectorId": 1, "expiryDate": Utc::now() + ChronoDuration::minutes(5), "idTag": "A", "reservationId": 1}),
        )
        .await
        .unwrap_err();
    assert_eq!(reserve.code, ErrorCode::NotSupported);
    assert!(router.handle_call("ClearCache", json!({})).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_get_configuration() {
    let h = harness().await;

    let response = call(&h, "GetConfiguration", json!({"key": ["HeartbeatInterval", "Nope"]})).await;
    assert_eq!(response["configurationKey"][0]["key"], "HeartbeatInterval");
    assert_eq!(response["configurationKey"][0]["value"], "60");
    assert_eq!(response["configurationKey"][0]["readonly"], false);
    assert_eq!(response["unknownKey"], json!(["Nope"]));

    let all = call(&h, "GetConfiguration", json!({})).await;
    let keys = all["configurationKey"].as_array().unwrap();
    assert!(keys.iter().any(|kv| kv["key"] == "NumberOfConnectors" && kv["readonly"] == true));
    assert!(all.get("unknownKey").is_none());
}

#[rstest]
#[case::accepted("HeartbeatInterval", "30", "Accepted")]
#[case::read_only("NumberOfConnectors", "4", "Rejected")]
#[case::unknown("FluxCapacitance", "1.21", "NotSupported")]
#[case::invalid_integer("HeartbeatInterval", "soon", "Rejected")]
#[case::invalid_boolean("LocalPreAuthorize", "maybe", "Rejected")]
#[tokio::test(start_paused = true)]
async fn test_change_configuration(#[case] key: &str, #[case] value: &str, #[case] expected: &str) {
    let h = harness().await;
    let response = call(&h, "ChangeConfiguration", json!({"key": key, "value": value})).await;
    assert_eq!(response["status"], expected);
}

#[tokio::test(start_paused = true)]
async fn test_change_configuration_is_persisted() {
    let h = harness().await;
    h.boot().await;

    let response = call(&h, "ChangeConfiguration", json!({"key": "HeartbeatInterval", "value": "30"})).await;
    assert_eq!(response["status"], "Accepted");

    let persisted = h.repository.load_configuration().await.unwrap();
    assert!(persisted
        .iter()
        .any(|kv| kv.key == "HeartbeatInterval" && kv.value.as_deref() == Some("30")));

    // Re-armed with the new period
    tokio::time::sleep(Duration::from_secs(31)).await;
    h.csms.wait_for("Heartbeat", 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_clear_cache() {
    let h = harness().await;
    h.cp.authorize_tag("TAG1").await;
    assert_eq!(h.cp.tags().cached_tags(), 1);

    let response = call(&h, "ClearCache", json!({})).await;
    assert_eq!(response["status"], "Accepted");
    assert_eq!(h.cp.tags().cached_tags(), 0);

    call(&h, "ChangeConfiguration", json!({"key": "AuthorizationCacheEnabled", "value": "false"})).await;
    let response = call(&h, "ClearCache", json!({})).await;
    assert_eq!(response["status"], "Rejected");
}

#[tokio::test(start_paused = true)]
async fn test_data_transfer() {
    let h = harness().await;

    let other_vendor = call(&h, "DataTransfer", json!({"vendorId": "Someone"})).await;
    assert_eq!(other_vendor["status"], "UnknownVendorId");

    let unknown = call(&h, "DataTransfer", json!({"vendorId": VENDOR, "messageId": "Firmware"})).await;
    assert_eq!(unknown["status"], "UnknownMessageId");

    let display = call(
        &h,
        "DataTransfer",
        json!({"vendorId": VENDOR, "messageId": "DisplayMessage", "data": "Welcome\nto the garage"}),
    )
    .await;
    assert_eq!(display["status"], "Accepted");
    assert!(h
        .display
        .messages()
        .iter()
        .any(|m| m.top == "Welcome" && m.bottom == "to the garage"));
}

#[tokio::test(start_paused = true)]
async fn test_change_availability() {
    let h = harness().await;
    h.boot().await;

    let response = call(&h, "ChangeAvailability", json!({"connectorId": 0, "type": "Inoperative"})).await;
    assert_eq!(response["status"], "Accepted");
    assert!(!h.cp.is_operative());
    assert_eq!(h.evse(1).status().await.0, ChargePointStatus::Unavailable);
    let statuses = h.csms.wait_for("StatusNotification", 3).await;
    assert!(statuses.iter().any(|s| s["connectorId"] == 0 && s["status"] == "Unavailable"));

    let response = call(&h, "ChangeAvailability", json!({"connectorId": 0, "type": "Operative"})).await;
    assert_eq!(response["status"], "Accepted");
    assert_eq!(h.evse(1).status().await.0, ChargePointStatus::Available);

    let response = call(&h, "ChangeAvailability", json!({"connectorId": 7, "type": "Inoperative"})).await;
    assert_eq!(response["status"], "Rejected");
}

#[tokio::test(start_paused = true)]
async fn test_change_availability_waits_for_session() {
    let h = charging_harness().await;

    let response = call(&h, "ChangeAvailability", json!({"connectorId": 1, "type": "Inoperative"})).await;
    assert_eq!(response["status"], "Scheduled");
    assert!(h.evse(1).is_charging().await);

    h.cp.stop_charging(1, open_charge_point::ocpp::messages::Reason::Local)
        .await
        .unwrap();
    let evse = h.evse(1);
    eventually(move || {
        let evse = evse.clone();
        async move { evse.status().await.0 == ChargePointStatus::Unavailable }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_start_transaction() {
    let h = harness().await;
    h.boot().await;

    let response = call(&h, "RemoteStartTransaction", json!({"idTag": "REMOTE", "connectorId": 1})).await;
    assert_eq!(response["status"], "Accepted");
    assert!(h.csms.calls("StartTransaction").is_empty());

    tokio::time::sleep(Duration::from_secs(4)).await;
    let start = h.csms.wait_for("StartTransaction", 1).await;
    assert_eq!(start[0]["idTag"], "REMOTE");
    assert!(h.csms.calls("Authorize").is_empty());
    let evse = h.evse(1);
    eventually(move || {
        let evse = evse.clone();
        async move { evse.is_charging().await }
    })
    .await;

    let busy = call(&h, "RemoteStartTransaction", json!({"idTag": "OTHER", "connectorId": 1})).await;
    assert_eq!(busy["status"], "Rejected");
    let missing = call(&h, "RemoteStartTransaction", json!({"idTag": "OTHER", "connectorId": 9})).await;
    assert_eq!(missing["status"], "Rejected");
}

#[tokio::test(start_paused = true)]
async fn test_remote_start_can_require_authorization() {
    let h = HarnessBuilder::new()
        .toml("[ocpp]\nAuthorizeRemoteTxRequests = \"true\"")
        .start()
        .await;
    h.boot().await;
    h.csms.respond("Authorize", json!({"idTagInfo": {"status": "Invalid"}}));

    let response = call(&h, "RemoteStartTransaction", json!({"idTag": "REMOTE"})).await;
    assert_eq!(response["status"], "Accepted");

    tokio::time::sleep(Duration::from_secs(4)).await;
    h.csms.wait_for("Authorize", 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.csms.calls("StartTransaction").is_empty());
    assert_eq!(h.evse(1).status().await.0, ChargePointStatus::Available);
}

#[tokio::test(start_paused = true)]
async fn test_remote_stop_transaction() {
    let h = charging_harness().await;

    let unknown = call(&h, "RemoteStopTransaction", json!({"transactionId": 99})).await;
    assert_eq!(unknown["status"], "Rejected");

    let response = call(&h, "RemoteStopTransaction", json!({"transactionId": 1})).await;
    assert_eq!(response["status"], "Accepted");

    tokio::time::sleep(Duration::from_secs(4)).await;
    let stop = h.csms.wait_for("StopTransaction", 1).await;
    assert_eq!(stop[0]["transactionId"], 1);
    assert_eq!(stop[0]["reason"], "Remote");
    let evse = h.evse(1);
    eventually(move || {
        let evse = evse.clone();
        async move { evse.status().await.0 == ChargePointStatus::Available }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_unlock_connector_stops_session() {
    let h = charging_harness().await;

    let response = call(&h, "UnlockConnector", json!({"connectorId": 1})).await;
    assert_eq!(response["status"], "Unlocked");

    tokio::time::sleep(Duration::from_secs(3)).await;
    let stop = h.csms.wait_for("StopTransaction", 1).await;
    assert_eq!(stop[0]["reason"], "UnlockCommand");
    let evse = h.evse(1);
    eventually(move || {
        let evse = evse.clone();
        async move { evse.status().await.0 == ChargePointStatus::Unavailable }
    })
    .await;

    let missing = call(&h, "UnlockConnector", json!({"connectorId": 4})).await;
    assert_eq!(missing["status"], "UnlockFailed");
    assert!(h.evccs[0].unlock_count() >= 1);
    assert!(!h.evccs[0].is_locked());
}

#[tokio::test(start_paused = true)]
async fn test_unlock_connector_reports_jammed_lock() {
    let h = harness().await;
    h.boot().await;

    let response = call(&h, "UnlockConnector", json!({"connectorId": 1})).await;
    assert_eq!(response["status"], "Unlocked");
    assert_eq!(h.evccs[0].unlock_count(), 1);

    h.evccs[0].fail_unlock(true);
    let response = call(&h, "UnlockConnector", json!({"connectorId": 1})).await;
    assert_eq!(response["status"], "UnlockFailed");
    assert_eq!(h.evccs[0].unlock_count(), 2);
}

fn reserve_now(connector_id: i32, reservation_id: i32, tag: &str, expires_in: ChronoDuration) -> Value {
    json!({
        "connectorId": connector_id,
        "expiryDate": Utc::now() + expires_in,
        "idTag": tag,
        "reservationId": reservation_id
    })
}

#[tokio::test(start_paused = true)]
async fn test_reserve_and_cancel() {
    let h = harness().await;
    h.boot().await;

    let response = call(&h, "ReserveNow", reserve_now(1, 7, "RES1", ChronoDuration::minutes(10))).await;
    assert_eq!(response["status"], "Accepted");
    assert_eq!(h.evse(1).status().await.0, ChargePointStatus::Reserved);
    assert!(h.cp.scheduler().has_tag("reservation-7"));

    let response = call(&h, "CancelReservation", json!({"reservationId": 7})).await;
    assert_eq!(response["status"], "Accepted");
    assert_eq!(h.evse(1).status().await.0, ChargePointStatus::Available);
    assert!(!h.cp.scheduler().has_tag("reservation-7"));

    let response = call(&h, "CancelReservation", json!({"reservationId": 7})).await;
    assert_eq!(response["status"], "Rejected");
}

#[rstest]
#[case::connector_zero(0, ChronoDuration::minutes(10))]
#[case::unknown_connector(5, ChronoDuration::minutes(10))]
#[case::already_expired(1, ChronoDuration::minutes(-1))]
#[tokio::test(start_paused = true)]
async fn test_reserve_now_rejected(#[case] connector_id: i32, #[case] expires_in: ChronoDuration) {
    let h = harness().await;
    let response = call(&h, "ReserveNow", reserve_now(connector_id, 3, "RES1", expires_in)).await;
    assert_eq!(response["status"], "Rejected");
}

#[tokio::test(start_paused = true)]
async fn test_reserve_now_on_busy_evse() {
    let h = charging_harness().await;
    let response = call(&h, "ReserveNow", reserve_now(1, 3, "RES1", ChronoDuration::minutes(10))).await;
    assert_eq!(response["status"], "Occupied");

    call(&h, "ChangeAvailability", json!({"connectorId": 0, "type": "Inoperative"})).await;
    let response = call(&h, "ReserveNow", reserve_now(1, 4, "RES1", ChronoDuration::minutes(10))).await;
    assert_eq!(response["status"], "Unavailable");
}

#[tokio::test(start_paused = true)]
async fn test_reservation_expires() {
    let h = harness().await;
    let response = call(&h, "ReserveNow", reserve_now(1, 7, "RES1", ChronoDuration::seconds(60))).await;
    assert_eq!(response["status"], "Accepted");

    tokio::time::sleep(Duration::from_secs(61)).await;
    let evse = h.evse(1);
    eventually(move || {
        let evse = evse.clone();
        async move { evse.status().await.0 == ChargePointStatus::Available }
    })
    .await;
    assert_eq!(h.evse(1).reservation_id().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_reserved_tag_starts_on_its_evse() {
    let h = harness().await;
    h.boot().await;
    call(&h, "ReserveNow", reserve_now(1, 7, "RES1", ChronoDuration::minutes(10))).await;

    // Someone else cannot take the reserved EVSE
    assert!(h.cp.handle_tag("OTHER").await.is_err());

    h.cp.handle_tag("res1").await.unwrap();
    let start = h.csms.wait_for("StartTransaction", 1).await;
    assert_eq!(start[0]["reservationId"], 7);
    assert_eq!(start[0]["idTag"], "RES1");

    let evse = h.evse(1);
    eventually(move || {
        let evse = evse.clone();
        async move { evse.is_charging().await }
    })
    .await;
    assert!(!h.cp.scheduler().has_tag("reservation-7"));
}

#[rstest]
#[case::boot("BootNotification", None, "Accepted")]
#[case::heartbeat("Heartbeat", None, "Accepted")]
#[case::status_for_evse("StatusNotification", Some(1), "Accepted")]
#[case::status_for_unknown_evse("StatusNotification", Some(4), "Rejected")]
#[case::meter_values_without_meter("MeterValues", None, "Rejected")]
#[case::diagnostics("DiagnosticsStatusNotification", None, "NotImplemented")]
#[case::firmware("FirmwareStatusNotification", None, "NotImplemented")]
#[tokio::test(start_paused = true)]
async fn test_trigger_message_answers(#[case] message: &str, #[case] connector_id: Option<i32>, #[case] expected: &str) {
    let h = harness().await;
    let mut payload = json!({"requestedMessage": message});
    if let Some(connector_id) = connector_id {
        payload["connectorId"] = json!(connector_id);
    }
    let response = call(&h, "TriggerMessage", payload).await;
    assert_eq!(response["status"], expected);
}

#[tokio::test(start_paused = true)]
async fn test_triggered_messages_follow_the_answer() {
    let h = harness().await;
    h.boot().await;
    let statuses_before = h.csms.wait_for("StatusNotification", 2).await.len();

    call(&h, "TriggerMessage", json!({"requestedMessage": "Heartbeat"})).await;
    assert!(h.csms.calls("Heartbeat").is_empty());
    tokio::time::sleep(Duration::from_secs(3)).await;
    h.csms.wait_for("Heartbeat", 1).await;

    call(&h, "TriggerMessage", json!({"requestedMessage": "StatusNotification", "connectorId": 1})).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let statuses = h.csms.wait_for("StatusNotification", statuses_before + 1).await;
    assert_eq!(statuses[statuses_before]["connectorId"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_triggered_meter_values_sent_once() {
    let h = HarnessBuilder::new().power_meters().start().await;
    h.boot().await;

    let response = call(&h, "TriggerMessage", json!({"requestedMessage": "MeterValues", "connectorId": 1})).await;
    assert_eq!(response["status"], "Accepted");

    tokio::time::sleep(Duration::from_secs(5)).await;
    let meter_values = h.csms.wait_for("MeterValues", 1).await;
    assert_eq!(meter_values.len(), 1);
    assert_eq!(meter_values[0]["connectorId"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_local_list_management() {
    let h = harness().await;

    let version = call(&h, "GetLocalListVersion", json!({})).await;
    assert_eq!(version["listVersion"], 0);

    let full = call(
        &h,
        "SendLocalList",
        json!({
            "listVersion": 3,
            "updateType": "Full",
            "localAuthorizationList": [
                {"idTag": "LOCAL1", "idTagInfo": {"status": "Accepted"}},
                {"idTag": "LOCAL2", "idTagInfo": {"status": "Blocked"}}
            ]
        }),
    )
    .await;
    assert_eq!(full["status"], "Accepted");
    assert_eq!(call(&h, "GetLocalListVersion", json!({})).await["listVersion"], 3);
    let persisted = h.repository.load_tags().await.unwrap().unwrap();
    assert_eq!(persisted.local_list.unwrap().version(), 3);

    let stale = call(
        &h,
        "SendLocalList",
        json!({"listVersion": 2, "updateType": "Differential", "localAuthorizationList": []}),
    )
    .await;
    assert_eq!(stale["status"], "VersionMismatch");

    let entries: Vec<Value> = (0..11)
        .map(|i| json!({"idTag": format!("TAG{i}"), "idTagInfo": {"status": "Accepted"}}))
        .collect();
    let too_many = call(
        &h,
        "SendLocalList",
        json!({"listVersion": 4, "updateType": "Full", "localAuthorizationList": entries}),
    )
    .await;
    assert_eq!(too_many["status"], "Failed");

    call(&h, "ChangeConfiguration", json!({"key": "LocalAuthListEnabled", "value": "false"})).await;
    let disabled = call(
        &h,
        "SendLocalList",
        json!({"listVersion": 5, "updateType": "Full", "localAuthorizationList": []}),
    )
    .await;
    assert_eq!(disabled["status"], "NotSupported");
    assert_eq!(call(&h, "GetLocalListVersion", json!({})).await["listVersion"], -1);
}

#[tokio::test(start_paused = true)]
async fn test_soft_reset_closes_sessions_and_requests_restart() {
    let h = charging_harness().await;

    let response = call(&h, "Reset", json!({"type": "Soft"})).await;
    assert_eq!(response["status"], "Accepted");
    assert!(!h.cp.is_restart_requested());

    tokio::time::sleep(Duration::from_secs(4)).await;
    let stop = h.csms.wait_for("StopTransaction", 1).await;
    assert_eq!(stop[0]["reason"], "SoftReset");
    assert!(!h.evse(1).has_active_session().await);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let cp = h.cp.clone();
    eventually(move || {
        let cp = cp.clone();
        async move { cp.is_restart_requested() }
    })
    .await;
    assert!(h.cp.token().is_cancelled());
}
