use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::FixedOffset;
use relayd::engine::Engine;
use relayd::model::{Channel, CommandReason, RelayState};
use relayd::rest::create_router;
use relayd::store::MemoryStore;
use relayd::transport::{ChannelTransport, SentCommand};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tower::ServiceExt;

fn app() -> (Router, UnboundedReceiver<SentCommand>) {
    let (transport, rx) = ChannelTransport::new();
    let offset = FixedOffset::east_opt(6 * 3600).unwrap();
    let engine = Arc::new(Engine::new(Arc::new(MemoryStore::new()), transport, offset));
    (create_router(engine, "esp32_001"), rx)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let (app, _rx) = app();

    let (status, body) = call(&app, Method::GET, "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true, "mqtt": true, "deviceId": "esp32_001" }));
}

#[tokio::test]
async fn test_relay_command() {
    let (app, mut rx) = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/relay/dev1",
        Some(json!({ "ch": 2, "state": 1 })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["published"], json!({ "ch": 2, "state": 1 }));
    assert_eq!(body["timerCancelled"], false);

    let sent = rx.try_recv().unwrap();
    assert_eq!(sent.device_id, "dev1");
    assert_eq!(sent.command.ch, Channel::Two);
    assert_eq!(sent.command.state, RelayState::On);
    assert_eq!(sent.command.reason, CommandReason::Manual);

    let (_, device) = call(&app, Method::GET, "/api/device/dev1", None).await;
    assert_eq!(device["relay"], json!([0, 1]));
}

#[tokio::test]
async fn test_validation_errors() {
    let (app, mut rx) = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/relay/dev1",
        Some(json!({ "ch": 3, "state": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "ok": false, "error": "ch must be 1 or 2" }));

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/relayAll/dev1",
        Some(json!({ "state": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "state must be 0 or 1");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/timer/dev1",
        Some(json!({ "ch": 1, "mode": "on_for", "minutes": 1, "seconds": 75 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "minutes>=0 and seconds 0..59 required");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/timer/dev1",
        Some(json!({ "ch": 1, "mode": "blink", "seconds": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "mode must be on_for/off_for");

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/cutoff/dev1",
        Some(json!({ "ch": 1, "enabled": true, "limitmWh": 0.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/schedule/dev1",
        Some(json!({ "ch": 1, "enabled": true, "on": "7pm", "off": "23:00" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, Method::DELETE, "/api/timer/dev1/x", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let (app, _rx) = app();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/relay/dev1")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_timer_and_automations() {
    let (app, mut rx) = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/timer/dev1",
        Some(json!({ "ch": 1, "mode": "on_for", "minutes": 2, "seconds": 30 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["timer"]["mode"], "on_for");
    assert_eq!(body["timer"]["endState"], 0);
    assert_eq!(rx.try_recv().unwrap().command.reason, CommandReason::TimerStart);

    call(
        &app,
        Method::POST,
        "/api/schedule/dev1",
        Some(json!({ "ch": 2, "enabled": true, "on": "06:30", "off": "07:45", "invert": true })),
    )
    .await;
    call(
        &app,
        Method::POST,
        "/api/cutoff/dev1",
        Some(json!({ "ch": 1, "enabled": true, "limitmWh": 250 })),
    )
    .await;

    let (status, body) = call(&app, Method::GET, "/api/automations/dev1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["timers"]["1"]["mode"], "on_for");
    assert!(body["timers"]["2"].is_null());
    assert_eq!(
        body["schedules"]["2"],
        json!({ "enabled": true, "on": "06:30", "off": "07:45", "invert": true })
    );
    assert_eq!(body["schedules"]["1"]["on"], "18:00");
    assert_eq!(body["cutoffs"]["1"]["limitmWh"], 250.0);
    assert_eq!(body["cutoffs"]["2"]["enabled"], false);

    let (status, body) = call(&app, Method::DELETE, "/api/timer/dev1/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelledCount"], 1);

    let (_, body) = call(&app, Method::DELETE, "/api/schedule/dev1/2", None).await;
    assert_eq!(body["deletedCount"], 1);
    let (_, body) = call(&app, Method::DELETE, "/api/cutoff/dev1/2", None).await;
    assert_eq!(body["deletedCount"], 0);
}

#[tokio::test]
async fn test_trip_settings_and_events() {
    let (app, _rx) = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/trip/dev1/settings",
        Some(json!({ "vMin": "", "vMax": "250", "pMax": 1500 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settings"]["vMax"], 250.0);
    assert!(body["settings"]["vMin"].is_null());
    assert_eq!(body["settings"]["latched"], false);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/trip/dev1/settings",
        Some(json!({ "iMin": 2, "iMax": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Min must be < Max (where both are set).");

    call(&app, Method::POST, "/api/trip/dev1/reset", None).await;

    let (status, body) = call(&app, Method::GET, "/api/trip/dev1?limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settings"]["pMax"], 1500.0);
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["kind"], "trip_reset");
    assert_eq!(events[0]["message"], "Trip latch reset.");

    let (_, body) = call(&app, Method::GET, "/api/trip/dev1/events", None).await;
    let events = body["events"].as_array().unwrap().clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["kind"], "settings_saved");

    let id = events[0]["id"].as_str().unwrap();
    let (status, _) = call(&app, Method::DELETE, &format!("/api/trip/dev1/events/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, Method::DELETE, &format!("/api/trip/dev1/events/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], false);

    let (status, body) = call(&app, Method::DELETE, "/api/trip/dev1/events/not-an-id", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid eventId.");

    let (_, body) = call(&app, Method::DELETE, "/api/trip/dev1/events", None).await;
    assert_eq!(body["deletedCount"], 1);
}

#[tokio::test]
async fn test_latest_and_history_for_unknown_device() {
    let (app, _rx) = app();

    let (status, body) = call(&app, Method::GET, "/api/latest/nobody", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_null());

    let (status, body) = call(&app, Method::GET, "/api/history/nobody?limit=5000", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (_, body) = call(&app, Method::GET, "/api/trip/nobody", None).await;
    assert!(body["settings"].is_null());
    assert_eq!(body["events"], json!([]));
}
