use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use crate::engine::Engine;
use crate::errors::Error;
use crate::model::{
    Channel, RelayState, ScheduleConfig, TimerMode, TripThresholds, DEFAULT_CUTOFF_LIMIT_MWH,
    DEFAULT_SCHEDULE_OFF, DEFAULT_SCHEDULE_ON,
};
use crate::store::Store;
use crate::transport::Transport;
use crate::validate;

const HISTORY_DEFAULT_LIMIT: usize = 200;
const HISTORY_MAX_LIMIT: usize = 2000;
const TRIP_EVENTS_DEFAULT_LIMIT: usize = 100;
const TRIP_EVENTS_MAX_LIMIT: usize = 500;

struct AppState<S, T> {
    engine: Arc<Engine<S, T>>,
    default_device_id: String,
}

impl<S, T> Clone for AppState<S, T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            default_device_id: self.default_device_id.clone(),
        }
    }
}

type ApiResult = Result<Json<Value>, AppError>;

pub fn create_router<S: Store, T: Transport>(
    engine: Arc<Engine<S, T>>,
    default_device_id: impl Into<String>,
) -> Router {
    let state = AppState {
        engine,
        default_device_id: default_device_id.into(),
    };

    Router::new()
        .route("/api/health", get(health::<S, T>))
        .route("/api/latest/:device_id", get(latest::<S, T>))
        .route("/api/history/:device_id", get(history::<S, T>))
        .route("/api/device/:device_id", get(device::<S, T>))
        .route("/api/relay/:device_id", post(set_relay::<S, T>))
        .route("/api/relayAll/:device_id", post(set_all_relays::<S, T>))
        .route("/api/timer/:device_id", post(start_timer::<S, T>))
        .route("/api/timer/:device_id/:ch", delete(cancel_timer::<S, T>))
        .route("/api/schedule/:device_id", post(upsert_schedule::<S, T>))
        .route("/api/schedule/:device_id/:ch", delete(delete_schedule::<S, T>))
        .route("/api/cutoff/:device_id", post(upsert_cutoff::<S, T>))
        .route("/api/cutoff/:device_id/:ch", delete(delete_cutoff::<S, T>))
        .route("/api/automations/:device_id", get(automations::<S, T>))
        .route("/api/trip/:device_id", get(trip_overview::<S, T>))
        .route("/api/trip/:device_id/settings", post(save_trip_settings::<S, T>))
        .route("/api/trip/:device_id/reset", post(reset_trip::<S, T>))
        .route(
            "/api/trip/:device_id/events",
            get(trip_events::<S, T>).delete(delete_trip_events::<S, T>),
        )
        .route(
            "/api/trip/:device_id/events/:event_id",
            delete(delete_trip_event::<S, T>),
        )
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

impl LimitQuery {
    fn resolve(&self, default: usize, max: usize) -> usize {
        self.limit
            .filter(|l| *l > 0)
            .map_or(default, |l| l as usize)
            .min(max)
    }
}

#[derive(Debug, Deserialize)]
struct RelayRequest {
    ch: Option<i64>,
    state: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MasterRequest {
    state: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimerRequest {
    ch: Option<i64>,
    mode: Option<String>,
    minutes: Option<f64>,
    seconds: Option<f64>,
    duration_sec: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    ch: Option<i64>,
    enabled: Option<bool>,
    on: Option<String>,
    off: Option<String>,
    invert: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CutoffRequest {
    ch: Option<i64>,
    enabled: Option<bool>,
    #[serde(rename = "limitmWh")]
    limit_mwh: Option<f64>,
}

/// Threshold form: each field may be a number, a numeric string, empty or null.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TripSettingsRequest {
    v_min: Option<Value>,
    v_max: Option<Value>,
    i_min: Option<Value>,
    i_max: Option<Value>,
    p_min: Option<Value>,
    p_max: Option<Value>,
}

fn number_or_null(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse().ok(),
        _ => None,
    };
    n.filter(|v| v.is_finite())
}

impl TripSettingsRequest {
    fn thresholds(&self) -> TripThresholds {
        TripThresholds {
            v_min: number_or_null(self.v_min.as_ref()),
            v_max: number_or_null(self.v_max.as_ref()),
            i_min: number_or_null(self.i_min.as_ref()),
            i_max: number_or_null(self.i_max.as_ref()),
            p_min: number_or_null(self.p_min.as_ref()),
            p_max: number_or_null(self.p_max.as_ref()),
        }
    }
}

fn body<B>(payload: Result<Json<B>, JsonRejection>) -> Result<B, AppError> {
    payload
        .map(|Json(b)| b)
        .map_err(|e| Error::Validation(e.body_text()).into())
}

fn query(params: Result<Query<LimitQuery>, QueryRejection>) -> Result<LimitQuery, AppError> {
    params
        .map(|Query(q)| q)
        .map_err(|e| Error::Validation(e.body_text()).into())
}

fn channel(raw: Option<i64>) -> Result<Channel, Error> {
    Channel::parse(raw.ok_or_else(|| Error::validation("ch must be 1 or 2"))?)
}

fn path_channel(raw: &str) -> Result<Channel, Error> {
    let ch = raw
        .parse::<i64>()
        .map_err(|_| Error::validation("ch must be 1 or 2"))?;
    Channel::parse(ch)
}

fn relay_state(raw: Option<i64>) -> Result<RelayState, Error> {
    RelayState::parse(raw.ok_or_else(|| Error::validation("state must be 0 or 1"))?)
}

async fn health<S: Store, T: Transport>(State(state): State<AppState<S, T>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "mqtt": state.engine.transport().is_connected(),
        "deviceId": state.default_device_id,
    }))
}

async fn latest<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
) -> ApiResult {
    let sample = state.engine.store().latest_sample(&device_id).await?;
    Ok(Json(json!(sample)))
}

async fn history<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
    params: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let limit = query(params)?.resolve(HISTORY_DEFAULT_LIMIT, HISTORY_MAX_LIMIT);
    let samples = state.engine.store().recent_samples(&device_id, limit).await?;
    Ok(Json(json!(samples)))
}

async fn device<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
) -> ApiResult {
    let device = state.engine.store().device(&device_id).await?;
    Ok(Json(json!(device)))
}

async fn set_relay<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let ch = channel(req.ch)?;
    let relay = relay_state(req.state)?;

    let cancelled = state.engine.set_relay(&device_id, ch, relay).await?;

    Ok(Json(json!({
        "ok": true,
        "published": { "ch": ch, "state": relay },
        "timerCancelled": cancelled > 0,
        "cancelledCount": cancelled,
    })))
}

async fn set_all_relays<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
    payload: Result<Json<MasterRequest>, JsonRejection>,
) -> ApiResult {
    let relay = relay_state(body(payload)?.state)?;

    let cancelled = state.engine.set_all_relays(&device_id, relay).await?;

    Ok(Json(json!({
        "ok": true,
        "deviceId": device_id,
        "relay": [relay, relay],
        "cancelledCount": cancelled,
    })))
}

async fn start_timer<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
    payload: Result<Json<TimerRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let ch = channel(req.ch)?;
    let mode = TimerMode::parse(req.mode.as_deref().unwrap_or_default())?;
    let duration_secs = match req.duration_sec {
        Some(secs) => validate::timer_secs(secs)?,
        None => validate::timer_duration(req.minutes, req.seconds)?,
    };

    let timer = state
        .engine
        .start_timer(&device_id, ch, mode, duration_secs, Utc::now())
        .await?;

    Ok(Json(json!({ "ok": true, "timer": timer })))
}

async fn cancel_timer<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path((device_id, ch)): Path<(String, String)>,
) -> ApiResult {
    let ch = path_channel(&ch)?;
    let cancelled = state.engine.cancel_timer(&device_id, ch).await?;
    Ok(Json(json!({ "ok": true, "cancelledCount": cancelled })))
}

async fn upsert_schedule<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
    payload: Result<Json<ScheduleRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let ch = channel(req.ch)?;
    let config = ScheduleConfig {
        enabled: req.enabled.unwrap_or(false),
        on: req.on.unwrap_or_else(|| DEFAULT_SCHEDULE_ON.to_string()),
        off: req.off.unwrap_or_else(|| DEFAULT_SCHEDULE_OFF.to_string()),
        invert: req.invert.unwrap_or(false),
    };

    let schedule = state.engine.upsert_schedule(&device_id, ch, config).await?;

    Ok(Json(json!({ "ok": true, "schedule": schedule })))
}

async fn delete_schedule<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path((device_id, ch)): Path<(String, String)>,
) -> ApiResult {
    let ch = path_channel(&ch)?;
    let deleted = state.engine.delete_schedule(&device_id, ch).await?;
    Ok(Json(json!({ "ok": true, "deletedCount": deleted })))
}

async fn upsert_cutoff<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
    payload: Result<Json<CutoffRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let ch = channel(req.ch)?;

    let rule = state
        .engine
        .upsert_cutoff(
            &device_id,
            ch,
            req.enabled.unwrap_or(false),
            req.limit_mwh.unwrap_or(DEFAULT_CUTOFF_LIMIT_MWH),
        )
        .await?;

    Ok(Json(json!({ "ok": true, "cutoff": rule })))
}

async fn delete_cutoff<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path((device_id, ch)): Path<(String, String)>,
) -> ApiResult {
    let ch = path_channel(&ch)?;
    let deleted = state.engine.delete_cutoff(&device_id, ch).await?;
    Ok(Json(json!({ "ok": true, "deletedCount": deleted })))
}

async fn automations<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
) -> ApiResult {
    let snapshot = state.engine.automations(&device_id).await?;
    Ok(Json(json!({
        "ok": true,
        "timers": snapshot.timers,
        "schedules": snapshot.schedules,
        "cutoffs": snapshot.cutoffs,
    })))
}

async fn trip_overview<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
    params: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let limit = query(params)?.resolve(TRIP_EVENTS_DEFAULT_LIMIT, TRIP_EVENTS_MAX_LIMIT);
    let settings = state.engine.store().trip_settings(&device_id).await?;
    let events = state.engine.trip_events(&device_id, limit).await?;
    Ok(Json(json!({ "ok": true, "settings": settings, "events": events })))
}

async fn save_trip_settings<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
    payload: Result<Json<TripSettingsRequest>, JsonRejection>,
) -> ApiResult {
    let thresholds = body(payload)?.thresholds();
    let settings = state
        .engine
        .upsert_trip_settings(&device_id, thresholds, Utc::now())
        .await?;
    Ok(Json(json!({ "ok": true, "settings": settings })))
}

async fn reset_trip<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
) -> ApiResult {
    let settings = state.engine.reset_trip_latch(&device_id, Utc::now()).await?;
    Ok(Json(json!({ "ok": true, "settings": settings })))
}

async fn trip_events<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
    params: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let limit = query(params)?.resolve(TRIP_EVENTS_DEFAULT_LIMIT, TRIP_EVENTS_MAX_LIMIT);
    let events = state.engine.trip_events(&device_id, limit).await?;
    Ok(Json(json!({ "ok": true, "events": events })))
}

async fn delete_trip_events<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path(device_id): Path<String>,
) -> ApiResult {
    let deleted = state.engine.delete_trip_events(&device_id).await?;
    Ok(Json(json!({ "ok": true, "deletedCount": deleted })))
}

async fn delete_trip_event<S: Store, T: Transport>(
    State(state): State<AppState<S, T>>,
    Path((device_id, event_id)): Path<(String, String)>,
) -> ApiResult {
    let id = Uuid::parse_str(&event_id).map_err(|_| Error::validation("Invalid eventId."))?;
    state.engine.delete_trip_event(&device_id, id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<Error>() {
            Some(Error::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(Error::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self.0.downcast_ref::<Error>() {
            Some(Error::Validation(msg)) => msg.clone(),
            _ if status.is_server_error() => {
                error!("API error: {:#}", self.0);
                "Internal server error".to_string()
            }
            _ => self.0.to_string(),
        };

        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_resolution() {
        let q = |limit| LimitQuery { limit };
        assert_eq!(q(None).resolve(200, 2000), 200);
        assert_eq!(q(Some(50)).resolve(200, 2000), 50);
        assert_eq!(q(Some(5000)).resolve(200, 2000), 2000);
        assert_eq!(q(Some(0)).resolve(100, 500), 100);
        assert_eq!(q(Some(-3)).resolve(100, 500), 100);
    }

    #[test]
    fn test_number_or_null() {
        assert_eq!(number_or_null(Some(&json!(250))), Some(250.0));
        assert_eq!(number_or_null(Some(&json!(" 0.5 "))), Some(0.5));
        assert_eq!(number_or_null(Some(&json!(""))), None);
        assert_eq!(number_or_null(Some(&json!("abc"))), None);
        assert_eq!(number_or_null(Some(&Value::Null)), None);
        assert_eq!(number_or_null(None), None);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            AppError::from(Error::validation("bad")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(Error::NotFound("Trip event".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(Error::Transport("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
