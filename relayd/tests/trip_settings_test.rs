//! Trip settings edits racing with telemetry evaluation, and event-log
//! failures, against a store that can pause or fail selected calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use relayd::engine::Engine;
use relayd::errors::{Error, Result};
use relayd::model::RelayState::{Off, On};
use relayd::model::{
    Channel, CutoffProgress, CutoffRule, DeviceState, RelayArray, RelayState, Schedule,
    ScheduleConfig, TelemetrySample, Timer, TripEvent, TripSettings, TripThresholds,
};
use relayd::store::{MemoryStore, Store};
use relayd::transport::ChannelTransport;
use tokio::sync::Notify;
use uuid::Uuid;

/// Delegates to [`MemoryStore`]. Can hold the next trip settings read until
/// released, and can fail every trip event insert.
#[derive(Default)]
struct GatedStore {
    inner: MemoryStore,
    hold_settings_read: AtomicBool,
    settings_read: Notify,
    release: Notify,
    fail_event_log: AtomicBool,
}

impl Store for GatedStore {
    async fn insert_sample(&self, sample: &TelemetrySample) -> Result<()> {
        self.inner.insert_sample(sample).await
    }

    async fn latest_sample(&self, device_id: &str) -> Result<Option<TelemetrySample>> {
        self.inner.latest_sample(device_id).await
    }

    async fn recent_samples(&self, device_id: &str, limit: usize) -> Result<Vec<TelemetrySample>> {
        self.inner.recent_samples(device_id, limit).await
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceState>> {
        self.inner.device(device_id).await
    }

    async fn record_seen(
        &self,
        device_id: &str,
        last_seen: i64,
        relay: Option<RelayArray>,
    ) -> Result<()> {
        self.inner.record_seen(device_id, last_seen, relay).await
    }

    async fn set_relay(&self, device_id: &str, ch: Channel, state: RelayState) -> Result<()> {
        self.inner.set_relay(device_id, ch, state).await
    }

    async fn insert_timer(&self, timer: &Timer) -> Result<()> {
        self.inner.insert_timer(timer).await
    }

    async fn active_timers(&self, device_id: &str) -> Result<Vec<Timer>> {
        self.inner.active_timers(device_id).await
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>> {
        self.inner.due_timers(now).await
    }

    async fn deactivate_timer(&self, id: Uuid) -> Result<bool> {
        self.inner.deactivate_timer(id).await
    }

    async fn cancel_timers(&self, device_id: &str, ch: Option<Channel>) -> Result<u64> {
        self.inner.cancel_timers(device_id, ch).await
    }

    async fn schedules(&self, device_id: &str) -> Result<Vec<Schedule>> {
        self.inner.schedules(device_id).await
    }

    async fn enabled_schedules(&self) -> Result<Vec<Schedule>> {
        self.inner.enabled_schedules().await
    }

    async fn upsert_schedule(
        &self,
        device_id: &str,
        ch: Channel,
        config: &ScheduleConfig,
    ) -> Result<Schedule> {
        self.inner.upsert_schedule(device_id, ch, config).await
    }

    async fn mark_schedule_applied(
        &self,
        device_id: &str,
        ch: Channel,
        expected: RelayState,
        applied: RelayState,
    ) -> Result<bool> {
        self.inner
            .mark_schedule_applied(device_id, ch, expected, applied)
            .await
    }

    async fn delete_schedule(&self, device_id: &str, ch: Channel) -> Result<u64> {
        self.inner.delete_schedule(device_id, ch).await
    }

    async fn cutoffs(&self, device_id: &str) -> Result<Vec<CutoffRule>> {
        self.inner.cutoffs(device_id).await
    }

    async fn cutoff(&self, device_id: &str, ch: Channel) -> Result<Option<CutoffRule>> {
        self.inner.cutoff(device_id, ch).await
    }

    async fn upsert_cutoff(
        &self,
        device_id: &str,
        ch: Channel,
        enabled: bool,
        limit_mwh: f64,
    ) -> Result<CutoffRule> {
        self.inner.upsert_cutoff(device_id, ch, enabled, limit_mwh).await
    }

    async fn save_cutoff_progress(
        &self,
        device_id: &str,
        ch: Channel,
        progress: CutoffProgress,
    ) -> Result<()> {
        self.inner.save_cutoff_progress(device_id, ch, progress).await
    }

    async fn delete_cutoff(&self, device_id: &str, ch: Channel) -> Result<u64> {
        self.inner.delete_cutoff(device_id, ch).await
    }

    async fn trip_settings(&self, device_id: &str) -> Result<Option<TripSettings>> {
        let settings = self.inner.trip_settings(device_id).await?;
        if self.hold_settings_read.swap(false, Ordering::SeqCst) {
            self.settings_read.notify_one();
            self.release.notified().await;
        }
        Ok(settings)
    }

    async fn save_trip_thresholds(
        &self,
        device_id: &str,
        thresholds: &TripThresholds,
    ) -> Result<TripSettings> {
        self.inner.save_trip_thresholds(device_id, thresholds).await
    }

    async fn latch_trip(&self, device_id: &str, at: DateTime<Utc>, fault: &str) -> Result<bool> {
        self.inner.latch_trip(device_id, at, fault).await
    }

    async fn reset_trip_latch(&self, device_id: &str) -> Result<TripSettings> {
        self.inner.reset_trip_latch(device_id).await
    }

    async fn insert_trip_event(&self, event: &TripEvent) -> Result<()> {
        if self.fail_event_log.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.insert_trip_event(event).await
    }

    async fn trip_events(&self, device_id: &str, limit: usize) -> Result<Vec<TripEvent>> {
        self.inner.trip_events(device_id, limit).await
    }

    async fn delete_trip_events(&self, device_id: &str) -> Result<u64> {
        self.inner.delete_trip_events(device_id).await
    }

    async fn delete_trip_event(&self, device_id: &str, id: Uuid) -> Result<bool> {
        self.inner.delete_trip_event(device_id, id).await
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn v_max(limit: f64) -> TripThresholds {
    TripThresholds {
        v_max: Some(limit),
        ..Default::default()
    }
}

fn setup() -> (Arc<GatedStore>, Arc<Engine<GatedStore, ChannelTransport>>) {
    let store = Arc::new(GatedStore::default());
    // Sent commands are not inspected here; the receiver is dropped
    let (transport, _rx) = ChannelTransport::new();
    let utc = FixedOffset::east_opt(0).unwrap();
    let engine = Arc::new(Engine::new(store.clone(), transport, utc));
    (store, engine)
}

#[tokio::test]
async fn test_threshold_edit_waits_for_running_evaluation() {
    let (store, engine) = setup();
    engine.upsert_trip_settings("dev1", v_max(250.0), t0()).await.unwrap();

    store.hold_settings_read.store(true, Ordering::SeqCst);
    let evaluation = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let sample = TelemetrySample {
                device_id: "dev1".into(),
                v1: Some(260.0),
                i1: Some(0.1),
                p1: Some(26.0),
                relay: Some([On, Off]),
                ..Default::default()
            };
            engine.handle_telemetry(sample, t0()).await
        })
    };
    store.settings_read.notified().await;

    // The evaluation has read vMax=250; the edit must wait until it is done
    let edit = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.upsert_trip_settings("dev1", v_max(300.0), t0()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!edit.is_finished());

    store.release.notify_one();
    let outcome = evaluation.await.unwrap().unwrap();
    assert_eq!(outcome.trip.as_deref(), Some("V_HIGH"));
    edit.await.unwrap().unwrap();

    // The later edit wins and leaves protection armed
    let settings = store.trip_settings("dev1").await.unwrap().unwrap();
    assert!(!settings.latched());
    assert_eq!(settings.thresholds.v_max, Some(300.0));
}

#[tokio::test]
async fn test_event_log_failure_does_not_fail_settings_change() {
    let (store, engine) = setup();
    store.fail_event_log.store(true, Ordering::SeqCst);

    let saved = engine
        .upsert_trip_settings("dev1", v_max(250.0), t0())
        .await
        .unwrap();
    assert_eq!(saved.thresholds.v_max, Some(250.0));

    store.latch_trip("dev1", t0(), "V_HIGH").await.unwrap();
    let reset = engine.reset_trip_latch("dev1", t0()).await.unwrap();
    assert!(!reset.latched());

    let stored = store.trip_settings("dev1").await.unwrap().unwrap();
    assert_eq!(stored.thresholds.v_max, Some(250.0));
    assert!(!stored.latched());
    assert!(engine.trip_events("dev1", 10).await.unwrap().is_empty());
}
