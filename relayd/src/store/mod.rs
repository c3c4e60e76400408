//! Persistence port for telemetry, device state and rule records.
//!
//! Read-modify-write steps the engine relies on for exactly-once behaviour
//! (`deactivate_timer`, `mark_schedule_applied`, `latch_trip`) are conditional
//! updates: they report whether this caller won the transition.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{make_pool, PgStore};

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{
    Channel, CutoffProgress, CutoffRule, DeviceState, RelayArray, RelayState, Schedule,
    ScheduleConfig, TelemetrySample, Timer, TripEvent, TripSettings, TripThresholds,
};

pub trait Store: Send + Sync + 'static {
    // Telemetry

    fn insert_sample(&self, sample: &TelemetrySample) -> impl Future<Output = Result<()>> + Send;

    fn latest_sample(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<Option<TelemetrySample>>> + Send;

    /// Most recent `limit` samples, oldest first.
    fn recent_samples(
        &self,
        device_id: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<TelemetrySample>>> + Send;

    // Device state

    fn device(&self, device_id: &str) -> impl Future<Output = Result<Option<DeviceState>>> + Send;

    /// Upserts `last_seen`, and the relay array when the device reported one.
    fn record_seen(
        &self,
        device_id: &str,
        last_seen: i64,
        relay: Option<RelayArray>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn set_relay(
        &self,
        device_id: &str,
        ch: Channel,
        state: RelayState,
    ) -> impl Future<Output = Result<()>> + Send;

    // Timers

    fn insert_timer(&self, timer: &Timer) -> impl Future<Output = Result<()>> + Send;

    fn active_timers(&self, device_id: &str) -> impl Future<Output = Result<Vec<Timer>>> + Send;

    fn due_timers(&self, now: DateTime<Utc>) -> impl Future<Output = Result<Vec<Timer>>> + Send;

    /// Flips one timer to inactive; `false` when it was no longer active.
    fn deactivate_timer(&self, id: Uuid) -> impl Future<Output = Result<bool>> + Send;

    /// Deactivates the active timers of a device, or of one of its channels.
    fn cancel_timers(
        &self,
        device_id: &str,
        ch: Option<Channel>,
    ) -> impl Future<Output = Result<u64>> + Send;

    // Schedules

    fn schedules(&self, device_id: &str) -> impl Future<Output = Result<Vec<Schedule>>> + Send;

    fn enabled_schedules(&self) -> impl Future<Output = Result<Vec<Schedule>>> + Send;

    /// Replace-or-create; keeps the engine's last applied state.
    fn upsert_schedule(
        &self,
        device_id: &str,
        ch: Channel,
        config: &ScheduleConfig,
    ) -> impl Future<Output = Result<Schedule>> + Send;

    /// Sets the applied state only if it still equals `expected`.
    fn mark_schedule_applied(
        &self,
        device_id: &str,
        ch: Channel,
        expected: RelayState,
        applied: RelayState,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn delete_schedule(&self, device_id: &str, ch: Channel)
        -> impl Future<Output = Result<u64>> + Send;

    // Cutoffs

    fn cutoffs(&self, device_id: &str) -> impl Future<Output = Result<Vec<CutoffRule>>> + Send;

    fn cutoff(
        &self,
        device_id: &str,
        ch: Channel,
    ) -> impl Future<Output = Result<Option<CutoffRule>>> + Send;

    /// Replace-or-create; always resets baseline tracking.
    fn upsert_cutoff(
        &self,
        device_id: &str,
        ch: Channel,
        enabled: bool,
        limit_mwh: f64,
    ) -> impl Future<Output = Result<CutoffRule>> + Send;

    fn save_cutoff_progress(
        &self,
        device_id: &str,
        ch: Channel,
        progress: CutoffProgress,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_cutoff(&self, device_id: &str, ch: Channel)
        -> impl Future<Output = Result<u64>> + Send;

    // Trip protection

    fn trip_settings(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<Option<TripSettings>>> + Send;

    /// Replace thresholds and clear the latch.
    fn save_trip_thresholds(
        &self,
        device_id: &str,
        thresholds: &TripThresholds,
    ) -> impl Future<Output = Result<TripSettings>> + Send;

    /// Sets the latch; `false` when it was already set.
    fn latch_trip(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
        fault: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn reset_trip_latch(&self, device_id: &str) -> impl Future<Output = Result<TripSettings>> + Send;

    fn insert_trip_event(&self, event: &TripEvent) -> impl Future<Output = Result<()>> + Send;

    /// Newest first.
    fn trip_events(
        &self,
        device_id: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<TripEvent>>> + Send;

    fn delete_trip_events(&self, device_id: &str) -> impl Future<Output = Result<u64>> + Send;

    fn delete_trip_event(&self, device_id: &str, id: Uuid)
        -> impl Future<Output = Result<bool>> + Send;
}
