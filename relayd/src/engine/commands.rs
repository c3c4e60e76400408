use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use super::Engine;
use crate::errors::{Error, Result};
use crate::metrics::STORE_FAILURES_TOTAL;
use crate::model::{
    Channel, CommandReason, CutoffRule, RelayCommand, RelayState, Schedule, ScheduleConfig,
    Timer, TimerMode, TripEvent, TripLevel, TripSettings, TripThresholds,
    DEFAULT_CUTOFF_LIMIT_MWH, DEFAULT_SCHEDULE_OFF, DEFAULT_SCHEDULE_ON,
};
use crate::store::Store;
use crate::transport::Transport;
use crate::validate;

/// One value per channel, serialized with the channel numbers as keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerChannel<T> {
    #[serde(rename = "1")]
    pub one: T,
    #[serde(rename = "2")]
    pub two: T,
}

impl<T> PerChannel<T> {
    pub fn get(&self, ch: Channel) -> &T {
        match ch {
            Channel::One => &self.one,
            Channel::Two => &self.two,
        }
    }

    pub fn get_mut(&mut self, ch: Channel) -> &mut T {
        match ch {
            Channel::One => &mut self.one,
            Channel::Two => &mut self.two,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerView {
    pub end_at: DateTime<Utc>,
    pub active: bool,
    pub mode: TimerMode,
    pub end_state: RelayState,
}

impl From<&Timer> for TimerView {
    fn from(timer: &Timer) -> Self {
        Self {
            end_at: timer.end_at,
            active: timer.active,
            mode: timer.mode,
            end_state: timer.end_state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleView {
    pub enabled: bool,
    pub on: String,
    pub off: String,
    pub invert: bool,
}

impl Default for ScheduleView {
    fn default() -> Self {
        Self {
            enabled: false,
            on: DEFAULT_SCHEDULE_ON.to_string(),
            off: DEFAULT_SCHEDULE_OFF.to_string(),
            invert: false,
        }
    }
}

impl From<&Schedule> for ScheduleView {
    fn from(schedule: &Schedule) -> Self {
        Self {
            enabled: schedule.enabled,
            on: schedule.on.clone(),
            off: schedule.off.clone(),
            invert: schedule.invert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoffView {
    pub enabled: bool,
    #[serde(rename = "limitmWh")]
    pub limit_mwh: f64,
    #[serde(rename = "consumedmWh")]
    pub consumed_mwh: f64,
}

impl Default for CutoffView {
    fn default() -> Self {
        Self {
            enabled: false,
            limit_mwh: DEFAULT_CUTOFF_LIMIT_MWH,
            consumed_mwh: 0.0,
        }
    }
}

impl From<&CutoffRule> for CutoffView {
    fn from(rule: &CutoffRule) -> Self {
        Self {
            enabled: rule.enabled,
            limit_mwh: rule.limit_mwh,
            consumed_mwh: rule.consumed_mwh(),
        }
    }
}

/// Rules of both channels of a device, with defaults for unset ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationSnapshot {
    pub timers: PerChannel<Option<TimerView>>,
    pub schedules: PerChannel<ScheduleView>,
    pub cutoffs: PerChannel<CutoffView>,
}

impl<S: Store, T: Transport> Engine<S, T> {
    /// Manual switch of one channel. Cancels the channel's active timer and
    /// returns how many timers were cancelled.
    pub async fn set_relay(&self, device_id: &str, ch: Channel, state: RelayState) -> Result<u64> {
        let _guard = self.locks.lock(device_id, ch).await;

        let cancelled = self.store.cancel_timers(device_id, Some(ch)).await?;
        self.publisher
            .publish(device_id, RelayCommand::new(ch, state, CommandReason::Manual))
            .await;

        info!(
            "Manual relay {} ch={} -> {} (timers cancelled: {})",
            device_id,
            ch,
            u8::from(state),
            cancelled
        );
        Ok(cancelled)
    }

    /// Master switch: both channels, all timers of the device cancelled.
    pub async fn set_all_relays(&self, device_id: &str, state: RelayState) -> Result<u64> {
        let _guard = self.locks.lock_device(device_id).await;

        let cancelled = self.store.cancel_timers(device_id, None).await?;
        for ch in Channel::ALL {
            self.publisher
                .publish(device_id, RelayCommand::new(ch, state, CommandReason::Master))
                .await;
        }

        info!("Master relay {} -> {}", device_id, u8::from(state));
        Ok(cancelled)
    }

    /// Replaces the channel's timer, switches to the mode's start state and
    /// arms the timer to flip it after `duration_secs`.
    pub async fn start_timer(
        &self,
        device_id: &str,
        ch: Channel,
        mode: TimerMode,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Timer> {
        let duration_secs = validate::timer_secs(duration_secs)?;
        let _guard = self.locks.lock(device_id, ch).await;

        self.store.cancel_timers(device_id, Some(ch)).await?;

        let timer = Timer {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            ch,
            mode,
            end_at: now + Duration::seconds(duration_secs as i64),
            end_state: mode.end_state(),
            active: true,
            created_at: now,
        };
        self.store.insert_timer(&timer).await?;

        let command = RelayCommand::new(ch, mode.start_state(), CommandReason::TimerStart)
            .with_meta("mode", mode.as_str());
        self.publisher.publish(device_id, command).await;

        info!(
            "Timer {} armed: {} ch={} {} for {}s",
            timer.id,
            device_id,
            ch,
            mode.as_str(),
            duration_secs
        );
        Ok(timer)
    }

    pub async fn cancel_timer(&self, device_id: &str, ch: Channel) -> Result<u64> {
        let _guard = self.locks.lock(device_id, ch).await;
        self.store.cancel_timers(device_id, Some(ch)).await
    }

    pub async fn upsert_schedule(
        &self,
        device_id: &str,
        ch: Channel,
        config: ScheduleConfig,
    ) -> Result<Schedule> {
        validate::clock_time(&config.on)?;
        validate::clock_time(&config.off)?;

        let _guard = self.locks.lock(device_id, ch).await;
        let schedule = self.store.upsert_schedule(device_id, ch, &config).await?;
        info!(
            "Schedule saved: {} ch={} enabled={} {}-{} invert={}",
            device_id, ch, schedule.enabled, schedule.on, schedule.off, schedule.invert
        );
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, device_id: &str, ch: Channel) -> Result<u64> {
        let _guard = self.locks.lock(device_id, ch).await;
        self.store.delete_schedule(device_id, ch).await
    }

    /// Saving a rule always starts a fresh budget from the next reading.
    pub async fn upsert_cutoff(
        &self,
        device_id: &str,
        ch: Channel,
        enabled: bool,
        limit_mwh: f64,
    ) -> Result<CutoffRule> {
        let limit_mwh = validate::cutoff_limit(limit_mwh)?;

        let _guard = self.locks.lock(device_id, ch).await;
        let rule = self
            .store
            .upsert_cutoff(device_id, ch, enabled, limit_mwh)
            .await?;
        info!(
            "Cutoff saved: {} ch={} enabled={} limit={} mWh",
            device_id, ch, rule.enabled, rule.limit_mwh
        );
        Ok(rule)
    }

    pub async fn delete_cutoff(&self, device_id: &str, ch: Channel) -> Result<u64> {
        let _guard = self.locks.lock(device_id, ch).await;
        self.store.delete_cutoff(device_id, ch).await
    }

    /// Replaces the thresholds and re-arms protection.
    pub async fn upsert_trip_settings(
        &self,
        device_id: &str,
        thresholds: TripThresholds,
        now: DateTime<Utc>,
    ) -> Result<TripSettings> {
        validate::trip_thresholds(&thresholds)?;

        let _guard = self.locks.lock_device(device_id).await;
        let settings = self.store.save_trip_thresholds(device_id, &thresholds).await?;

        let (kind, message) = if thresholds.any() {
            ("settings_saved", "Trip thresholds saved.")
        } else {
            ("settings_cleared", "Trip thresholds cleared (all empty).")
        };
        let event = TripEvent::new(device_id, TripLevel::Success, kind, now)
            .with_message(message)
            .with_meta(json!(thresholds));
        self.log_trip_event(&event).await;

        info!("Trip settings for {}: {}", device_id, kind);
        Ok(settings)
    }

    pub async fn reset_trip_latch(&self, device_id: &str, now: DateTime<Utc>) -> Result<TripSettings> {
        let _guard = self.locks.lock_device(device_id).await;
        let settings = self.store.reset_trip_latch(device_id).await?;

        let event = TripEvent::new(device_id, TripLevel::Success, "trip_reset", now)
            .with_message("Trip latch reset.");
        self.log_trip_event(&event).await;

        info!("Trip latch reset for {}", device_id);
        Ok(settings)
    }

    /// The settings change is already saved; a lost log entry does not fail it.
    async fn log_trip_event(&self, event: &TripEvent) {
        if let Err(e) = self.store.insert_trip_event(event).await {
            STORE_FAILURES_TOTAL.inc();
            error!("Failed to log {} for {}: {}", event.kind, event.device_id, e);
        }
    }

    pub async fn trip_events(&self, device_id: &str, limit: usize) -> Result<Vec<TripEvent>> {
        self.store.trip_events(device_id, limit).await
    }

    pub async fn delete_trip_events(&self, device_id: &str) -> Result<u64> {
        self.store.delete_trip_events(device_id).await
    }

    pub async fn delete_trip_event(&self, device_id: &str, id: Uuid) -> Result<()> {
        if self.store.delete_trip_event(device_id, id).await? {
            Ok(())
        } else {
            Err(Error::NotFound("Trip event".to_string()))
        }
    }

    pub async fn automations(&self, device_id: &str) -> Result<AutomationSnapshot> {
        let mut snapshot = AutomationSnapshot::default();

        for timer in self.store.active_timers(device_id).await? {
            *snapshot.timers.get_mut(timer.ch) = Some(TimerView::from(&timer));
        }
        for schedule in self.store.schedules(device_id).await? {
            *snapshot.schedules.get_mut(schedule.ch) = ScheduleView::from(&schedule);
        }
        for rule in self.store.cutoffs(device_id).await? {
            *snapshot.cutoffs.get_mut(rule.ch) = CutoffView::from(&rule);
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot_shape() {
        let value = serde_json::to_value(AutomationSnapshot::default()).unwrap();

        assert_eq!(value["timers"]["1"], serde_json::Value::Null);
        assert_eq!(value["schedules"]["2"]["on"], "18:00");
        assert_eq!(value["schedules"]["2"]["off"], "23:00");
        assert_eq!(value["schedules"]["1"]["enabled"], false);
        assert_eq!(value["cutoffs"]["1"]["limitmWh"], 1000.0);
        assert_eq!(value["cutoffs"]["2"]["consumedmWh"], 0.0);
    }

    #[test]
    fn test_per_channel_access() {
        let mut per: PerChannel<u32> = PerChannel::default();
        *per.get_mut(Channel::Two) = 7;
        assert_eq!(*per.get(Channel::One), 0);
        assert_eq!(*per.get(Channel::Two), 7);
    }
}
