use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Store;
use crate::errors::Result;
use crate::model::{
    Channel, CutoffProgress, CutoffRule, DeviceState, RelayArray, RelayState, Schedule,
    ScheduleConfig, TelemetrySample, Timer, TripEvent, TripSettings, TripThresholds,
};

type RuleKey = (String, Channel);

#[derive(Default)]
struct Inner {
    samples: HashMap<String, Vec<TelemetrySample>>,
    devices: HashMap<String, DeviceState>,
    timers: Vec<Timer>,
    schedules: BTreeMap<RuleKey, Schedule>,
    cutoffs: BTreeMap<RuleKey, CutoffRule>,
    trip_settings: HashMap<String, TripSettings>,
    trip_events: Vec<TripEvent>,
}

/// Process-local store. Backs the test suite and `STORE_BACKEND=memory`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key(device_id: &str, ch: Channel) -> RuleKey {
    (device_id.to_string(), ch)
}

impl Store for MemoryStore {
    async fn insert_sample(&self, sample: &TelemetrySample) -> Result<()> {
        self.state()
            .samples
            .entry(sample.device_id.clone())
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    async fn latest_sample(&self, device_id: &str) -> Result<Option<TelemetrySample>> {
        Ok(self
            .state()
            .samples
            .get(device_id)
            .and_then(|s| s.last().cloned()))
    }

    async fn recent_samples(&self, device_id: &str, limit: usize) -> Result<Vec<TelemetrySample>> {
        let state = self.state();
        let Some(samples) = state.samples.get(device_id) else {
            return Ok(Vec::new());
        };
        let start = samples.len().saturating_sub(limit);
        Ok(samples[start..].to_vec())
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceState>> {
        Ok(self.state().devices.get(device_id).cloned())
    }

    async fn record_seen(
        &self,
        device_id: &str,
        last_seen: i64,
        relay: Option<RelayArray>,
    ) -> Result<()> {
        let mut state = self.state();
        let device = state
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceState::new(device_id));
        device.last_seen = Some(last_seen);
        if let Some(relay) = relay {
            device.relay = relay;
        }
        Ok(())
    }

    async fn set_relay(&self, device_id: &str, ch: Channel, relay_state: RelayState) -> Result<()> {
        let mut state = self.state();
        let device = state
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceState::new(device_id));
        device.relay[ch.index()] = relay_state;
        Ok(())
    }

    async fn insert_timer(&self, timer: &Timer) -> Result<()> {
        self.state().timers.push(timer.clone());
        Ok(())
    }

    async fn active_timers(&self, device_id: &str) -> Result<Vec<Timer>> {
        Ok(self
            .state()
            .timers
            .iter()
            .filter(|t| t.active && t.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>> {
        Ok(self
            .state()
            .timers
            .iter()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect())
    }

    async fn deactivate_timer(&self, id: Uuid) -> Result<bool> {
        // Inactive timers are never read again, so they are dropped
        let mut state = self.state();
        match state.timers.iter().position(|t| t.id == id && t.active) {
            Some(idx) => {
                state.timers.swap_remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cancel_timers(&self, device_id: &str, ch: Option<Channel>) -> Result<u64> {
        let mut state = self.state();
        let before = state.timers.len();
        state
            .timers
            .retain(|t| !(t.device_id == device_id && ch.map_or(true, |c| c == t.ch)));
        Ok((before - state.timers.len()) as u64)
    }

    async fn schedules(&self, device_id: &str) -> Result<Vec<Schedule>> {
        Ok(self
            .state()
            .schedules
            .values()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn enabled_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self
            .state()
            .schedules
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn upsert_schedule(
        &self,
        device_id: &str,
        ch: Channel,
        config: &ScheduleConfig,
    ) -> Result<Schedule> {
        let mut state = self.state();
        let schedule = state
            .schedules
            .entry(key(device_id, ch))
            .or_insert_with(|| Schedule {
                device_id: device_id.to_string(),
                ch,
                enabled: false,
                on: String::new(),
                off: String::new(),
                invert: false,
                last_applied_state: RelayState::Off,
            });
        schedule.enabled = config.enabled;
        schedule.on = config.on.clone();
        schedule.off = config.off.clone();
        schedule.invert = config.invert;
        Ok(schedule.clone())
    }

    async fn mark_schedule_applied(
        &self,
        device_id: &str,
        ch: Channel,
        expected: RelayState,
        applied: RelayState,
    ) -> Result<bool> {
        let mut state = self.state();
        match state.schedules.get_mut(&key(device_id, ch)) {
            Some(s) if s.last_applied_state == expected => {
                s.last_applied_state = applied;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_schedule(&self, device_id: &str, ch: Channel) -> Result<u64> {
        Ok(u64::from(self.state().schedules.remove(&key(device_id, ch)).is_some()))
    }

    async fn cutoffs(&self, device_id: &str) -> Result<Vec<CutoffRule>> {
        Ok(self
            .state()
            .cutoffs
            .values()
            .filter(|c| c.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn cutoff(&self, device_id: &str, ch: Channel) -> Result<Option<CutoffRule>> {
        Ok(self.state().cutoffs.get(&key(device_id, ch)).cloned())
    }

    async fn upsert_cutoff(
        &self,
        device_id: &str,
        ch: Channel,
        enabled: bool,
        limit_mwh: f64,
    ) -> Result<CutoffRule> {
        let rule = CutoffRule::new(device_id, ch, enabled, limit_mwh);
        self.state().cutoffs.insert(key(device_id, ch), rule.clone());
        Ok(rule)
    }

    async fn save_cutoff_progress(
        &self,
        device_id: &str,
        ch: Channel,
        progress: CutoffProgress,
    ) -> Result<()> {
        if let Some(rule) = self.state().cutoffs.get_mut(&key(device_id, ch)) {
            rule.apply(progress);
        }
        Ok(())
    }

    async fn delete_cutoff(&self, device_id: &str, ch: Channel) -> Result<u64> {
        Ok(u64::from(self.state().cutoffs.remove(&key(device_id, ch)).is_some()))
    }

    async fn trip_settings(&self, device_id: &str) -> Result<Option<TripSettings>> {
        Ok(self.state().trip_settings.get(device_id).cloned())
    }

    async fn save_trip_thresholds(
        &self,
        device_id: &str,
        thresholds: &TripThresholds,
    ) -> Result<TripSettings> {
        let settings = TripSettings::new(device_id, *thresholds);
        self.state()
            .trip_settings
            .insert(device_id.to_string(), settings.clone());
        Ok(settings)
    }

    async fn latch_trip(&self, device_id: &str, at: DateTime<Utc>, fault: &str) -> Result<bool> {
        let mut state = self.state();
        let settings = state
            .trip_settings
            .entry(device_id.to_string())
            .or_insert_with(|| TripSettings::new(device_id, TripThresholds::default()));
        if settings.latched {
            return Ok(false);
        }
        settings.latched = true;
        settings.latched_at = Some(at);
        settings.last_fault = fault.to_string();
        Ok(true)
    }

    async fn reset_trip_latch(&self, device_id: &str) -> Result<TripSettings> {
        let mut state = self.state();
        let settings = state
            .trip_settings
            .entry(device_id.to_string())
            .or_insert_with(|| TripSettings::new(device_id, TripThresholds::default()));
        settings.clear_latch();
        Ok(settings.clone())
    }

    async fn insert_trip_event(&self, event: &TripEvent) -> Result<()> {
        self.state().trip_events.push(event.clone());
        Ok(())
    }

    async fn trip_events(&self, device_id: &str, limit: usize) -> Result<Vec<TripEvent>> {
        Ok(self
            .state()
            .trip_events
            .iter()
            .rev()
            .filter(|e| e.device_id == device_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_trip_events(&self, device_id: &str) -> Result<u64> {
        let mut state = self.state();
        let before = state.trip_events.len();
        state.trip_events.retain(|e| e.device_id != device_id);
        Ok((before - state.trip_events.len()) as u64)
    }

    async fn delete_trip_event(&self, device_id: &str, id: Uuid) -> Result<bool> {
        let mut state = self.state();
        let before = state.trip_events.len();
        state
            .trip_events
            .retain(|e| !(e.id == id && e.device_id == device_id));
        Ok(state.trip_events.len() < before)
    }
}
