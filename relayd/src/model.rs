use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Error, Result};

/// One of the two relay outputs of a controller.
///
/// The API numbers them 1 and 2; the firmware labels the second relay 3, so
/// commands on the wire carry [`Channel::device_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Channel {
    One,
    Two,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::One, Channel::Two];

    pub fn number(self) -> u8 {
        match self {
            Channel::One => 1,
            Channel::Two => 2,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Channel::One => 0,
            Channel::Two => 1,
        }
    }

    pub fn device_label(self) -> u8 {
        match self {
            Channel::One => 1,
            Channel::Two => 3,
        }
    }

    pub fn from_device_label(label: i64) -> Option<Self> {
        match label {
            1 => Some(Channel::One),
            3 => Some(Channel::Two),
            _ => None,
        }
    }

    /// Lenient parse used for request bodies and path segments.
    pub fn parse(raw: i64) -> Result<Self> {
        match raw {
            1 => Ok(Channel::One),
            2 => Ok(Channel::Two),
            _ => Err(Error::validation("ch must be 1 or 2")),
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Channel::parse(i64::from(value))
    }
}

impl From<Channel> for u8 {
    fn from(ch: Channel) -> u8 {
        ch.number()
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RelayState {
    #[default]
    Off,
    On,
}

impl RelayState {
    pub fn parse(raw: i64) -> Result<Self> {
        match raw {
            0 => Ok(RelayState::Off),
            1 => Ok(RelayState::On),
            _ => Err(Error::validation("state must be 0 or 1")),
        }
    }

    pub fn is_on(self) -> bool {
        self == RelayState::On
    }

    pub fn flipped(self) -> Self {
        match self {
            RelayState::Off => RelayState::On,
            RelayState::On => RelayState::Off,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            RelayState::Off => 0,
            RelayState::On => 1,
        }
    }
}

impl TryFrom<u8> for RelayState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        RelayState::parse(i64::from(value))
    }
}

impl From<RelayState> for u8 {
    fn from(state: RelayState) -> u8 {
        state.as_i16() as u8
    }
}

impl From<bool> for RelayState {
    fn from(on: bool) -> Self {
        if on {
            RelayState::On
        } else {
            RelayState::Off
        }
    }
}

pub type RelayArray = [RelayState; 2];

/// Telemetry sample as published by the controller on `home/{device}/telemetry`.
///
/// Per-channel fields keep the firmware naming: `v1`.. for relay 1 and
/// `v3`.. for the second relay. The legacy totals are still sent by older
/// firmware and are used as fallbacks by trip evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub ts: Option<i64>,

    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub energy_wh: Option<f64>,

    pub v1: Option<f64>,
    pub i1: Option<f64>,
    pub p1: Option<f64>,
    pub e1_wh: Option<f64>,

    pub v3: Option<f64>,
    pub i3: Option<f64>,
    pub p3: Option<f64>,
    pub e3_wh: Option<f64>,

    pub clip_i1: Option<f64>,
    pub clip_i3: Option<f64>,

    pub rssi: Option<i32>,
    pub relay: Option<RelayArray>,

    #[serde(default)]
    pub received_at: Option<i64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw: serde_json::Value,
}

/// Electrical readings of a single channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelReading {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub energy_wh: Option<f64>,
}

impl TelemetrySample {
    pub fn reading(&self, ch: Channel) -> ChannelReading {
        match ch {
            Channel::One => ChannelReading {
                voltage: finite(self.v1),
                current: finite(self.i1),
                power: finite(self.p1),
                energy_wh: finite(self.e1_wh),
            },
            Channel::Two => ChannelReading {
                voltage: finite(self.v3),
                current: finite(self.i3),
                power: finite(self.p3),
                energy_wh: finite(self.e3_wh),
            },
        }
    }

    pub fn relay_state(&self, ch: Channel) -> RelayState {
        self.relay.map(|r| r[ch.index()]).unwrap_or_default()
    }
}

pub(crate) fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub device_id: String,
    pub last_seen: Option<i64>,
    pub relay: RelayArray,
}

impl DeviceState {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            last_seen: None,
            relay: [RelayState::Off; 2],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerMode {
    /// Relay on now, off when the timer ends.
    #[serde(rename = "on_for")]
    RunThenOff,
    /// Relay off now, on when the timer ends.
    #[serde(rename = "off_for")]
    OffThenRun,
}

impl TimerMode {
    pub fn start_state(self) -> RelayState {
        match self {
            TimerMode::RunThenOff => RelayState::On,
            TimerMode::OffThenRun => RelayState::Off,
        }
    }

    pub fn end_state(self) -> RelayState {
        self.start_state().flipped()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimerMode::RunThenOff => "on_for",
            TimerMode::OffThenRun => "off_for",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "on_for" => Ok(TimerMode::RunThenOff),
            "off_for" => Ok(TimerMode::OffThenRun),
            _ => Err(Error::validation("mode must be on_for/off_for")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    pub id: Uuid,
    pub device_id: String,
    pub ch: Channel,
    pub mode: TimerMode,
    pub end_at: DateTime<Utc>,
    pub end_state: RelayState,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Timer {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.end_at <= now
    }
}

pub const DEFAULT_SCHEDULE_ON: &str = "18:00";
pub const DEFAULT_SCHEDULE_OFF: &str = "23:00";

/// Daily on/off window for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub device_id: String,
    pub ch: Channel,
    pub enabled: bool,
    pub on: String,
    pub off: String,
    pub invert: bool,
    pub(crate) last_applied_state: RelayState,
}

impl Schedule {
    pub fn last_applied_state(&self) -> RelayState {
        self.last_applied_state
    }
}

/// Operator-editable part of a schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub on: String,
    pub off: String,
    pub invert: bool,
}

pub const DEFAULT_CUTOFF_LIMIT_MWH: f64 = 1000.0;

/// Energy budget since a baseline reading of the channel's Wh counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoffRule {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub ch: Channel,
    pub enabled: bool,
    #[serde(rename = "limitmWh")]
    pub limit_mwh: f64,
    #[serde(rename = "startWh")]
    pub(crate) start_wh: Option<f64>,
    #[serde(rename = "lastWh")]
    pub(crate) last_wh: Option<f64>,
    #[serde(rename = "consumedmWh")]
    pub(crate) consumed_mwh: f64,
}

impl CutoffRule {
    pub fn new(device_id: impl Into<String>, ch: Channel, enabled: bool, limit_mwh: f64) -> Self {
        Self {
            device_id: device_id.into(),
            ch,
            enabled,
            limit_mwh,
            start_wh: None,
            last_wh: None,
            consumed_mwh: 0.0,
        }
    }

    pub fn baseline_wh(&self) -> Option<f64> {
        self.start_wh
    }

    pub fn last_wh(&self) -> Option<f64> {
        self.last_wh
    }

    pub fn consumed_mwh(&self) -> f64 {
        self.consumed_mwh
    }

    pub fn progress(&self) -> CutoffProgress {
        CutoffProgress {
            start_wh: self.start_wh,
            last_wh: self.last_wh,
            consumed_mwh: self.consumed_mwh,
        }
    }

    pub(crate) fn apply(&mut self, progress: CutoffProgress) {
        self.start_wh = progress.start_wh;
        self.last_wh = progress.last_wh;
        self.consumed_mwh = progress.consumed_mwh;
    }
}

/// Engine-owned tracking fields of a [`CutoffRule`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CutoffProgress {
    pub start_wh: Option<f64>,
    pub last_wh: Option<f64>,
    pub consumed_mwh: f64,
}

impl CutoffProgress {
    pub fn reset() -> Self {
        Self::default()
    }

    pub fn baseline(reading_wh: f64) -> Self {
        Self {
            start_wh: Some(reading_wh),
            last_wh: Some(reading_wh),
            consumed_mwh: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripThresholds {
    pub v_min: Option<f64>,
    pub v_max: Option<f64>,
    pub i_min: Option<f64>,
    pub i_max: Option<f64>,
    pub p_min: Option<f64>,
    pub p_max: Option<f64>,
}

impl TripThresholds {
    pub fn any(&self) -> bool {
        [
            self.v_min, self.v_max, self.i_min, self.i_max, self.p_min, self.p_max,
        ]
        .iter()
        .any(Option::is_some)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSettings {
    pub device_id: String,
    #[serde(flatten)]
    pub thresholds: TripThresholds,
    pub(crate) latched: bool,
    pub(crate) latched_at: Option<DateTime<Utc>>,
    pub(crate) last_fault: String,
}

impl TripSettings {
    pub fn new(device_id: impl Into<String>, thresholds: TripThresholds) -> Self {
        Self {
            device_id: device_id.into(),
            thresholds,
            latched: false,
            latched_at: None,
            last_fault: String::new(),
        }
    }

    pub fn latched(&self) -> bool {
        self.latched
    }

    pub fn latched_at(&self) -> Option<DateTime<Utc>> {
        self.latched_at
    }

    pub fn last_fault(&self) -> &str {
        &self.last_fault
    }

    pub(crate) fn clear_latch(&mut self) {
        self.latched = false;
        self.latched_at = None;
        self.last_fault.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripLevel {
    Info,
    Success,
    Fault,
}

impl TripLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TripLevel::Info => "info",
            TripLevel::Success => "success",
            TripLevel::Fault => "fault",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => TripLevel::Success,
            "fault" => TripLevel::Fault,
            _ => TripLevel::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripEvent {
    pub id: Uuid,
    pub device_id: String,
    pub level: TripLevel,
    pub kind: String,
    pub fault: String,
    pub message: String,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TripEvent {
    pub fn new(
        device_id: impl Into<String>,
        level: TripLevel,
        kind: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            level,
            kind: kind.into(),
            fault: String::new(),
            message: String::new(),
            meta: serde_json::json!({}),
            created_at,
        }
    }

    pub fn with_fault(mut self, fault: impl Into<String>) -> Self {
        self.fault = fault.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandReason {
    Manual,
    Master,
    Timer,
    TimerStart,
    Schedule,
    EnergyBudget,
    Trip,
}

impl CommandReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandReason::Manual => "manual",
            CommandReason::Master => "master",
            CommandReason::Timer => "timer",
            CommandReason::TimerStart => "timer_start",
            CommandReason::Schedule => "schedule",
            CommandReason::EnergyBudget => "energy_budget",
            CommandReason::Trip => "trip",
        }
    }
}

/// Relay command sent to `home/{device}/cmd`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayCommand {
    pub ch: Channel,
    pub state: RelayState,
    pub reason: CommandReason,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl RelayCommand {
    pub fn new(ch: Channel, state: RelayState, reason: CommandReason) -> Self {
        Self {
            ch,
            state,
            reason,
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    /// Wire payload: `{"ch": 1|3, "state": 0|1, "reason": "...", ...meta}`.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut body = self.meta.clone();
        body.insert("ch".into(), self.ch.device_label().into());
        body.insert("state".into(), u8::from(self.state).into());
        body.insert("reason".into(), self.reason.as_str().into());
        serde_json::Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_parses_firmware_payload() {
        let payload = r#"{
            "deviceId": "esp32_001", "ts": 1700000000,
            "voltage": 230.1, "current": 0.4, "power": 92.0, "energyWh": 12.5,
            "v1": 230.0, "i1": 0.25, "p1": 57.5, "e1Wh": 7.5,
            "v3": 231.0, "i3": 0.15, "p3": 34.6, "e3Wh": 5.0,
            "rssi": -61, "relay": [1, 0]
        }"#;

        let sample: TelemetrySample = serde_json::from_str(payload).unwrap();

        assert_eq!(sample.device_id, "esp32_001");
        assert_eq!(sample.ts, Some(1_700_000_000));
        assert_eq!(sample.reading(Channel::Two).energy_wh, Some(5.0));
        assert_eq!(sample.relay_state(Channel::One), RelayState::On);
        assert_eq!(sample.relay_state(Channel::Two), RelayState::Off);
    }

    #[test]
    fn test_sample_rejects_bad_relay_value() {
        let payload = r#"{"deviceId": "dev1", "relay": [2, 0]}"#;
        assert!(serde_json::from_str::<TelemetrySample>(payload).is_err());
    }

    #[test]
    fn test_command_payload_uses_firmware_label() {
        let cmd = RelayCommand::new(Channel::Two, RelayState::Off, CommandReason::Trip)
            .with_meta("fault", "V_HIGH");

        let payload = cmd.to_payload();

        assert_eq!(payload["ch"], 3);
        assert_eq!(payload["state"], 0);
        assert_eq!(payload["reason"], "trip");
        assert_eq!(payload["fault"], "V_HIGH");
    }

    #[test]
    fn test_timer_mode_states() {
        assert_eq!(TimerMode::RunThenOff.start_state(), RelayState::On);
        assert_eq!(TimerMode::RunThenOff.end_state(), RelayState::Off);
        assert_eq!(TimerMode::OffThenRun.start_state(), RelayState::Off);
        assert_eq!(TimerMode::OffThenRun.end_state(), RelayState::On);
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!(Channel::parse(1).unwrap(), Channel::One);
        assert_eq!(Channel::parse(2).unwrap(), Channel::Two);
        assert!(Channel::parse(3).is_err());
        assert_eq!(Channel::from_device_label(3), Some(Channel::Two));
    }
}
