use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, warn};

use super::Engine;
use crate::errors::Result;
use crate::metrics::{STORE_FAILURES_TOTAL, TRIPS_TOTAL};
use crate::model::{
    finite, Channel, CommandReason, RelayCommand, RelayState, TelemetrySample, TripEvent,
    TripLevel, TripThresholds,
};
use crate::store::Store;
use crate::transport::Transport;

/// Device-level readings as seen by trip protection.
///
/// Only energised channels count: current and power are summed over the ON
/// channels, voltage is taken from them (mean of both when both are ON).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripTotals {
    pub r1_on: bool,
    pub r2_on: bool,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
}

impl TripTotals {
    pub fn any_on(&self) -> bool {
        self.r1_on || self.r2_on
    }
}

pub fn compute_totals(sample: &TelemetrySample) -> TripTotals {
    let r1_on = sample.relay_state(Channel::One).is_on();
    let r2_on = sample.relay_state(Channel::Two).is_on();
    let one = sample.reading(Channel::One);
    let two = sample.reading(Channel::Two);
    let legacy_v = finite(sample.voltage);

    let voltage = match (r1_on, r2_on) {
        (true, true) => match (one.voltage, two.voltage) {
            (Some(v1), Some(v2)) => Some((v1 + v2) / 2.0),
            (v1, v2) => legacy_v.or(v1).or(v2),
        },
        (true, false) => one.voltage.or(legacy_v),
        (false, true) => two.voltage.or(legacy_v),
        (false, false) => legacy_v,
    };

    let any_on = r1_on || r2_on;
    let sum_on = |a: Option<f64>, b: Option<f64>| {
        let a = if r1_on { a.unwrap_or(0.0) } else { 0.0 };
        let b = if r2_on { b.unwrap_or(0.0) } else { 0.0 };
        any_on.then_some(a + b)
    };

    TripTotals {
        r1_on,
        r2_on,
        voltage,
        current: sum_on(one.current, two.current),
        power: sum_on(one.power, two.power),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub tag: &'static str,
    pub message: String,
}

pub fn check_violations(totals: &TripTotals, t: &TripThresholds) -> Vec<Violation> {
    let mut faults = Vec::new();
    let mut add = |tag: &'static str, message: String| faults.push(Violation { tag, message });

    if let Some(v) = totals.voltage {
        if let Some(min) = t.v_min.filter(|min| v < *min) {
            add("V_LOW", format!("Voltage low: {:.2} < {}", v, min));
        }
        if let Some(max) = t.v_max.filter(|max| v > *max) {
            add("V_HIGH", format!("Voltage high: {:.2} > {}", v, max));
        }
    }
    if let Some(i) = totals.current {
        if let Some(min) = t.i_min.filter(|min| i < *min) {
            add("I_LOW", format!("Current low: {:.3} < {}", i, min));
        }
        if let Some(max) = t.i_max.filter(|max| i > *max) {
            add("I_HIGH", format!("Current high: {:.3} > {}", i, max));
        }
    }
    if let Some(p) = totals.power {
        if let Some(min) = t.p_min.filter(|min| p < *min) {
            add("P_LOW", format!("Power low: {:.2} < {}", p, min));
        }
        if let Some(max) = t.p_max.filter(|max| p > *max) {
            add("P_HIGH", format!("Power high: {:.2} > {}", p, max));
        }
    }

    faults
}

impl<S: Store, T: Transport> Engine<S, T> {
    /// Latches and switches the device off when a configured bound is
    /// violated. Returns the fault code when this sample tripped.
    pub(super) async fn evaluate_trip(
        &self,
        sample: &TelemetrySample,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let device_id = sample.device_id.as_str();
        // Held from the settings read through switch-off; edits and resets wait
        let _guard = self.locks.lock_device(device_id).await;

        let Some(settings) = self.store.trip_settings(device_id).await? else {
            return Ok(None);
        };
        if !settings.thresholds.any() || settings.latched {
            return Ok(None);
        }

        let totals = compute_totals(sample);
        // A de-energised line reads as zero current and power
        if !totals.any_on() {
            return Ok(None);
        }

        let faults = check_violations(&totals, &settings.thresholds);
        if faults.is_empty() {
            return Ok(None);
        }

        let fault_code = faults.iter().map(|f| f.tag).collect::<Vec<_>>().join("|");
        let message = faults
            .iter()
            .map(|f| f.message.as_str())
            .collect::<Vec<_>>()
            .join(" • ");

        if !self.store.latch_trip(device_id, now, &message).await? {
            return Ok(None);
        }

        let event = TripEvent::new(device_id, TripLevel::Fault, "trip_triggered", now)
            .with_fault(&fault_code)
            .with_message(&message)
            .with_meta(json!({
                "v": totals.voltage,
                "i": totals.current,
                "p": totals.power,
                "relays": { "r1On": totals.r1_on, "r2On": totals.r2_on },
                "settings": settings.thresholds,
            }));
        if let Err(e) = self.store.insert_trip_event(&event).await {
            STORE_FAILURES_TOTAL.inc();
            error!("Failed to log trip event for {}: {}", device_id, e);
        }

        self.trip_all_off(device_id, &fault_code).await;

        TRIPS_TOTAL.inc();
        warn!("Trip on {}: {} ({})", device_id, fault_code, message);
        Ok(Some(fault_code))
    }

    /// Cancels the device's timers and switches both channels off.
    /// Runs under the caller's device lock.
    async fn trip_all_off(&self, device_id: &str, fault_code: &str) {
        if let Err(e) = self.store.cancel_timers(device_id, None).await {
            STORE_FAILURES_TOTAL.inc();
            error!("Failed to cancel timers of {} on trip: {}", device_id, e);
        }

        for ch in Channel::ALL {
            let command = RelayCommand::new(ch, RelayState::Off, CommandReason::Trip)
                .with_meta("fault", fault_code);
            self.publisher.publish(device_id, command).await;
        }
    }
}
