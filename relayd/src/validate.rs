use crate::errors::{Error, Result};
use crate::model::{TelemetrySample, TripThresholds};

pub const MAX_TIMER_SECS: u64 = 12 * 60 * 60;
pub const MIN_CUTOFF_LIMIT_MWH: f64 = 1.0;

/// Validates an inbound telemetry sample
pub fn validate(sample: &TelemetrySample) -> Result<()> {
    if sample.device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    let fields = [
        ("voltage", sample.voltage),
        ("current", sample.current),
        ("power", sample.power),
        ("energyWh", sample.energy_wh),
        ("v1", sample.v1),
        ("i1", sample.i1),
        ("p1", sample.p1),
        ("e1Wh", sample.e1_wh),
        ("v3", sample.v3),
        ("i3", sample.i3),
        ("p3", sample.p3),
        ("e3Wh", sample.e3_wh),
    ];
    for (name, value) in fields {
        if let Some(v) = value {
            if !v.is_finite() {
                return Err(Error::Validation(format!("{} is not a finite number", name)));
            }
        }
    }

    // Energy counters are monotonic meters
    for (name, value) in [("energyWh", sample.energy_wh), ("e1Wh", sample.e1_wh), ("e3Wh", sample.e3_wh)] {
        if value.is_some_and(|v| v < 0.0) {
            return Err(Error::Validation(format!("{} cannot be negative", name)));
        }
    }

    Ok(())
}

/// Total timer duration from the `minutes` + `seconds` request fields.
pub fn timer_duration(minutes: Option<f64>, seconds: Option<f64>) -> Result<u64> {
    let m = minutes.unwrap_or(0.0);
    let s = seconds.unwrap_or(0.0);
    if !m.is_finite() || !s.is_finite() || m < 0.0 || s < 0.0 || s > 59.0 {
        return Err(Error::validation("minutes>=0 and seconds 0..59 required"));
    }

    let total = (m * 60.0 + s).floor();
    if total <= 0.0 || total > MAX_TIMER_SECS as f64 {
        return Err(Error::Validation(format!(
            "duration must be 1..{} seconds",
            MAX_TIMER_SECS
        )));
    }

    Ok(total as u64)
}

pub fn timer_secs(duration_secs: u64) -> Result<u64> {
    if duration_secs == 0 || duration_secs > MAX_TIMER_SECS {
        return Err(Error::Validation(format!(
            "duration must be 1..{} seconds",
            MAX_TIMER_SECS
        )));
    }
    Ok(duration_secs)
}

/// Strict `HH:MM` check for schedule edits.
pub fn clock_time(raw: &str) -> Result<()> {
    let invalid = || Error::Validation(format!("invalid time '{}', expected HH:MM", raw));
    let (h, m) = raw.split_once(':').ok_or_else(invalid)?;
    let h: u32 = h.trim().parse().map_err(|_| invalid())?;
    let m: u32 = m.trim().parse().map_err(|_| invalid())?;
    if h > 23 || m > 59 {
        return Err(invalid());
    }
    Ok(())
}

pub fn cutoff_limit(limit_mwh: f64) -> Result<f64> {
    if !limit_mwh.is_finite() || limit_mwh < MIN_CUTOFF_LIMIT_MWH {
        return Err(Error::validation("limitmWh must be >= 1"));
    }
    Ok(limit_mwh)
}

pub fn trip_thresholds(t: &TripThresholds) -> Result<()> {
    let pairs = [(t.v_min, t.v_max), (t.i_min, t.i_max), (t.p_min, t.p_max)];
    let bad = pairs
        .iter()
        .any(|pair| matches!(pair, (Some(min), Some(max)) if min >= max));
    if bad {
        return Err(Error::validation("Min must be < Max (where both are set)."));
    }

    let all = [t.v_min, t.v_max, t.i_min, t.i_max, t.p_min, t.p_max];
    if all.iter().flatten().any(|v| !v.is_finite()) {
        return Err(Error::validation("thresholds must be finite numbers"));
    }

    Ok(())
}
