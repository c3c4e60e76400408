use tracing::{debug, error, info};

use super::Engine;
use crate::metrics::{CUTOFFS_FIRED_TOTAL, STORE_FAILURES_TOTAL};
use crate::model::{
    Channel, CommandReason, CutoffProgress, CutoffRule, RelayCommand, RelayState, TelemetrySample,
};
use crate::store::Store;
use crate::transport::Transport;

/// Tolerance when comparing Wh counter readings for a reset.
pub const ENERGY_EPSILON_WH: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CutoffDecision {
    /// No usable reading or limit for this sample.
    Skip,
    /// First reading, or the device counter went backwards.
    Rebaseline(CutoffProgress),
    /// Budget still open.
    Track(CutoffProgress),
    /// Budget used up while the relay is on.
    Fire { consumed_mwh: f64 },
}

/// One step of an energy budget rule for a new counter reading.
pub fn evaluate_cutoff(rule: &CutoffRule, reading_wh: Option<f64>, relay: RelayState) -> CutoffDecision {
    let Some(reading) = reading_wh.filter(|r| r.is_finite()) else {
        return CutoffDecision::Skip;
    };
    if !rule.limit_mwh.is_finite() || rule.limit_mwh <= 0.0 {
        return CutoffDecision::Skip;
    }

    let start = match (rule.start_wh, rule.last_wh) {
        (Some(start), Some(last)) if reading + ENERGY_EPSILON_WH >= last => start,
        _ => return CutoffDecision::Rebaseline(CutoffProgress::baseline(reading)),
    };

    let consumed_mwh = ((reading - start) * 1000.0).max(0.0);
    if relay.is_on() && consumed_mwh >= rule.limit_mwh {
        return CutoffDecision::Fire { consumed_mwh };
    }

    CutoffDecision::Track(CutoffProgress {
        start_wh: Some(start),
        last_wh: Some(reading),
        consumed_mwh,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl<S: Store, T: Transport> Engine<S, T> {
    /// Runs every enabled budget rule of the sample's device. Returns the
    /// channels that were switched off.
    pub(super) async fn evaluate_cutoffs(&self, sample: &TelemetrySample) -> Vec<Channel> {
        let device_id = sample.device_id.as_str();
        let rules = match self.store.cutoffs(device_id).await {
            Ok(rules) => rules,
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();
                error!("Failed to load cutoff rules for {}: {}", device_id, e);
                return Vec::new();
            }
        };

        let mut fired = Vec::new();
        for ch in rules.iter().filter(|r| r.enabled).map(|r| r.ch) {
            let _guard = self.locks.lock(device_id, ch).await;

            // Re-read under the lock: an edit may have reset the baseline
            let rule = match self.store.cutoff(device_id, ch).await {
                Ok(Some(rule)) if rule.enabled => rule,
                Ok(_) => continue,
                Err(e) => {
                    STORE_FAILURES_TOTAL.inc();
                    error!("Failed to reload cutoff {} ch={}: {}", device_id, ch, e);
                    continue;
                }
            };

            let decision = evaluate_cutoff(&rule, sample.reading(ch).energy_wh, sample.relay_state(ch));
            let progress = match decision {
                CutoffDecision::Skip => continue,
                CutoffDecision::Rebaseline(progress) => {
                    debug!(
                        "Cutoff baseline for {} ch={} set to {:?} Wh",
                        device_id, ch, progress.start_wh
                    );
                    progress
                }
                CutoffDecision::Track(progress) => progress,
                CutoffDecision::Fire { consumed_mwh } => {
                    let command = RelayCommand::new(ch, RelayState::Off, CommandReason::EnergyBudget)
                        .with_meta("consumedmWh", round2(consumed_mwh))
                        .with_meta("limitmWh", rule.limit_mwh);
                    self.publisher.publish(device_id, command).await;

                    CUTOFFS_FIRED_TOTAL.inc();
                    info!(
                        "Energy budget reached on {} ch={}: {:.2} >= {} mWh",
                        device_id, ch, consumed_mwh, rule.limit_mwh
                    );
                    fired.push(ch);
                    CutoffProgress::reset()
                }
            };

            if let Err(e) = self.store.save_cutoff_progress(device_id, ch, progress).await {
                STORE_FAILURES_TOTAL.inc();
                error!("Failed to save cutoff progress for {} ch={}: {}", device_id, ch, e);
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(limit: f64) -> CutoffRule {
        CutoffRule::new("dev1", Channel::One, true, limit)
    }

    fn step(rule: &mut CutoffRule, reading: f64, relay: RelayState) -> CutoffDecision {
        let decision = evaluate_cutoff(rule, Some(reading), relay);
        match decision {
            CutoffDecision::Rebaseline(p) | CutoffDecision::Track(p) => rule.apply(p),
            CutoffDecision::Fire { .. } => rule.apply(CutoffProgress::reset()),
            CutoffDecision::Skip => {}
        }
        decision
    }

    #[test]
    fn test_budget_accumulates_and_fires_once() {
        let mut r = rule(1000.0);

        assert!(matches!(step(&mut r, 0.0, RelayState::On), CutoffDecision::Rebaseline(_)));
        assert_eq!(r.consumed_mwh(), 0.0);

        assert!(matches!(step(&mut r, 0.4, RelayState::On), CutoffDecision::Track(_)));
        assert!((r.consumed_mwh() - 400.0).abs() < 1e-6);

        match step(&mut r, 1.1, RelayState::On) {
            CutoffDecision::Fire { consumed_mwh } => assert!((consumed_mwh - 1100.0).abs() < 1e-6),
            other => panic!("expected fire, got {:?}", other),
        }
        assert_eq!(r.baseline_wh(), None);
        assert_eq!(r.last_wh(), None);
        assert_eq!(r.consumed_mwh(), 0.0);

        // Next reading only re-baselines
        assert!(matches!(step(&mut r, 1.2, RelayState::On), CutoffDecision::Rebaseline(_)));
    }

    #[test]
    fn test_relay_off_tracks_without_firing() {
        let mut r = rule(100.0);
        step(&mut r, 1.0, RelayState::Off);

        let decision = step(&mut r, 2.0, RelayState::Off);
        assert!(matches!(decision, CutoffDecision::Track(_)));
        assert!((r.consumed_mwh() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_counter_rollover_rebaselines() {
        let mut r = rule(1000.0);
        step(&mut r, 5.0, RelayState::On);
        step(&mut r, 5.5, RelayState::On);

        let decision = step(&mut r, 0.2, RelayState::On);
        assert_eq!(decision, CutoffDecision::Rebaseline(CutoffProgress::baseline(0.2)));
        assert_eq!(r.consumed_mwh(), 0.0);
    }

    #[test]
    fn test_tiny_backwards_jitter_is_tolerated() {
        let mut r = rule(1000.0);
        step(&mut r, 5.0, RelayState::On);
        let decision = step(&mut r, 5.0 - ENERGY_EPSILON_WH / 2.0, RelayState::On);
        assert!(matches!(decision, CutoffDecision::Track(_)));
    }

    #[test]
    fn test_missing_reading_or_bad_limit_is_skipped() {
        let r = rule(1000.0);
        assert_eq!(evaluate_cutoff(&r, None, RelayState::On), CutoffDecision::Skip);
        assert_eq!(evaluate_cutoff(&r, Some(f64::NAN), RelayState::On), CutoffDecision::Skip);
        assert_eq!(evaluate_cutoff(&rule(0.0), Some(1.0), RelayState::On), CutoffDecision::Skip);
    }
}
