use chrono::{DateTime, FixedOffset, Timelike, Utc};
use tracing::{error, info};

use super::Engine;
use crate::errors::Result;
use crate::metrics::{SCHEDULES_APPLIED_TOTAL, STORE_FAILURES_TOTAL};
use crate::model::{CommandReason, RelayCommand, RelayState, Schedule};
use crate::store::Store;
use crate::transport::Transport;

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Minute of day for `HH:MM`, clamped to `0..=1439`. Garbage reads as 0.
pub fn minutes_from_hhmm(raw: &str) -> u16 {
    let Some((h, m)) = raw.split_once(':') else {
        return 0;
    };
    match (h.trim().parse::<i64>(), m.trim().parse::<i64>()) {
        (Ok(h), Ok(m)) => (h * 60 + m).clamp(0, MINUTES_PER_DAY - 1) as u16,
        _ => 0,
    }
}

/// `[on, off)`, wrapping past midnight when `on > off`. Empty when equal.
pub fn is_within_window(now: u16, on: u16, off: u16) -> bool {
    if on == off {
        return false;
    }
    if on < off {
        now >= on && now < off
    } else {
        now >= on || now < off
    }
}

pub fn minute_of_day(now: DateTime<Utc>, offset: FixedOffset) -> u16 {
    let local = now.with_timezone(&offset);
    (local.hour() * 60 + local.minute()) as u16
}

pub fn desired_state(schedule: &Schedule, now_minute: u16) -> RelayState {
    let on = minutes_from_hhmm(&schedule.on);
    let off = minutes_from_hhmm(&schedule.off);
    let desired = RelayState::from(is_within_window(now_minute, on, off));
    if schedule.invert {
        desired.flipped()
    } else {
        desired
    }
}

impl<S: Store, T: Transport> Engine<S, T> {
    /// Applies enabled schedules whose desired state differs from the last
    /// state they applied. Returns the number of commands published.
    pub async fn sweep_schedules(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_minute = minute_of_day(now, self.schedule_offset);
        let schedules = self.store.enabled_schedules().await?;
        let mut applied = 0;

        for schedule in schedules {
            let desired = desired_state(&schedule, now_minute);
            if desired == schedule.last_applied_state {
                continue;
            }

            let _guard = self.locks.lock(&schedule.device_id, schedule.ch).await;
            let claimed = self
                .store
                .mark_schedule_applied(
                    &schedule.device_id,
                    schedule.ch,
                    schedule.last_applied_state,
                    desired,
                )
                .await;
            match claimed {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    STORE_FAILURES_TOTAL.inc();
                    error!(
                        "Failed to record schedule state for {} ch={}: {}",
                        schedule.device_id, schedule.ch, e
                    );
                    continue;
                }
            }

            self.publisher
                .publish(
                    &schedule.device_id,
                    RelayCommand::new(schedule.ch, desired, CommandReason::Schedule),
                )
                .await;

            SCHEDULES_APPLIED_TOTAL.inc();
            info!(
                "Schedule applied: {} ch={} -> {} ({}-{}, minute {})",
                schedule.device_id,
                schedule.ch,
                u8::from(desired),
                schedule.on,
                schedule.off,
                now_minute
            );
            applied += 1;
        }

        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Channel;
    use chrono::TimeZone;

    fn schedule(on: &str, off: &str, invert: bool) -> Schedule {
        Schedule {
            device_id: "dev1".into(),
            ch: Channel::One,
            enabled: true,
            on: on.into(),
            off: off.into(),
            invert,
            last_applied_state: RelayState::Off,
        }
    }

    #[test]
    fn test_minutes_from_hhmm() {
        assert_eq!(minutes_from_hhmm("00:00"), 0);
        assert_eq!(minutes_from_hhmm("18:30"), 1110);
        assert_eq!(minutes_from_hhmm("23:59"), 1439);
        assert_eq!(minutes_from_hhmm("25:00"), 1439);
        assert_eq!(minutes_from_hhmm("xx:10"), 0);
        assert_eq!(minutes_from_hhmm(""), 0);
    }

    #[test]
    fn test_empty_window_is_always_off() {
        for on in [0u16, 17, 720, 1439] {
            for now in 0..1440u16 {
                assert!(!is_within_window(now, on, on));
            }
        }
    }

    #[test]
    fn test_same_day_window() {
        assert!(!is_within_window(1079, 1080, 1380));
        assert!(is_within_window(1080, 1080, 1380));
        assert!(is_within_window(1379, 1080, 1380));
        assert!(!is_within_window(1380, 1080, 1380));
    }

    #[test]
    fn test_midnight_crossing_window() {
        let (on, off) = (1320u16, 360u16);
        for now in 0..1440u16 {
            let expected = now >= on || now < off;
            assert_eq!(is_within_window(now, on, off), expected, "minute {}", now);
        }
    }

    #[test]
    fn test_invert_flips_desired_state() {
        let normal = schedule("08:00", "09:00", false);
        let inverted = schedule("08:00", "09:00", true);
        assert_eq!(desired_state(&normal, 8 * 60 + 30), RelayState::On);
        assert_eq!(desired_state(&inverted, 8 * 60 + 30), RelayState::Off);
        assert_eq!(desired_state(&inverted, 12 * 60), RelayState::On);
    }

    #[test]
    fn test_minute_of_day_uses_offset() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 20, 15, 0).unwrap();
        let dhaka = FixedOffset::east_opt(6 * 3600).unwrap();
        assert_eq!(minute_of_day(now, dhaka), 2 * 60 + 15);
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(minute_of_day(now, utc), 20 * 60 + 15);
    }
}
