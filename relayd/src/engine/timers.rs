use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use super::Engine;
use crate::errors::Result;
use crate::metrics::{STORE_FAILURES_TOTAL, TIMERS_FIRED_TOTAL};
use crate::model::{CommandReason, RelayCommand};
use crate::store::Store;
use crate::transport::Transport;

impl<S: Store, T: Transport> Engine<S, T> {
    /// Fires every active timer whose end time has passed.
    ///
    /// A timer is claimed (deactivated) under its channel lock before the
    /// command goes out, so a timer cancelled by a concurrent manual command
    /// never fires and a claimed timer fires once. Returns the number fired.
    pub async fn sweep_timers(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_timers(now).await?;
        let mut fired = 0;

        for timer in due {
            let _guard = self.locks.lock(&timer.device_id, timer.ch).await;

            match self.store.deactivate_timer(timer.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Timer {} was cancelled before it fired", timer.id);
                    continue;
                }
                Err(e) => {
                    STORE_FAILURES_TOTAL.inc();
                    error!("Failed to claim timer {}: {}", timer.id, e);
                    continue;
                }
            }

            let command = RelayCommand::new(timer.ch, timer.end_state, CommandReason::Timer)
                .with_meta("mode", timer.mode.as_str());
            self.publisher.publish(&timer.device_id, command).await;

            TIMERS_FIRED_TOTAL.inc();
            info!(
                "Timer {} fired: {} ch={} -> {}",
                timer.id,
                timer.device_id,
                timer.ch,
                u8::from(timer.end_state)
            );
            fired += 1;
        }

        Ok(fired)
    }
}
