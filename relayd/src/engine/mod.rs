//! Automation engine.
//!
//! Three evaluation paths share the rule stores:
//! - the timer sweep and the schedule sweep, driven by the wall clock
//!   (see [`crate::sweeper`]);
//! - the telemetry path, run once per inbound sample in arrival order
//!   (energy budget cutoffs, then trip protection).
//!
//! Operator commands from the REST layer go through the same engine so that
//! every relay change passes the channel locks and the [`Publisher`].
//!
//! Every evaluation takes `now` explicitly; callers pass `Utc::now()`.

mod commands;
mod cutoff;
mod schedule;
mod telemetry;
mod timers;
mod trip;

pub use commands::{AutomationSnapshot, CutoffView, PerChannel, ScheduleView, TimerView};
pub use cutoff::{evaluate_cutoff, CutoffDecision, ENERGY_EPSILON_WH};
pub use schedule::{desired_state, is_within_window, minute_of_day, minutes_from_hhmm};
pub use telemetry::TelemetryOutcome;
pub use trip::{check_violations, compute_totals, TripTotals, Violation};

use std::sync::Arc;

use chrono::FixedOffset;

use crate::locks::ChannelLocks;
use crate::publisher::Publisher;
use crate::store::Store;
use crate::transport::Transport;

pub struct Engine<S, T> {
    store: Arc<S>,
    publisher: Publisher<S, T>,
    locks: ChannelLocks,
    schedule_offset: FixedOffset,
}

impl<S: Store, T: Transport> Engine<S, T> {
    pub fn new(store: Arc<S>, transport: T, schedule_offset: FixedOffset) -> Self {
        Self {
            publisher: Publisher::new(store.clone(), transport),
            store,
            locks: ChannelLocks::new(),
            schedule_offset,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        self.publisher.transport()
    }

    pub fn schedule_offset(&self) -> FixedOffset {
        self.schedule_offset
    }
}
