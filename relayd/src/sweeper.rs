//! Wall-clock drivers for the timer and schedule sweeps.
//!
//! Each sweep runs inline in its own loop. When a pass takes longer than the
//! interval the missed ticks are skipped, so passes never overlap or pile up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::errors::Result;
use crate::metrics::{SWEEP_LATENCY_SECONDS, SWEEP_OVERRUNS_TOTAL};
use crate::store::Store;
use crate::transport::Transport;

pub async fn run_periodic<F, Fut>(name: &'static str, period: Duration, mut pass: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize>>,
{
    info!("{} sweep started (interval: {:?})", name, period);

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let start = Instant::now();
        match pass().await {
            Ok(0) => {}
            Ok(n) => debug!("{} sweep applied {} change(s)", name, n),
            Err(e) => error!("{} sweep failed: {}", name, e),
        }

        let elapsed = start.elapsed();
        SWEEP_LATENCY_SECONDS
            .with_label_values(&[name])
            .observe(elapsed.as_secs_f64());
        if elapsed > period {
            SWEEP_OVERRUNS_TOTAL.with_label_values(&[name]).inc();
            warn!("{} sweep took {:?}, longer than its {:?} interval", name, elapsed, period);
        }
    }
}

pub async fn run_timer_sweep<S: Store, T: Transport>(engine: Arc<Engine<S, T>>, period: Duration) {
    run_periodic("timer", period, || engine.sweep_timers(Utc::now())).await
}

pub async fn run_schedule_sweep<S: Store, T: Transport>(
    engine: Arc<Engine<S, T>>,
    period: Duration,
) {
    run_periodic("schedule", period, || engine.sweep_schedules(Utc::now())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_periodic_runs_each_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let handle = tokio::spawn(async move {
            run_periodic("test", Duration::from_millis(100), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        handle.abort();

        // Ticks at 0, 100, 200, 300 ms
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_pass_skips_missed_ticks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let handle = tokio::spawn(async move {
            run_periodic("slow", Duration::from_millis(100), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    Ok(1)
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(520)).await;
        handle.abort();

        // Six ticks elapsed but each 250 ms pass swallows the ones it overlaps
        let calls = calls.load(Ordering::SeqCst);
        assert!((2..=3).contains(&calls), "ran {} passes", calls);
    }
}
