use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::metrics::TELEMETRY_LATENCY_SECONDS;
use crate::model::TelemetrySample;
use crate::store::Store;
use crate::transport::Transport;

/// Single consumer of the telemetry queue: samples are evaluated one at a
/// time in arrival order.
pub async fn run_ingest<S: Store, T: Transport>(
    mut rx: mpsc::Receiver<TelemetrySample>,
    engine: Arc<Engine<S, T>>,
) {
    info!("Starting telemetry consumer");

    while let Some(sample) = rx.recv().await {
        let start = Instant::now();
        let device_id = sample.device_id.clone();

        match engine.handle_telemetry(sample, Utc::now()).await {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                warn!("Telemetry from {} not evaluated: {}", device_id, e)
            }
            Err(e) => error!("Failed to evaluate telemetry from {}: {}", device_id, e),
        }

        TELEMETRY_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
    }

    info!("Telemetry queue closed, consumer stopped");
}
