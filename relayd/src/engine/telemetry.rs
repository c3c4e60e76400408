use chrono::{DateTime, Utc};
use tracing::{debug, error};

use super::Engine;
use crate::errors::Result;
use crate::metrics::STORE_FAILURES_TOTAL;
use crate::model::{Channel, RelayState, TelemetrySample};
use crate::store::Store;
use crate::transport::Transport;

/// What a single telemetry sample triggered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryOutcome {
    pub cutoffs_fired: Vec<Channel>,
    pub trip: Option<String>,
}

impl<S: Store, T: Transport> Engine<S, T> {
    /// Stores a validated sample, refreshes the device record and runs the
    /// per-sample rules: energy budgets first, then trip protection.
    pub async fn handle_telemetry(
        &self,
        mut sample: TelemetrySample,
        now: DateTime<Utc>,
    ) -> Result<TelemetryOutcome> {
        sample.ts.get_or_insert(now.timestamp());
        sample.received_at = Some(now.timestamp_millis());

        let reported = sample.relay;
        if reported.is_none() {
            // Older firmware omits the relay array; fall back to the last known state
            let known = match self.store.device(&sample.device_id).await {
                Ok(device) => device.map(|d| d.relay),
                Err(e) => {
                    STORE_FAILURES_TOTAL.inc();
                    error!("Failed to load device {}: {}", sample.device_id, e);
                    None
                }
            };
            sample.relay = Some(known.unwrap_or([RelayState::Off; 2]));
        }

        if let Err(e) = self.store.insert_sample(&sample).await {
            STORE_FAILURES_TOTAL.inc();
            error!("Failed to store telemetry from {}: {}", sample.device_id, e);
        }

        if let Err(e) = self
            .store
            .record_seen(&sample.device_id, now.timestamp(), reported)
            .await
        {
            STORE_FAILURES_TOTAL.inc();
            error!("Failed to update device {}: {}", sample.device_id, e);
        }

        let cutoffs_fired = self.evaluate_cutoffs(&sample).await;
        let trip = self.evaluate_trip(&sample, now).await?;

        debug!(
            "Telemetry from {} processed (cutoffs fired: {}, trip: {:?})",
            sample.device_id,
            cutoffs_fired.len(),
            trip
        );
        Ok(TelemetryOutcome { cutoffs_fired, trip })
    }
}
