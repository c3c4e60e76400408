use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::metrics::{COMMANDS_TOTAL, COMMAND_FAILURES_TOTAL, STORE_FAILURES_TOTAL};
use crate::model::RelayCommand;
use crate::store::Store;
use crate::transport::Transport;

/// Single chokepoint for relay changes.
///
/// Sends the command and then mirrors the desired state into the device
/// record, whether or not the device ever acknowledges it.
pub struct Publisher<S, T> {
    store: Arc<S>,
    transport: T,
}

impl<S: Store, T: Transport> Publisher<S, T> {
    pub fn new(store: Arc<S>, transport: T) -> Self {
        Self { store, transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Never fails: transport and store errors are logged and counted.
    pub async fn publish(&self, device_id: &str, command: RelayCommand) {
        let reason = command.reason.as_str();
        match self.transport.send(device_id, &command) {
            Ok(()) => {
                COMMANDS_TOTAL.with_label_values(&[reason]).inc();
                debug!(
                    "Published ch={} state={} reason={} to {}",
                    command.ch,
                    u8::from(command.state),
                    reason,
                    device_id
                );
            }
            Err(e) => {
                COMMAND_FAILURES_TOTAL.inc();
                warn!(
                    "Failed to publish ch={} reason={} to {}: {}",
                    command.ch, reason, device_id, e
                );
            }
        }

        if let Err(e) = self
            .store
            .set_relay(device_id, command.ch, command.state)
            .await
        {
            STORE_FAILURES_TOTAL.inc();
            error!("Failed to update relay state of {}: {}", device_id, e);
        }
    }
}
