//! Outbound side of the device link.

use tokio::sync::mpsc;

use crate::errors::{Error, Result};
use crate::model::RelayCommand;

/// Fire-and-forget command sink. `send` must not wait for the device.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, device_id: &str, command: &RelayCommand) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// A command as it left the publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub device_id: String,
    pub command: RelayCommand,
}

/// Forwards commands into an in-process channel instead of a broker.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<SentCommand>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SentCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, device_id: &str, command: &RelayCommand) -> Result<()> {
        self.tx
            .send(SentCommand {
                device_id: device_id.to_string(),
                command: command.clone(),
            })
            .map_err(|_| Error::ChannelSend)
    }

    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}
