use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::Channel;

/// Serializes mutations of one (device, channel).
///
/// Sweeps, telemetry evaluation and operator commands all take the channel
/// lock before a read-modify-write on its rules or relay. Device-wide
/// operations take both channels in [`Channel::ALL`] order.
#[derive(Default)]
pub struct ChannelLocks {
    locks: Mutex<HashMap<(String, Channel), Arc<AsyncMutex<()>>>>,
}

pub struct DeviceGuard {
    _guards: [OwnedMutexGuard<()>; 2],
}

impl ChannelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, device_id: &str, ch: Channel) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry((device_id.to_string(), ch))
            .or_default()
            .clone()
    }

    pub async fn lock(&self, device_id: &str, ch: Channel) -> OwnedMutexGuard<()> {
        self.slot(device_id, ch).lock_owned().await
    }

    pub async fn lock_device(&self, device_id: &str) -> DeviceGuard {
        let first = self.lock(device_id, Channel::ALL[0]).await;
        let second = self.lock(device_id, Channel::ALL[1]).await;
        DeviceGuard {
            _guards: [first, second],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_channel_is_exclusive() {
        let locks = Arc::new(ChannelLocks::new());
        let guard = locks.lock("dev1", Channel::One).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("dev1", Channel::One).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let locks = ChannelLocks::new();
        let _one = locks.lock("dev1", Channel::One).await;
        let two = tokio::time::timeout(Duration::from_millis(50), locks.lock("dev1", Channel::Two)).await;
        assert!(two.is_ok());
    }

    #[tokio::test]
    async fn test_device_lock_waits_for_channel() {
        let locks = Arc::new(ChannelLocks::new());
        let guard = locks.lock("dev1", Channel::Two).await;

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), locks.lock_device("dev1")).await;
        assert!(blocked.is_err());

        drop(guard);
        let _device = locks.lock_device("dev1").await;
    }
}
