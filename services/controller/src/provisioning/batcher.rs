//! Provisioning batch windows.
//!
//! Unschedulable-pod notifications are coalesced: a batch opens on the
//! first trigger and closes once no trigger arrived for the idle window, or
//! when the maximum window has passed since it opened.

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::config::BatcherConfig;

/// Triggers beyond this many are dropped; a batch is already pending.
const TRIGGER_BUFFER: usize = 1024;

/// Sending half, held by whatever learns about unschedulable pods.
#[derive(Debug, Clone)]
pub struct BatchTrigger {
    tx: mpsc::Sender<()>,
}

impl BatchTrigger {
    /// Note that a pod needs capacity.
    pub fn trigger(&self) {
        // A full buffer already guarantees a batch.
        let _ = self.tx.try_send(());
    }
}

/// Receiving half, owned by the provisioning loop.
#[derive(Debug)]
pub struct Batcher {
    config: BatcherConfig,
    rx: mpsc::Receiver<()>,
}

/// Create a connected trigger and batcher.
pub fn batcher(config: BatcherConfig) -> (BatchTrigger, Batcher) {
    let (tx, rx) = mpsc::channel(TRIGGER_BUFFER);
    (BatchTrigger { tx }, Batcher { config, rx })
}

impl Batcher {
    /// Wait for the next batch to close. Returns the number of triggers it
    /// coalesced, or `None` once every trigger has been dropped.
    pub async fn wait(&mut self) -> Option<usize> {
        self.rx.recv().await?;

        let opened = Instant::now();
        let hard_deadline = opened + self.config.max;
        let mut triggers = 1;

        loop {
            let deadline = (Instant::now() + self.config.idle).min(hard_deadline);
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(())) => {
                    triggers += 1;
                    if Instant::now() >= hard_deadline {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        Some(triggers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> BatcherConfig {
        BatcherConfig {
            idle: Duration::from_secs(1),
            max: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_window_closes_batch() {
        let (trigger, mut batcher) = batcher(config());
        let started = Instant::now();

        trigger.trigger();
        trigger.trigger();
        assert_eq!(batcher.wait().await, Some(2));
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_window_caps_batch() {
        let (trigger, mut batcher) = batcher(config());
        let started = Instant::now();

        let feeder = tokio::spawn(async move {
            for _ in 0..30 {
                trigger.trigger();
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });

        let triggers = batcher.wait().await.unwrap();
        assert!(triggers >= 20);
        assert!(started.elapsed() <= Duration::from_secs(10));
        feeder.abort();
    }

    #[tokio::test]
    async fn test_closed_when_triggers_dropped() {
        let (trigger, mut batcher) = batcher(config());
        drop(trigger);
        assert_eq!(batcher.wait().await, None);
    }
}
