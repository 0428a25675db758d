use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::queue::Queue;

/// Periodically runs [`Queue::reclaim`].
pub struct Reclaimer {
    interval: Duration,
}

impl Reclaimer {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Interval taken from the queue's own configuration.
    pub fn for_queue(queue: &Queue) -> Self {
        Self::new(queue.config().reclaim_interval_ms)
    }

    /// Ticks until `shutdown` is cancelled. A fatal-class error stops the
    /// loop; anything else is logged and retried on the next tick. Returns
    /// the number of passes run.
    pub async fn run(&self, queue: Arc<Queue>, shutdown: CancellationToken) -> u64 {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut passes = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(queue = %queue.config().name, passes, "Reclaimer stopping");
                    break;
                }
                _ = interval.tick() => {
                    passes += 1;
                    match queue.reclaim(Utc::now()) {
                        Ok(report) if !report.is_empty() => {
                            tracing::debug!(?report, "Reclaim pass finished");
                        }
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            tracing::error!(error = %e, "Reclaimer hit a consistency fault");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Reclaim pass failed");
                        }
                    }
                }
            }
        }
        passes
    }

    /// Spawns [`Reclaimer::run`] on the current runtime.
    pub fn spawn(
        self,
        queue: Arc<Queue>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<u64> {
        tokio::spawn(async move { self.run(queue, shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let queue = Arc::new(Queue::new(QueueConfig::new("test")));
        let token = CancellationToken::new();
        let handle = Reclaimer::new(10).spawn(queue, token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let passes = handle.await.unwrap();
        assert!(passes >= 1);
    }
}
