//! Queue adapter — backoff and degraded-health reporting over a backend.
//!
//! Backend unavailability never terminates the process: dequeue backs off
//! with exponential delay and the scheduler keeps running in a degraded
//! state; enqueue retries a bounded number of times before surfacing the
//! error to the submitter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::BackoffPolicy;
use crate::error::QueueError;
use crate::monitor::Monitor;
use crate::queue::{Delivery, DeliveryHandle, QueueBackend};
use crate::task::ScheduleMessage;

const MAX_ENQUEUE_ATTEMPTS: u32 = 5;

/// Wraps the configured backend with availability handling.
pub struct QueueAdapter {
    backend: Arc<dyn QueueBackend>,
    monitor: Arc<Monitor>,
    backoff: BackoffPolicy,
    failure_streak: AtomicU32,
}

impl QueueAdapter {
    pub fn new(backend: Arc<dyn QueueBackend>, monitor: Arc<Monitor>, backoff: BackoffPolicy) -> Self {
        Self {
            backend,
            monitor,
            backoff,
            failure_streak: AtomicU32::new(0),
        }
    }

    fn mark_unavailable(&self) -> Duration {
        let streak = self.failure_streak.fetch_add(1, Ordering::AcqRel) + 1;
        self.monitor.set_degraded(true);
        self.backoff.delay(streak)
    }

    fn mark_healthy(&self) {
        if self.failure_streak.swap(0, Ordering::AcqRel) > 0 {
            self.monitor.set_degraded(false);
        }
    }

    /// Enqueue with bounded retry on unavailability.
    pub async fn enqueue(&self, message: &ScheduleMessage) -> Result<(), QueueError> {
        let mut attempt = 1;
        loop {
            match self.backend.enqueue(message.clone()).await {
                Ok(()) => {
                    self.mark_healthy();
                    return Ok(());
                }
                Err(e) if e.is_unavailable() && attempt < MAX_ENQUEUE_ATTEMPTS => {
                    let delay = self.mark_unavailable();
                    tracing::warn!(
                        task_id = %message.task_id,
                        backend = self.backend.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Enqueue failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Dequeue one batch. On unavailability the adapter records the degraded
    /// state, sleeps the current backoff, and returns an empty batch so the
    /// worker loop keeps spinning instead of crashing.
    pub async fn dequeue(
        &self,
        batch_size: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        match self.backend.dequeue(batch_size, wait_timeout).await {
            Ok(deliveries) => {
                self.mark_healthy();
                Ok(deliveries)
            }
            Err(e) if e.is_unavailable() => {
                let delay = self.mark_unavailable();
                tracing::warn!(
                    backend = self.backend.name(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Dequeue failed, backing off"
                );
                tokio::time::sleep(delay).await;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn ack(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        self.backend.ack(handle).await
    }

    pub async fn nack(
        &self,
        handle: &DeliveryHandle,
        requeue_delay: Duration,
    ) -> Result<(), QueueError> {
        self.backend.nack(handle, requeue_delay).await
    }

    pub async fn depth(&self) -> Result<usize, QueueError> {
        self.backend.depth().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::task::TaskPayload;

    /// Backend that reports unavailability for the first `failures` calls.
    struct FlakyBackend {
        failures: AtomicU32,
    }

    impl FlakyBackend {
        fn take_failure(&self) -> bool {
            self.failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then(|| n - 1))
                .is_ok()
        }

        fn unavailable() -> QueueError {
            QueueError::Unavailable {
                backend: "flaky".into(),
                reason: "connection refused".into(),
            }
        }
    }

    #[async_trait]
    impl QueueBackend for FlakyBackend {
        async fn enqueue(&self, _message: ScheduleMessage) -> Result<(), QueueError> {
            if self.take_failure() {
                return Err(Self::unavailable());
            }
            Ok(())
        }

        async fn dequeue(
            &self,
            _batch_size: usize,
            _wait_timeout: Duration,
        ) -> Result<Vec<Delivery>, QueueError> {
            if self.take_failure() {
                return Err(Self::unavailable());
            }
            Ok(Vec::new())
        }

        async fn ack(&self, _handle: &DeliveryHandle) -> Result<(), QueueError> {
            Ok(())
        }

        async fn nack(
            &self,
            _handle: &DeliveryHandle,
            _requeue_delay: Duration,
        ) -> Result<(), QueueError> {
            Ok(())
        }

        async fn depth(&self) -> Result<usize, QueueError> {
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn adapter(failures: u32) -> (QueueAdapter, Arc<Monitor>) {
        let monitor = Arc::new(Monitor::new());
        let adapter = QueueAdapter::new(
            Arc::new(FlakyBackend {
                failures: AtomicU32::new(failures),
            }),
            monitor.clone(),
            BackoffPolicy {
                base: Duration::from_millis(1),
                multiplier: 1.0,
                cap: Duration::from_millis(1),
                jitter: 0.0,
            },
        );
        (adapter, monitor)
    }

    fn msg() -> ScheduleMessage {
        ScheduleMessage::new("u1", "cube-1", TaskPayload::MemReorganize { scope: None })
    }

    #[tokio::test]
    async fn enqueue_retries_through_unavailability() {
        let (adapter, monitor) = adapter(2);
        adapter.enqueue(&msg()).await.unwrap();
        // Recovered after the successful call.
        assert!(!monitor.is_degraded());
    }

    #[tokio::test]
    async fn enqueue_gives_up_after_bounded_attempts() {
        let (adapter, monitor) = adapter(100);
        let err = adapter.enqueue(&msg()).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(monitor.is_degraded());
    }

    #[tokio::test]
    async fn dequeue_degrades_instead_of_failing() {
        let (adapter, monitor) = adapter(1);

        let first = adapter.dequeue(8, Duration::ZERO).await.unwrap();
        assert!(first.is_empty());
        assert!(monitor.is_degraded());

        let _ = adapter.dequeue(8, Duration::ZERO).await.unwrap();
        assert!(!monitor.is_degraded());
    }
}
