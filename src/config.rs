//! Configuration types.

use std::time::Duration;

use rand::Rng;

use crate::queue::QueueBackendConfig;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker slots. Bounds total concurrent pressure on the
    /// memory stores.
    pub pool_size: usize,
    /// Maximum messages pulled per dequeue call.
    pub consume_batch: usize,
    /// How long a dequeue call blocks waiting for messages.
    pub dequeue_wait: Duration,
    /// Buffered messages per worker slot channel.
    pub slot_queue_capacity: usize,
    /// Delivery ceiling: a task dead-letters once a failing delivery reaches
    /// this attempt count.
    pub max_retries: u32,
    /// Backoff applied to nack requeue delays.
    pub retry_backoff: BackoffPolicy,
    /// Backoff applied when the queue backend is unavailable.
    pub backend_backoff: BackoffPolicy,
    /// Default per-label execution budget, used when a handler does not
    /// declare its own.
    pub handler_timeout: Duration,
    /// Attempts for transient I/O inside the Memory Ops Facade.
    pub memory_retry_attempts: u32,
    /// Backoff between facade-level retries.
    pub memory_retry_backoff: BackoffPolicy,
    /// Tasks Running longer than this are force-failed by the monitor.
    pub stuck_threshold: Duration,
    /// Interval between stuck-task sweeps.
    pub stuck_check_interval: Duration,
    /// A worker heartbeat older than this counts as stale in health output.
    pub heartbeat_stale_after: Duration,
    /// How long terminal task records are retained before purge.
    pub audit_retention: Duration,
    /// Interval between audit purge sweeps.
    pub purge_interval: Duration,
    /// Queue backend variant, selected once at construction.
    pub queue: QueueBackendConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            consume_batch: 8,
            dequeue_wait: Duration::from_millis(500),
            slot_queue_capacity: 16,
            max_retries: 3,
            retry_backoff: BackoffPolicy::default(),
            backend_backoff: BackoffPolicy {
                base: Duration::from_millis(200),
                multiplier: 2.0,
                cap: Duration::from_secs(10),
                jitter: 0.1,
            },
            handler_timeout: Duration::from_secs(30),
            memory_retry_attempts: 3,
            memory_retry_backoff: BackoffPolicy {
                base: Duration::from_millis(100),
                multiplier: 2.0,
                cap: Duration::from_secs(2),
                jitter: 0.1,
            },
            stuck_threshold: Duration::from_secs(300), // 5 minutes
            stuck_check_interval: Duration::from_secs(30),
            heartbeat_stale_after: Duration::from_secs(60),
            audit_retention: Duration::from_secs(24 * 3600),
            purge_interval: Duration::from_secs(600),
            queue: QueueBackendConfig::default(),
        }
    }
}

/// Exponential backoff with a cap and proportional jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub base: Duration,
    /// Multiplier applied per additional attempt.
    pub multiplier: f64,
    /// Upper bound on the computed delay.
    pub cap: Duration,
    /// Jitter fraction in [0, 1): the delay is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after `attempt` attempts (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exp);
        let capped = raw.min(self.cap.as_secs_f64());
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, cap_secs: u64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(base_ms),
            multiplier: 2.0,
            cap: Duration::from_secs(cap_secs),
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = no_jitter(500, 60);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
    }

    #[test]
    fn backoff_respects_cap() {
        let policy = no_jitter(500, 4);
        assert_eq!(policy.delay(10), Duration::from_secs(4));
        // Huge attempt numbers must not overflow.
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(60),
            jitter: 0.2,
        };
        for _ in 0..100 {
            let d = policy.delay(1).as_secs_f64();
            assert!((0.8..=1.2).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = SchedulerConfig::default();
        assert!(config.pool_size >= 1);
        assert!(config.max_retries >= 1);
        assert!(config.stuck_threshold > config.handler_timeout);
    }
}
