//! Stream-based queue backend.
//!
//! Models an append-ordered log with a pending-entries table: delivery in
//! strict arrival order, un-acked deliveries reclaimed after the visibility
//! timeout ahead of newer entries.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{Delivery, DeliveryHandle, QueueBackend};
use crate::task::ScheduleMessage;

struct QueuedEntry {
    /// Arrival order, assigned at first enqueue and kept across redeliveries.
    seq: u64,
    message: ScheduleMessage,
}

struct InFlightEntry {
    entry: QueuedEntry,
    deadline: Instant,
}

struct DelayedEntry {
    entry: QueuedEntry,
    available_at: Instant,
}

#[derive(Default)]
struct StreamInner {
    ready: VecDeque<QueuedEntry>,
    delayed: Vec<DelayedEntry>,
    in_flight: HashMap<Uuid, InFlightEntry>,
    next_seq: u64,
}

impl StreamInner {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.in_flight.len()
    }

    /// Move due delayed entries and expired in-flight entries back to ready,
    /// preserving arrival order among them.
    fn promote(&mut self, now: Instant) {
        let mut due: Vec<QueuedEntry> = Vec::new();

        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].available_at <= now {
                due.push(self.delayed.swap_remove(i).entry);
            } else {
                i += 1;
            }
        }

        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(e) = self.in_flight.remove(&id) {
                due.push(e.entry);
            }
        }

        if due.is_empty() {
            return;
        }
        // Reclaimed entries keep their arrival seq, so sorting restores the
        // log order ahead of anything enqueued after them.
        self.ready.extend(due);
        self.ready.make_contiguous().sort_by_key(|e| e.seq);
    }

    /// Earliest future instant at which promote() would find new work.
    fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|e| e.available_at).min();
        let in_flight = self.in_flight.values().map(|e| e.deadline).min();
        match (delayed, in_flight) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

/// Arrival-ordered queue backend with visibility-timeout redelivery.
pub struct StreamQueue {
    inner: Mutex<StreamInner>,
    notify: Notify,
    visibility_timeout: Duration,
    capacity: usize,
}

impl StreamQueue {
    pub fn new(visibility_timeout: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StreamInner::default()),
            notify: Notify::new(),
            visibility_timeout,
            capacity,
        }
    }
}

#[async_trait::async_trait]
impl QueueBackend for StreamQueue {
    async fn enqueue(&self, message: ScheduleMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.ready.push_back(QueuedEntry { seq, message });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(
        &self,
        batch_size: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let wait_deadline = Instant::now() + wait_timeout;

        loop {
            let now = Instant::now();
            let sleep_until;
            {
                let mut inner = self.inner.lock().await;
                inner.promote(now);

                if !inner.ready.is_empty() {
                    let mut deliveries = Vec::with_capacity(batch_size.min(inner.ready.len()));
                    for _ in 0..batch_size {
                        let Some(mut entry) = inner.ready.pop_front() else {
                            break;
                        };
                        entry.message.attempt_count += 1;
                        let delivery_id = Uuid::new_v4();
                        let handle = DeliveryHandle {
                            delivery_id,
                            task_id: entry.message.task_id,
                        };
                        let message = entry.message.clone();
                        inner.in_flight.insert(
                            delivery_id,
                            InFlightEntry {
                                entry,
                                deadline: now + self.visibility_timeout,
                            },
                        );
                        deliveries.push(Delivery { handle, message });
                    }
                    return Ok(deliveries);
                }

                if now >= wait_deadline {
                    return Ok(Vec::new());
                }
                sleep_until = match inner.next_wakeup() {
                    Some(at) => at.min(wait_deadline),
                    None => wait_deadline,
                };
            }

            let _ = tokio::time::timeout_at(sleep_until, self.notify.notified()).await;
        }
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner
            .in_flight
            .remove(&handle.delivery_id)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery {
                delivery_id: handle.delivery_id,
            })
    }

    async fn nack(
        &self,
        handle: &DeliveryHandle,
        requeue_delay: Duration,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.in_flight.remove(&handle.delivery_id).ok_or(
            QueueError::UnknownDelivery {
                delivery_id: handle.delivery_id,
            },
        )?;
        inner.delayed.push(DelayedEntry {
            entry: entry.entry,
            available_at: Instant::now() + requeue_delay,
        });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.ready.len() + inner.delayed.len())
    }

    fn name(&self) -> &'static str {
        "stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;

    fn msg(content: &str) -> ScheduleMessage {
        ScheduleMessage::new(
            "u1",
            "cube-1",
            TaskPayload::Add {
                messages: vec![content.into()],
            },
        )
    }

    fn queue() -> StreamQueue {
        StreamQueue::new(Duration::from_secs(30), 100)
    }

    #[tokio::test]
    async fn delivers_in_arrival_order() {
        let q = queue();
        let a = msg("a");
        let b = msg("b");
        q.enqueue(a.clone()).await.unwrap();
        q.enqueue(b.clone()).await.unwrap();

        let got = q.dequeue(10, Duration::ZERO).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message.task_id, a.task_id);
        assert_eq!(got[1].message.task_id, b.task_id);
    }

    #[tokio::test]
    async fn delivery_increments_attempt_count() {
        let q = queue();
        q.enqueue(msg("a")).await.unwrap();
        let got = q.dequeue(1, Duration::ZERO).await.unwrap();
        assert_eq!(got[0].message.attempt_count, 1);
    }

    #[tokio::test]
    async fn acked_delivery_is_gone() {
        let q = queue();
        q.enqueue(msg("a")).await.unwrap();
        let got = q.dequeue(1, Duration::ZERO).await.unwrap();
        q.ack(&got[0].handle).await.unwrap();

        assert_eq!(q.depth().await.unwrap(), 0);
        assert!(q.dequeue(1, Duration::ZERO).await.unwrap().is_empty());
        // Double-ack is an error.
        assert!(q.ack(&got[0].handle).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_delivery_is_reclaimed_after_visibility_timeout() {
        let q = StreamQueue::new(Duration::from_millis(50), 100);
        q.enqueue(msg("a")).await.unwrap();

        let first = q.dequeue(1, Duration::ZERO).await.unwrap();
        assert_eq!(first[0].message.attempt_count, 1);
        assert!(q.dequeue(1, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = q.dequeue(1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message.attempt_count, 2);
        // The stale handle is no longer settleable.
        assert!(q.ack(&first[0].handle).await.is_err());
        q.ack(&second[0].handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn nack_delays_redelivery() {
        let q = queue();
        q.enqueue(msg("a")).await.unwrap();
        let got = q.dequeue(1, Duration::ZERO).await.unwrap();
        q.nack(&got[0].handle, Duration::from_millis(100)).await.unwrap();

        assert!(q.dequeue(1, Duration::ZERO).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(110)).await;
        let redelivered = q.dequeue(1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].message.attempt_count, 2);
    }

    #[tokio::test]
    async fn reclaimed_entry_precedes_newer_entries() {
        let q = StreamQueue::new(Duration::from_millis(10), 100);
        let a = msg("a");
        q.enqueue(a.clone()).await.unwrap();
        let _stale = q.dequeue(1, Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let b = msg("b");
        q.enqueue(b.clone()).await.unwrap();

        let got = q.dequeue(10, Duration::ZERO).await.unwrap();
        assert_eq!(got[0].message.task_id, a.task_id);
        assert_eq!(got[1].message.task_id, b.task_id);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let q = StreamQueue::new(Duration::from_secs(30), 2);
        q.enqueue(msg("a")).await.unwrap();
        q.enqueue(msg("b")).await.unwrap();
        let err = q.enqueue(msg("c")).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { capacity: 2 }));
    }

    #[tokio::test]
    async fn dequeue_wait_times_out_empty() {
        let q = queue();
        let start = std::time::Instant::now();
        let got = q.dequeue(1, Duration::from_millis(30)).await.unwrap();
        assert!(got.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
