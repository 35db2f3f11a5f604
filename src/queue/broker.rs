//! Broker-based queue backend.
//!
//! Models a broker channel: deliveries honor message priority (High before
//! Normal before Low, arrival order within a priority class), with the same
//! un-acked visibility-timeout reclaim as the stream backend.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{Delivery, DeliveryHandle, QueueBackend};
use crate::task::{ScheduleMessage, TaskPriority};

struct HeapEntry {
    rank: u8,
    seq: u64,
    message: ScheduleMessage,
}

impl HeapEntry {
    fn new(seq: u64, message: ScheduleMessage) -> Self {
        let rank = message
            .priority
            .unwrap_or(TaskPriority::Normal)
            .rank();
        Self { rank, seq, message }
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap pops the greatest element; greatest = lowest rank, then
    // lowest seq, so High/oldest delivers first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct InFlightEntry {
    entry: HeapEntry,
    deadline: Instant,
}

struct DelayedEntry {
    entry: HeapEntry,
    available_at: Instant,
}

#[derive(Default)]
struct BrokerInner {
    ready: BinaryHeap<HeapEntry>,
    delayed: Vec<DelayedEntry>,
    in_flight: HashMap<Uuid, InFlightEntry>,
    next_seq: u64,
}

impl BrokerInner {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.in_flight.len()
    }

    fn promote(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].available_at <= now {
                let due = self.delayed.swap_remove(i);
                self.ready.push(due.entry);
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
                self.ready.push(e.entry);
            }
        }
    }

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

/// Priority-aware queue backend with visibility-timeout redelivery.
pub struct BrokerQueue {
    inner: Mutex<BrokerInner>,
    notify: Notify,
    visibility_timeout: Duration,
    capacity: usize,
}

impl BrokerQueue {
    pub fn new(visibility_timeout: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BrokerInner::default()),
            notify: Notify::new(),
            visibility_timeout,
            capacity,
        }
    }
}

#[async_trait::async_trait]
impl QueueBackend for BrokerQueue {
    async fn enqueue(&self, message: ScheduleMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.ready.push(HeapEntry::new(seq, message));
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
                        let Some(mut entry) = inner.ready.pop() else {
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
        "broker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;

    fn msg(priority: Option<TaskPriority>) -> ScheduleMessage {
        let mut m = ScheduleMessage::new(
            "u1",
            "cube-1",
            TaskPayload::MemReorganize { scope: None },
        );
        m.priority = priority;
        m
    }

    #[tokio::test]
    async fn high_priority_delivers_first() {
        let q = BrokerQueue::new(Duration::from_secs(30), 100);
        let low = msg(Some(TaskPriority::Low));
        let normal = msg(None);
        let high = msg(Some(TaskPriority::High));
        q.enqueue(low.clone()).await.unwrap();
        q.enqueue(normal.clone()).await.unwrap();
        q.enqueue(high.clone()).await.unwrap();

        let got = q.dequeue(10, Duration::ZERO).await.unwrap();
        assert_eq!(got[0].message.task_id, high.task_id);
        assert_eq!(got[1].message.task_id, normal.task_id);
        assert_eq!(got[2].message.task_id, low.task_id);
    }

    #[tokio::test]
    async fn same_priority_keeps_arrival_order() {
        let q = BrokerQueue::new(Duration::from_secs(30), 100);
        let a = msg(None);
        let b = msg(None);
        q.enqueue(a.clone()).await.unwrap();
        q.enqueue(b.clone()).await.unwrap();

        let got = q.dequeue(10, Duration::ZERO).await.unwrap();
        assert_eq!(got[0].message.task_id, a.task_id);
        assert_eq!(got[1].message.task_id, b.task_id);
    }

    #[tokio::test(start_paused = true)]
    async fn nacked_high_priority_jumps_queue_on_redelivery() {
        let q = BrokerQueue::new(Duration::from_secs(30), 100);
        let high = msg(Some(TaskPriority::High));
        q.enqueue(high.clone()).await.unwrap();

        let got = q.dequeue(1, Duration::ZERO).await.unwrap();
        q.nack(&got[0].handle, Duration::from_millis(50)).await.unwrap();

        q.enqueue(msg(None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let redelivered = q.dequeue(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(redelivered[0].message.task_id, high.task_id);
        assert_eq!(redelivered[0].message.attempt_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_timeout_reclaims_unacked() {
        let q = BrokerQueue::new(Duration::from_millis(40), 100);
        q.enqueue(msg(None)).await.unwrap();
        let first = q.dequeue(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = q.dequeue(1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message.attempt_count, 2);
    }

    #[tokio::test]
    async fn capacity_counts_in_flight() {
        let q = BrokerQueue::new(Duration::from_secs(30), 1);
        q.enqueue(msg(None)).await.unwrap();
        let _held = q.dequeue(1, Duration::ZERO).await.unwrap();
        let err = q.enqueue(msg(None)).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { capacity: 1 }));
    }
}
