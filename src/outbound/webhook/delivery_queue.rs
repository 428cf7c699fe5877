use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::schemas::Delivery;

/// What to do when a push finds the queue full for longer than the
/// enqueue timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait up to the enqueue timeout, then refuse the new delivery.
    #[default]
    Block,

    /// Wait up to the enqueue timeout, then evict the oldest queued delivery.
    DropOldest,

    /// Refuse immediately.
    Reject,
}

/// The queue stayed full; the caller still owns the delivery and must
/// record its fate.
#[derive(Debug, Error)]
#[error("delivery queue is full")]
pub struct QueueOverflowError {
    pub delivery: Box<Delivery>,
}

#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting this older delivery.
    Evicted(Box<Delivery>),
}

/// Bounded FIFO between the dispatcher and the worker pool
#[derive(Debug)]
pub struct DeliveryQueue {
    items: Mutex<VecDeque<Delivery>>,

    capacity: usize,

    policy: OverflowPolicy,

    enqueue_timeout: Duration,

    not_empty: Notify,

    not_full: Notify,

    closed: AtomicBool,
}

impl DeliveryQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy, enqueue_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            enqueue_timeout,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Enqueue a delivery, applying the overflow policy when full.
    pub async fn push(&self, delivery: Delivery) -> Result<PushOutcome, QueueOverflowError> {
        let deadline = match self.policy {
            OverflowPolicy::Reject => Instant::now(),
            _ => Instant::now() + self.enqueue_timeout,
        };

        let mut delivery = delivery;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(delivery).await {
                Ok(()) => return Ok(PushOutcome::Queued),
                Err(back) => delivery = back,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        if self.policy == OverflowPolicy::DropOldest {
            let mut items = self.items.lock().await;
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            debug!(delivery_id = %delivery.id, "Enqueuing delivery");
            items.push_back(delivery);
            drop(items);
            self.not_empty.notify_one();

            return Ok(match evicted {
                Some(old) => {
                    warn!(
                        delivery_id = %old.id,
                        capacity = self.capacity,
                        "Delivery queue full, evicted oldest delivery"
                    );
                    PushOutcome::Evicted(Box::new(old))
                }
                None => PushOutcome::Queued,
            });
        }

        warn!(
            delivery_id = %delivery.id,
            capacity = self.capacity,
            "Delivery queue full, rejecting delivery"
        );
        Err(QueueOverflowError {
            delivery: Box::new(delivery),
        })
    }

    /// Enqueue without waiting; hands the delivery back when full.
    pub async fn try_push(&self, delivery: Delivery) -> Result<(), Delivery> {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            return Err(delivery);
        }
        debug!(
            delivery_id = %delivery.id,
            subscription_id = %delivery.subscription_id,
            "Enqueuing delivery"
        );
        items.push_back(delivery);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Wait for the next delivery. Returns `None` once the queue is closed.
    ///
    /// Cancel safe: a delivery is only removed when it is returned.
    pub async fn pop(&self) -> Option<Delivery> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            if let Some(delivery) = self.items.lock().await.pop_front() {
                self.not_full.notify_one();
                debug!(delivery_id = %delivery.id, "Dequeued delivery");
                return Some(delivery);
            }

            notified.await;
        }
    }

    /// Stop handing out deliveries and wake every waiting worker.
    ///
    /// Whatever is still queued stays persisted as `pending` and is picked
    /// up again on the next start.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
