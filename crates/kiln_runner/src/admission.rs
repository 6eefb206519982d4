//! FIFO admission control over a fixed number of accelerator slots.
//!
//! A job takes its place in the queue when [`AdmissionController::enqueue`] is called, not when
//! it starts waiting, so grants follow submission order no matter how tasks are scheduled.

use kiln_core::prelude::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AdmissionController {
    capacity: usize,
    queue: Arc<Mutex<Queue>>,
}

struct Queue {
    available: usize,
    /// Slots claimed beyond capacity, paid back before any waiter is served.
    overdrawn: usize,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    job_id: String,
    tx: oneshot::Sender<AdmissionSlot>,
}

/// A held slot. Dropping it returns the capacity and wakes the oldest live waiter.
#[derive(Debug)]
pub struct AdmissionSlot {
    job_id: String,
    queue: Option<Arc<Mutex<Queue>>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("available", &self.available)
            .field("overdrawn", &self.overdrawn)
            .field("waiting", &self.waiters.len())
            .finish()
    }
}

/// A place in the queue. Dropping it abandons the place.
pub struct AdmissionTicket {
    job_id: String,
    rx: oneshot::Receiver<AdmissionSlot>,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: Arc::new(Mutex::new(Queue {
                available: capacity,
                overdrawn: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Rejects models that may not run at all.
    pub fn check(&self, descriptor: &ModelDescriptor) -> Result<(), JobError> {
        if descriptor.enabled {
            Ok(())
        } else {
            Err(JobError::ModelDisabled(descriptor.id.clone()))
        }
    }

    /// Takes a place at the back of the queue.
    pub fn enqueue(&self, job_id: &str) -> AdmissionTicket {
        let (tx, rx) = oneshot::channel();
        let mut queue = self.queue.lock();

        if queue.available > 0 && queue.waiters.is_empty() {
            queue.available -= 1;
            let slot = AdmissionSlot {
                job_id: job_id.to_string(),
                queue: Some(self.queue.clone()),
            };
            // The receiver is alive, so this cannot fail.
            let _ = tx.send(slot).map_err(AdmissionSlot::disarm);
            debug!(job_id, available = queue.available, "Slot granted immediately");
        } else {
            queue.waiters.push_back(Waiter {
                job_id: job_id.to_string(),
                tx,
            });
            debug!(job_id, waiting = queue.waiters.len(), "Queued for a slot");
        }

        AdmissionTicket {
            job_id: job_id.to_string(),
            rx,
        }
    }

    /// Takes a slot right away, even when none is free, for a job whose execution unit is already
    /// running. Waiters are only served again once the excess is released.
    pub fn claim(&self, job_id: &str) -> AdmissionSlot {
        let mut queue = self.queue.lock();
        if queue.available > 0 {
            queue.available -= 1;
        } else {
            queue.overdrawn += 1;
        }
        debug!(
            job_id,
            available = queue.available,
            overdrawn = queue.overdrawn,
            "Slot claimed"
        );

        AdmissionSlot {
            job_id: job_id.to_string(),
            queue: Some(self.queue.clone()),
        }
    }

    /// Waits for a slot. Shorthand for [`enqueue`](Self::enqueue) followed by
    /// [`AdmissionTicket::wait`].
    pub async fn acquire(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<AdmissionSlot, JobError> {
        self.enqueue(job_id).wait(timeout).await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.queue.lock().available
    }

    /// Number of live waiters.
    pub fn waiting(&self) -> usize {
        self.queue
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }
}

impl Queue {
    /// Hands a freed slot to the oldest live waiter, or returns it to the pool.
    fn release(&mut self, this: &Arc<Mutex<Queue>>, from: &str) {
        if self.overdrawn > 0 {
            self.overdrawn -= 1;
            debug!(from, overdrawn = self.overdrawn, "Overdrawn slot returned");
            return;
        }
        while let Some(waiter) = self.waiters.pop_front() {
            let slot = AdmissionSlot {
                job_id: waiter.job_id.clone(),
                queue: Some(this.clone()),
            };
            match waiter.tx.send(slot) {
                Ok(()) => {
                    info!(from, to = %waiter.job_id, "Slot handed over");
                    return;
                }
                Err(slot) => {
                    // Abandoned waiter. The slot must not run its drop under our lock.
                    slot.disarm();
                    debug!(job_id = %waiter.job_id, "Skipped abandoned waiter");
                }
            }
        }
        self.available += 1;
        debug!(from, available = self.available, "Slot returned");
    }
}

impl AdmissionSlot {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Returns the slot. Same as dropping it.
    pub fn release(self) {}

    fn disarm(mut self) {
        self.queue = None;
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.lock().release(&queue, &self.job_id);
        }
    }
}

impl AdmissionTicket {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Waits until the slot is granted, or fails with [`JobError::AdmissionTimeout`].
    pub async fn wait(self, timeout: Duration) -> Result<AdmissionSlot, JobError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(slot)) => Ok(slot),
            Ok(Err(_)) => Err(JobError::System(format!(
                "admission queue dropped job {}",
                self.job_id
            ))),
            Err(_) => Err(JobError::AdmissionTimeout(format!(
                "no slot became free within {}s",
                timeout.as_secs()
            ))),
        }
    }
}
