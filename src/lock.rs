//! Resource Locking
//!
//! Per-resource mutual exclusion with a FIFO wait queue, local to this
//! node. A waiter whose deadline passes is removed and denied; once granted,
//! a lock is only lost through `release` or the expired-lock sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::events::{EventBus, LockEvent};

/// Result of an acquire call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LockOutcome {
    Granted,
    Denied,
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        *self == LockOutcome::Granted
    }
}

/// A request waiting for a held resource
struct PendingRequest {
    ticket: u64,
    requester: String,
    enqueued_at: Instant,
    deadline: Instant,
    responder: oneshot::Sender<()>,
}

/// Lock state of a single resource
struct LockRecord {
    holder: Option<String>,
    acquired_at: Option<Instant>,
    acquired_at_utc: Option<DateTime<Utc>>,
    queue: VecDeque<PendingRequest>,
}

impl LockRecord {
    fn new() -> Self {
        Self {
            holder: None,
            acquired_at: None,
            acquired_at_utc: None,
            queue: VecDeque::new(),
        }
    }

    fn grant(&mut self, requester: &str) {
        self.holder = Some(requester.to_string());
        self.acquired_at = Some(Instant::now());
        self.acquired_at_utc = Some(Utc::now());
    }

    fn clear_holder(&mut self) -> Option<String> {
        self.acquired_at = None;
        self.acquired_at_utc = None;
        self.holder.take()
    }

    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.queue.is_empty()
    }
}

/// A currently held lock
#[derive(Debug, Clone, Serialize)]
pub struct HeldLock {
    pub resource_id: String,
    pub holder: String,
    pub acquired_at: Option<DateTime<Utc>>,
    pub held_for_ms: u64,
}

/// A queued request
#[derive(Debug, Clone, Serialize)]
pub struct WaitingRequest {
    pub ticket: u64,
    pub requester: String,
    pub waited_ms: u64,
}

/// Wait queue of one resource
#[derive(Debug, Clone, Serialize)]
pub struct ResourceQueue {
    pub resource_id: String,
    pub waiting: Vec<WaitingRequest>,
}

/// Lock table snapshot
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub locks: Vec<HeldLock>,
    pub queues: Vec<ResourceQueue>,
    pub total_locks: usize,
    pub total_queued: usize,
}

/// Lock table for every resource on this node
pub struct ResourceLock {
    table: Mutex<HashMap<String, LockRecord>>,
    next_ticket: AtomicU64,
    events: EventBus,
}

impl ResourceLock {
    /// Create an empty lock table
    pub fn new(events: EventBus) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            events,
        }
    }

    /// Acquire `resource_id` for `requester`, waiting at most `timeout`.
    ///
    /// Grants at once if the resource is free or already held by
    /// `requester`. Otherwise queues behind earlier requests.
    pub async fn acquire(&self, resource_id: &str, requester: &str, timeout: Duration) -> LockOutcome {
        let (ticket, mut granted) = {
            let mut table = self.table.lock().await;
            let record = table
                .entry(resource_id.to_string())
                .or_insert_with(LockRecord::new);

            match record.holder.as_deref() {
                None => {
                    record.grant(requester);
                    tracing::info!("Acquired lock for {} (holder: {})", resource_id, requester);
                    self.events.lock(LockEvent::Acquired {
                        resource_id: resource_id.to_string(),
                        holder: requester.to_string(),
                    });
                    return LockOutcome::Granted;
                }
                Some(holder) if holder == requester => {
                    tracing::debug!("{} already holds {}", requester, resource_id);
                    return LockOutcome::Granted;
                }
                Some(_) => {}
            }

            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            let (responder, granted) = oneshot::channel();
            let now = Instant::now();
            record.queue.push_back(PendingRequest {
                ticket,
                requester: requester.to_string(),
                enqueued_at: now,
                deadline: now + timeout,
                responder,
            });
            tracing::info!(
                "Resource {} is locked, {} queued (queue size {})",
                resource_id,
                requester,
                record.queue.len()
            );
            (ticket, granted)
        };

        match tokio::time::timeout(timeout, &mut granted).await {
            Ok(Ok(())) => LockOutcome::Granted,
            // Dropped unanswered by promotion after the deadline
            Ok(Err(_)) => LockOutcome::Denied,
            Err(_) => {
                let mut table = self.table.lock().await;
                if let Some(record) = table.get_mut(resource_id) {
                    if let Some(pos) = record.queue.iter().position(|r| r.ticket == ticket) {
                        record.queue.remove(pos);
                        if record.is_idle() {
                            table.remove(resource_id);
                        }
                        self.timed_out(resource_id, requester);
                        return LockOutcome::Denied;
                    }
                }
                // Promoted between the deadline and taking the table lock
                match granted.try_recv() {
                    Ok(()) => LockOutcome::Granted,
                    Err(_) => LockOutcome::Denied,
                }
            }
        }
    }

    /// Release `resource_id`. Fails without touching the table unless
    /// `requester` is the current holder.
    pub async fn release(&self, resource_id: &str, requester: &str) -> Result<()> {
        let mut table = self.table.lock().await;

        let holder = table.get(resource_id).and_then(|r| r.holder.clone());
        if holder.as_deref() != Some(requester) {
            tracing::warn!(
                "Rejected release of {} by {} (holder: {:?})",
                resource_id,
                requester,
                holder
            );
            return Err(Error::PermissionDenied {
                resource_id: resource_id.to_string(),
                requester: requester.to_string(),
                holder,
            });
        }

        let Some(record) = table.get_mut(resource_id) else {
            return Err(Error::Internal(format!("lock record for {} vanished", resource_id)));
        };
        record.clear_holder();
        tracing::info!("Released lock for {} (holder: {})", resource_id, requester);
        self.events.lock(LockEvent::Released {
            resource_id: resource_id.to_string(),
            holder: requester.to_string(),
        });

        self.promote_next(resource_id, record);
        if record.is_idle() {
            table.remove(resource_id);
        }
        Ok(())
    }

    /// Force-release every lock held longer than `max_hold` and hand each
    /// resource to its next waiter. Returns the resources released.
    pub async fn sweep_expired(&self, max_hold: Duration) -> Vec<String> {
        let mut table = self.table.lock().await;
        let mut released = Vec::new();

        for (resource_id, record) in table.iter_mut() {
            let Some(acquired_at) = record.acquired_at else {
                continue;
            };
            let held_for = acquired_at.elapsed();
            if held_for <= max_hold {
                continue;
            }

            let holder = record.clear_holder().unwrap_or_default();
            tracing::warn!(
                "Lock fault: force releasing {} held by {} for {:?} (limit {:?})",
                resource_id,
                holder,
                held_for,
                max_hold
            );
            self.events.lock(LockEvent::ForceReleased {
                resource_id: resource_id.clone(),
                holder,
                held_for_ms: held_for.as_millis() as u64,
            });

            self.promote_next(resource_id, record);
            released.push(resource_id.clone());
        }

        table.retain(|_, record| !record.is_idle());
        released
    }

    /// Hand a free resource to the oldest waiter that can still take it
    fn promote_next(&self, resource_id: &str, record: &mut LockRecord) {
        let now = Instant::now();
        while let Some(next) = record.queue.pop_front() {
            if next.deadline <= now {
                self.timed_out(resource_id, &next.requester);
                continue;
            }
            if next.responder.send(()).is_err() {
                tracing::debug!("Waiter {} for {} went away", next.requester, resource_id);
                continue;
            }

            record.grant(&next.requester);
            tracing::info!(
                "Granted {} to {} after {:?} in queue",
                resource_id,
                next.requester,
                next.enqueued_at.elapsed()
            );
            self.events.lock(LockEvent::Acquired {
                resource_id: resource_id.to_string(),
                holder: next.requester,
            });
            return;
        }
    }

    fn timed_out(&self, resource_id: &str, requester: &str) {
        tracing::warn!("Lock request for {} by {} timed out", resource_id, requester);
        self.events.lock(LockEvent::RequestTimedOut {
            resource_id: resource_id.to_string(),
            requester: requester.to_string(),
        });
    }

    /// Get the current holder of a resource
    pub async fn holder(&self, resource_id: &str) -> Option<String> {
        self.table
            .lock()
            .await
            .get(resource_id)
            .and_then(|r| r.holder.clone())
    }

    /// Get the number of requests waiting on a resource
    pub async fn queue_len(&self, resource_id: &str) -> usize {
        self.table
            .lock()
            .await
            .get(resource_id)
            .map(|r| r.queue.len())
            .unwrap_or(0)
    }

    /// Snapshot of held locks and wait queues
    pub async fn status(&self) -> LockStatus {
        let table = self.table.lock().await;
        let mut locks = Vec::new();
        let mut queues = Vec::new();

        for (resource_id, record) in table.iter() {
            if let (Some(holder), Some(acquired_at)) = (&record.holder, record.acquired_at) {
                locks.push(HeldLock {
                    resource_id: resource_id.clone(),
                    holder: holder.clone(),
                    acquired_at: record.acquired_at_utc,
                    held_for_ms: acquired_at.elapsed().as_millis() as u64,
                });
            }
            if !record.queue.is_empty() {
                queues.push(ResourceQueue {
                    resource_id: resource_id.clone(),
                    waiting: record
                        .queue
                        .iter()
                        .map(|r| WaitingRequest {
                            ticket: r.ticket,
                            requester: r.requester.clone(),
                            waited_ms: r.enqueued_at.elapsed().as_millis() as u64,
                        })
                        .collect(),
                });
            }
        }

        locks.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        queues.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        let total_queued = queues.iter().map(|q| q.waiting.len()).sum();

        LockStatus {
            total_locks: locks.len(),
            total_queued,
            locks,
            queues,
        }
    }
}
