//! Coroutine Lock
//!
//! Async FIFO mutual exclusion keyed by `(kind, key)`, usable across
//! suspension points. A `wait` either takes the lock immediately (empty
//! queue) or enqueues; registration happens synchronously inside the call,
//! so callers that invoke `wait` in arrival order are granted the lock in
//! that order no matter how the returned futures are polled. Dropping the
//! [`LockToken`] releases the lock and grants the next eligible waiter.
//!
//! Waits may carry a timeout: a timed-out waiter resolves with
//! [`LockError::Timeout`] and is skipped when its turn comes. Token levels
//! count handoffs since the queue formed — a debugging aid for spotting
//! runaway lock depth, not part of correctness.
//!
//! Not re-entrant: a caller that waits twice on the same key while holding
//! the first token deadlocks itself. That is caller responsibility.

use crate::error::LockError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

/// Lock namespaces; keys only collide within one kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LockKind {
    /// Per-entity mailbox serialization (key = packed actor id).
    Mailbox,
    /// Actor location lookups/transfers.
    Location,
    /// Storage access serialization.
    Db,
}

/// Lock depth at which a warning is logged; a queue this deep usually
/// means a handler is holding a lock across a slow call.
const RUNAWAY_LEVEL: u32 = 100;

struct Waiter {
    tx: oneshot::Sender<LockToken>,
    cancelled: Arc<AtomicBool>,
}

struct LockQueue {
    /// Handoffs since this queue formed; the current holder's level.
    level: u32,
    waiters: VecDeque<Waiter>,
}

/// Process-wide coroutine lock service. Presence of a queue entry means
/// the lock is held.
pub struct CoroutineLockService {
    queues: Mutex<HashMap<(LockKind, u64), LockQueue>>,
}

enum Grant {
    Now(LockToken),
    Queued(oneshot::Receiver<LockToken>, Arc<AtomicBool>),
}

impl CoroutineLockService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Wait for the lock with no budget. FIFO with respect to other
    /// `wait`/`wait_timeout` calls on the same key.
    pub fn wait(
        self: &Arc<Self>,
        kind: LockKind,
        key: u64,
    ) -> impl std::future::Future<Output = Result<LockToken, LockError>> + 'static {
        let grant = self.register(kind, key);
        async move {
            match grant {
                Grant::Now(token) => Ok(token),
                Grant::Queued(rx, _flag) => rx.await.map_err(|_| LockError::Closed),
            }
        }
    }

    /// Wait with a budget. On timeout the waiter resolves with
    /// [`LockError::Timeout`] and will be skipped when popped.
    pub fn wait_timeout(
        self: &Arc<Self>,
        kind: LockKind,
        key: u64,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<LockToken, LockError>> + 'static {
        let grant = self.register(kind, key);
        async move {
            match grant {
                Grant::Now(token) => Ok(token),
                Grant::Queued(rx, flag) => match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(token)) => Ok(token),
                    Ok(Err(_)) => Err(LockError::Closed),
                    Err(_) => {
                        flag.store(true, Ordering::Release);
                        Err(LockError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                },
            }
        }
    }

    /// Synchronous part of a wait: take the lock or join the queue. This
    /// is what pins FIFO order to call order.
    fn register(self: &Arc<Self>, kind: LockKind, key: u64) -> Grant {
        let mut queues = self.queues.lock();
        match queues.entry((kind, key)) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(LockQueue {
                    level: 1,
                    waiters: VecDeque::new(),
                });
                Grant::Now(LockToken {
                    service: Arc::clone(self),
                    kind,
                    key,
                    level: 1,
                    armed: true,
                })
            }
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let (tx, rx) = oneshot::channel();
                let cancelled = Arc::new(AtomicBool::new(false));
                entry.get_mut().waiters.push_back(Waiter {
                    tx,
                    cancelled: Arc::clone(&cancelled),
                });
                Grant::Queued(rx, cancelled)
            }
        }
    }

    /// Hand the lock to the next eligible waiter, or retire the queue.
    fn release(self: &Arc<Self>, kind: LockKind, key: u64) {
        loop {
            let handoff = {
                let mut queues = self.queues.lock();
                let Some(queue) = queues.get_mut(&(kind, key)) else {
                    return;
                };
                let granted = loop {
                    match queue.waiters.pop_front() {
                        None => break None,
                        Some(waiter) if waiter.cancelled.load(Ordering::Acquire) => continue,
                        Some(waiter) => {
                            queue.level += 1;
                            if queue.level == RUNAWAY_LEVEL {
                                warn!(?kind, key, level = queue.level, "coroutine lock queue very deep");
                            }
                            let token = LockToken {
                                service: Arc::clone(self),
                                kind,
                                key,
                                level: queue.level,
                                armed: true,
                            };
                            break Some((waiter.tx, token));
                        }
                    }
                };
                if granted.is_none() {
                    queues.remove(&(kind, key));
                }
                granted
            };

            match handoff {
                None => return,
                Some((tx, token)) => match tx.send(token) {
                    Ok(()) => return,
                    Err(mut token) => {
                        // Receiver vanished without marking itself
                        // cancelled (future dropped). Disarm so this
                        // token's drop does not release again, and grant
                        // the next waiter instead.
                        token.armed = false;
                        continue;
                    }
                },
            }
        }
    }

    #[cfg(test)]
    fn queue_len(&self, kind: LockKind, key: u64) -> Option<usize> {
        self.queues
            .lock()
            .get(&(kind, key))
            .map(|q| q.waiters.len())
    }
}

/// Holding this token is holding the lock. Dropping it releases.
pub struct LockToken {
    service: Arc<CoroutineLockService>,
    kind: LockKind,
    key: u64,
    level: u32,
    armed: bool,
}

impl LockToken {
    /// Handoff count since the queue formed. Diagnostic only.
    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if self.armed {
            self.service.release(self.kind, self.key);
        }
    }
}

impl std::fmt::Debug for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockToken")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("level", &self.level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn uncontended_wait_grants_immediately() {
        let locks = CoroutineLockService::new();
        let token = locks.wait(LockKind::Mailbox, 1).await.unwrap();
        assert_eq!(token.level(), 1);
        drop(token);
        // Queue retired; a fresh wait starts at level 1 again.
        let token = locks.wait(LockKind::Mailbox, 1).await.unwrap();
        assert_eq!(token.level(), 1);
    }

    #[tokio::test]
    async fn waiters_granted_in_fifo_order() {
        let locks = CoroutineLockService::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let holder = locks.wait(LockKind::Mailbox, 42).await.unwrap();

        // Five waiters enqueue in a known order (registration is
        // synchronous in wait()).
        let mut tasks = Vec::new();
        for i in 0..5u32 {
            let fut = locks.wait(LockKind::Mailbox, 42);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let token = fut.await.unwrap();
                order.lock().push(i);
                drop(token);
            }));
        }
        assert_eq!(locks.queue_len(LockKind::Mailbox, 42), Some(5));

        drop(holder);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn mutual_exclusion_holds_under_contention() {
        let locks = CoroutineLockService::new();
        let active = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let locks = Arc::clone(&locks);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                let _token = locks.wait(LockKind::Db, 7).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timed_out_waiter_is_skipped() {
        let locks = CoroutineLockService::new();
        let holder = locks.wait(LockKind::Location, 5).await.unwrap();

        let timed_out = locks.wait_timeout(LockKind::Location, 5, Duration::from_millis(10));
        let patient = locks.wait(LockKind::Location, 5);

        let err = timed_out.await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        drop(holder);
        // The patient waiter gets the lock even though the timed-out one
        // is still first in the queue.
        let token = patient.await.unwrap();
        assert_eq!(token.level(), 2);
    }

    #[tokio::test]
    async fn keys_do_not_interfere() {
        let locks = CoroutineLockService::new();
        let _a = locks.wait(LockKind::Mailbox, 1).await.unwrap();
        // Different key and different kind with the same key: both free.
        let _b = locks.wait(LockKind::Mailbox, 2).await.unwrap();
        let _c = locks.wait(LockKind::Location, 1).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_waiter_future_is_skipped() {
        let locks = CoroutineLockService::new();
        let holder = locks.wait(LockKind::Mailbox, 9).await.unwrap();

        let abandoned = locks.wait(LockKind::Mailbox, 9);
        let survivor = locks.wait(LockKind::Mailbox, 9);
        drop(abandoned);

        drop(holder);
        let token = survivor.await.unwrap();
        assert_eq!(token.level(), 3);
    }
}
