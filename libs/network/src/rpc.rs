//! RPC Correlation
//!
//! One [`PendingTable`] per sender (session or process-level actor sender).
//! Every outgoing request takes a fresh id from a monotonically increasing
//! counter and parks a oneshot completion here with a deadline; the entry is
//! removed by exactly one of: the matching response, caller cancellation,
//! sender disposal, or the deadline sweep. The sweep is the only place
//! timeouts are enforced — there is no automatic retry.

use crate::error::RpcError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{trace, warn};
use types::message::{ErrorResponse, Message};

pub type CallResult = std::result::Result<Box<dyn Message>, RpcError>;

struct Pending {
    deadline: Instant,
    tx: oneshot::Sender<CallResult>,
}

/// Sender-scoped table of in-flight requests.
pub struct PendingTable {
    entries: Mutex<HashMap<u32, Pending>>,
    next_id: AtomicU32,
    timeout: Duration,
}

impl PendingTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Next correlation id. Skips 0, which marks "no rpc" on the wire.
    pub fn next_rpc_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Park a completion for `rpc_id`. At most one entry per id may exist;
    /// a duplicate means the id counter was misused and is rejected.
    pub fn register(&self, rpc_id: u32) -> Option<oneshot::Receiver<CallResult>> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        if entries.contains_key(&rpc_id) {
            warn!(rpc_id, "duplicate rpc id registration rejected");
            return None;
        }
        entries.insert(
            rpc_id,
            Pending {
                deadline: Instant::now() + self.timeout,
                tx,
            },
        );
        Some(rx)
    }

    /// Resolve an entry with an inbound response. A nonzero error code in
    /// the payload becomes [`RpcError::Remote`]. Returns false when no
    /// entry matched (late response after timeout — dropped by design).
    pub fn complete(&self, rpc_id: u32, msg: Box<dyn Message>) -> bool {
        let Some(pending) = self.entries.lock().remove(&rpc_id) else {
            trace!(rpc_id, "response without pending entry dropped");
            return false;
        };
        let result = if msg.error() != 0 {
            let code = msg.error();
            let message = msg
                .as_any()
                .downcast_ref::<ErrorResponse>()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            Err(RpcError::Remote { code, message })
        } else {
            Ok(msg)
        };
        pending.tx.send(result).is_ok()
    }

    /// Resolve an entry with a local failure.
    pub fn fail(&self, rpc_id: u32, error: RpcError) -> bool {
        match self.entries.lock().remove(&rpc_id) {
            Some(pending) => pending.tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Fail every in-flight request, e.g. when the owning session closes.
    pub fn fail_all(&self, make_error: impl Fn(u32) -> RpcError) {
        let drained: Vec<(u32, Pending)> = self.entries.lock().drain().collect();
        for (rpc_id, pending) in drained {
            let _ = pending.tx.send(Err(make_error(rpc_id)));
        }
    }

    /// Fail entries whose deadline has passed. Called from the owner's
    /// periodic sweep task; returns how many timed out.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(u32, Pending)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<u32> = entries
                .iter()
                .filter(|(_, p)| now >= p.deadline)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|p| (id, p)))
                .collect()
        };
        let count = expired.len();
        let timeout_ms = self.timeout.as_millis() as u64;
        for (rpc_id, pending) in expired {
            warn!(rpc_id, timeout_ms, "rpc timed out");
            let _ = pending.tx.send(Err(RpcError::Timeout { rpc_id, timeout_ms }));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use types::response_message;

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct Pong {
        rpc_id: u32,
        error: i32,
    }
    response_message!(Pong);

    #[test]
    fn ids_are_unique_and_nonzero() {
        let table = PendingTable::new(Duration::from_secs(1));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = table.next_rpc_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn complete_resolves_receiver() {
        let table = PendingTable::new(Duration::from_secs(5));
        let rx = table.register(7).unwrap();
        assert!(table.complete(
            7,
            Box::new(Pong {
                rpc_id: 7,
                error: 0
            })
        ));
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.rpc_id(), 7);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn nonzero_error_becomes_remote_failure() {
        let table = PendingTable::new(Duration::from_secs(5));
        let rx = table.register(8).unwrap();
        table.complete(
            8,
            Box::new(ErrorResponse::new(8, types::error_code::ACTOR_NOT_FOUND, "gone")),
        );
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_actor_not_found());
    }

    #[tokio::test]
    async fn sweep_times_out_expired_entries() {
        let table = PendingTable::new(Duration::from_millis(1));
        let rx = table.register(9).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(table.sweep(Instant::now()), 1);
        assert!(matches!(
            rx.await.unwrap(),
            Err(RpcError::Timeout { rpc_id: 9, .. })
        ));
        // Slot is free again.
        assert!(table.register(9).is_some());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let table = PendingTable::new(Duration::from_secs(1));
        let _rx = table.register(3).unwrap();
        assert!(table.register(3).is_none());
    }

    #[tokio::test]
    async fn fail_all_drains_table() {
        let table = PendingTable::new(Duration::from_secs(5));
        let rx1 = table.register(1).unwrap();
        let rx2 = table.register(2).unwrap();
        table.fail_all(|rpc_id| RpcError::SessionClosed { rpc_id });
        assert!(matches!(
            rx1.await.unwrap(),
            Err(RpcError::SessionClosed { rpc_id: 1 })
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(RpcError::SessionClosed { rpc_id: 2 })
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn late_response_is_dropped() {
        let table = PendingTable::new(Duration::from_millis(1));
        let rx = table.register(4).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        table.sweep(Instant::now());
        assert!(rx.await.unwrap().is_err());
        // The response arriving after the sweep finds no entry.
        assert!(!table.complete(
            4,
            Box::new(Pong {
                rpc_id: 4,
                error: 0
            })
        ));
    }
}
