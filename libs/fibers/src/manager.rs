//! Fiber Manager
//!
//! Creates fibers on demand — one per logical scene (realm, gate, map,
//! location, ...) — assigns fiber ids, wires each new fiber into the
//! process's fiber table, and tears them down again. Owned by the process
//! context; never a global.

use crate::dispatch::DispatchServices;
use crate::error::SendError;
use crate::fiber::{spawn_fiber, FiberHandle};
use crate::sender::FiberTable;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use types::{FiberId, ProcessId};

struct FiberRecord {
    handle: FiberHandle,
    thread: std::thread::JoinHandle<()>,
}

pub struct FiberManager {
    process: ProcessId,
    mailbox_capacity: usize,
    services: Arc<DispatchServices>,
    table: Arc<FiberTable>,
    /// Fiber ids start at 1; 0 is the process-level responder address.
    next_fiber: AtomicU16,
    fibers: Mutex<HashMap<FiberId, FiberRecord>>,
}

impl FiberManager {
    pub(crate) fn new(
        process: ProcessId,
        mailbox_capacity: usize,
        services: Arc<DispatchServices>,
        table: Arc<FiberTable>,
    ) -> Self {
        Self {
            process,
            mailbox_capacity,
            services,
            table,
            next_fiber: AtomicU16::new(1),
            fibers: Mutex::new(HashMap::new()),
        }
    }

    /// Create a fiber with its own thread and register it for routing.
    pub fn spawn(&self, name: &str) -> std::io::Result<FiberHandle> {
        let id = self.next_fiber.fetch_add(1, Ordering::Relaxed);
        let (handle, thread) = spawn_fiber(
            self.process,
            id,
            name,
            self.mailbox_capacity,
            Arc::clone(&self.services),
        )?;
        self.table.register(id, handle.inbox());
        self.fibers
            .lock()
            .insert(id, FiberRecord {
                handle: handle.clone(),
                thread,
            });
        info!(fiber = id, name, "fiber spawned");
        Ok(handle)
    }

    pub fn get(&self, fiber: FiberId) -> Option<FiberHandle> {
        self.fibers.lock().get(&fiber).map(|r| r.handle.clone())
    }

    /// Stop a fiber and wait for its thread to finish. Messages queued at
    /// stop time are rejected by the fiber's drain.
    pub async fn dispose(&self, fiber: FiberId) -> Result<(), SendError> {
        let record = self
            .fibers
            .lock()
            .remove(&fiber)
            .ok_or(SendError::UnknownFiber { fiber })?;
        self.table.unregister(fiber);
        record.handle.stop().await;

        // Join off the async runtime; fiber threads exit quickly once the
        // stop command drains.
        let joined = tokio::task::spawn_blocking(move || record.thread.join()).await;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!(fiber, "fiber thread panicked during shutdown"),
            Err(e) => warn!(fiber, error = %e, "failed to join fiber thread"),
        }
        info!(fiber, "fiber disposed");
        Ok(())
    }

    pub fn fiber_ids(&self) -> Vec<FiberId> {
        self.fibers.lock().keys().copied().collect()
    }

    /// Stop every fiber (process shutdown).
    pub async fn shutdown(&self) {
        for fiber in self.fiber_ids() {
            if let Err(e) = self.dispose(fiber).await {
                warn!(fiber, error = %e, "fiber dispose failed during shutdown");
            }
        }
    }
}
