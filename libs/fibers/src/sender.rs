//! Location-Transparent Sender
//!
//! The process-level component behind `send` and `call`. Routing is by the
//! destination [`ActorId`]: a local process id delivers straight into the
//! target fiber's inbound queue with no serialization; anything else is
//! serialized once and shipped over the process mesh. Callers cannot tell
//! the difference — same API, same failure taxonomy.
//!
//! Calls correlate through a process-scoped [`PendingTable`]; responses
//! come back addressed to the reserved fiber id 0 and complete the table.
//! A periodic sweep enforces deadlines. The router task feeding this
//! component is spawned by the process context.

use crate::error::SendError;
use crate::fiber::FiberMsg;
use dashmap::DashMap;
use network::{PendingTable, ProcessMesh, Route, RoutedMessage, RpcError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use types::actor_id::PROCESS_FIBER_ID;
use types::error_code;
use types::message::{Message, MessageKind, Request};
use types::{ActorId, FiberId, ProcessId};

/// Live fibers' inboxes, shared between the manager (which registers) and
/// the sender/router (which deliver).
#[derive(Default)]
pub(crate) struct FiberTable {
    inboxes: DashMap<FiberId, mpsc::Sender<FiberMsg>>,
}

impl FiberTable {
    pub(crate) fn register(&self, fiber: FiberId, inbox: mpsc::Sender<FiberMsg>) {
        self.inboxes.insert(fiber, inbox);
    }

    pub(crate) fn unregister(&self, fiber: FiberId) {
        self.inboxes.remove(&fiber);
    }

    pub(crate) fn inbox(&self, fiber: FiberId) -> Option<mpsc::Sender<FiberMsg>> {
        self.inboxes.get(&fiber).map(|entry| entry.clone())
    }
}

pub struct ActorSender {
    process: ProcessId,
    pending: Arc<PendingTable>,
    mesh: Arc<ProcessMesh>,
    fibers: Arc<FiberTable>,
}

impl ActorSender {
    pub(crate) fn new(
        process: ProcessId,
        pending: Arc<PendingTable>,
        mesh: Arc<ProcessMesh>,
        fibers: Arc<FiberTable>,
    ) -> Self {
        Self {
            process,
            pending,
            mesh,
            fibers,
        }
    }

    pub fn local_process(&self) -> ProcessId {
        self.process
    }

    pub(crate) fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// Fire-and-forget. No delivery guarantee beyond the transport's own;
    /// backpressure from a full local inbox is awaited, not dropped.
    pub async fn send(
        &self,
        from: ActorId,
        to: ActorId,
        msg: Box<dyn Message>,
    ) -> Result<(), SendError> {
        let kind = msg.kind();
        if to.process() != self.process {
            // Remote: one serialization inside the session, then the wire.
            let route = Route { to, from, kind };
            self.mesh
                .send_to(to.process(), route, msg.as_ref())
                .await?;
            return Ok(());
        }

        if to.fiber() == PROCESS_FIBER_ID {
            // Responses to this process's own calls.
            if kind == MessageKind::Response {
                let rpc_id = msg.rpc_id();
                if !self.pending.complete(rpc_id, msg) {
                    trace!(rpc_id, "local response without pending entry");
                }
                return Ok(());
            }
            return Err(SendError::UnknownFiber {
                fiber: PROCESS_FIBER_ID,
            });
        }

        let inbox = self
            .fibers
            .inbox(to.fiber())
            .ok_or(SendError::UnknownFiber { fiber: to.fiber() })?;
        inbox
            .send(FiberMsg::Routed(RoutedMessage { to, from, kind, msg }))
            .await
            .map_err(|_| SendError::FiberStopped { fiber: to.fiber() })
    }

    /// Request/response addressed by actor id. Resolves with the response,
    /// a remote error code, or the deadline timeout — never a hang.
    pub async fn call<R: Request>(
        &self,
        to: ActorId,
        mut req: R,
    ) -> Result<R::Response, RpcError> {
        let rpc_id = self.pending.next_rpc_id();
        req.set_rpc_id(rpc_id);
        let Some(rx) = self.pending.register(rpc_id) else {
            warn!(rpc_id, "rpc id collision, call aborted");
            return Err(RpcError::Cancelled { rpc_id });
        };

        let from = ActorId::process_root(self.process);
        if let Err(e) = self.send(from, to, Box::new(req)).await {
            self.pending.fail(rpc_id, RpcError::Cancelled { rpc_id });
            return Err(match e {
                // A missing local fiber is indistinguishable from a stale
                // target: resolve it the way a remote dispatcher would.
                SendError::UnknownFiber { .. } | SendError::FiberStopped { .. } => {
                    RpcError::Remote {
                        code: error_code::ACTOR_NOT_FOUND,
                        message: format!("no route to {to}"),
                    }
                }
                SendError::Network(net) => RpcError::Network(net),
            });
        }

        match rx.await {
            Ok(result) => {
                let msg = result?;
                msg.into_any()
                    .downcast::<R::Response>()
                    .map(|b| *b)
                    .map_err(|_| RpcError::UnexpectedResponse { rpc_id })
            }
            Err(_) => Err(RpcError::SessionClosed { rpc_id }),
        }
    }

    /// Deliver one envelope that arrived over the mesh. Runs on the router
    /// task.
    pub(crate) async fn deliver_inbound(&self, routed: RoutedMessage) {
        // Rewrite the process segment defensively; the envelope reached
        // this process, so this process owns the address now.
        let to = routed.to.with_process(self.process);
        let routed = RoutedMessage { to, ..routed };

        if to.fiber() == PROCESS_FIBER_ID && routed.kind == MessageKind::Response {
            let rpc_id = routed.msg.rpc_id();
            if !self.pending.complete(rpc_id, routed.msg) {
                trace!(rpc_id, "late remote response dropped");
            }
            return;
        }

        let Some(inbox) = self.fibers.inbox(to.fiber()) else {
            self.reject_unroutable(routed).await;
            return;
        };
        let fiber = to.fiber();
        if let Err(send_failed) = inbox.send(FiberMsg::Routed(routed)).await {
            let mpsc::error::SendError(FiberMsg::Routed(routed)) = send_failed else {
                return;
            };
            warn!(fiber, "fiber inbox closed while delivering");
            self.reject_unroutable(routed).await;
        }
    }

    /// A remote request that cannot reach any fiber still gets a
    /// deterministic answer.
    async fn reject_unroutable(&self, routed: RoutedMessage) {
        if routed.kind != MessageKind::Request {
            warn!(to = %routed.to, "unroutable envelope dropped");
            return;
        }
        let response = types::message::ErrorResponse::new(
            routed.msg.rpc_id(),
            error_code::ACTOR_NOT_FOUND,
            format!("no fiber {} in process {}", routed.to.fiber(), self.process),
        );
        if let Err(e) = self
            .send(routed.to, routed.from, Box::new(response))
            .await
        {
            warn!(error = %e, caller = %routed.from, "failed to reject unroutable request");
        }
    }
}
