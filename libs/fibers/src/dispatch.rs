//! Message Dispatcher
//!
//! Per-message path: `Received → (ordering policy) → Dispatching →
//! Completed | Faulted`. Runs on the target fiber's thread.
//!
//! Ordered targets acquire the coroutine lock keyed by their packed actor
//! id before the handler runs; the lock-wait is registered synchronously at
//! dispatch initiation, which is what makes per-target FIFO hold even
//! though many dispatch futures are in flight on the fiber. Unordered
//! targets dispatch immediately and may interleave.
//!
//! Requests always produce exactly one response for the caller: the
//! handler's, or a synthesized [`ErrorResponse`] when the target entity is
//! gone, no handler is registered, or the handler fails. Nothing here
//! lets a caller's pending RPC hang.

use crate::coroutine_lock::{CoroutineLockService, LockKind};
use crate::fiber::EntityTable;
use crate::handler::HandlerRegistry;
use crate::sender::ActorSender;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{error, warn};
use types::error_code;
use types::message::{ErrorResponse, Message, MessageKind};
use types::ActorId;

/// One-per-process services injected into every fiber at creation.
pub(crate) struct DispatchServices {
    /// Swappable handler table (hot-refresh boundary).
    pub handlers: RwLock<Arc<HandlerRegistry>>,
    pub locks: Arc<CoroutineLockService>,
    pub sender: Arc<ActorSender>,
}

/// Build the dispatch future for one inbound message. The synchronous part
/// resolves the entity, the handler, and — for ordered targets — enqueues
/// the lock wait; everything else happens when the fiber polls the future.
pub(crate) fn dispatch_message(
    services: &Arc<DispatchServices>,
    entities: &Rc<RefCell<EntityTable>>,
    routed: network::RoutedMessage,
) -> LocalBoxFuture<'static, ()> {
    let services = Arc::clone(services);
    let network::RoutedMessage { to, from, kind, msg } = routed;

    if kind == MessageKind::Response || msg.kind() == MessageKind::Response {
        // Responses are correlated at the sender layer; one reaching a
        // fiber mailbox means a misaddressed envelope.
        warn!(%to, %from, "response envelope in fiber mailbox dropped");
        return Box::pin(async {});
    }
    let is_request = kind == MessageKind::Request;
    let rpc_id = msg.rpc_id();

    let record = entities
        .borrow()
        .get(to.instance())
        .map(|r| (Rc::clone(&r.entity), r.policy));
    let Some((entity, policy)) = record else {
        return Box::pin(async move {
            if is_request {
                respond_error(
                    &services,
                    to,
                    from,
                    rpc_id,
                    error_code::ACTOR_NOT_FOUND,
                    format!("no entity at {to}"),
                )
                .await;
            } else {
                warn!(%to, "message for unknown entity dropped");
            }
        });
    };

    let registry = Arc::clone(&services.handlers.read());
    let Some(handler) = registry.get(msg.as_any().type_id()) else {
        return Box::pin(async move {
            if is_request {
                respond_error(
                    &services,
                    to,
                    from,
                    rpc_id,
                    error_code::HANDLER_NOT_FOUND,
                    String::new(),
                )
                .await;
            } else {
                warn!(%to, message = ?msg, "no handler registered, message dropped");
            }
        });
    };

    // Ordered policy: join the lock queue *now*, in arrival order.
    let lock_wait = match policy {
        crate::entity::MailboxPolicy::Ordered => {
            Some(services.locks.wait(LockKind::Mailbox, to.as_u64()))
        }
        crate::entity::MailboxPolicy::Unordered => None,
    };

    Box::pin(async move {
        let _token = match lock_wait {
            Some(wait) => match wait.await {
                Ok(token) => Some(token),
                Err(e) => {
                    // Untimed waits only fail if the lock service is gone,
                    // which means the process is tearing down.
                    error!(error = %e, %to, "mailbox lock unavailable, message dropped");
                    return;
                }
            },
            None => None,
        };

        let outcome = AssertUnwindSafe(handler.handle(entity, from, msg))
            .catch_unwind()
            .await;

        match (is_request, outcome) {
            (true, Ok(Ok(Some(mut response)))) => {
                response.set_rpc_id(rpc_id);
                if let Err(e) = services.sender.send(to, from, response).await {
                    warn!(error = %e, %from, "failed to deliver response");
                }
            }
            (true, Ok(Ok(None))) => {
                // A request handler that produces no response is a
                // registration mistake (one-way handler bound to a
                // request type).
                respond_error(
                    &services,
                    to,
                    from,
                    rpc_id,
                    error_code::HANDLER_FAILED,
                    String::new(),
                )
                .await;
            }
            (true, Ok(Err(code))) => {
                respond_error(&services, to, from, rpc_id, code, String::new()).await;
            }
            (true, Err(panic)) => {
                error!(%to, ?panic, "request handler panicked");
                respond_error(
                    &services,
                    to,
                    from,
                    rpc_id,
                    error_code::HANDLER_FAILED,
                    String::new(),
                )
                .await;
            }
            (false, Ok(Ok(_))) => {}
            (false, Ok(Err(code))) => {
                warn!(code, %to, "one-way handler failed");
            }
            (false, Err(panic)) => {
                error!(%to, ?panic, "one-way handler panicked");
            }
        }
    })
}

/// Synthesize an [`ErrorResponse`] back to the caller so its pending RPC
/// resolves deterministically instead of timing out.
async fn respond_error(
    services: &Arc<DispatchServices>,
    target: ActorId,
    caller: ActorId,
    rpc_id: u32,
    code: i32,
    message: String,
) {
    let response = ErrorResponse::new(rpc_id, code, message);
    if let Err(e) = services.sender.send(target, caller, Box::new(response)).await {
        warn!(error = %e, %caller, code, "failed to deliver error response");
    }
}
