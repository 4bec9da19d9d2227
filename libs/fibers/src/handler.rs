//! Handler Registry
//!
//! Explicit mapping from request/message type to handler, populated by
//! registration calls at startup — the runtime never scans for handlers.
//! The registry is immutable once built; the process context holds it
//! behind an atomically swappable `Arc`, which is the whole of the
//! "handler table refreshed" hot-reload boundary: install a new registry
//! and subsequent dispatches use it.
//!
//! Handlers are typed ([`RequestHandler`], [`MessageHandler`]); an erasure
//! adapter stores them uniformly and performs the downcasts at dispatch.
//! Handler futures are `!Send` by design — they run on the target fiber's
//! thread and may hold entity borrows across suspension points.

use crate::entity::{entity_holds_type, Entity, EntityRef};
use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::error;
use types::error_code;
use types::message::{Message, Request};
use types::ActorId;

/// Typed request handler: produces the response or an application error
/// code for the caller.
#[async_trait(?Send)]
pub trait RequestHandler<E: Entity, R: Request>: Send + Sync + 'static {
    async fn handle(
        &self,
        entity: EntityRef<E>,
        from: ActorId,
        req: R,
    ) -> Result<R::Response, i32>;
}

/// Typed one-way handler. A returned error code is logged on the serving
/// side; there is no caller to notify.
#[async_trait(?Send)]
pub trait MessageHandler<E: Entity, M: Message>: Send + Sync + 'static {
    async fn handle(&self, entity: EntityRef<E>, from: ActorId, msg: M) -> Result<(), i32>;
}

/// `Some(response)` for requests, `None` for one-way messages.
pub(crate) type HandlerOutcome = Result<Option<Box<dyn Message>>, i32>;

pub(crate) trait ErasedHandler: Send + Sync {
    fn entity_type(&self) -> TypeId;

    fn handle(
        &self,
        entity: Rc<RefCell<dyn Entity>>,
        from: ActorId,
        msg: Box<dyn Message>,
    ) -> LocalBoxFuture<'static, HandlerOutcome>;
}

struct RequestAdapter<E, R, H> {
    handler: Arc<H>,
    _marker: std::marker::PhantomData<fn() -> (E, R)>,
}

impl<E, R, H> ErasedHandler for RequestAdapter<E, R, H>
where
    E: Entity,
    R: Request,
    H: RequestHandler<E, R>,
{
    fn entity_type(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn handle(
        &self,
        entity: Rc<RefCell<dyn Entity>>,
        from: ActorId,
        msg: Box<dyn Message>,
    ) -> LocalBoxFuture<'static, HandlerOutcome> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            if !entity_holds_type::<E>(&entity) {
                error!(
                    expected = std::any::type_name::<E>(),
                    "entity type does not match registered handler"
                );
                return Err(error_code::HANDLER_FAILED);
            }
            let req = match msg.into_any().downcast::<R>() {
                Ok(req) => *req,
                Err(_) => {
                    error!(
                        expected = std::any::type_name::<R>(),
                        "request type does not match registered handler"
                    );
                    return Err(error_code::HANDLER_FAILED);
                }
            };
            let entity = EntityRef::<E>::new_unchecked(entity);
            let response = handler.handle(entity, from, req).await?;
            Ok(Some(Box::new(response) as Box<dyn Message>))
        })
    }
}

struct MessageAdapter<E, M, H> {
    handler: Arc<H>,
    _marker: std::marker::PhantomData<fn() -> (E, M)>,
}

impl<E, M, H> ErasedHandler for MessageAdapter<E, M, H>
where
    E: Entity,
    M: Message,
    H: MessageHandler<E, M>,
{
    fn entity_type(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn handle(
        &self,
        entity: Rc<RefCell<dyn Entity>>,
        from: ActorId,
        msg: Box<dyn Message>,
    ) -> LocalBoxFuture<'static, HandlerOutcome> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            if !entity_holds_type::<E>(&entity) {
                error!(
                    expected = std::any::type_name::<E>(),
                    "entity type does not match registered handler"
                );
                return Err(error_code::HANDLER_FAILED);
            }
            let msg = match msg.into_any().downcast::<M>() {
                Ok(msg) => *msg,
                Err(_) => {
                    error!(
                        expected = std::any::type_name::<M>(),
                        "message type does not match registered handler"
                    );
                    return Err(error_code::HANDLER_FAILED);
                }
            };
            let entity = EntityRef::<E>::new_unchecked(entity);
            handler.handle(entity, from, msg).await?;
            Ok(None)
        })
    }
}

/// Message-type → handler table. Built at startup, swapped wholesale on
/// refresh.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request<E, R, H>(&mut self, handler: H) -> &mut Self
    where
        E: Entity,
        R: Request,
        H: RequestHandler<E, R>,
    {
        self.handlers.insert(
            TypeId::of::<R>(),
            Arc::new(RequestAdapter::<E, R, H> {
                handler: Arc::new(handler),
                _marker: std::marker::PhantomData,
            }),
        );
        self
    }

    pub fn register_message<E, M, H>(&mut self, handler: H) -> &mut Self
    where
        E: Entity,
        M: Message,
        H: MessageHandler<E, M>,
    {
        self.handlers.insert(
            TypeId::of::<M>(),
            Arc::new(MessageAdapter::<E, M, H> {
                handler: Arc::new(handler),
                _marker: std::marker::PhantomData,
            }),
        );
        self
    }

    pub(crate) fn get(&self, message_type: TypeId) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(&message_type).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
