//! Fiber
//!
//! An independently scheduled unit: its own OS thread running a
//! current-thread tokio runtime, a bounded inbound queue, and a table of
//! entities keyed by instance id. Every continuation of work started on a
//! fiber resumes on the fiber's thread; parallelism exists only *between*
//! fibers.
//!
//! The inbound queue is bounded and senders wait for space — the explicit
//! backpressure decision for the otherwise-unbounded mailbox growth risk.
//! Disposal drains the queue and rejects still-queued requests with a
//! fiber-stopped error so no caller is left hanging.

use crate::dispatch::{dispatch_message, DispatchServices};
use crate::entity::{Entity, MailboxPolicy};
use crate::error::SendError;
use network::RoutedMessage;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use types::error_code;
use types::message::{ErrorResponse, Message, MessageKind};
use types::{ActorId, FiberId, InstanceId, ProcessId};

pub(crate) struct EntityRecord {
    pub entity: Rc<RefCell<dyn Entity>>,
    pub policy: MailboxPolicy,
}

/// Fiber-local entity table. Instance ids increase monotonically from 1
/// and are never reused while the fiber lives, so a stale id misses here
/// instead of hitting a recycled entity.
pub(crate) struct EntityTable {
    entities: HashMap<InstanceId, EntityRecord>,
    next_instance: InstanceId,
}

impl EntityTable {
    fn new() -> Self {
        Self {
            entities: HashMap::new(),
            next_instance: 1,
        }
    }

    pub(crate) fn get(&self, instance: InstanceId) -> Option<&EntityRecord> {
        self.entities.get(&instance)
    }

    fn insert(&mut self, entity: Rc<RefCell<dyn Entity>>, policy: MailboxPolicy) -> InstanceId {
        let instance = self.next_instance;
        self.next_instance += 1;
        self.entities.insert(instance, EntityRecord { entity, policy });
        instance
    }

    fn remove(&mut self, instance: InstanceId) -> bool {
        self.entities.remove(&instance).is_some()
    }
}

type EntityBuilder = Box<dyn FnOnce() -> Rc<RefCell<dyn Entity>> + Send>;

pub(crate) enum FiberCommand {
    AddEntity {
        policy: MailboxPolicy,
        build: EntityBuilder,
        reply: oneshot::Sender<ActorId>,
    },
    RemoveEntity {
        instance: InstanceId,
        reply: oneshot::Sender<bool>,
    },
    Stop,
}

pub(crate) enum FiberMsg {
    Routed(RoutedMessage),
    Command(FiberCommand),
}

/// Cloneable handle to a running fiber.
#[derive(Clone)]
pub struct FiberHandle {
    id: FiberId,
    process: ProcessId,
    name: Arc<str>,
    inbox: mpsc::Sender<FiberMsg>,
}

impl FiberHandle {
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an entity on this fiber. The builder runs on the fiber's
    /// thread, so the entity itself never crosses threads.
    pub async fn spawn_entity<E, F>(
        &self,
        policy: MailboxPolicy,
        build: F,
    ) -> Result<ActorId, SendError>
    where
        E: Entity,
        F: FnOnce() -> E + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let command = FiberCommand::AddEntity {
            policy,
            build: Box::new(move || Rc::new(RefCell::new(build())) as Rc<RefCell<dyn Entity>>),
            reply,
        };
        self.send_command(command).await?;
        rx.await.map_err(|_| SendError::FiberStopped { fiber: self.id })
    }

    /// Dispose an entity. Its instance id is never handed out again.
    pub async fn remove_entity(&self, actor_id: ActorId) -> Result<bool, SendError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(FiberCommand::RemoveEntity {
            instance: actor_id.instance(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SendError::FiberStopped { fiber: self.id })
    }

    /// Ask the fiber to stop. Queued requests are rejected during drain.
    pub async fn stop(&self) {
        let _ = self.inbox.send(FiberMsg::Command(FiberCommand::Stop)).await;
    }

    pub(crate) fn inbox(&self) -> mpsc::Sender<FiberMsg> {
        self.inbox.clone()
    }

    async fn send_command(&self, command: FiberCommand) -> Result<(), SendError> {
        self.inbox
            .send(FiberMsg::Command(command))
            .await
            .map_err(|_| SendError::FiberStopped { fiber: self.id })
    }
}

/// Spawn the fiber thread. Returns the handle once the thread is started.
pub(crate) fn spawn_fiber(
    process: ProcessId,
    id: FiberId,
    name: &str,
    mailbox_capacity: usize,
    services: Arc<DispatchServices>,
) -> std::io::Result<(FiberHandle, std::thread::JoinHandle<()>)> {
    let (inbox_tx, inbox_rx) = mpsc::channel(mailbox_capacity);
    let thread_name = format!("fiber-{id}-{name}");
    let fiber_name: Arc<str> = Arc::from(name);

    let thread = std::thread::Builder::new().name(thread_name).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!(fiber = id, error = %e, "failed to build fiber runtime");
                return;
            }
        };
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, fiber_main(process, id, services, inbox_rx));
    })?;

    Ok((
        FiberHandle {
            id,
            process,
            name: fiber_name,
            inbox: inbox_tx,
        },
        thread,
    ))
}

async fn fiber_main(
    process: ProcessId,
    id: FiberId,
    services: Arc<DispatchServices>,
    mut inbox: mpsc::Receiver<FiberMsg>,
) {
    info!(fiber = id, "fiber started");
    let entities = Rc::new(RefCell::new(EntityTable::new()));
    let mut in_flight = FuturesUnordered::new();

    loop {
        tokio::select! {
            biased;

            msg = inbox.recv() => match msg {
                None => break,
                Some(FiberMsg::Command(FiberCommand::Stop)) => break,
                Some(FiberMsg::Command(FiberCommand::AddEntity { policy, build, reply })) => {
                    let instance = entities.borrow_mut().insert(build(), policy);
                    let actor_id = ActorId::new(process, id, instance);
                    debug!(%actor_id, ?policy, "entity registered");
                    let _ = reply.send(actor_id);
                }
                Some(FiberMsg::Command(FiberCommand::RemoveEntity { instance, reply })) => {
                    let removed = entities.borrow_mut().remove(instance);
                    debug!(fiber = id, instance, removed, "entity removed");
                    let _ = reply.send(removed);
                }
                Some(FiberMsg::Routed(routed)) => {
                    in_flight.push(dispatch_message(&services, &entities, routed));
                }
            },

            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
        }
    }

    // Drain: reject queued requests deterministically, drop the rest.
    inbox.close();
    while let Ok(msg) = inbox.try_recv() {
        if let FiberMsg::Routed(routed) = msg {
            if routed.kind == MessageKind::Request {
                let response = ErrorResponse::new(
                    routed.msg.rpc_id(),
                    error_code::FIBER_STOPPED,
                    format!("fiber {id} stopped"),
                );
                if let Err(e) = services
                    .sender
                    .send(routed.to, routed.from, Box::new(response))
                    .await
                {
                    warn!(error = %e, "failed to reject queued request during drain");
                }
            }
        }
    }
    // In-flight dispatches are dropped with the fiber; their lock tokens
    // release on drop.
    drop(in_flight);
    info!(fiber = id, "fiber stopped");
}
