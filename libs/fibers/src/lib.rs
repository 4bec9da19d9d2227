//! Fiber/Actor Runtime
//!
//! The execution model above the transport: [`Fiber`]s are independently
//! scheduled logical processes, each pinned to its own single-threaded
//! execution context so that every continuation of work started on a fiber
//! resumes on that fiber and never on an arbitrary pool thread. Fibers run
//! in parallel with each other across dedicated OS threads.
//!
//! Entities live inside fibers, addressed by [`ActorId`](types::ActorId)
//! and fed by per-entity mailboxes with a fixed ordering policy. The
//! [`ActorSender`] gives location-transparent `send`/`call`: local targets
//! get the message by direct enqueue, remote targets by serialization over
//! the process mesh — same API either way.
//!
//! Services that exist once per process (codec registry, handler registry,
//! coroutine locks, the sender, the mesh) are owned by [`ProcessContext`]
//! and injected into fibers at creation; there are no global singletons.

pub mod config;
pub mod context;
pub mod coroutine_lock;
mod dispatch;
pub mod entity;
pub mod error;
pub mod fiber;
pub mod handler;
pub mod manager;
pub mod sender;

pub use config::ProcessConfig;
pub use context::ProcessContext;
pub use coroutine_lock::{CoroutineLockService, LockKind, LockToken};
pub use entity::{Entity, EntityRef, MailboxPolicy};
pub use error::{ConfigError, LockError, SendError};
pub use fiber::FiberHandle;
pub use handler::{HandlerRegistry, MessageHandler, RequestHandler};
pub use manager::FiberManager;
pub use sender::ActorSender;
