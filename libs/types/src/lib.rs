//! Core Value Types
//!
//! Pure value types shared by every layer of the fibermesh runtime: the
//! packed [`ActorId`] address, the [`Message`]/[`Request`]/[`Response`]
//! traits that the codec and dispatcher operate on, and the application
//! error codes carried inside response payloads.
//!
//! This crate has no async machinery and no I/O; everything here is a value
//! or a trait definition.

pub mod actor_id;
pub mod error_code;
pub mod message;

pub use actor_id::{ActorId, FiberId, InstanceId, ProcessId};
pub use message::{ErrorResponse, Message, MessageKind, Request};
