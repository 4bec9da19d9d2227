//! Message Traits
//!
//! Every payload that crosses a fiber or process boundary implements
//! [`Message`]. The trait is object-safe so the dispatcher and codec can
//! work with `Box<dyn Message>`; the typed [`Request`] trait links a request
//! to its response type for the `call` APIs.
//!
//! Requests carry an application-level `rpc_id`; responses carry `rpc_id`
//! plus an `error` code. A nonzero error means the response's business
//! fields are undefined and only the error code/text are meaningful.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Role of a message in the request/response protocol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MessageKind {
    /// Fire-and-forget notification; no caller is waiting.
    OneWay = 0,
    Request = 1,
    Response = 2,
}

impl MessageKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(MessageKind::OneWay),
            1 => Some(MessageKind::Request),
            2 => Some(MessageKind::Response),
            _ => None,
        }
    }
}

/// Object-safe message surface.
///
/// `rpc_id`/`error` accessors have meaning only for the kinds that carry
/// them; for one-way messages the defaults apply.
pub trait Message: Any + Send + Sync + fmt::Debug + 'static {
    fn kind(&self) -> MessageKind {
        MessageKind::OneWay
    }

    fn rpc_id(&self) -> u32 {
        0
    }

    fn set_rpc_id(&mut self, _rpc_id: u32) {}

    fn error(&self) -> i32 {
        0
    }

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Typed request: links a request struct to its response struct so that
/// `call` sites get back the concrete response type.
pub trait Request: Message + Serialize + serde::de::DeserializeOwned {
    type Response: Message + Serialize + serde::de::DeserializeOwned;
}

/// Implements [`Message`] for a fire-and-forget notification type.
#[macro_export]
macro_rules! one_way_message {
    ($ty:ty) => {
        impl $crate::message::Message for $ty {
            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn into_any(self: Box<Self>) -> Box<dyn ::std::any::Any + Send> {
                self
            }
        }
    };
}

/// Implements [`Message`] + [`Request`] for a request type. The struct must
/// have an `rpc_id: u32` field.
#[macro_export]
macro_rules! request_message {
    ($req:ty => $resp:ty) => {
        impl $crate::message::Message for $req {
            fn kind(&self) -> $crate::message::MessageKind {
                $crate::message::MessageKind::Request
            }

            fn rpc_id(&self) -> u32 {
                self.rpc_id
            }

            fn set_rpc_id(&mut self, rpc_id: u32) {
                self.rpc_id = rpc_id;
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn into_any(self: Box<Self>) -> Box<dyn ::std::any::Any + Send> {
                self
            }
        }

        impl $crate::message::Request for $req {
            type Response = $resp;
        }
    };
}

/// Implements [`Message`] for a response type. The struct must have
/// `rpc_id: u32` and `error: i32` fields.
#[macro_export]
macro_rules! response_message {
    ($ty:ty) => {
        impl $crate::message::Message for $ty {
            fn kind(&self) -> $crate::message::MessageKind {
                $crate::message::MessageKind::Response
            }

            fn rpc_id(&self) -> u32 {
                self.rpc_id
            }

            fn set_rpc_id(&mut self, rpc_id: u32) {
                self.rpc_id = rpc_id;
            }

            fn error(&self) -> i32 {
                self.error
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn into_any(self: Box<Self>) -> Box<dyn ::std::any::Any + Send> {
                self
            }
        }
    };
}

/// Synthesized failure response. The dispatcher sends this back when a
/// request cannot reach a handler (stale target, handler failure), so the
/// caller's pending RPC resolves deterministically instead of timing out.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub rpc_id: u32,
    pub error: i32,
    pub message: String,
}

response_message!(ErrorResponse);

impl ErrorResponse {
    pub fn new(rpc_id: u32, error: i32, message: impl Into<String>) -> Self {
        Self {
            rpc_id,
            error,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Tick {
        n: u64,
    }
    one_way_message!(Tick);

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct EchoRequest {
        rpc_id: u32,
        text: String,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct EchoResponse {
        rpc_id: u32,
        error: i32,
        text: String,
    }

    request_message!(EchoRequest => EchoResponse);
    response_message!(EchoResponse);

    #[test]
    fn kinds() {
        assert_eq!(Tick { n: 1 }.kind(), MessageKind::OneWay);
        assert_eq!(EchoRequest::default().kind(), MessageKind::Request);
        assert_eq!(EchoResponse::default().kind(), MessageKind::Response);
    }

    #[test]
    fn rpc_id_round_trips_through_dyn() {
        let mut req: Box<dyn Message> = Box::new(EchoRequest::default());
        req.set_rpc_id(42);
        assert_eq!(req.rpc_id(), 42);

        let concrete = req.into_any().downcast::<EchoRequest>().unwrap();
        assert_eq!(concrete.rpc_id, 42);
    }

    #[test]
    fn error_response_carries_code() {
        let resp = ErrorResponse::new(7, 100_002, "gone");
        assert_eq!(resp.kind(), MessageKind::Response);
        assert_eq!(resp.rpc_id(), 7);
        assert_eq!(resp.error(), 100_002);
    }

    #[test]
    fn kind_from_u8_rejects_unknown() {
        assert_eq!(MessageKind::from_u8(2), Some(MessageKind::Response));
        assert_eq!(MessageKind::from_u8(3), None);
    }
}
