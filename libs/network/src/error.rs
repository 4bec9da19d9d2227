//! Transport Error Types
//!
//! Two families: [`NetworkError`] for channel/framing level failures that
//! are handled at the session boundary, and [`RpcError`] for the typed
//! failures an awaiting `call` can resolve with. Application handlers only
//! ever see `RpcError`; raw I/O and framing problems never cross that line.

use thiserror::Error;
use types::error_code;

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Error, Debug)]
pub enum NetworkError {
    /// Malformed length or header. Fatal for the connection: the stream
    /// cannot be resynchronized, so the only safe reaction is disconnect.
    #[error("framing error: {message}")]
    Framing { message: String },

    /// Connection-level failure (reset, refused, closed mid-stream).
    #[error("transport error: {message}")]
    Transport {
        message: String,
        source: Option<std::io::Error>,
    },

    /// Handshake or connect did not finish within its budget.
    #[error("connect timeout after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    /// Payload failed to encode/decode or used an unknown opcode.
    #[error(transparent)]
    Codec(#[from] codec::CodecError),

    /// Operation on a session that has already been disposed.
    #[error("session closed")]
    SessionClosed,

    /// No address is configured for the requested peer process.
    #[error("unknown peer process {process}")]
    UnknownPeer { process: u16 },
}

impl NetworkError {
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source),
        }
    }

    /// True when the error condemns the whole connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NetworkError::Framing { .. }
                | NetworkError::Transport { .. }
                | NetworkError::ConnectTimeout { .. }
                | NetworkError::SessionClosed
        )
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(error: std::io::Error) -> Self {
        NetworkError::Transport {
            message: error.to_string(),
            source: Some(error),
        }
    }
}

/// Failure of an awaited `call`. Every pending request resolves with the
/// response or with exactly one of these; none of them hang the caller.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Deadline elapsed; the pending slot has been freed. No retry is
    /// attempted by the runtime.
    #[error("rpc {rpc_id} timed out after {timeout_ms}ms")]
    Timeout { rpc_id: u32, timeout_ms: u64 },

    /// The session or link carrying the request was disposed first.
    #[error("session closed before rpc {rpc_id} completed")]
    SessionClosed { rpc_id: u32 },

    /// Caller-side cancellation removed the pending entry.
    #[error("rpc {rpc_id} cancelled")]
    Cancelled { rpc_id: u32 },

    /// The remote side answered with a nonzero error code.
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    /// The response decoded to a different type than the request expects.
    #[error("unexpected response type for rpc {rpc_id}")]
    UnexpectedResponse { rpc_id: u32 },

    /// The request never left this process.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl RpcError {
    /// True when the remote side reported the target actor as gone.
    pub fn is_actor_not_found(&self) -> bool {
        matches!(
            self,
            RpcError::Remote {
                code: error_code::ACTOR_NOT_FOUND,
                ..
            }
        )
    }
}
