//! Transport Layer
//!
//! Everything between raw sockets and the actor layer:
//!
//! - [`framing`] — the length-prefixed packet format and its two-state
//!   incremental parser, in the trusted inner and untrusted outer variants.
//! - [`channel`] — the `Channel` contract the rest of the system sees:
//!   ordered, reliable, packet-oriented byte transport.
//! - [`tcp`] — the streaming binding over `tokio::net::TcpStream`.
//! - [`kcp`] — the reliable-messaging binding over UDP datagrams: ARQ with
//!   per-segment sequencing, retransmission, and congestion control, exposed
//!   as an ordinary ordered `Channel`.
//! - [`session`] / [`rpc`] — one logical connection with RPC correlation,
//!   deadline sweeps, and idle-timeout disposal.
//! - [`mesh`] — process-to-process links: lazy dial by peer id, accept loop,
//!   routed actor envelopes.
//!
//! Framing and transport failures are contained here; they surface to upper
//! layers only as the typed errors in [`error`], never as raw I/O errors
//! inside message handlers.

pub mod channel;
pub mod error;
pub mod framing;
pub mod kcp;
pub mod mesh;
pub mod rpc;
pub mod session;
pub mod tcp;

pub use channel::{Channel, ChannelRx, ChannelTx};
pub use error::{NetworkError, Result, RpcError};
pub use framing::{Frame, FrameFormat, FrameParser, Route};
pub use kcp::{KcpChannel, KcpConnector, KcpListener};
pub use mesh::{MeshConfig, ProcessMesh};
pub use rpc::PendingTable;
pub use session::{RoutedMessage, Session, SessionConfig, SessionEvent};
pub use tcp::{TcpAcceptor, TcpChannel};

/// Default RPC deadline.
pub const RPC_TIMEOUT_MS: u64 = 40_000;

/// Default interval between pending-table deadline sweeps.
pub const RPC_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Default idle threshold after which a session is disposed.
pub const SESSION_IDLE_TIMEOUT_MS: u64 = 40_000;
