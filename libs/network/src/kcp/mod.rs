//! Reliable-UDP Channel Binding
//!
//! Ordered, reliable messaging over unreliable datagrams, exposed to the
//! rest of the system as an ordinary [`Channel`](crate::channel::Channel).
//! The ARQ machinery — per-segment sequencing, cumulative acks with fast
//! retransmit, RTT-estimated retransmission timeouts, and a send/congestion
//! window — lives in [`core`] as a pure state machine driven by an external
//! clock, which is what makes it testable without sockets. [`channel`]
//! wraps it around a `UdpSocket` with a SYN/ACK/FIN conversation handshake.
//!
//! Datagram layout: a one-byte command, then command-specific fields.
//! `MSG` datagrams carry one or more ARQ segments (see [`segment`]).

pub mod channel;
pub mod core;
pub mod segment;

pub use channel::{KcpChannel, KcpConnector, KcpListener};

/// Datagram-level commands for connection management.
pub mod command {
    pub const SYN: u8 = 1;
    pub const ACK: u8 = 2;
    pub const FIN: u8 = 3;
    pub const MSG: u8 = 4;
}
