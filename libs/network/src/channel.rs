//! Channel Contract
//!
//! A `Channel` is an established, ordered, reliable, packet-oriented link:
//! TCP and the KCP-style UDP binding both end up here, and everything above
//! (sessions, the process mesh) only sees this trait. `recv` suspends until
//! a complete frame has been buffered; partial packets never escape the
//! transport.
//!
//! Sessions split a channel into its send and receive halves so a writer
//! task and a reader task can run concurrently.

use crate::error::Result;
use crate::framing::Frame;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Send half of a channel.
#[async_trait]
pub trait ChannelTx: Send {
    /// Frame and write one packet. Ordered with respect to earlier sends.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Flush and close the link. Further sends fail.
    async fn close(&mut self);
}

/// Receive half of a channel.
#[async_trait]
pub trait ChannelRx: Send {
    /// Next complete frame. An error here is terminal for the connection
    /// (framing violation or transport failure); callers must dispose the
    /// channel and not call `recv` again.
    async fn recv(&mut self) -> Result<Frame>;
}

/// An established bidirectional link.
pub trait Channel: Send {
    fn peer_addr(&self) -> SocketAddr;

    /// Split into independently owned halves for concurrent I/O tasks.
    fn split(self: Box<Self>) -> (Box<dyn ChannelTx>, Box<dyn ChannelRx>);
}
