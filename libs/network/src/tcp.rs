//! TCP Channel Binding
//!
//! The streaming transport: a `TcpStream` with `TCP_NODELAY`, framed by
//! [`FrameParser`]. Connect/accept establish the link; the stream's own
//! ordering and reliability carry the channel guarantees.

use crate::channel::{Channel, ChannelRx, ChannelTx};
use crate::error::{NetworkError, Result};
use crate::framing::{encode_frame, Frame, FrameFormat, FrameParser};
use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

const READ_CHUNK: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpChannel {
    tx: TcpFrameTx,
    rx: TcpFrameRx,
    peer: SocketAddr,
}

impl TcpChannel {
    /// Dial a peer. The format decides the framing header on this link.
    pub async fn connect(addr: SocketAddr, format: FrameFormat) -> Result<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectTimeout {
                timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            })?
            .map_err(|e| NetworkError::transport_with_source("tcp connect failed", e))?;
        Self::from_stream(stream, format)
    }

    pub(crate) fn from_stream(stream: TcpStream, format: FrameFormat) -> Result<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }
        let peer = stream
            .peer_addr()
            .map_err(|e| NetworkError::transport_with_source("no peer address", e))?;
        let (read, write) = stream.into_split();
        debug!(%peer, ?format, "tcp channel established");
        Ok(Self {
            tx: TcpFrameTx {
                write,
                format,
                buf: BytesMut::with_capacity(READ_CHUNK),
            },
            rx: TcpFrameRx {
                read,
                parser: FrameParser::new(format),
                poisoned: false,
            },
            peer,
        })
    }

    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        self.tx.send(frame).await
    }

    pub async fn recv(&mut self) -> Result<Frame> {
        self.rx.recv().await
    }
}

impl Channel for TcpChannel {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn split(self: Box<Self>) -> (Box<dyn ChannelTx>, Box<dyn ChannelRx>) {
        (Box::new(self.tx), Box::new(self.rx))
    }
}

pub struct TcpFrameTx {
    write: OwnedWriteHalf,
    format: FrameFormat,
    buf: BytesMut,
}

#[async_trait]
impl ChannelTx for TcpFrameTx {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.buf.clear();
        encode_frame(self.format, &frame, &mut self.buf)?;
        self.write
            .write_all(&self.buf)
            .await
            .map_err(|e| NetworkError::transport_with_source("tcp write failed", e))?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.write.shutdown().await;
    }
}

pub struct TcpFrameRx {
    read: OwnedReadHalf,
    parser: FrameParser,
    /// Set after a framing error; the stream position is unrecoverable.
    poisoned: bool,
}

#[async_trait]
impl ChannelRx for TcpFrameRx {
    async fn recv(&mut self) -> Result<Frame> {
        if self.poisoned {
            return Err(NetworkError::framing("channel poisoned by earlier framing error"));
        }
        loop {
            match self.parser.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self
                .read
                .read(&mut chunk)
                .await
                .map_err(|e| NetworkError::transport_with_source("tcp read failed", e))?;
            if n == 0 {
                return Err(NetworkError::transport("connection closed by peer"));
            }
            self.parser.feed(&chunk[..n]);
        }
    }
}

/// Listener side: accepts raw streams and wraps them as channels.
pub struct TcpAcceptor {
    listener: TcpListener,
    format: FrameFormat,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr, format: FrameFormat) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::transport_with_source("tcp bind failed", e))?;
        debug!(%addr, ?format, "tcp acceptor listening");
        Ok(Self { listener, format })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| NetworkError::transport_with_source("no local address", e))
    }

    pub async fn accept(&self) -> Result<TcpChannel> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| NetworkError::transport_with_source("tcp accept failed", e))?;
        TcpChannel::from_stream(stream, self.format)
    }
}
