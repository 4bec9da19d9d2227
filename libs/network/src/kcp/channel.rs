//! UDP Channel Driver
//!
//! Wraps [`ArqCore`] around a `UdpSocket` and exposes the result as a
//! [`Channel`]. Connection establishment is a SYN/ACK conversation: the
//! client picks a random conversation id and repeats `SYN` until the
//! acceptor answers `ACK` with the id it allocated for its side; data then
//! flows as `MSG` datagrams whose segments carry the receiver's id, which
//! is what lets one listening socket demultiplex all of its conversations.
//! `FIN` tears the conversation down in either direction.

use super::command;
use super::core::ArqCore;
use crate::channel::{Channel, ChannelRx, ChannelTx};
use crate::error::{NetworkError, Result};
use crate::framing::{encode_frame, Frame, FrameFormat, FrameParser};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

const HANDSHAKE_RESEND: Duration = Duration::from_millis(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const TICK: Duration = Duration::from_millis(10);
const MAX_DATAGRAM: usize = 64 * 1024;

enum DriverCmd {
    Send(Frame),
    Close,
}

pub struct KcpChannel {
    peer: SocketAddr,
    tx: KcpTx,
    rx: KcpRx,
}

impl KcpChannel {
    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        self.tx.send(frame).await
    }

    pub async fn recv(&mut self) -> Result<Frame> {
        self.rx.recv().await
    }
}

impl Channel for KcpChannel {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn split(self: Box<Self>) -> (Box<dyn ChannelTx>, Box<dyn ChannelRx>) {
        (Box::new(self.tx), Box::new(self.rx))
    }
}

pub struct KcpTx {
    cmd_tx: mpsc::Sender<DriverCmd>,
}

#[async_trait]
impl ChannelTx for KcpTx {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.cmd_tx
            .send(DriverCmd::Send(frame))
            .await
            .map_err(|_| NetworkError::transport("kcp driver gone"))
    }

    async fn close(&mut self) {
        let _ = self.cmd_tx.send(DriverCmd::Close).await;
    }
}

pub struct KcpRx {
    in_rx: mpsc::Receiver<Result<Frame>>,
}

#[async_trait]
impl ChannelRx for KcpRx {
    async fn recv(&mut self) -> Result<Frame> {
        match self.in_rx.recv().await {
            Some(result) => result,
            None => Err(NetworkError::transport("kcp connection closed")),
        }
    }
}

/// Client-side establishment.
pub struct KcpConnector;

impl KcpConnector {
    pub async fn connect(remote: SocketAddr, format: FrameFormat) -> Result<KcpChannel> {
        let bind = SocketAddr::new(
            if remote.is_ipv4() {
                std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
            } else {
                std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
            },
            0,
        );
        let socket = Arc::new(
            UdpSocket::bind(bind)
                .await
                .map_err(|e| NetworkError::transport_with_source("udp bind failed", e))?,
        );
        socket
            .connect(remote)
            .await
            .map_err(|e| NetworkError::transport_with_source("udp connect failed", e))?;

        let client_conv: u32 = rand::random::<u32>() | 1;
        let mut syn = vec![command::SYN];
        syn.extend_from_slice(&client_conv.to_le_bytes());

        // Repeat SYN until the acceptor's ACK names our conversation.
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let server_conv = loop {
            if Instant::now() >= deadline {
                return Err(NetworkError::ConnectTimeout {
                    timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
                });
            }
            socket
                .send(&syn)
                .await
                .map_err(|e| NetworkError::transport_with_source("syn send failed", e))?;

            let mut buf = [0u8; 64];
            match tokio::time::timeout(HANDSHAKE_RESEND, socket.recv(&mut buf)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    return Err(NetworkError::transport_with_source("handshake recv failed", e))
                }
                Ok(Ok(n)) => {
                    if n >= 9 && buf[0] == command::ACK {
                        let echoed = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
                        if echoed == client_conv {
                            break u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
                        }
                    }
                }
            }
        };
        debug!(%remote, client_conv, server_conv, "kcp conversation established");

        let (dg_tx, dg_rx) = mpsc::channel::<Vec<u8>>(256);
        let (cmd_tx, cmd_rx) = mpsc::channel::<DriverCmd>(256);
        let (in_tx, in_rx) = mpsc::channel::<Result<Frame>>(256);

        // Dedicated socket: a small read task feeds the driver.
        let read_socket = Arc::clone(&socket);
        let read_conv = client_conv;
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match read_socket.recv(&mut buf).await {
                    Ok(n) if n > 0 => {
                        if accepts_conv(&buf[..n], read_conv)
                            && dg_tx.send(buf[..n].to_vec()).await.is_err()
                        {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });

        let driver = Driver {
            socket: SendHalf::Connected(socket),
            peer: remote,
            format,
            core: ArqCore::new(server_conv),
            parser: FrameParser::new(format),
            local_conv: client_conv,
            started: Instant::now(),
            dg_rx,
            cmd_rx,
            in_tx,
        };
        tokio::spawn(driver.run());

        Ok(KcpChannel {
            peer: remote,
            tx: KcpTx { cmd_tx },
            rx: KcpRx { in_rx },
        })
    }
}

/// Datagram belongs to this conversation: handshake replies always pass,
/// MSG/FIN must name our local id.
fn accepts_conv(datagram: &[u8], local_conv: u32) -> bool {
    match datagram[0] {
        command::ACK => true,
        command::MSG | command::FIN if datagram.len() >= 5 => {
            u32::from_le_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]) == local_conv
        }
        _ => false,
    }
}

enum SendHalf {
    /// Client socket, already connected to the peer.
    Connected(Arc<UdpSocket>),
    /// Listener socket shared by all conversations; sends name the peer.
    Shared(Arc<UdpSocket>),
}

impl SendHalf {
    async fn send_to_peer(&self, data: &[u8], peer: SocketAddr) -> std::io::Result<usize> {
        match self {
            SendHalf::Connected(socket) => socket.send(data).await,
            SendHalf::Shared(socket) => socket.send_to(data, peer).await,
        }
    }
}

struct Driver {
    socket: SendHalf,
    peer: SocketAddr,
    format: FrameFormat,
    core: ArqCore,
    parser: FrameParser,
    local_conv: u32,
    started: Instant,
    dg_rx: mpsc::Receiver<Vec<u8>>,
    cmd_rx: mpsc::Receiver<DriverCmd>,
    in_tx: mpsc::Sender<Result<Frame>>,
}

impl Driver {
    fn now_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut encode_buf = BytesMut::new();

        loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(DriverCmd::Send(frame)) => {
                        encode_buf.clear();
                        if let Err(e) = encode_frame(self.format, &frame, &mut encode_buf) {
                            let _ = self.in_tx.send(Err(e)).await;
                            self.send_fin().await;
                            break;
                        }
                        self.core.send(&encode_buf);
                    }
                    Some(DriverCmd::Close) | None => {
                        self.flush().await;
                        self.send_fin().await;
                        break;
                    }
                },

                datagram = self.dg_rx.recv() => match datagram {
                    Some(datagram) => {
                        if !self.handle_datagram(&datagram).await {
                            break;
                        }
                    }
                    None => {
                        // Demux entry gone (listener stopped or evicted us).
                        let _ = self.in_tx
                            .send(Err(NetworkError::transport("kcp demux gone")))
                            .await;
                        break;
                    }
                },

                _ = tick.tick() => {
                    self.flush().await;
                    if self.core.is_dead() {
                        warn!(peer = %self.peer, "kcp link dead, too many retransmissions");
                        let _ = self.in_tx
                            .send(Err(NetworkError::transport("kcp link dead")))
                            .await;
                        break;
                    }
                }
            }
        }
        trace!(peer = %self.peer, conv = self.local_conv, "kcp driver stopped");
    }

    /// Returns false when the conversation must end.
    async fn handle_datagram(&mut self, datagram: &[u8]) -> bool {
        match datagram[0] {
            command::MSG => {
                let now = self.now_ms();
                if let Err(e) = self.core.input(&datagram[1..], now) {
                    let _ = self.in_tx.send(Err(e)).await;
                    self.send_fin().await;
                    return false;
                }
                while let Some(message) = self.core.recv() {
                    self.parser.feed(&message);
                    loop {
                        match self.parser.next_frame() {
                            Ok(Some(frame)) => {
                                if self.in_tx.send(Ok(frame)).await.is_err() {
                                    // Receiver gone; stop quietly.
                                    self.send_fin().await;
                                    return false;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                let _ = self.in_tx.send(Err(e)).await;
                                self.send_fin().await;
                                return false;
                            }
                        }
                    }
                }
                true
            }
            command::FIN => {
                debug!(peer = %self.peer, "kcp peer closed conversation");
                let _ = self
                    .in_tx
                    .send(Err(NetworkError::transport("closed by peer")))
                    .await;
                false
            }
            _ => true,
        }
    }

    async fn flush(&mut self) {
        let now = self.now_ms();
        for body in self.core.update(now) {
            let mut packet = Vec::with_capacity(1 + body.len());
            packet.push(command::MSG);
            packet.extend_from_slice(&body);
            if let Err(e) = self.socket.send_to_peer(&packet, self.peer).await {
                trace!(peer = %self.peer, error = %e, "udp send failed");
            }
        }
    }

    async fn send_fin(&self) {
        let mut fin = vec![command::FIN];
        // The peer knows the conversation by the id it allocated for us;
        // our segments already carry it, and so does the FIN.
        fin.extend_from_slice(&self.remote_conv_bytes());
        fin.extend_from_slice(&0u32.to_le_bytes());
        let _ = self.socket.send_to_peer(&fin, self.peer).await;
    }

    fn remote_conv_bytes(&self) -> [u8; 4] {
        self.core.remote_conv().to_le_bytes()
    }
}

struct PendingAccept {
    server_conv: u32,
}

/// Acceptor side: one socket, many conversations.
pub struct KcpListener {
    local: SocketAddr,
    accept_rx: Mutex<mpsc::Receiver<KcpChannel>>,
}

impl KcpListener {
    pub async fn bind(addr: SocketAddr, format: FrameFormat) -> Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .map_err(|e| NetworkError::transport_with_source("udp bind failed", e))?,
        );
        let local = socket
            .local_addr()
            .map_err(|e| NetworkError::transport_with_source("no local address", e))?;
        let (accept_tx, accept_rx) = mpsc::channel(64);

        tokio::spawn(demux_loop(socket, format, accept_tx));
        debug!(%local, ?format, "kcp listener bound");

        Ok(Self {
            local,
            accept_rx: Mutex::new(accept_rx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn accept(&self) -> Result<KcpChannel> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| NetworkError::transport("kcp listener closed"))
    }
}

async fn demux_loop(
    socket: Arc<UdpSocket>,
    format: FrameFormat,
    accept_tx: mpsc::Sender<KcpChannel>,
) {
    let conv_alloc = AtomicU32::new(1);
    // Live conversations by our allocated id, and handshake dedupe by
    // (peer, client id) so SYN retries re-send the same ACK.
    let mut conns: HashMap<u32, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut pending: HashMap<(SocketAddr, u32), PendingAccept> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "kcp listener socket failed");
                return;
            }
        };
        if n == 0 {
            continue;
        }
        let datagram = &buf[..n];

        match datagram[0] {
            command::SYN if n >= 5 => {
                let client_conv =
                    u32::from_le_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
                let server_conv = match pending.get(&(from, client_conv)) {
                    Some(entry) => entry.server_conv,
                    None => {
                        let server_conv = conv_alloc.fetch_add(1, Ordering::Relaxed);
                        let (dg_tx, dg_rx) = mpsc::channel::<Vec<u8>>(256);
                        let (cmd_tx, cmd_rx) = mpsc::channel::<DriverCmd>(256);
                        let (in_tx, in_rx) = mpsc::channel::<Result<Frame>>(256);

                        let driver = Driver {
                            socket: SendHalf::Shared(Arc::clone(&socket)),
                            peer: from,
                            format,
                            core: ArqCore::new(client_conv),
                            parser: FrameParser::new(format),
                            local_conv: server_conv,
                            started: Instant::now(),
                            dg_rx,
                            cmd_rx,
                            in_tx,
                        };
                        tokio::spawn(driver.run());
                        conns.insert(server_conv, dg_tx);
                        pending.insert((from, client_conv), PendingAccept { server_conv });

                        let channel = KcpChannel {
                            peer: from,
                            tx: KcpTx { cmd_tx },
                            rx: KcpRx { in_rx },
                        };
                        if accept_tx.send(channel).await.is_err() {
                            return;
                        }
                        debug!(peer = %from, client_conv, server_conv, "kcp conversation accepted");
                        server_conv
                    }
                };

                let mut ack = vec![command::ACK];
                ack.extend_from_slice(&client_conv.to_le_bytes());
                ack.extend_from_slice(&server_conv.to_le_bytes());
                let _ = socket.send_to(&ack, from).await;
            }
            command::MSG | command::FIN if n >= 5 => {
                let conv =
                    u32::from_le_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
                let gone = match conns.get(&conv) {
                    Some(dg_tx) => dg_tx.send(datagram.to_vec()).await.is_err(),
                    None => false,
                };
                if gone {
                    conns.remove(&conv);
                    pending.retain(|_, entry| entry.server_conv != conv);
                }
            }
            other => {
                trace!(peer = %from, command = other, "ignoring unknown kcp datagram");
            }
        }
    }
}
