//! Session
//!
//! Turns an established [`Channel`] into an addressable, RPC-capable
//! endpoint. A session owns a writer task, a reader task, a deadline-sweep
//! task, and (optionally) an idle checker; disposal — explicit, transport
//! failure, or idle timeout — fails every in-flight call with a
//! session-closed error and stops the tasks. Raw transport and framing
//! errors end here; the owner only ever observes typed events and failures.

use crate::channel::Channel;
use crate::error::{NetworkError, Result, RpcError};
use crate::framing::{Frame, Route};
use crate::rpc::PendingTable;
use bytes::Bytes;
use codec::OpcodeRegistry;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use types::message::{Message, MessageKind, Request};
use types::ActorId;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Deadline for each `call`.
    pub rpc_timeout: Duration,
    /// Interval of the pending-table deadline sweep.
    pub sweep_interval: Duration,
    /// Dispose the session after this long without any traffic. `None`
    /// disables the checker (process-mesh links are kept alive by the
    /// peer table instead).
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_millis(crate::RPC_TIMEOUT_MS),
            sweep_interval: Duration::from_millis(crate::RPC_SWEEP_INTERVAL_MS),
            idle_timeout: Some(Duration::from_millis(crate::SESSION_IDLE_TIMEOUT_MS)),
        }
    }
}

/// A message routed between actors across a process boundary (inner links).
#[derive(Debug)]
pub struct RoutedMessage {
    pub to: ActorId,
    pub from: ActorId,
    pub kind: MessageKind,
    pub msg: Box<dyn Message>,
}

/// What a session delivers to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// Outer-link payload that is not a response to one of our calls.
    Message(Box<dyn Message>),
    /// Inner-link actor envelope.
    Routed(RoutedMessage),
}

struct Activity {
    last_recv: Instant,
    last_send: Instant,
}

pub struct Session {
    id: u64,
    peer: SocketAddr,
    codec: Arc<OpcodeRegistry>,
    out_tx: mpsc::Sender<Frame>,
    pending: Arc<PendingTable>,
    activity: Mutex<Activity>,
    closed: AtomicBool,
    /// Latched shutdown signal; tasks watch it so a dispose between their
    /// polls is never missed.
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Wrap a channel and start the session tasks. The returned receiver
    /// yields inbound traffic that is not consumed by RPC correlation; when
    /// it returns `None` the session is gone.
    pub fn spawn(
        channel: Box<dyn Channel>,
        codec: Arc<OpcodeRegistry>,
        config: SessionConfig,
    ) -> (Arc<Session>, mpsc::Receiver<SessionEvent>) {
        let peer = channel.peer_addr();
        let (mut tx_half, mut rx_half) = channel.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(1024);
        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(1024);

        let now = Instant::now();
        let (shutdown, _) = watch::channel(false);
        let session = Arc::new(Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            codec,
            out_tx,
            pending: Arc::new(PendingTable::new(config.rpc_timeout)),
            activity: Mutex::new(Activity {
                last_recv: now,
                last_send: now,
            }),
            closed: AtomicBool::new(false),
            shutdown,
        });
        debug!(session = session.id, %peer, "session started");

        // Writer: drains the outbound queue until shutdown or write error.
        let writer = Arc::clone(&session);
        let mut writer_shutdown = session.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.changed() => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = tx_half.send(frame).await {
                                warn!(session = writer.id, error = %e, "session write failed");
                                writer.dispose("write failure");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            tx_half.close().await;
        });

        // Reader: frames in, decode, correlate or deliver.
        let reader = Arc::clone(&session);
        let mut reader_shutdown = session.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shutdown.changed() => break,
                    frame = rx_half.recv() => match frame {
                        Ok(frame) => {
                            if !reader.on_frame(frame, &event_tx).await {
                                break;
                            }
                        }
                        Err(e) => {
                            // Framing violations and transport failures both
                            // end the session; they differ only in logging.
                            match &e {
                                NetworkError::Framing { .. } => {
                                    warn!(session = reader.id, error = %e, "fatal framing error")
                                }
                                _ => debug!(session = reader.id, error = %e, "transport closed"),
                            }
                            reader.dispose("read failure");
                            break;
                        }
                    },
                }
            }
        });

        // Deadline sweep: the only place call timeouts fire.
        let sweeper = Arc::clone(&session);
        let mut sweeper_shutdown = session.shutdown.subscribe();
        let sweep_interval = config.sweep_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = sweeper_shutdown.changed() => break,
                    _ = tick.tick() => {
                        sweeper.pending.sweep(Instant::now());
                    }
                }
            }
        });

        if let Some(idle) = config.idle_timeout {
            let checker = Arc::clone(&session);
            let mut checker_shutdown = session.shutdown.subscribe();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(idle / 2);
                loop {
                    tokio::select! {
                        _ = checker_shutdown.changed() => break,
                        _ = tick.tick() => {
                            if checker.idle_for() > idle {
                                warn!(session = checker.id, idle_ms = idle.as_millis() as u64,
                                      "session idle timeout");
                                checker.dispose("idle timeout");
                                break;
                            }
                        }
                    }
                }
            });
        }

        (session, event_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Time since the last send or receive.
    pub fn idle_for(&self) -> Duration {
        let activity = self.activity.lock();
        let last = activity.last_recv.max(activity.last_send);
        last.elapsed()
    }

    /// Fire-and-forget on an outer link.
    pub async fn send(&self, msg: &dyn Message) -> Result<()> {
        let (opcode, body) = self.codec.encode(msg)?;
        self.enqueue(Frame::outer(opcode, Bytes::from(body))).await
    }

    /// Fire-and-forget of a routed envelope on an inner link.
    pub async fn send_routed(&self, route: Route, msg: &dyn Message) -> Result<()> {
        let (opcode, body) = self.codec.encode(msg)?;
        self.enqueue(Frame::inner(route, opcode, Bytes::from(body)))
            .await
    }

    /// Request/response over this session. Suspends until the matching
    /// response arrives, the deadline passes, or the session closes.
    pub async fn call<R: Request>(&self, req: R) -> std::result::Result<R::Response, RpcError> {
        let (rpc_id, rx) = self.start_call(req).await?;
        match rx.await {
            Ok(result) => downcast_response::<R>(rpc_id, result?),
            Err(_) => Err(RpcError::SessionClosed { rpc_id }),
        }
    }

    /// Like [`Session::call`] but resolves early with `Cancelled` when the
    /// supplied future completes first. Cancellation does not stop work
    /// already dispatched on the remote side.
    pub async fn call_cancellable<R: Request>(
        &self,
        req: R,
        cancel: impl std::future::Future<Output = ()>,
    ) -> std::result::Result<R::Response, RpcError> {
        let (rpc_id, rx) = self.start_call(req).await?;
        tokio::select! {
            result = rx => match result {
                Ok(result) => downcast_response::<R>(rpc_id, result?),
                Err(_) => Err(RpcError::SessionClosed { rpc_id }),
            },
            _ = cancel => {
                self.pending.fail(rpc_id, RpcError::Cancelled { rpc_id });
                Err(RpcError::Cancelled { rpc_id })
            }
        }
    }

    async fn start_call<R: Request>(
        &self,
        mut req: R,
    ) -> std::result::Result<(u32, tokio::sync::oneshot::Receiver<crate::rpc::CallResult>), RpcError>
    {
        if self.is_closed() {
            return Err(RpcError::Network(NetworkError::SessionClosed));
        }
        let rpc_id = self.pending.next_rpc_id();
        req.set_rpc_id(rpc_id);
        let rx = self
            .pending
            .register(rpc_id)
            .ok_or(RpcError::Network(NetworkError::SessionClosed))?;
        if let Err(e) = self.send(&req).await {
            self.pending
                .fail(rpc_id, RpcError::SessionClosed { rpc_id });
            return Err(e.into());
        }
        Ok((rpc_id, rx))
    }

    /// Dispose the session: fail in-flight calls, stop the tasks, close
    /// the channel. Idempotent.
    pub fn dispose(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(session = self.id, peer = %self.peer, reason, "session disposed");
        self.pending
            .fail_all(|rpc_id| RpcError::SessionClosed { rpc_id });
        let _ = self.shutdown.send(true);
    }

    async fn enqueue(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::SessionClosed);
        }
        self.out_tx
            .send(frame)
            .await
            .map_err(|_| NetworkError::SessionClosed)?;
        self.activity.lock().last_send = Instant::now();
        Ok(())
    }

    /// Returns false when the session must stop reading.
    async fn on_frame(&self, frame: Frame, event_tx: &mpsc::Sender<SessionEvent>) -> bool {
        self.activity.lock().last_recv = Instant::now();

        let msg = match self.codec.decode(frame.opcode, &frame.body) {
            Ok(msg) => msg,
            Err(e) => {
                // Unknown opcode or undecodable body: same trust posture as
                // a framing violation.
                warn!(session = self.id, opcode = frame.opcode, error = %e, "fatal decode error");
                self.dispose("decode failure");
                return false;
            }
        };

        match frame.route {
            Some(route) => {
                let routed = RoutedMessage {
                    to: route.to,
                    from: route.from,
                    kind: route.kind,
                    msg,
                };
                if event_tx.send(SessionEvent::Routed(routed)).await.is_err() {
                    self.dispose("owner gone");
                    return false;
                }
            }
            None => {
                if msg.kind() == MessageKind::Response {
                    let rpc_id = msg.rpc_id();
                    if !self.pending.complete(rpc_id, msg) {
                        trace!(session = self.id, rpc_id, "late response dropped");
                    }
                } else if event_tx.send(SessionEvent::Message(msg)).await.is_err() {
                    self.dispose("owner gone");
                    return false;
                }
            }
        }
        true
    }
}

fn downcast_response<R: Request>(
    rpc_id: u32,
    msg: Box<dyn Message>,
) -> std::result::Result<R::Response, RpcError> {
    msg.into_any()
        .downcast::<R::Response>()
        .map(|b| *b)
        .map_err(|_| RpcError::UnexpectedResponse { rpc_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameFormat;
    use crate::tcp::{TcpAcceptor, TcpChannel};
    use serde::{Deserialize, Serialize};
    use types::{request_message, response_message};

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct PingRequest {
        rpc_id: u32,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct PingResponse {
        rpc_id: u32,
        error: i32,
    }

    request_message!(PingRequest => PingResponse);
    response_message!(PingResponse);

    fn test_codec() -> Arc<OpcodeRegistry> {
        let mut registry = OpcodeRegistry::with_builtins();
        registry.register::<PingRequest>(100).unwrap();
        registry.register::<PingResponse>(101).unwrap();
        Arc::new(registry)
    }

    async fn session_pair(
        config: SessionConfig,
    ) -> (
        (Arc<Session>, mpsc::Receiver<SessionEvent>),
        (Arc<Session>, mpsc::Receiver<SessionEvent>),
    ) {
        let codec = test_codec();
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), FrameFormat::Outer)
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = TcpChannel::connect(addr, FrameFormat::Outer).await.unwrap();
        let server = acceptor.accept().await.unwrap();

        (
            Session::spawn(Box::new(client), Arc::clone(&codec), config.clone()),
            Session::spawn(Box::new(server), codec, config),
        )
    }

    #[tokio::test]
    async fn call_resolves_with_matching_response() {
        let ((client, _client_events), (server, mut server_events)) =
            session_pair(SessionConfig::default()).await;

        // Server: answer each ping with a pong carrying the same rpc id.
        tokio::spawn(async move {
            while let Some(event) = server_events.recv().await {
                if let SessionEvent::Message(msg) = event {
                    let rpc_id = msg.rpc_id();
                    server
                        .send(&PingResponse { rpc_id, error: 0 })
                        .await
                        .unwrap();
                }
            }
        });

        let response = client.call(PingRequest::default()).await.unwrap();
        assert_eq!(response.error, 0);
    }

    #[tokio::test]
    async fn concurrent_calls_use_distinct_rpc_ids() {
        let ((client, _client_events), (server, mut server_events)) =
            session_pair(SessionConfig::default()).await;

        tokio::spawn(async move {
            let mut seen = std::collections::HashSet::new();
            while let Some(event) = server_events.recv().await {
                if let SessionEvent::Message(msg) = event {
                    let rpc_id = msg.rpc_id();
                    assert!(seen.insert(rpc_id), "rpc id reused while in flight");
                    server
                        .send(&PingResponse { rpc_id, error: 0 })
                        .await
                        .unwrap();
                }
            }
        });

        let calls: Vec<_> = (0..10)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.call(PingRequest::default()).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn unanswered_call_times_out_and_frees_slot() {
        let config = SessionConfig {
            rpc_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
            idle_timeout: None,
        };
        // Server never replies.
        let ((client, _client_events), (_server, _server_events)) = session_pair(config).await;

        let started = Instant::now();
        let err = client.call(PingRequest::default()).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn dispose_fails_in_flight_calls() {
        let ((client, _client_events), (_server, _server_events)) =
            session_pair(SessionConfig::default()).await;

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call(PingRequest::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.dispose("test teardown");

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::SessionClosed { .. }));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn cancellation_resolves_early() {
        let ((client, _client_events), (_server, _server_events)) =
            session_pair(SessionConfig::default()).await;

        let err = client
            .call_cancellable(PingRequest::default(), async {
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Cancelled { .. }));
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn idle_session_is_disposed() {
        let config = SessionConfig {
            rpc_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(100),
            idle_timeout: Some(Duration::from_millis(100)),
        };
        let ((client, _client_events), (_server, _server_events)) = session_pair(config).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(client.is_closed());
    }
}
