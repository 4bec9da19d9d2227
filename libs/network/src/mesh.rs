//! Process Mesh
//!
//! Inner-network links between server processes. Each process listens on
//! its inner address and dials peers lazily, by process id, from a
//! configured peer table. Envelopes arriving on any link — dialed or
//! accepted — funnel into a single inbound queue that the actor router
//! consumes; replies are sent by process id, dialing back if needed, so
//! accepted links never need to identify their peer.

use crate::channel::Channel;
use crate::error::{NetworkError, Result};
use crate::framing::{FrameFormat, Route};
use crate::session::{RoutedMessage, Session, SessionConfig, SessionEvent};
use crate::tcp::{TcpAcceptor, TcpChannel};
use codec::OpcodeRegistry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use types::message::Message;
use types::ProcessId;

#[derive(Clone, Debug)]
pub struct MeshConfig {
    pub process_id: ProcessId,
    /// Inner listen address for this process.
    pub listen: SocketAddr,
    /// Peer process id → inner address.
    pub peers: HashMap<ProcessId, SocketAddr>,
    pub session: SessionConfig,
}

/// One process's view of the inner network.
pub struct ProcessMesh {
    config: MeshConfig,
    codec: Arc<OpcodeRegistry>,
    local: SocketAddr,
    /// Peer address table, seeded from config and refreshable at runtime.
    peers: DashMap<ProcessId, SocketAddr>,
    /// Outbound links by peer process id. Accepted inbound links are pumped
    /// but not stored; replies dial by id.
    links: DashMap<ProcessId, Arc<Session>>,
    inbound_tx: mpsc::Sender<RoutedMessage>,
}

impl ProcessMesh {
    /// Bind the inner listener and start the accept loop. The returned
    /// receiver carries every envelope that arrives from any peer.
    pub async fn start(
        config: MeshConfig,
        codec: Arc<OpcodeRegistry>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<RoutedMessage>)> {
        let acceptor = TcpAcceptor::bind(config.listen, FrameFormat::Inner).await?;
        let local = acceptor.local_addr()?;
        info!(process = config.process_id, %local, "process mesh listening");

        let (inbound_tx, inbound_rx) = mpsc::channel::<RoutedMessage>(4096);
        let peers: DashMap<ProcessId, SocketAddr> =
            config.peers.iter().map(|(p, a)| (*p, *a)).collect();
        let mesh = Arc::new(Self {
            config,
            codec,
            local,
            peers,
            links: DashMap::new(),
            inbound_tx,
        });

        let accepting = Arc::clone(&mesh);
        tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok(channel) => {
                        let peer = channel.peer_addr();
                        debug!(%peer, "inner link accepted");
                        let (session, events) = Session::spawn(
                            Box::new(channel),
                            Arc::clone(&accepting.codec),
                            accepting.config.session.clone(),
                        );
                        accepting.pump(session, events);
                    }
                    Err(e) => {
                        warn!(error = %e, "inner accept failed, listener stopping");
                        break;
                    }
                }
            }
        });

        Ok((mesh, inbound_rx))
    }

    pub fn local_process(&self) -> ProcessId {
        self.config.process_id
    }

    /// Address the inner listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Add or replace a peer address after startup (config refresh).
    pub fn set_peer(&self, process: ProcessId, addr: SocketAddr) {
        // Dropping any live link forces the next send to dial the new
        // address.
        self.links.remove(&process);
        self.peers.insert(process, addr);
    }

    /// Send a routed envelope to a peer process, dialing if no live link
    /// exists. A send failure drops the link so the next attempt redials.
    pub async fn send_to(
        &self,
        process: ProcessId,
        route: Route,
        msg: &dyn Message,
    ) -> Result<()> {
        let session = self.link(process).await?;
        if let Err(e) = session.send_routed(route, msg).await {
            self.links.remove(&process);
            return Err(e);
        }
        Ok(())
    }

    async fn link(&self, process: ProcessId) -> Result<Arc<Session>> {
        if let Some(existing) = self.links.get(&process) {
            if !existing.is_closed() {
                return Ok(Arc::clone(&existing));
            }
            drop(existing);
            self.links.remove(&process);
        }

        let addr = *self
            .peers
            .get(&process)
            .ok_or(NetworkError::UnknownPeer { process })?;
        let channel = TcpChannel::connect(addr, FrameFormat::Inner).await?;
        let (session, events) = Session::spawn(
            Box::new(channel),
            Arc::clone(&self.codec),
            self.config.session.clone(),
        );
        self.pump(Arc::clone(&session), events);

        // Two callers may have dialed concurrently; the map keeps one link
        // per peer and the loser is disposed.
        match self.links.entry(process) {
            dashmap::mapref::entry::Entry::Occupied(entry) if !entry.get().is_closed() => {
                session.dispose("duplicate dial");
                Ok(Arc::clone(entry.get()))
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                entry.insert(Arc::clone(&session));
                debug!(process, %addr, "inner link re-established");
                Ok(session)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
                debug!(process, %addr, "inner link established");
                Ok(session)
            }
        }
    }

    /// Forward a link's envelopes into the mesh inbound queue.
    fn pump(&self, session: Arc<Session>, mut events: mpsc::Receiver<SessionEvent>) {
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Routed(routed) => {
                        if inbound.send(routed).await.is_err() {
                            session.dispose("mesh stopped");
                            break;
                        }
                    }
                    SessionEvent::Message(msg) => {
                        // Inner links carry only routed envelopes.
                        warn!(session = session.id(), message = ?msg,
                              "unrouted message on inner link dropped");
                    }
                }
            }
        });
    }

    /// Dispose every outbound link (process shutdown).
    pub fn shutdown(&self) {
        for entry in self.links.iter() {
            entry.value().dispose("mesh shutdown");
        }
        self.links.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use types::{one_way_message, ActorId, MessageKind};

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct Poke {
        value: u32,
    }
    one_way_message!(Poke);

    fn test_codec() -> Arc<OpcodeRegistry> {
        let mut registry = OpcodeRegistry::with_builtins();
        registry.register::<Poke>(200).unwrap();
        Arc::new(registry)
    }

    fn mesh_config(process_id: ProcessId, listen: SocketAddr) -> MeshConfig {
        MeshConfig {
            process_id,
            listen,
            peers: HashMap::new(),
            session: SessionConfig {
                idle_timeout: None,
                ..SessionConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn envelope_crosses_processes() {
        let codec = test_codec();

        let (mesh_b, mut inbound_b) = ProcessMesh::start(
            mesh_config(2, "127.0.0.1:0".parse().unwrap()),
            Arc::clone(&codec),
        )
        .await
        .unwrap();

        let mut config_a = mesh_config(1, "127.0.0.1:0".parse().unwrap());
        config_a.peers.insert(2, mesh_b.local_addr());
        let (mesh_a, _inbound_a) = ProcessMesh::start(config_a, codec).await.unwrap();

        let route = Route {
            to: ActorId::new(2, 1, 42),
            from: ActorId::new(1, 0, 0),
            kind: MessageKind::OneWay,
        };
        mesh_a
            .send_to(2, route, &Poke { value: 7 })
            .await
            .unwrap();

        let routed = inbound_b.recv().await.unwrap();
        assert_eq!(routed.to, ActorId::new(2, 1, 42));
        assert_eq!(routed.from, ActorId::new(1, 0, 0));
        assert_eq!(routed.kind, MessageKind::OneWay);
        let poke = routed.msg.into_any().downcast::<Poke>().unwrap();
        assert_eq!(poke.value, 7);
    }

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let codec = test_codec();
        let (mesh, _inbound) = ProcessMesh::start(
            mesh_config(1, "127.0.0.1:0".parse().unwrap()),
            codec,
        )
        .await
        .unwrap();

        let route = Route {
            to: ActorId::new(9, 1, 1),
            from: ActorId::new(1, 0, 0),
            kind: MessageKind::OneWay,
        };
        let err = mesh.send_to(9, route, &Poke { value: 1 }).await.unwrap_err();
        assert!(matches!(err, NetworkError::UnknownPeer { process: 9 }));
    }

    #[tokio::test]
    async fn reply_dials_back_by_process_id() {
        let codec = test_codec();

        let (mesh_a, mut inbound_a) = ProcessMesh::start(
            mesh_config(1, "127.0.0.1:0".parse().unwrap()),
            Arc::clone(&codec),
        )
        .await
        .unwrap();
        let mut config_b = mesh_config(2, "127.0.0.1:0".parse().unwrap());
        config_b.peers.insert(1, mesh_a.local_addr());
        let (mesh_b, mut inbound_b) = ProcessMesh::start(config_b, Arc::clone(&codec)).await.unwrap();
        mesh_a.set_peer(2, mesh_b.local_addr());

        // A pokes B; B answers over its own dialed link.
        let route_out = Route {
            to: ActorId::new(2, 1, 1),
            from: ActorId::new(1, 1, 1),
            kind: MessageKind::OneWay,
        };
        mesh_a.send_to(2, route_out, &Poke { value: 1 }).await.unwrap();
        let received = inbound_b.recv().await.unwrap();

        let route_back = Route {
            to: received.from,
            from: received.to,
            kind: MessageKind::OneWay,
        };
        mesh_b
            .send_to(received.from.process(), route_back, &Poke { value: 2 })
            .await
            .unwrap();

        let reply = inbound_a.recv().await.unwrap();
        assert_eq!(reply.to, ActorId::new(1, 1, 1));
        let poke = reply.msg.into_any().downcast::<Poke>().unwrap();
        assert_eq!(poke.value, 2);
    }
}
