//! Process Context
//!
//! The one-per-process container. Owns the services that exist once per
//! process — codec registry, handler registry, coroutine locks, the actor
//! sender, the process mesh, the fiber manager — and injects them into
//! fibers at creation; nothing here is a global. Also runs the
//! process-level background tasks: the mesh router and the call-deadline
//! sweep.

use crate::config::ProcessConfig;
use crate::coroutine_lock::CoroutineLockService;
use crate::dispatch::DispatchServices;
use crate::handler::HandlerRegistry;
use crate::manager::FiberManager;
use crate::sender::{ActorSender, FiberTable};
use codec::OpcodeRegistry;
use network::{PendingTable, ProcessMesh};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::info;

pub struct ProcessContext {
    config: ProcessConfig,
    opcodes: Arc<OpcodeRegistry>,
    services: Arc<DispatchServices>,
    sender: Arc<ActorSender>,
    mesh: Arc<ProcessMesh>,
    manager: FiberManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessContext {
    /// Bring the process online: bind the inner listener, start the router
    /// and sweep tasks, and wire the services fibers will be handed.
    pub async fn start(
        config: ProcessConfig,
        opcodes: OpcodeRegistry,
        handlers: HandlerRegistry,
    ) -> network::Result<Arc<Self>> {
        let opcodes = Arc::new(opcodes);
        let (mesh, mut inbound) =
            ProcessMesh::start(config.mesh_config(), Arc::clone(&opcodes)).await?;

        let pending = Arc::new(PendingTable::new(config.rpc_timeout()));
        let fiber_table = Arc::new(FiberTable::default());
        let sender = Arc::new(ActorSender::new(
            config.process_id,
            Arc::clone(&pending),
            Arc::clone(&mesh),
            Arc::clone(&fiber_table),
        ));

        let services = Arc::new(DispatchServices {
            handlers: RwLock::new(Arc::new(handlers)),
            locks: CoroutineLockService::new(),
            sender: Arc::clone(&sender),
        });
        let manager = FiberManager::new(
            config.process_id,
            config.mailbox_capacity,
            Arc::clone(&services),
            Arc::clone(&fiber_table),
        );

        // Router: every envelope from every inner link goes through the
        // sender's delivery path.
        let router_sender = Arc::clone(&sender);
        let router = tokio::spawn(async move {
            while let Some(routed) = inbound.recv().await {
                router_sender.deliver_inbound(routed).await;
            }
        });

        // Deadline sweep for process-level calls.
        let sweep_sender = Arc::clone(&sender);
        let sweep_interval = config.sweep_interval();
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_interval);
            loop {
                tick.tick().await;
                sweep_sender.pending().sweep(Instant::now());
            }
        });

        info!(process = config.process_id, "process context started");
        Ok(Arc::new(Self {
            config,
            opcodes,
            services,
            sender,
            mesh,
            manager,
            tasks: Mutex::new(vec![router, sweeper]),
        }))
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn opcodes(&self) -> &Arc<OpcodeRegistry> {
        &self.opcodes
    }

    pub fn sender(&self) -> &Arc<ActorSender> {
        &self.sender
    }

    pub fn mesh(&self) -> &Arc<ProcessMesh> {
        &self.mesh
    }

    pub fn fibers(&self) -> &FiberManager {
        &self.manager
    }

    pub fn locks(&self) -> &Arc<CoroutineLockService> {
        &self.services.locks
    }

    /// Swap in a freshly built handler table. This is the reaction to an
    /// external "handler table refreshed" event: in-flight dispatches keep
    /// the table they started with, new dispatches see the new one.
    pub fn install_handlers(&self, handlers: HandlerRegistry) {
        *self.services.handlers.write() = Arc::new(handlers);
        info!(process = self.config.process_id, "handler table refreshed");
    }

    /// Stop fibers, close mesh links, and end the background tasks.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        self.mesh.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(process = self.config.process_id, "process context stopped");
    }
}
