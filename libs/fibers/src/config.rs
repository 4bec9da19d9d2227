//! Process Configuration
//!
//! The startup collaborator hands the runtime a process id, listen
//! addresses, a peer table, and timing knobs. Loadable from YAML; every
//! timing field has the runtime's default so minimal configs stay small.

use crate::error::ConfigError;
use network::{MeshConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use types::ProcessId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub process_id: ProcessId,
    /// Inner (trusted, process ⇄ process) listen address.
    pub inner_listen: SocketAddr,
    /// Peer process id → inner address.
    #[serde(default)]
    pub peers: HashMap<ProcessId, SocketAddr>,

    /// Bound of each fiber's inbound queue; senders wait when it is full.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// 0 disables idle disposal.
    #[serde(default = "default_session_idle_timeout_ms")]
    pub session_idle_timeout_ms: u64,
}

fn default_mailbox_capacity() -> usize {
    10_000
}

fn default_rpc_timeout_ms() -> u64 {
    network::RPC_TIMEOUT_MS
}

fn default_sweep_interval_ms() -> u64 {
    network::RPC_SWEEP_INTERVAL_MS
}

fn default_session_idle_timeout_ms() -> u64 {
    network::SESSION_IDLE_TIMEOUT_MS
}

impl ProcessConfig {
    /// Minimal config for one process with defaults everywhere else.
    pub fn standalone(process_id: ProcessId, inner_listen: SocketAddr) -> Self {
        Self {
            process_id,
            inner_listen,
            peers: HashMap::new(),
            mailbox_capacity: default_mailbox_capacity(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            session_idle_timeout_ms: default_session_idle_timeout_ms(),
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            rpc_timeout: self.rpc_timeout(),
            sweep_interval: self.sweep_interval(),
            idle_timeout: match self.session_idle_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            process_id: self.process_id,
            listen: self.inner_listen,
            peers: self.peers.clone(),
            session: self.session_config(),
        }
    }
}
