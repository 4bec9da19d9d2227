//! Actor Addressing
//!
//! An [`ActorId`] is the composite address used for location-transparent
//! routing: process id in the top 16 bits, fiber id in the next 16, and a
//! per-fiber monotonically increasing instance id in the low 32. Instance
//! ids are never reused while the owning fiber lives, so a stale address is
//! detected by lookup miss and treated as "actor gone" rather than being
//! silently misrouted to whatever entity now occupies the slot.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type ProcessId = u16;
pub type FiberId = u16;
pub type InstanceId = u32;

/// Fiber id 0 is reserved for the process-level RPC responder: a response
/// addressed to fiber 0 completes the sender's pending-call table instead of
/// being delivered to an entity mailbox.
pub const PROCESS_FIBER_ID: FiberId = 0;

/// Composite actor address packed into a single `u64`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(u64);

impl ActorId {
    /// The null address. Instance 0 is never a live entity.
    pub const NONE: ActorId = ActorId(0);

    pub fn new(process: ProcessId, fiber: FiberId, instance: InstanceId) -> Self {
        Self((process as u64) << 48 | (fiber as u64) << 32 | instance as u64)
    }

    /// Address of a process-level sender (fiber 0, instance 0).
    pub fn process_root(process: ProcessId) -> Self {
        Self::new(process, PROCESS_FIBER_ID, 0)
    }

    pub fn process(self) -> ProcessId {
        (self.0 >> 48) as ProcessId
    }

    pub fn fiber(self) -> FiberId {
        (self.0 >> 32) as FiberId
    }

    pub fn instance(self) -> InstanceId {
        self.0 as InstanceId
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Same address rebased onto another process. Used when a forwarded
    /// envelope crosses a process boundary and the receiving side rewrites
    /// the process segment before local re-dispatch.
    pub fn with_process(self, process: ProcessId) -> Self {
        Self::new(process, self.fiber(), self.instance())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.process(), self.fiber(), self.instance())
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trip() {
        let id = ActorId::new(3, 17, 0xDEAD_BEEF);
        assert_eq!(id.process(), 3);
        assert_eq!(id.fiber(), 17);
        assert_eq!(id.instance(), 0xDEAD_BEEF);
        assert_eq!(ActorId::from_u64(id.as_u64()), id);
    }

    #[test]
    fn extremes_do_not_bleed_between_segments() {
        let id = ActorId::new(u16::MAX, u16::MAX, u32::MAX);
        assert_eq!(id.process(), u16::MAX);
        assert_eq!(id.fiber(), u16::MAX);
        assert_eq!(id.instance(), u32::MAX);

        let id = ActorId::new(u16::MAX, 0, 0);
        assert_eq!(id.fiber(), 0);
        assert_eq!(id.instance(), 0);
    }

    #[test]
    fn rebase_keeps_fiber_and_instance() {
        let id = ActorId::new(1, 4, 99).with_process(7);
        assert_eq!(id.process(), 7);
        assert_eq!(id.fiber(), 4);
        assert_eq!(id.instance(), 99);
    }

    #[test]
    fn display_is_dotted() {
        assert_eq!(ActorId::new(1, 2, 3).to_string(), "1.2.3");
    }
}
