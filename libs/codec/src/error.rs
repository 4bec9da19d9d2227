//! Codec Error Types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Error, Debug)]
pub enum CodecError {
    /// Opcode not present in the registry. Fatal for the connection that
    /// produced it — the peer is speaking a different protocol.
    #[error("unknown opcode {opcode}")]
    UnknownOpcode { opcode: u16 },

    /// Attempt to encode a message type that was never registered.
    #[error("unregistered message type {type_name}")]
    UnknownType { type_name: &'static str },

    /// Two registrations claimed the same opcode.
    #[error("opcode {opcode} registered twice ({existing} and {incoming})")]
    DuplicateOpcode {
        opcode: u16,
        existing: &'static str,
        incoming: &'static str,
    },

    /// Opcode 0 is reserved as the invalid sentinel.
    #[error("opcode 0 is not assignable")]
    ZeroOpcode,

    #[error("failed to serialize {type_name}: {source}")]
    Serialize {
        type_name: &'static str,
        source: bincode::Error,
    },

    #[error("failed to deserialize opcode {opcode} ({type_name}): {source}")]
    Deserialize {
        opcode: u16,
        type_name: &'static str,
        source: bincode::Error,
    },
}
