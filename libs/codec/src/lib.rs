//! Wire Codec
//!
//! Maps opcodes to message types and serializes payload bodies. The mapping
//! is an explicit table populated by registration calls at process startup —
//! there is no runtime type scanning. Opcode 0 is never valid; an opcode
//! missing from the table is a fatal decode error for the connection that
//! produced it.
//!
//! Payload bodies are bincode; the framing bytes around them belong to the
//! `network` crate.

pub mod error;
pub mod registry;

pub use error::{CodecError, Result};
pub use registry::{OpcodeRegistry, ERROR_RESPONSE_OPCODE};
