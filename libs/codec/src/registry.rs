//! Opcode Registry
//!
//! One entry per wire message type: opcode, type name, and erased
//! encode/decode functions. Built once at startup by explicit `register`
//! calls, then shared immutably (`Arc<OpcodeRegistry>`) by every session
//! and fiber in the process.

use crate::error::{CodecError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use tracing::debug;
use types::message::{ErrorResponse, Message, MessageKind};

/// Reserved opcode for the dispatcher-synthesized [`ErrorResponse`].
pub const ERROR_RESPONSE_OPCODE: u16 = 1;

type EncodeFn = fn(&dyn Message) -> Result<Vec<u8>>;
type DecodeFn = fn(&[u8]) -> Result<Box<dyn Message>>;

struct Entry {
    type_name: &'static str,
    kind: MessageKind,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Bidirectional opcode ⇄ message-type table.
pub struct OpcodeRegistry {
    by_opcode: HashMap<u16, Entry>,
    by_type: HashMap<TypeId, u16>,
}

impl OpcodeRegistry {
    /// Empty registry. Most callers want [`OpcodeRegistry::with_builtins`].
    pub fn new() -> Self {
        Self {
            by_opcode: HashMap::new(),
            by_type: HashMap::new(),
        }
    }

    /// Registry pre-populated with the runtime's own wire messages.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register::<ErrorResponse>(ERROR_RESPONSE_OPCODE)
            .expect("builtin registration cannot collide in an empty registry");
        registry
    }

    /// Register `M` under `opcode`. Fails on opcode 0 or a duplicate.
    pub fn register<M>(&mut self, opcode: u16) -> Result<()>
    where
        M: Message + Serialize + DeserializeOwned + Default,
    {
        if opcode == 0 {
            return Err(CodecError::ZeroOpcode);
        }
        let type_name = std::any::type_name::<M>();
        if let Some(existing) = self.by_opcode.get(&opcode) {
            return Err(CodecError::DuplicateOpcode {
                opcode,
                existing: existing.type_name,
                incoming: type_name,
            });
        }

        // The kind is a property of the type, probed once at registration.
        let kind = M::default().kind();

        self.by_opcode.insert(
            opcode,
            Entry {
                type_name,
                kind,
                encode: encode_erased::<M>,
                decode: decode_erased::<M>,
            },
        );
        self.by_type.insert(TypeId::of::<M>(), opcode);
        debug!(opcode, message = type_name, "registered wire message");
        Ok(())
    }

    /// Opcode for a concrete message type.
    pub fn opcode_of<M: Message>(&self) -> Result<u16> {
        self.by_type
            .get(&TypeId::of::<M>())
            .copied()
            .ok_or(CodecError::UnknownType {
                type_name: std::any::type_name::<M>(),
            })
    }

    /// Opcode for an erased message, resolved by its runtime type.
    pub fn opcode_of_dyn(&self, msg: &dyn Message) -> Result<u16> {
        self.by_type
            .get(&msg.as_any().type_id())
            .copied()
            .ok_or(CodecError::UnknownType {
                type_name: "<unregistered dyn Message>",
            })
    }

    /// Message role declared for `opcode`, if registered.
    pub fn kind_of(&self, opcode: u16) -> Option<MessageKind> {
        self.by_opcode.get(&opcode).map(|e| e.kind)
    }

    /// Serialize an erased message; returns its opcode and body bytes.
    pub fn encode(&self, msg: &dyn Message) -> Result<(u16, Vec<u8>)> {
        let opcode = self.opcode_of_dyn(msg)?;
        let entry = &self.by_opcode[&opcode];
        let body = (entry.encode)(msg)?;
        Ok((opcode, body))
    }

    /// Deserialize body bytes tagged with `opcode`.
    pub fn decode(&self, opcode: u16, body: &[u8]) -> Result<Box<dyn Message>> {
        let entry = self
            .by_opcode
            .get(&opcode)
            .ok_or(CodecError::UnknownOpcode { opcode })?;
        (entry.decode)(body).map_err(|e| match e {
            CodecError::Deserialize {
                type_name, source, ..
            } => CodecError::Deserialize {
                opcode,
                type_name,
                source,
            },
            other => other,
        })
    }

    pub fn contains(&self, opcode: u16) -> bool {
        self.by_opcode.contains_key(&opcode)
    }

    pub fn len(&self) -> usize {
        self.by_opcode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_opcode.is_empty()
    }
}

impl Default for OpcodeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn encode_erased<M>(msg: &dyn Message) -> Result<Vec<u8>>
where
    M: Message + Serialize,
{
    let concrete = msg
        .as_any()
        .downcast_ref::<M>()
        .ok_or(CodecError::UnknownType {
            type_name: std::any::type_name::<M>(),
        })?;
    bincode::serialize(concrete).map_err(|source| CodecError::Serialize {
        type_name: std::any::type_name::<M>(),
        source,
    })
}

fn decode_erased<M>(body: &[u8]) -> Result<Box<dyn Message>>
where
    M: Message + DeserializeOwned,
{
    let concrete: M = bincode::deserialize(body).map_err(|source| CodecError::Deserialize {
        opcode: 0,
        type_name: std::any::type_name::<M>(),
        source,
    })?;
    Ok(Box::new(concrete))
}
