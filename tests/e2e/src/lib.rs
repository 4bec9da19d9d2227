//! Shared fixtures for the cross-process tests: the wire messages both
//! test processes speak, their opcode assignments, and the handler set a
//! "zone" process installs.

use async_trait::async_trait;
use codec::OpcodeRegistry;
use fibers::{EntityRef, HandlerRegistry, MessageHandler, RequestHandler};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use types::{one_way_message, request_message, response_message, ActorId};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MoveNotice {
    pub step: u32,
}
one_way_message!(MoveNotice);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnterZoneRequest {
    pub rpc_id: u32,
    pub unit_name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnterZoneResponse {
    pub rpc_id: u32,
    pub error: i32,
    pub occupants: u32,
}

request_message!(EnterZoneRequest => EnterZoneResponse);
response_message!(EnterZoneResponse);

pub fn opcodes() -> OpcodeRegistry {
    let mut registry = OpcodeRegistry::with_builtins();
    registry.register::<MoveNotice>(1001).expect("fresh registry");
    registry
        .register::<EnterZoneRequest>(1002)
        .expect("fresh registry");
    registry
        .register::<EnterZoneResponse>(1003)
        .expect("fresh registry");
    registry
}

/// Zone entity: counts occupants, logs movement steps in arrival order.
pub struct Zone {
    pub occupants: u32,
    pub steps: Arc<Mutex<Vec<u32>>>,
}

pub struct EnterZoneHandler;

#[async_trait(?Send)]
impl RequestHandler<Zone, EnterZoneRequest> for EnterZoneHandler {
    async fn handle(
        &self,
        entity: EntityRef<Zone>,
        _from: ActorId,
        _req: EnterZoneRequest,
    ) -> Result<EnterZoneResponse, i32> {
        let occupants = {
            let mut zone = entity.borrow_mut();
            zone.occupants += 1;
            zone.occupants
        };
        Ok(EnterZoneResponse {
            rpc_id: 0,
            error: 0,
            occupants,
        })
    }
}

pub struct MoveHandler;

#[async_trait(?Send)]
impl MessageHandler<Zone, MoveNotice> for MoveHandler {
    async fn handle(
        &self,
        entity: EntityRef<Zone>,
        _from: ActorId,
        msg: MoveNotice,
    ) -> Result<(), i32> {
        entity.borrow_mut().steps.lock().push(msg.step);
        Ok(())
    }
}

pub fn zone_handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_request::<Zone, EnterZoneRequest, _>(EnterZoneHandler)
        .register_message::<Zone, MoveNotice, _>(MoveHandler);
    registry
}
