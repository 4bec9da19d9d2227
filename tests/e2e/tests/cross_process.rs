//! Two real processes' worth of runtime — two contexts, two inner
//! listeners, loopback TCP between them — exercising the location
//! transparency promise: the same send/call API, the same failure
//! taxonomy, whether the target actor is across the room or across the
//! wire.

use e2e_tests::{
    opcodes, zone_handlers, EnterZoneRequest, MoveNotice, Zone,
};
use fibers::{MailboxPolicy, ProcessConfig, ProcessContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use types::{ActorId, ProcessId};

async fn start(process_id: ProcessId) -> Arc<ProcessContext> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut config = ProcessConfig::standalone(process_id, "127.0.0.1:0".parse().unwrap());
    config.sweep_interval_ms = 20;
    // Idle disposal off: these links sit quiet between assertions.
    config.session_idle_timeout_ms = 0;
    ProcessContext::start(config, opcodes(), zone_handlers())
        .await
        .unwrap()
}

/// Start two processes and point their peer tables at each other.
async fn start_pair() -> (Arc<ProcessContext>, Arc<ProcessContext>) {
    let a = start(1).await;
    let b = start(2).await;
    a.mesh().set_peer(2, b.mesh().local_addr());
    b.mesh().set_peer(1, a.mesh().local_addr());
    (a, b)
}

async fn spawn_zone(
    process: &Arc<ProcessContext>,
    steps: Arc<Mutex<Vec<u32>>>,
) -> (fibers::FiberHandle, ActorId) {
    let fiber = process.fibers().spawn("zone").unwrap();
    let zone = fiber
        .spawn_entity(MailboxPolicy::Ordered, move || Zone {
            occupants: 0,
            steps,
        })
        .await
        .unwrap();
    (fiber, zone)
}

#[tokio::test]
async fn remote_call_round_trips() {
    let (a, b) = start_pair().await;
    let (_fiber, zone) = spawn_zone(&b, Arc::new(Mutex::new(Vec::new()))).await;

    // Caller on process 1, entity on process 2.
    let response = a
        .sender()
        .call(
            zone,
            EnterZoneRequest {
                rpc_id: 0,
                unit_name: "knight".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(response.occupants, 1);

    // Again over the (now established) link.
    let response = a
        .sender()
        .call(
            zone,
            EnterZoneRequest {
                rpc_id: 0,
                unit_name: "rogue".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(response.occupants, 2);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn remote_one_way_messages_arrive_in_order() {
    let (a, b) = start_pair().await;
    let steps = Arc::new(Mutex::new(Vec::new()));
    let (_fiber, zone) = spawn_zone(&b, Arc::clone(&steps)).await;

    let from = ActorId::process_root(1);
    for step in 1..=20u32 {
        a.sender()
            .send(from, zone, Box::new(MoveNotice { step }))
            .await
            .unwrap();
    }

    for _ in 0..300 {
        if steps.lock().len() == 20 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*steps.lock(), (1..=20).collect::<Vec<u32>>());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn remote_stale_actor_resolves_not_found() {
    let (a, b) = start_pair().await;
    let (fiber, zone) = spawn_zone(&b, Arc::new(Mutex::new(Vec::new()))).await;

    assert!(fiber.remove_entity(zone).await.unwrap());

    let err = a
        .sender()
        .call(
            zone,
            EnterZoneRequest {
                rpc_id: 0,
                unit_name: "ghost".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_actor_not_found(), "got {err}");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn remote_unknown_fiber_resolves_not_found() {
    let (a, b) = start_pair().await;

    let bogus = ActorId::new(2, 9_999, 1);
    let err = a
        .sender()
        .call(
            bogus,
            EnterZoneRequest {
                rpc_id: 0,
                unit_name: "lost".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_actor_not_found(), "got {err}");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn calls_flow_in_both_directions_concurrently() {
    let (a, b) = start_pair().await;
    let (_fiber_a, zone_a) = spawn_zone(&a, Arc::new(Mutex::new(Vec::new()))).await;
    let (_fiber_b, zone_b) = spawn_zone(&b, Arc::new(Mutex::new(Vec::new()))).await;

    let call_ab = a.sender().call(
        zone_b,
        EnterZoneRequest {
            rpc_id: 0,
            unit_name: "east".into(),
        },
    );
    let call_ba = b.sender().call(
        zone_a,
        EnterZoneRequest {
            rpc_id: 0,
            unit_name: "west".into(),
        },
    );

    let (east, west) = tokio::join!(call_ab, call_ba);
    assert_eq!(east.unwrap().occupants, 1);
    assert_eq!(west.unwrap().occupants, 1);

    a.shutdown().await;
    b.shutdown().await;
}
