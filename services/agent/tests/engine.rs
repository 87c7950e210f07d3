//! Integration tests for the session registry.
//!
//! Sessions run against the in-memory collaborators with tokio's clock
//! paused, so retry delays and read timeouts elapse instantly.

use std::sync::Arc;
use std::time::Duration;

use tapra_agent::testing::{MockInterfaceSource, MockTransport};
use tapra_agent::{AdvertConfig, Engine, SessionState};
use tapra_networking::ndp::{Message, ALL_NODES};
use tapra_networking::{ExclusionList, Route};
use tokio::time::Instant;

struct Harness {
    source: Arc<MockInterfaceSource>,
    transport: Arc<MockTransport>,
    engine: Engine,
}

fn harness(exclusions: ExclusionList) -> Harness {
    let source = Arc::new(MockInterfaceSource::new());
    let transport = Arc::new(MockTransport::new());
    let engine = Engine::new(
        source.clone(),
        transport.clone(),
        exclusions,
        AdvertConfig {
            router_lifetime: Duration::from_secs(1800),
            interval: Duration::from_secs(600),
        },
    );
    Harness {
        source,
        transport,
        engine,
    }
}

fn host_route(addr: &str) -> Route {
    Route::new(addr.parse().unwrap(), 128)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_active(engine: &Engine, index: u32) {
    wait_until("session to become active", || {
        engine
            .get(index)
            .is_some_and(|s| s.state() == SessionState::Active)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_add_registers_and_advertises() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);

    h.engine.add(3);
    assert!(h.engine.exists(3));

    wait_active(&h.engine, 3).await;
    let link = h.transport.link(3);
    link.wait_for_sent(1).await;

    let session = h.engine.get(3).unwrap();
    assert_eq!(session.name(), "tap3_0");
    assert_eq!(session.prefix(), Some("2001:db8:1::".parse().unwrap()));
    assert!(link.filter_installed());
    assert!(link.joined_all_routers());

    let sent = link.sent();
    assert_eq!(sent[0].destination, ALL_NODES);
    assert_eq!(sent[0].message, session.advertisement());
    assert_eq!(h.engine.indices(), vec![3]);
}

#[tokio::test(start_paused = true)]
async fn test_close_deregisters_promptly() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    h.engine.add(3);
    wait_active(&h.engine, 3).await;
    let session = h.engine.get(3).unwrap();

    let closed_at = Instant::now();
    h.engine.close(3);
    wait_until("deregistration", || !h.engine.exists(3)).await;

    assert!(closed_at.elapsed() <= Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(h.engine.get(3).is_none());
    assert_eq!(h.transport.link(3).open_sockets(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_add_then_close_never_leaks() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(5, "tap5_0", vec![host_route("2001:db8:5::1")]);

    // Close immediately, after one scheduler turn, and mid-construction.
    h.engine.add(5);
    h.engine.close(5);
    wait_until("deregistration", || !h.engine.exists(5)).await;

    h.engine.add(5);
    tokio::task::yield_now().await;
    h.engine.close(5);
    wait_until("deregistration", || !h.engine.exists(5)).await;

    h.source.set_delay(Duration::from_millis(500));
    h.engine.add(5);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.engine.exists(5));
    assert!(h.engine.get(5).is_none());
    h.engine.close(5);
    wait_until("deregistration", || !h.engine.exists(5)).await;

    // Give any stray task time to misbehave.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.engine.is_empty());
    assert_eq!(h.transport.link(5).open_sockets(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let h = harness(ExclusionList::default());
    h.engine.close(42);

    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    h.engine.add(3);
    wait_active(&h.engine, 3).await;

    h.engine.close(3);
    h.engine.close(3);
    wait_until("deregistration", || !h.engine.exists(3)).await;
    h.engine.close(3);
    assert!(h.engine.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_add_on_managed_index_is_noop() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    h.engine.add(3);
    wait_active(&h.engine, 3).await;
    let first = h.engine.get(3).unwrap();

    h.engine.add(3);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(Arc::ptr_eq(&first, &h.engine.get(3).unwrap()));
    assert_eq!(h.transport.link(3).bind_attempts(), 1);
    assert_eq!(h.engine.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_construction_failures_leave_no_entry() {
    let h = harness(ExclusionList::default());

    // Unknown interface.
    h.engine.add(9);
    wait_until("failed construction", || !h.engine.exists(9)).await;

    // Only link-local routes.
    h.source
        .add_tap(4, "tap4_0", vec![Route::new("fe80::".parse().unwrap(), 64)]);
    h.engine.add(4);
    wait_until("failed construction", || !h.engine.exists(4)).await;

    assert_eq!(h.transport.link(4).bind_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_excluded_routes_do_not_qualify() {
    let h = harness(ExclusionList::parse(&["2001:db8:1::/48"]).unwrap());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    h.source.add_tap(
        4,
        "tap4_0",
        vec![host_route("2001:db8:1::1"), host_route("2001:db8:2::1")],
    );

    h.engine.add(3);
    h.engine.add(4);
    wait_until("failed construction", || !h.engine.exists(3)).await;
    wait_active(&h.engine, 4).await;

    assert_eq!(
        h.engine.get(4).unwrap().prefix(),
        Some("2001:db8:2::".parse().unwrap())
    );
}

#[tokio::test(start_paused = true)]
async fn test_bind_is_retried_every_second() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    let link = h.transport.link(3);
    link.fail_binds(3);

    let started = Instant::now();
    h.engine.add(3);
    wait_active(&h.engine, 3).await;

    assert_eq!(link.bind_attempts(), 4);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(link.open_sockets(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_failure_is_retried() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    let link = h.transport.link(3);
    link.fail_joins(2);

    let started = Instant::now();
    h.engine.add(3);
    wait_active(&h.engine, 3).await;

    assert_eq!(link.bind_attempts(), 3);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(link.open_sockets(), 1);
    assert!(link.joined_all_routers());
}

#[tokio::test(start_paused = true)]
async fn test_filter_failure_ends_session() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    let link = h.transport.link(3);
    link.fail_filter(true);

    h.engine.add(3);
    wait_until("deregistration", || !h.engine.exists(3)).await;

    // Not retried.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(link.bind_attempts(), 1);
    assert_eq!(link.open_sockets(), 0);
    assert!(!link.filter_installed());
    assert!(!h.engine.exists(3));
}

#[tokio::test(start_paused = true)]
async fn test_close_while_binding_is_clean() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    let link = h.transport.link(3);
    link.fail_binds(u32::MAX);

    h.engine.add(3);
    wait_until("bind retries", || link.bind_attempts() >= 2).await;
    let session = h.engine.get(3).unwrap();
    assert_eq!(session.state(), SessionState::Binding);

    let closed_at = Instant::now();
    h.engine.close(3);
    wait_until("deregistration", || !h.engine.exists(3)).await;

    assert!(closed_at.elapsed() <= Duration::from_secs(1));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.stats().sent(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_ends_session() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    h.engine.add(3);
    wait_active(&h.engine, 3).await;
    let link = h.transport.link(3);
    link.wait_for_sent(1).await;

    link.fail_sends(true);
    link.inject_solicitation();

    wait_until("deregistration", || !h.engine.exists(3)).await;
    assert_eq!(link.open_sockets(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_receive_failure_ends_session() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    h.engine.add(3);
    wait_active(&h.engine, 3).await;
    let link = h.transport.link(3);

    link.fail_receives(true);
    wait_until("deregistration", || !h.engine.exists(3)).await;
    assert_eq!(link.open_sockets(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subnet_only_interface_advertises_without_prefix() {
    let h = harness(ExclusionList::default());
    h.source.add_tap(
        6,
        "tap6_0",
        vec![Route::new("2001:db8:6::".parse().unwrap(), 64)],
    );
    h.engine.add(6);
    wait_active(&h.engine, 6).await;

    let link = h.transport.link(6);
    link.wait_for_sent(1).await;

    assert_eq!(h.engine.get(6).unwrap().prefix(), None);
    match &link.sent()[0].message {
        Message::RouterAdvertisement(ra) => {
            assert_eq!(ra.prefixes().count(), 0);
            assert_eq!(ra.mtu(), Some(1500));
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_index_can_be_managed_again_after_close() {
    let h = harness(ExclusionList::default());
    h.source
        .add_tap(3, "tap3_0", vec![host_route("2001:db8:1::1")]);
    h.engine.add(3);
    wait_active(&h.engine, 3).await;
    let first = h.engine.get(3).unwrap();

    h.engine.close(3);
    wait_until("deregistration", || !h.engine.exists(3)).await;

    h.engine.add(3);
    wait_active(&h.engine, 3).await;
    assert!(!Arc::ptr_eq(&first, &h.engine.get(3).unwrap()));
    assert_eq!(h.transport.link(3).open_sockets(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_every_session() {
    let h = harness(ExclusionList::default());
    // One session stuck binding.
    h.transport.link(4).fail_binds(u32::MAX);

    for index in 1..=4 {
        h.source.add_tap(
            index,
            &format!("tap{index}_0"),
            vec![host_route(&format!("2001:db8:{index}::1"))],
        );
        h.engine.add(index);
    }

    for index in 1..=3 {
        wait_active(&h.engine, index).await;
    }
    assert_eq!(h.engine.len(), 4);

    h.engine.shutdown(Duration::from_secs(5)).await;

    assert!(h.engine.is_empty());
    for index in 1..=4 {
        assert_eq!(h.transport.link(index).open_sockets(), 0);
    }
}
