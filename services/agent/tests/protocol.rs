//! Integration tests for the advertisement loops of a single session.

use std::sync::Arc;
use std::time::Duration;

use tapra_agent::cancel::{self, CancelHandle};
use tapra_agent::testing::{MockInterfaceSource, MockLink, MockTransport};
use tapra_agent::{AdvertConfig, SessionError, SessionState, TapSession};
use tapra_networking::ndp::{Message, RouterAdvertisement};
use tapra_networking::{ExclusionList, Route};
use tokio::task::JoinHandle;

struct Running {
    session: Arc<TapSession>,
    link: Arc<MockLink>,
    cancel: CancelHandle,
    task: JoinHandle<Result<(), SessionError>>,
}

async fn start(interval: Duration, prepare: impl FnOnce(&MockLink)) -> Running {
    let source = MockInterfaceSource::new();
    source.add_tap(
        3,
        "tap3_0",
        vec![Route::new("2001:db8:1::1".parse().unwrap(), 128)],
    );
    let config = AdvertConfig {
        router_lifetime: Duration::from_secs(1800),
        interval,
    };
    let session = Arc::new(
        TapSession::new(3, &source, &ExclusionList::default(), config)
            .await
            .unwrap(),
    );

    let transport = Arc::new(MockTransport::new());
    let link = transport.link(3);
    prepare(&link);

    let (cancel, token) = cancel::pair();
    let task = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.run(&*transport, token).await }
    });

    Running {
        session,
        link,
        cancel,
        task,
    }
}

async fn wait_active(session: &TapSession) {
    let mut state = session.watch_state();
    state
        .wait_for(|s| *s != SessionState::Binding)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_advertisements() {
    let r = start(Duration::from_secs(1), |_| {}).await;
    wait_active(&r.session).await;
    assert_eq!(r.session.state(), SessionState::Active);

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let sent = r.link.sent();
    assert!(sent.len() >= 2, "sent {} advertisements", sent.len());
    let gap = sent[1].at - sent[0].at;
    assert!(gap >= Duration::from_secs(1) && gap < Duration::from_millis(1100));
    assert!(sent
        .iter()
        .all(|s| matches!(s.message, Message::RouterAdvertisement(_))));
}

#[tokio::test(start_paused = true)]
async fn test_solicitation_triggers_advertisement() {
    let interval = Duration::from_secs(600);
    let r = start(interval, |_| {}).await;
    r.link.wait_for_sent(1).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    r.link.inject_solicitation();

    tokio::time::timeout(Duration::from_secs(2), r.link.wait_for_sent(2))
        .await
        .expect("no solicited advertisement");

    let sent = r.link.sent();
    assert!(sent[1].at - sent[0].at < interval);
    assert_eq!(sent[1].message, sent[0].message);
    assert_eq!(r.session.stats().received(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_solicitation_burst_is_answered() {
    let r = start(Duration::from_secs(600), |_| {}).await;
    r.link.wait_for_sent(1).await;

    for _ in 0..5 {
        r.link.inject_solicitation();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    // One advertisement per solicitation read, never more.
    assert_eq!(r.session.stats().received(), 5);
    assert_eq!(r.link.sent_count(), 6);
    assert_eq!(r.session.stats().sent(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_other_messages_are_ignored() {
    let r = start(Duration::from_secs(600), |_| {}).await;
    r.link.wait_for_sent(1).await;

    r.link.inject(
        Message::RouterAdvertisement(RouterAdvertisement {
            current_hop_limit: 64,
            managed: false,
            other: false,
            preference: Default::default(),
            router_lifetime: Duration::from_secs(60),
            reachable_time: Duration::ZERO,
            retransmit_timer: Duration::ZERO,
            options: vec![],
        }),
        "fe80::99".parse().unwrap(),
    );
    r.link.inject(Message::Other { icmp_type: 128 }, "fe80::99".parse().unwrap());
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(r.link.sent_count(), 1);
    assert_eq!(r.session.stats().received(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_is_clean() {
    let r = start(Duration::from_secs(600), |_| {}).await;
    r.link.wait_for_sent(1).await;

    r.cancel.cancel();
    r.task.await.unwrap().unwrap();

    assert_eq!(r.session.state(), SessionState::Closed);
    assert_eq!(r.link.open_sockets(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_cancel_handle_stops_session() {
    let r = start(Duration::from_secs(600), |_| {}).await;
    r.link.wait_for_sent(1).await;

    drop(r.cancel);
    tokio::time::timeout(Duration::from_secs(2), r.task)
        .await
        .expect("session did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_is_fatal() {
    let r = start(Duration::from_secs(600), |link| link.fail_sends(true)).await;

    let err = r.task.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Send(_)));
    assert_eq!(err.reason_code(), "send");
    assert_eq!(r.session.state(), SessionState::Closed);
    assert_eq!(r.link.open_sockets(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_receive_failure_is_fatal() {
    let r = start(Duration::from_secs(600), |link| link.fail_receives(true)).await;

    let err = r.task.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Receive(_)));
    assert!(!err.is_construction());
}
