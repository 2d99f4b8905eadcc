//! Fault handling and recovery tests.

mod common;

use common::{client_options, settle, start_broker};
use photon::client::{ClientEvent, ClientSession, ClientState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn concurrent_fault_triggers_start_exactly_one_recovery() {
    let broker = start_broker().await;
    let (client, mut events) = ClientSession::new(client_options(&broker, "flappy"));
    client.connect().await.unwrap();

    // Two triggers racing, as a transport error and a watchdog timeout
    // would; the compare-and-swap admits exactly one recovery loop.
    client.force_fault("transport error");
    client.force_fault("watchdog timeout");
    settle().await;
    assert_eq!(client.recovery_loops_started(), 1);

    // The single loop brings the session back.
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ClientEvent::Reconnected) => break,
                Some(_) => continue,
                None => panic!("event channel closed before reconnect"),
            }
        }
    })
    .await
    .expect("reconnect");
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.recovery_loops_started(), 1);

    client.close().await;
    broker.shutdown();
}

#[tokio::test]
async fn close_interrupts_reconnect_wait() {
    let broker = start_broker().await;
    let opts = client_options(&broker, "quitter").reconnect_delay(Duration::from_secs(30));
    let (client, _events) = ClientSession::new(opts);
    client.connect().await.unwrap();

    // Stop the broker so recovery cannot succeed, then fault.
    broker.shutdown();
    client.force_fault("broker went away");
    settle().await;
    assert_eq!(client.state(), ClientState::Faulted);

    // Close must win over the in-flight reconnect well before the 30s
    // delay elapses.
    let closed = timeout(Duration::from_secs(3), client.close()).await;
    assert!(closed.is_ok(), "close blocked behind the reconnect wait");
    assert_eq!(client.state(), ClientState::Closed);

    // The closed session never connects again.
    settle().await;
    assert_eq!(client.recovery_loops_started(), 1);
}

#[tokio::test]
async fn custom_fault_handler_replaces_builtin_loop() {
    let broker = start_broker().await;
    let (client, _events) = ClientSession::new(client_options(&broker, "custom"));

    let invocations = Arc::new(AtomicUsize::new(0));
    let seen = invocations.clone();
    client.set_fault_handler(Arc::new(move |_session, reason| {
        assert!(reason.contains("synthetic"));
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    client.connect().await.unwrap();
    client.force_fault("synthetic failure");
    settle().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    // The built-in loop stayed out of it.
    assert_eq!(client.recovery_loops_started(), 0);
    assert_eq!(client.state(), ClientState::Faulted);

    client.close().await;
    broker.shutdown();
}

#[tokio::test]
async fn reconnected_client_resubscribes_and_receives() {
    let broker = start_broker().await;
    let (subscriber, mut events) = ClientSession::new(client_options(&broker, "resub"));
    subscriber.connect().await.unwrap();
    subscriber.subscribe(&["r/t".to_string()]).await.unwrap();
    settle().await;

    subscriber.force_fault("flaky network");
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ClientEvent::Reconnected) => break,
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
    })
    .await
    .expect("reconnect");
    settle().await;

    let (publisher, _p) = ClientSession::new(client_options(&broker, "rpub"));
    publisher.connect().await.unwrap();
    publisher
        .publish(photon::protocol::ApplicationMessage::new("r/t", b"back".to_vec()))
        .await
        .unwrap();

    let delivered = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ClientEvent::Message(msg)) => break msg,
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
    })
    .await
    .expect("delivery after reconnect");
    assert_eq!(delivered.payload, b"back");

    publisher.close().await;
    subscriber.close().await;
    broker.shutdown();
}
