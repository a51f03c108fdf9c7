//! Subscription Integration Tests
//!
//! Tests routing, concurrent watches and subscription replay against a real
//! WebSocket endpoint.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use venue_link::{
    ConnectionClient, OutboundPayload, SubscriptionEvent, SubscriptionManager, StreamMessage,
};

use common::{TestVenue, config, wait_for, within};

fn subscribe(channel: &str) -> OutboundPayload {
    OutboundPayload::from(json!({"op": "subscribe", "channel": channel}))
}

fn unsubscribe(channel: &str) -> OutboundPayload {
    OutboundPayload::from(json!({"op": "unsubscribe", "channel": channel}))
}

fn update(channel: &str, seq: u64) -> Value {
    json!({"type": "update", "channel": channel, "seq": seq, "data": {"n": seq}})
}

fn manager(url: String) -> SubscriptionManager {
    SubscriptionManager::new(ConnectionClient::new(config(url, 5)))
}

#[tokio::test]
async fn handler_receives_only_its_channel() {
    let mut venue = TestVenue::start().await;
    let manager = manager(venue.url());
    manager.connect().await.unwrap();
    let mut peer = venue.accept().await;

    let hits = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&hits);
    manager
        .subscribe("trades:BTC", subscribe("trades:BTC"), move |message: &StreamMessage| {
            assert!(message.is_for("trades:BTC"));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(peer.recv_json().await, json!({"op": "subscribe", "channel": "trades:BTC"}));

    let mut events = manager.events();
    peer.send_json(&update("trades:ETH", 1)).await;
    peer.send_json(&update("trades:BTC", 2)).await;
    wait_for(&mut events, |e| {
        matches!(e, SubscriptionEvent::Message(m) if m.sequence_id == Some(2))
    })
    .await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    manager.disconnect().await;
}

#[tokio::test]
async fn concurrent_watches_each_see_every_message() {
    let mut venue = TestVenue::start().await;
    let manager = manager(venue.url());
    manager.connect().await.unwrap();
    let mut peer = venue.accept().await;

    let first = manager.watch("book:ETH", subscribe("book:ETH"), None).await.unwrap();
    let second = manager.watch("book:ETH", subscribe("book:ETH"), None).await.unwrap();
    peer.recv_json().await;
    peer.recv_json().await;

    for seq in 1..=3 {
        peer.send_json(&update("book:ETH", seq)).await;
    }

    let drain = |mut watch: venue_link::Watch| {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 3 {
                let message = within(watch.next()).await.unwrap();
                seen.push(message.sequence_id.unwrap());
            }
            seen
        })
    };
    let (a, b) = tokio::join!(drain(first), drain(second));

    assert_eq!(a.unwrap(), vec![1, 2, 3]);
    assert_eq!(b.unwrap(), vec![1, 2, 3]);
    manager.disconnect().await;
}

#[tokio::test]
async fn subscriptions_replay_after_reconnect() {
    let mut venue = TestVenue::start().await;
    let manager = manager(venue.url());
    let mut events = manager.events();
    manager.connect().await.unwrap();
    let mut peer = venue.accept().await;

    let mut trades = manager.watch("trades", subscribe("trades"), None).await.unwrap();
    manager
        .subscribe("quotes", subscribe("quotes"), |_: &StreamMessage| Ok(()))
        .await
        .unwrap();
    peer.recv_json().await;
    peer.recv_json().await;

    peer.kill();
    let mut peer = venue.accept().await;

    // Replayed in creation order on the new connection.
    assert_eq!(peer.recv_json().await, json!({"op": "subscribe", "channel": "trades"}));
    assert_eq!(peer.recv_json().await, json!({"op": "subscribe", "channel": "quotes"}));
    wait_for(&mut events, |e| {
        matches!(e, SubscriptionEvent::Resubscribed { count: 2 })
    })
    .await;

    peer.send_json(&update("trades", 9)).await;
    let message = within(trades.next()).await.unwrap();
    assert_eq!(message.sequence_id, Some(9));
    assert_eq!(manager.stats().active, 2);

    manager.disconnect().await;
}

#[tokio::test]
async fn queued_subscription_is_sent_once_on_connect() {
    let mut venue = TestVenue::start().await;
    let manager = manager(venue.url());

    manager
        .subscribe("trades", subscribe("trades"), |_: &StreamMessage| Ok(()))
        .await
        .unwrap();
    assert_eq!(manager.stats().pending_outbound, 1);

    manager.connect().await.unwrap();
    let mut peer = venue.accept().await;
    assert_eq!(peer.recv_json().await, json!({"op": "subscribe", "channel": "trades"}));

    // A marker proves nothing else was queued ahead of it.
    manager.client().send(&OutboundPayload::from("marker")).await.unwrap();
    assert_eq!(peer.recv_text().await.as_deref(), Some("marker"));
    assert_eq!(manager.stats().pending_outbound, 0);

    manager.disconnect().await;
}

#[tokio::test]
async fn dropping_watch_sends_unsubscribe() {
    let mut venue = TestVenue::start().await;
    let manager = manager(venue.url());
    manager.connect().await.unwrap();
    let mut peer = venue.accept().await;

    let watch = manager
        .watch("trades", subscribe("trades"), Some(unsubscribe("trades")))
        .await
        .unwrap();
    peer.recv_json().await;
    assert_eq!(manager.stats().active, 1);

    drop(watch);

    assert_eq!(peer.recv_json().await, json!({"op": "unsubscribe", "channel": "trades"}));
    assert_eq!(manager.stats().active, 0);
    manager.disconnect().await;
}

#[tokio::test]
async fn disconnect_ends_watches() {
    let mut venue = TestVenue::start().await;
    let manager = manager(venue.url());
    manager.connect().await.unwrap();
    let _peer = venue.accept().await;

    let mut watch = manager.watch("trades", subscribe("trades"), None).await.unwrap();
    manager.disconnect().await;

    assert!(within(watch.next()).await.is_none());
    assert_eq!(manager.stats().active, 0);

    // Nothing reconnects after an explicit disconnect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!manager.is_connected());
}
