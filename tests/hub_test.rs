//! Registry, presence and fan-out behaviour of the hub.

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{closed, drain, next_event, start_hub, RecordingStore};
use forum_chat::hub::{Client, Hub};
use forum_chat::messages::{ServerMessage, UserStatus};

fn status(user_id: &str, username: &str, is_online: bool) -> ServerMessage {
    ServerMessage::UserStatus(UserStatus {
        user_id: user_id.to_string(),
        username: username.to_string(),
        is_online,
    })
}

#[tokio::test]
async fn reconnect_replaces_and_closes_previous_connection() {
    let store = Arc::new(RecordingStore::default());
    let hub = start_hub(store.clone());

    let (first, mut first_rx) = Client::new("1", "alice", 8);
    let (second, mut second_rx) = Client::new("1", "alice", 8);
    let (third, mut third_rx) = Client::new("1", "alice", 8);
    let third_id = third.id;

    hub.admit(first).await;
    hub.admit(second).await;
    hub.admit(third).await;

    assert!(closed(&mut first_rx).await);
    assert!(closed(&mut second_rx).await);
    let online = hub.online_users().await;
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].user_id, "1");
    assert_eq!(online[0].username, "alice");

    hub.evict("1", third_id).await;
    assert!(closed(&mut third_rx).await);
    assert!(!hub.is_online("1").await);
    assert!(hub.online_users().await.is_empty());
}

#[tokio::test]
async fn stale_eviction_does_not_remove_newer_connection() {
    let store = Arc::new(RecordingStore::default());
    let hub = start_hub(store.clone());

    let (old, _old_rx) = Client::new("1", "alice", 8);
    let old_id = old.id;
    let (new, _new_rx) = Client::new("1", "alice", 8);

    hub.admit(old).await;
    hub.admit(new).await;
    hub.evict("1", old_id).await;

    assert!(hub.is_online("1").await);
    assert_eq!(
        store.presence_log(),
        vec![("1".to_string(), true), ("1".to_string(), true)]
    );
}

#[tokio::test]
async fn admit_then_evict_writes_online_then_offline() {
    let store = Arc::new(RecordingStore::default());
    let hub = start_hub(store.clone());

    let (client, mut rx) = Client::new("1", "alice", 8);
    let id = client.id;
    hub.admit(client).await;
    assert!(hub.is_online("1").await);

    hub.evict("1", id).await;
    hub.evict("1", id).await;

    assert!(!hub.is_online("1").await);
    assert!(closed(&mut rx).await);
    assert_eq!(
        store.presence_log(),
        vec![("1".to_string(), true), ("1".to_string(), false)]
    );
}

#[tokio::test]
async fn newcomer_gets_snapshot_and_others_get_status() {
    let store = Arc::new(RecordingStore::default());
    let hub = start_hub(store);

    let (alice, mut alice_rx) = Client::new("1", "alice", 8);
    let (bob, mut bob_rx) = Client::new("2", "bob", 8);
    hub.admit(alice).await;
    assert!(drain(&mut alice_rx).is_empty());

    hub.admit(bob).await;
    assert_eq!(drain(&mut bob_rx), vec![status("1", "alice", true)]);
    assert_eq!(drain(&mut alice_rx), vec![status("2", "bob", true)]);

    let (carol, mut carol_rx) = Client::new("3", "carol", 8);
    let carol_id = carol.id;
    hub.admit(carol).await;
    let mut snapshot = drain(&mut carol_rx);
    snapshot.sort_by_key(|event| match event {
        ServerMessage::UserStatus(s) => s.user_id.clone(),
        _ => String::new(),
    });
    assert_eq!(
        snapshot,
        vec![status("1", "alice", true), status("2", "bob", true)]
    );

    hub.evict("3", carol_id).await;
    assert_eq!(
        drain(&mut alice_rx),
        vec![status("3", "carol", true), status("3", "carol", false)]
    );
    assert_eq!(
        drain(&mut bob_rx),
        vec![status("3", "carol", true), status("3", "carol", false)]
    );
}

#[tokio::test]
async fn concurrent_admissions_see_each_other_but_not_themselves() {
    let store = Arc::new(RecordingStore::default());
    let hub = start_hub(store);

    let (alice, mut alice_rx) = Client::new("1", "alice", 8);
    let (bob, mut bob_rx) = Client::new("2", "bob", 8);
    tokio::join!(hub.admit(alice), hub.admit(bob));

    assert_eq!(drain(&mut alice_rx), vec![status("2", "bob", true)]);
    assert_eq!(drain(&mut bob_rx), vec![status("1", "alice", true)]);
}

#[tokio::test]
async fn broadcast_skips_excluded_and_survives_a_full_buffer() {
    let store = Arc::new(RecordingStore::default());
    let hub = start_hub(store);

    let (slow, mut slow_rx) = Client::new("slow", "slow", 1);
    hub.admit(slow).await;
    let (fast, mut fast_rx) = Client::new("fast", "fast", 8);
    hub.admit(fast).await;
    let (sender, mut sender_rx) = Client::new("sender", "sender", 8);
    hub.admit(sender).await;

    // slow now holds one unread status frame and is full.
    assert_eq!(hub.dropped_frames(), 1);
    drain(&mut fast_rx);
    drain(&mut sender_rx);

    let refresh = ServerMessage::ForceRefresh {
        timestamp: Utc::now(),
    };
    hub.broadcast(&refresh, Some("sender")).await;

    assert_eq!(drain(&mut fast_rx), vec![refresh.clone()]);
    assert!(drain(&mut sender_rx).is_empty());
    assert_eq!(drain(&mut slow_rx), vec![status("fast", "fast", true)]);
    assert_eq!(hub.dropped_frames(), 2);
}

#[tokio::test]
async fn send_to_offline_user_is_a_no_op() {
    let store = Arc::new(RecordingStore::default());
    let hub = start_hub(store);

    let (alice, mut alice_rx) = Client::new("1", "alice", 8);
    hub.admit(alice).await;

    assert!(!hub.send_to_user("2", &status("1", "alice", true)).await);
    assert!(hub.send_to_user("1", &status("3", "carol", false)).await);
    assert_eq!(next_event(&mut alice_rx).await, Some(status("3", "carol", false)));
}

#[tokio::test]
async fn force_refresh_follows_admission_when_enabled() {
    let store = Arc::new(RecordingStore::default());
    let (hub, handle) = Hub::new(store, true);
    tokio::spawn(hub.run());

    let (alice, mut alice_rx) = Client::new("1", "alice", 8);
    handle.admit(alice).await;
    assert!(matches!(
        next_event(&mut alice_rx).await,
        Some(ServerMessage::ForceRefresh { .. })
    ));

    let (bob, _bob_rx) = Client::new("2", "bob", 8);
    handle.admit(bob).await;
    assert_eq!(next_event(&mut alice_rx).await, Some(status("2", "bob", true)));
    assert!(matches!(
        next_event(&mut alice_rx).await,
        Some(ServerMessage::ForceRefresh { .. })
    ));
}
