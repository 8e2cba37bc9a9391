mod common;

use secure_messaging_service::websocket::{ClientHandle, HubError, WsFrame};
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

#[tokio::test]
async fn test_offline_recipient_reads_message_later() {
    let (state, _) = common::test_state();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    state.messages.provision_keys(alice).await.unwrap();
    state.messages.provision_keys(bob).await.unwrap();

    let stored = state.messages.send_message(alice, bob, "hello").await.unwrap();
    let push = state
        .hub
        .send_to_user(bob, WsFrame::message(&stored).to_text())
        .await;
    assert_eq!(push, Err(HubError::UserNotConnected));
    assert_eq!(push.unwrap_err().to_string(), "user not connected");

    let fetched = state.messages.fetch_pending(bob, alice).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].content.as_deref(), Some("hello"));
    assert_eq!(fetched[0].id, stored.id);
}

#[tokio::test]
async fn test_online_recipient_gets_ciphertext_envelope() {
    let (state, _) = common::test_state();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    state.messages.provision_keys(alice).await.unwrap();
    state.messages.provision_keys(bob).await.unwrap();

    let (client, mut queue) = ClientHandle::new(bob);
    state.hub.register(client).unwrap();
    timeout(Duration::from_secs(2), async {
        while !state.hub.is_online(bob).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let stored = state.messages.send_message(alice, bob, "secret").await.unwrap();
    state
        .hub
        .send_to_user(bob, WsFrame::message(&stored).to_text())
        .await
        .unwrap();

    let text = timeout(Duration::from_secs(2), queue.recv())
        .await
        .unwrap()
        .unwrap();
    let frame: WsFrame = serde_json::from_str(&text).unwrap();
    assert_eq!(frame.frame_type, "message");
    assert_eq!(frame.payload_uuid("sender_id"), Some(alice));
    assert!(!text.contains("secret"));

    // pushing does not mark delivery; the recipient still drains it
    let fetched = state.messages.fetch_pending(bob, alice).await.unwrap();
    assert_eq!(fetched[0].content.as_deref(), Some("secret"));
}

#[tokio::test]
async fn test_conversation_in_both_directions() {
    let (state, _) = common::test_state();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    state.messages.provision_keys(alice).await.unwrap();
    state.messages.provision_keys(bob).await.unwrap();

    for round in 0..3 {
        state
            .messages
            .send_message(alice, bob, &format!("a{round}"))
            .await
            .unwrap();
        state
            .messages
            .send_message(bob, alice, &format!("b{round}"))
            .await
            .unwrap();
    }

    let to_bob: Vec<_> = state
        .messages
        .fetch_pending(bob, alice)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| m.content)
        .collect();
    let to_alice: Vec<_> = state
        .messages
        .fetch_pending(alice, bob)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| m.content)
        .collect();

    assert_eq!(to_bob, vec!["a0", "a1", "a2"]);
    assert_eq!(to_alice, vec!["b0", "b1", "b2"]);
}

#[tokio::test]
async fn test_prekey_exhaustion_still_establishes_session() {
    let (state, store) = common::test_state();
    let bob = Uuid::new_v4();
    state.messages.provision_keys(bob).await.unwrap();

    // each new sender consumes one of bob's ten prekeys
    for _ in 0..12 {
        let sender = Uuid::new_v4();
        state.messages.provision_keys(sender).await.unwrap();
        state.messages.send_message(sender, bob, "hi").await.unwrap();
        let fetched = state.messages.fetch_pending(bob, sender).await.unwrap();
        assert_eq!(fetched[0].content.as_deref(), Some("hi"));
    }

    use secure_messaging_service::store::KeyStore;
    assert_eq!(store.prekey_count(bob).await.unwrap(), 0);
}
