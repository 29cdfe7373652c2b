mod support;

use std::time::Duration;

use strchat_core::UserAction;
use strchat_core::event::first_tag_value;
use strchat_core::pow::is_pow_valid;
use support::{Harness, config_with_anchors, test_settings};

const A: &str = "wss://a.test";

#[tokio::test(flavor = "multi_thread")]
async fn switching_chats_cancels_mining() {
    let h = Harness::start(config_with_anchors(&[A]), test_settings());
    h.dispatch(UserAction::JoinChats {
        names: "nostr rust".into(),
    });
    h.wait_for_relays(&[A]).await;

    // far beyond anything that finishes during the test
    h.dispatch(UserAction::SetPow {
        difficulty: "60".into(),
    });
    h.wait_for_text("PoW difficulty for nostr set to 60.").await;
    h.dispatch(UserAction::SendMessage {
        text: "expensive".into(),
    });
    h.wait_for_text("Calculating Proof-of-Work (difficulty 60)...")
        .await;

    h.dispatch(UserAction::ActivateView {
        name: "rust".into(),
    });
    h.wait_for_text("PoW calculation cancelled.").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.net.publish_count(A), 0);
    assert!(h.net.stored_events(A).is_empty());

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mined_messages_carry_a_valid_nonce() {
    let h = Harness::start(config_with_anchors(&[A]), test_settings());
    h.dispatch(UserAction::JoinChats {
        names: "nostr".into(),
    });
    h.wait_for_relays(&[A]).await;
    h.dispatch(UserAction::SetPow {
        difficulty: "8".into(),
    });
    h.dispatch(UserAction::SendMessage {
        text: "worked for it".into(),
    });
    h.wait_for_text("sent to 1/1 relays for nostr.").await;

    let stored = h.net.stored_events(A);
    assert_eq!(stored.len(), 1);
    assert!(is_pow_valid(&stored[0], 8));
    let nonce = stored[0]
        .tags
        .iter()
        .find(|t| t.as_slice()[0] == "nonce")
        .map(|t| t.as_slice().to_vec())
        .expect("nonce tag");
    assert_eq!(nonce[2], "8");
    assert!(first_tag_value(&stored[0], "n").is_some());

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_pow_values_leave_the_view_unchanged() {
    let h = Harness::start(config_with_anchors(&[A]), test_settings());
    h.dispatch(UserAction::SetPow {
        difficulty: "4".into(),
    });
    h.wait_for_text("No active chat. Use /join <chat> to join one.")
        .await;

    h.dispatch(UserAction::JoinChats {
        names: "nostr".into(),
    });
    h.dispatch(UserAction::SetPow {
        difficulty: "lots".into(),
    });
    h.dispatch(UserAction::SetPow {
        difficulty: "-3".into(),
    });
    h.dispatch(UserAction::SetPow {
        difficulty: "0".into(),
    });
    h.wait_for_text("PoW disabled for nostr.").await;
    assert!(h.saw_text("Invalid PoW difficulty: 'lots'. Must be a number."));
    assert!(h.saw_text("PoW difficulty cannot be negative."));

    h.shutdown().await;
}
