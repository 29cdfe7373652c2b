mod support;

use std::time::Duration;

use nostr_sdk::prelude::{Event, Keys, Timestamp};
use strchat_core::config::{ConfigStore, View};
use strchat_core::discovery::DiscoveredRelayStore;
use strchat_core::event::{EventDraft, RELAY_LIST_KIND};
use strchat_core::{Config, DisplayEvent, MemoryNetwork, UserAction};
use support::{Harness, WAIT, is_error, test_settings, text_of, wait_until};

const ANCHOR: &str = "wss://anchor.test";
const FOUND_1: &str = "wss://found1.test";
const FOUND_2: &str = "wss://found2.test";
const UPDATING: &str = "Updating subscriptions for active chat/group...";

fn relay_list(keys: &Keys, entries: &[(&str, Option<&str>)]) -> Event {
    let mut draft = EventDraft {
        kind: RELAY_LIST_KIND,
        content: String::new(),
        tags: Vec::new(),
        created_at: Timestamp::now(),
    };
    for (url, marker) in entries {
        let mut tag = vec!["r", *url];
        tag.extend(*marker);
        draft = draft.with_tag(tag);
    }
    draft.sign(keys).unwrap()
}

fn listed_connected(ev: &DisplayEvent, url: &str) -> bool {
    matches!(ev, DisplayEvent::RelaysUpdate { relays }
        if relays.iter().any(|r| r.url == url && r.connected))
}

fn nostr_config() -> Config {
    Config {
        anchor_relays: vec![ANCHOR.to_string()],
        views: vec![View::chat("nostr")],
        active_view_name: "nostr".to_string(),
        ..Config::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn verified_relays_join_the_mapping_after_one_debounced_recompute() {
    let net = MemoryNetwork::new();
    net.inject(
        ANCHOR,
        &relay_list(
            &Keys::generate(),
            &[
                (FOUND_1, None),
                (FOUND_2, None),
                ("ws://plain.test", None),
                ("wss://reader.test", Some("read")),
                (ANCHOR, None),
            ],
        ),
    );

    let mut settings = test_settings();
    settings.discovery_enabled = true;
    let debounce = settings.recompute_debounce;
    let h = Harness::start_on(net.clone(), nostr_config(), settings);

    wait_until("discovered relays subscribed", WAIT, || {
        net.active_subscriptions(FOUND_1) == 1 && net.active_subscriptions(FOUND_2) == 1
    })
    .await;
    tokio::time::sleep(debounce * 2).await;

    let recomputes = h.count(|ev| text_of(ev) == Some(UPDATING));
    // one at startup, one for the whole discovery burst
    assert_eq!(recomputes, 2);

    // candidates that fail the admission rules are never contacted
    assert_eq!(net.connect_count("ws://plain.test"), 0);
    assert_eq!(net.connect_count("wss://reader.test"), 0);

    // each verified relay kept its read-back probe
    assert_eq!(net.stored_events(FOUND_1).len(), 1);

    let dir = h.shutdown().await;
    let store = DiscoveredRelayStore::load(dir.path());
    assert_eq!(store.urls(), [FOUND_1, FOUND_2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_candidates_are_not_stored() {
    let net = MemoryNetwork::strict();
    net.add_relay(ANCHOR);
    net.add_relay(FOUND_1);
    net.inject(
        ANCHOR,
        &relay_list(&Keys::generate(), &[("wss://missing.test", None), (FOUND_1, None)]),
    );

    let mut settings = test_settings();
    settings.discovery_enabled = true;
    let h = Harness::start_on(net.clone(), nostr_config(), settings);

    wait_until("found1 verified", WAIT, || {
        net.active_subscriptions(FOUND_1) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dir = h.shutdown().await;
    let store = DiscoveredRelayStore::load(dir.path());
    assert_eq!(store.urls(), [FOUND_1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn anchors_are_added_listed_and_removed() {
    const EXTRA: &str = "wss://extra.test";
    let h = Harness::start(nostr_config(), test_settings());
    h.wait_for_relays(&[ANCHOR]).await;

    h.dispatch(UserAction::ManageAnchors {
        args: "extra.test https://web.test".into(),
    });
    h.wait_for_text("Added anchor relay(s): wss://extra.test").await;
    h.wait_for("invalid url reported", |ev| {
        is_error(ev, "Invalid URL(s) skipped: https://web.test")
    })
    .await;
    h.wait_for_relays(&[ANCHOR, EXTRA]).await;

    h.dispatch(UserAction::ManageAnchors {
        args: "wss://extra.test/".into(),
    });
    h.wait_for_text("Specified relay(s) are already in the anchor list.")
        .await;

    h.dispatch(UserAction::ManageAnchors { args: String::new() });
    h.wait_for_text("[2] wss://extra.test").await;

    h.dispatch(UserAction::ManageAnchors { args: "5".into() });
    h.wait_for("bad index", |ev| {
        is_error(ev, "Invalid number: 5. Use '/relay' to see the list.")
    })
    .await;

    h.dispatch(UserAction::ManageAnchors { args: "1".into() });
    h.wait_for_text("Removed anchor relay: wss://anchor.test").await;
    wait_until("old anchor released", WAIT, || {
        h.net.active_subscriptions(ANCHOR) == 0
    })
    .await;
    assert_eq!(h.net.active_subscriptions(EXTRA), 1);

    let dir = h.shutdown().await;
    let saved = ConfigStore::new(dir.path()).load_or_create().unwrap();
    assert_eq!(saved.anchor_relays, [EXTRA]);
}

#[tokio::test(flavor = "multi_thread")]
async fn verified_relay_is_listed_before_the_recompute() {
    let net = MemoryNetwork::new();
    net.inject(ANCHOR, &relay_list(&Keys::generate(), &[(FOUND_1, None)]));

    let mut settings = test_settings();
    settings.discovery_enabled = true;
    settings.recompute_debounce = Duration::from_secs(30);
    let h = Harness::start_on(net.clone(), nostr_config(), settings);

    h.wait_for("found1 listed", |ev| listed_connected(ev, FOUND_1))
        .await;
    // only the startup pass so far; the debounced one is still pending
    assert_eq!(h.count(|ev| text_of(ev) == Some(UPDATING)), 1);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn crawl_stops_at_the_depth_limit() {
    const HOP_2: &str = "wss://hop2.test";
    const HOP_3: &str = "wss://hop3.test";
    let net = MemoryNetwork::new();
    let keys = Keys::generate();
    net.inject(ANCHOR, &relay_list(&keys, &[(FOUND_1, None)]));
    net.inject(FOUND_1, &relay_list(&keys, &[(HOP_2, None)]));
    net.inject(HOP_2, &relay_list(&keys, &[(HOP_3, None)]));

    let mut settings = test_settings();
    settings.discovery_enabled = true;
    settings.max_discovery_depth = 2;
    settings.recompute_debounce = Duration::from_secs(30);
    let h = Harness::start_on(net.clone(), nostr_config(), settings);

    // anchor crawled at depth 1 finds found1, found1 at depth 2 finds hop2
    h.wait_for("hop2 verified", |ev| listed_connected(ev, HOP_2))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(net.connect_count(HOP_3), 0);

    let dir = h.shutdown().await;
    let store = DiscoveredRelayStore::load(dir.path());
    assert_eq!(store.urls(), [FOUND_1, HOP_2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn crawls_beyond_the_ceiling_are_skipped() {
    const ANCHOR_2: &str = "wss://anchor2.test";
    let net = MemoryNetwork::new();
    let keys = Keys::generate();
    net.inject(ANCHOR, &relay_list(&keys, &[(FOUND_1, None)]));
    net.inject(ANCHOR_2, &relay_list(&keys, &[(FOUND_2, None)]));

    let mut settings = test_settings();
    settings.discovery_enabled = true;
    settings.max_active_discoveries = 1;
    settings.recompute_debounce = Duration::from_secs(30);
    let config = Config {
        anchor_relays: vec![ANCHOR.to_string(), ANCHOR_2.to_string()],
        ..nostr_config()
    };
    let h = Harness::start_on(net.clone(), config, settings);

    h.wait_for("found1 verified", |ev| listed_connected(ev, FOUND_1))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    // anchor2 only saw the chat connection, never a crawl
    assert_eq!(net.connect_count(ANCHOR_2), 1);
    assert_eq!(net.connect_count(FOUND_2), 0);

    let dir = h.shutdown().await;
    let store = DiscoveredRelayStore::load(dir.path());
    assert_eq!(store.urls(), [FOUND_1]);
}
