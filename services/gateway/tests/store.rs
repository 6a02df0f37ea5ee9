//! Message store tests: persist idempotence, the forward-only delivery
//! state machine, pending ordering, digests, and retention expiry.

use chan_protocol::AckLevel;
use gateway::db::create_test_pool;
use gateway::repo::{digests, messages, subscriptions};
use serde_json::json;

fn message(id: &str, channel: &str, priority: i64, created_at: i64) -> messages::NewMessage {
    messages::NewMessage {
        message_id: id.to_owned(),
        channel: channel.to_owned(),
        body: json!({ "text": format!("body-{id}") }),
        message_type: None,
        priority,
        sender_account_id: 7,
        sender_profile_id: 1,
        created_at,
    }
}

#[tokio::test]
async fn persist_is_idempotent_by_message_id() {
    let pool = create_test_pool().await;
    let m = message("m1", "room.1", 0, 1000);

    assert!(messages::persist(&pool, &m, &[42, 43]).await.unwrap());
    assert!(!messages::persist(&pool, &m, &[42, 43]).await.unwrap());

    let pending = messages::get_pending(&pool, 42, None).await.unwrap();
    assert_eq!(pending.len(), 1);
    let pending = messages::get_pending(&pool, 43, None).await.unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn delivery_states_move_forward_only() {
    let pool = create_test_pool().await;
    messages::persist(&pool, &message("m1", "c", 0, 1000), &[42])
        .await
        .unwrap();

    assert!(messages::mark_delivered(&pool, "m1", 42, 1100).await.unwrap());
    // Repeat delivery marking is a no-op.
    assert!(!messages::mark_delivered(&pool, "m1", 42, 1200).await.unwrap());
    assert_eq!(
        messages::delivery_state(&pool, "m1", 42).await.unwrap(),
        Some("delivered".to_owned())
    );

    assert!(
        messages::record_ack(&pool, "m1", 42, AckLevel::Client, None, 1300)
            .await
            .unwrap()
    );
    assert_eq!(
        messages::delivery_state(&pool, "m1", 42).await.unwrap(),
        Some("ack_client".to_owned())
    );

    assert!(
        messages::record_ack(&pool, "m1", 42, AckLevel::App, Some(&json!({"read": true})), 1400)
            .await
            .unwrap()
    );
    assert_eq!(
        messages::delivery_state(&pool, "m1", 42).await.unwrap(),
        Some("ack_app".to_owned())
    );

    // ack_app is terminal: a late client ack succeeds without regressing.
    assert!(
        !messages::record_ack(&pool, "m1", 42, AckLevel::Client, None, 1500)
            .await
            .unwrap()
    );
    assert_eq!(
        messages::delivery_state(&pool, "m1", 42).await.unwrap(),
        Some("ack_app".to_owned())
    );
}

#[tokio::test]
async fn app_ack_is_reachable_straight_from_pending() {
    let pool = create_test_pool().await;
    messages::persist(&pool, &message("m1", "c", 0, 1000), &[42])
        .await
        .unwrap();

    assert!(
        messages::record_ack(&pool, "m1", 42, AckLevel::App, None, 1100)
            .await
            .unwrap()
    );
    assert_eq!(
        messages::delivery_state(&pool, "m1", 42).await.unwrap(),
        Some("ack_app".to_owned())
    );
}

#[tokio::test]
async fn get_pending_orders_by_priority_then_age_and_filters_by_channel() {
    let pool = create_test_pool().await;
    messages::persist(&pool, &message("low-old", "a", 0, 1000), &[42])
        .await
        .unwrap();
    messages::persist(&pool, &message("high-new", "a", 5, 3000), &[42])
        .await
        .unwrap();
    messages::persist(&pool, &message("high-old", "a", 5, 2000), &[42])
        .await
        .unwrap();
    messages::persist(&pool, &message("other-chan", "b", 9, 1500), &[42])
        .await
        .unwrap();

    let all = messages::get_pending(&pool, 42, None).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|r| r.message_id.as_str()).collect();
    assert_eq!(ids, vec!["other-chan", "high-old", "high-new", "low-old"]);

    let only_a = messages::get_pending(&pool, 42, Some("a")).await.unwrap();
    let ids: Vec<&str> = only_a.iter().map(|r| r.message_id.as_str()).collect();
    assert_eq!(ids, vec!["high-old", "high-new", "low-old"]);

    // Acked deliveries drop out of the pending set.
    messages::record_ack(&pool, "high-old", 42, AckLevel::App, None, 4000)
        .await
        .unwrap();
    let only_a = messages::get_pending(&pool, 42, Some("a")).await.unwrap();
    assert_eq!(only_a.len(), 2);
}

#[tokio::test]
async fn expire_sweeps_only_unacknowledged_deliveries_past_the_cutoff() {
    let pool = create_test_pool().await;
    messages::persist(&pool, &message("old-pending", "c", 0, 1000), &[42])
        .await
        .unwrap();
    messages::persist(&pool, &message("old-acked", "c", 0, 1000), &[42])
        .await
        .unwrap();
    messages::persist(&pool, &message("fresh", "c", 0, 9000), &[42])
        .await
        .unwrap();
    messages::record_ack(&pool, "old-acked", 42, AckLevel::App, None, 1100)
        .await
        .unwrap();

    assert_eq!(messages::expire(&pool, 5000).await.unwrap(), 1);
    assert_eq!(
        messages::delivery_state(&pool, "old-pending", 42).await.unwrap(),
        Some("expired".to_owned())
    );
    assert_eq!(
        messages::delivery_state(&pool, "old-acked", 42).await.unwrap(),
        Some("ack_app".to_owned())
    );
    assert_eq!(
        messages::delivery_state(&pool, "fresh", 42).await.unwrap(),
        Some("pending".to_owned())
    );

    // Expired deliveries no longer count as pending.
    let pending = messages::get_pending(&pool, 42, None).await.unwrap();
    let ids: Vec<&str> = pending.iter().map(|r| r.message_id.as_str()).collect();
    assert_eq!(ids, vec!["fresh"]);
}

#[tokio::test]
async fn digest_upserts_accumulate_and_clear() {
    let pool = create_test_pool().await;

    digests::upsert_digest(&pool, 42, "alerts", "first", 0, 1000)
        .await
        .unwrap();
    digests::upsert_digest(&pool, 42, "alerts", "second", 2, 1100)
        .await
        .unwrap();
    digests::upsert_digest(&pool, 42, "room.1", "hello", 0, 1200)
        .await
        .unwrap();
    digests::upsert_digest(&pool, 99, "alerts", "not yours", 0, 1300)
        .await
        .unwrap();

    let rollup = digests::build_digest(&pool, 42).await.unwrap();
    assert_eq!(rollup.total, 3);
    assert_eq!(rollup.channels.len(), 2);
    // Higher priority channel sorts first; previews keep the latest text.
    assert_eq!(rollup.channels[0].channel, "alerts");
    assert_eq!(rollup.channels[0].count, 2);
    assert_eq!(rollup.channels[0].preview.as_deref(), Some("second"));
    assert_eq!(rollup.channels[1].channel, "room.1");

    digests::clear_digests(&pool, 42).await.unwrap();
    assert!(digests::build_digest(&pool, 42).await.unwrap().is_empty());
    // Other recipients are untouched.
    assert_eq!(digests::build_digest(&pool, 99).await.unwrap().total, 1);
}

#[tokio::test]
async fn digest_previews_are_bounded() {
    let pool = create_test_pool().await;
    let long = "x".repeat(500);
    digests::upsert_digest(&pool, 42, "alerts", &long, 0, 1000)
        .await
        .unwrap();
    let rollup = digests::build_digest(&pool, 42).await.unwrap();
    assert_eq!(
        rollup.channels[0].preview.as_ref().map(String::len),
        Some(digests::PREVIEW_MAX_CHARS)
    );
}

#[tokio::test]
async fn subscription_mirror_round_trips() {
    let pool = create_test_pool().await;
    assert!(
        subscriptions::persist_subscription(&pool, 42, "room.1", 1000)
            .await
            .unwrap()
    );
    // Idempotent: the second write reports that the row already existed.
    assert!(
        !subscriptions::persist_subscription(&pool, 42, "room.1", 1001)
            .await
            .unwrap()
    );
    assert!(
        subscriptions::persist_subscription(&pool, 43, "room.1", 1002)
            .await
            .unwrap()
    );

    assert_eq!(
        subscriptions::subscribers_of(&pool, "room.1").await.unwrap(),
        vec![42, 43]
    );
    assert_eq!(
        subscriptions::channels_of(&pool, 42).await.unwrap(),
        vec!["room.1".to_owned()]
    );

    subscriptions::remove_subscription(&pool, 42, "room.1")
        .await
        .unwrap();
    assert_eq!(
        subscriptions::subscribers_of(&pool, "room.1").await.unwrap(),
        vec![43]
    );
}
