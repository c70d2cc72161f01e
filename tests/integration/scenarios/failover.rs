//! Reacting to Sentinel switch-master events

use crate::integration::{pool_builder, wait_until, MockRedis, MockSentinel, MASTER_NAME};
use heimdall::SentinelPool;
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(3);

/// Wait until every listener has subscribed so published events are not missed
async fn wait_for_subscribers(sentinels: &[&MockSentinel]) {
    let subscribed = wait_until(SETTLE, || sentinels.iter().all(|s| s.subscriber_count() == 1)).await;
    assert!(subscribed, "sentinel listeners did not subscribe");
}

async fn wait_for_failovers(pool: &SentinelPool, count: u64) {
    let switched = wait_until(SETTLE, || pool.metrics().failovers >= count).await;
    assert!(switched, "pool did not observe the failover");
}

#[tokio::test]
async fn test_failover_repoints_pool() {
    let old_master = MockRedis::new().await.unwrap();
    let new_master = MockRedis::new().await.unwrap();
    let sentinel = MockSentinel::monitoring(MASTER_NAME, old_master.addr()).await.unwrap();

    let pool = pool_builder(&sentinel).build().await.unwrap();
    let mut conn = pool.get_resource().await.unwrap();
    assert_eq!(conn.addr(), &old_master.addr());
    conn.set("foo", "old").await.unwrap();
    drop(conn);

    wait_for_subscribers(&[&sentinel]).await;
    sentinel.switch_master(MASTER_NAME, new_master.addr());
    wait_for_failovers(&pool, 1).await;
    assert_eq!(pool.current_master().await, new_master.addr());

    let mut conn = pool.get_resource().await.unwrap();
    assert_eq!(conn.addr(), &new_master.addr());
    conn.set("foo", "new").await.unwrap();
    drop(conn);

    assert_eq!(new_master.get_stored_value(0, "foo").as_deref(), Some("new"));
    assert_eq!(old_master.get_stored_value(0, "foo").as_deref(), Some("old"));

    // The idle connection to the old master was evicted on checkout
    assert!(wait_until(SETTLE, || old_master.active_connections() == 0).await);

    pool.destroy().await;
}

#[tokio::test]
async fn test_connection_to_old_master_is_dropped_on_return() {
    let old_master = MockRedis::new().await.unwrap();
    let new_master = MockRedis::new().await.unwrap();
    let sentinel = MockSentinel::monitoring(MASTER_NAME, old_master.addr()).await.unwrap();

    let pool = pool_builder(&sentinel).build().await.unwrap();
    let mut held = pool.get_resource().await.unwrap();
    held.ping().await.unwrap();

    wait_for_subscribers(&[&sentinel]).await;
    sentinel.switch_master(MASTER_NAME, new_master.addr());
    wait_for_failovers(&pool, 1).await;

    // Failover leaves checked-out connections alone
    held.ping().await.unwrap();
    drop(held);

    assert_eq!(pool.state().unwrap().connections, 0);
    assert!(wait_until(SETTLE, || old_master.active_connections() == 0).await);

    pool.destroy().await;
}

#[tokio::test]
async fn test_failover_reported_by_every_sentinel_applies_once() {
    let old_master = MockRedis::new().await.unwrap();
    let new_master = MockRedis::new().await.unwrap();
    let first = MockSentinel::monitoring(MASTER_NAME, old_master.addr()).await.unwrap();
    let second = MockSentinel::monitoring(MASTER_NAME, old_master.addr()).await.unwrap();

    let pool = pool_builder(&first)
        .sentinel(second.addr())
        .build()
        .await
        .unwrap();

    wait_for_subscribers(&[&first, &second]).await;
    assert_eq!(pool.active_listeners(), 2);

    first.switch_master(MASTER_NAME, new_master.addr());
    second.switch_master(MASTER_NAME, new_master.addr());
    wait_for_failovers(&pool, 1).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.metrics().failovers, 1);
    assert_eq!(pool.current_master().await, new_master.addr());

    pool.destroy().await;
}

#[tokio::test]
async fn test_events_for_other_masters_are_ignored() {
    let master = MockRedis::new().await.unwrap();
    let sentinel = MockSentinel::monitoring(MASTER_NAME, master.addr()).await.unwrap();

    let pool = pool_builder(&sentinel).build().await.unwrap();
    wait_for_subscribers(&[&sentinel]).await;

    sentinel.publish("othermaster 127.0.0.1 6379 127.0.0.1 6380");
    sentinel.publish("not a switch-master payload");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(pool.metrics().failovers, 0);
    assert_eq!(pool.current_master().await, master.addr());
    // A malformed payload does not cost the subscription
    assert_eq!(sentinel.subscriber_count(), 1);
    assert_eq!(pool.metrics().listener_reconnects, 0);

    pool.destroy().await;
}

#[tokio::test]
async fn test_duplicate_sentinels_share_one_listener() {
    let master = MockRedis::new().await.unwrap();
    let sentinel = MockSentinel::monitoring(MASTER_NAME, master.addr()).await.unwrap();

    let pool = pool_builder(&sentinel)
        .sentinel(sentinel.addr())
        .build()
        .await
        .unwrap();

    assert_eq!(pool.sentinels().len(), 1);
    wait_for_subscribers(&[&sentinel]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.active_listeners(), 1);
    assert_eq!(sentinel.subscriber_count(), 1);

    pool.destroy().await;
    assert_eq!(pool.active_listeners(), 0);
    assert!(wait_until(SETTLE, || sentinel.subscriber_count() == 0).await);
}

#[tokio::test]
async fn test_manual_master_switch() {
    let old_master = MockRedis::new().await.unwrap();
    let new_master = MockRedis::new().await.unwrap();
    let sentinel = MockSentinel::monitoring(MASTER_NAME, old_master.addr()).await.unwrap();

    let pool = pool_builder(&sentinel).build().await.unwrap();
    // Let the listener finish its catch-up query first
    wait_for_subscribers(&[&sentinel]).await;

    pool.handle_master_switch(MASTER_NAME, new_master.addr()).await;
    // Repeats and other names change nothing
    pool.handle_master_switch(MASTER_NAME, new_master.addr()).await;
    pool.handle_master_switch("othermaster", old_master.addr()).await;

    assert_eq!(pool.metrics().failovers, 1);
    let conn = pool.get_resource().await.unwrap();
    assert_eq!(conn.addr(), &new_master.addr());

    drop(conn);
    pool.destroy().await;
}

#[tokio::test]
async fn test_listener_resubscribes_and_catches_up_on_missed_failover() {
    let old_master = MockRedis::new().await.unwrap();
    let new_master = MockRedis::new().await.unwrap();
    let sentinel = MockSentinel::monitoring(MASTER_NAME, old_master.addr()).await.unwrap();

    let pool = pool_builder(&sentinel).build().await.unwrap();
    wait_for_subscribers(&[&sentinel]).await;
    let queries_before = sentinel.query_count();

    // The failover happens while the subscription is down, so no event is seen
    sentinel.set_master(MASTER_NAME, new_master.addr());
    sentinel.disconnect_subscribers();

    wait_for_failovers(&pool, 1).await;
    assert_eq!(pool.current_master().await, new_master.addr());
    assert!(sentinel.query_count() > queries_before);
    assert!(pool.metrics().listener_reconnects >= 1);

    // Back on the channel, live events still arrive
    wait_for_subscribers(&[&sentinel]).await;
    sentinel.switch_master(MASTER_NAME, old_master.addr());
    wait_for_failovers(&pool, 2).await;
    assert_eq!(pool.current_master().await, old_master.addr());

    let conn = pool.get_resource().await.unwrap();
    assert_eq!(conn.addr(), &old_master.addr());

    drop(conn);
    pool.destroy().await;
}
