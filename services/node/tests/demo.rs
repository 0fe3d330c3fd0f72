use ripple_common::FeedLimits;
use ripple_node::config::NodeConfig;
use ripple_node::demo::Demo;
use std::time::Duration;

fn test_config(consumers: usize) -> NodeConfig {
    let limits = FeedLimits::default();
    NodeConfig {
        metrics_bind: "127.0.0.1:0".parse().expect("addr"),
        shards: 3,
        consumers,
        write_interval_ms: 2,
        subscriber_queue_capacity: limits.subscriber_queue_capacity,
        mailbox_capacity: limits.mailbox_capacity,
        max_frame_bytes: limits.max_frame_bytes,
    }
}

#[tokio::test]
async fn consumers_receive_written_changes() {
    let demo = Demo::start(&test_config(2)).await.expect("start");
    assert_eq!(demo.registry().feed_count().await, 1);
    assert_eq!(demo.registry().subscriber_count(demo.table()).await, 2);

    tokio::time::timeout(Duration::from_secs(5), async {
        while demo.consumed() < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("changes consumed");

    let registry = demo.registry().clone();
    tokio::time::timeout(Duration::from_secs(5), demo.shutdown())
        .await
        .expect("shutdown");
    assert_eq!(registry.feed_count().await, 0);
}

#[tokio::test]
async fn shutdown_unregisters_every_mailbox() {
    let demo = Demo::start(&test_config(1)).await.expect("start");
    let transport = demo.transport().clone();
    // One control mailbox per publisher plus the feed inbox.
    assert_eq!(transport.mailbox_count(), 4);

    tokio::time::timeout(Duration::from_secs(5), demo.shutdown())
        .await
        .expect("shutdown");
    assert_eq!(transport.mailbox_count(), 0);
}

#[tokio::test]
async fn without_consumers_no_feed_is_built() {
    let demo = Demo::start(&test_config(0)).await.expect("start");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(demo.registry().feed_count().await, 0);
    assert_eq!(demo.consumed(), 0);
    demo.shutdown().await;
}
