use std::{
    ops::Deref,
    sync::Arc,
    time::{Duration, Instant},
};

use courier::{
    channel::{Delivery, DeliveryStream},
    config::Config,
    error::Error,
    exchange::{Exchange, FixedRoute},
    message::Message,
    queue::{Queue, QueueId, QueueSettings},
    service::VirtualHost,
    store::{MemoryMessageStore, MessageStore},
    subscription::{
        AcquireMode, Allowance, CreditUnit, FilterSpec, FlowMode, SubscriptionOptions,
        UNLIMITED_CREDIT,
    },
};
use futures_util::FutureExt;
use tokio_stream::StreamExt;

struct TestBroker {
    host: Arc<VirtualHost>,
    store: MemoryMessageStore,
}

impl Deref for TestBroker {
    type Target = VirtualHost;

    fn deref(&self) -> &Self::Target {
        &self.host
    }
}

fn setup() -> TestBroker {
    setup_with(Config::default())
}

fn setup_with(config: Config) -> TestBroker {
    let store = MemoryMessageStore::new();

    TestBroker {
        host: VirtualHost::connect_with()
            .config(config)
            .store(Arc::new(store.clone()))
            .call(),
        store,
    }
}

fn drain(deliveries: &mut DeliveryStream) -> Vec<Delivery> {
    let mut received = Vec::new();
    while let Some(Some(delivery)) = deliveries.next().now_or_never() {
        received.push(delivery);
    }
    received
}

async fn message(broker: &TestBroker, size: usize) -> Arc<Message> {
    broker
        .create_message()
        .content(vec![7u8; size])
        .call()
        .await
        .unwrap()
}

async fn persistent(broker: &TestBroker, size: usize) -> Arc<Message> {
    broker
        .create_message()
        .content(vec![7u8; size])
        .persistent(true)
        .call()
        .await
        .unwrap()
}

fn queue(broker: &TestBroker, name: &str) -> Arc<Queue> {
    broker
        .create_queue(QueueSettings::builder().name(name).build())
        .unwrap()
}

fn durable_queue(broker: &TestBroker, name: &str) -> Arc<Queue> {
    broker
        .create_queue(QueueSettings::builder().name(name).durable(true).build())
        .unwrap()
}

#[tokio::test]
async fn test_transactional_publish_then_acknowledge() {
    let broker = setup();
    let q = durable_queue(&broker, "q");

    let (publisher, _) = broker.open_channel(1).unwrap();
    publisher.set_local_transactional().unwrap();

    let m = persistent(&broker, 100).await;
    publisher.publish(m.clone(), &[q.clone()]).await.unwrap();
    assert_eq!(q.depth(), 0);
    assert!(!broker.store.contains_entry(q.id(), m.id()));

    publisher.commit().await.unwrap();
    assert_eq!(q.depth(), 1);
    assert!(broker.store.contains_entry(q.id(), m.id()));

    let (consumer, mut deliveries) = broker.open_channel(2).unwrap();
    consumer
        .subscribe(
            &q,
            Some("c".to_owned()),
            SubscriptionOptions::builder()
                .flow_mode(FlowMode::Window)
                .message_credit(Allowance::Limited(1))
                .byte_credit(Allowance::Limited(1000))
                .build(),
        )
        .unwrap();

    let received = drain(&mut deliveries);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].delivery_tag, 1);
    assert_eq!(received[0].consumer_tag, "c");
    assert!(!received[0].redelivered);
    assert_eq!(received[0].delivery_count, 1);
    assert_eq!(received[0].payload.len(), 100);

    let subscription = consumer.subscription("c").unwrap();
    assert_eq!(subscription.credit().available(), (Some(0), Some(900)));

    let entry = q.entries()[0].clone();
    assert!(entry.is_acquired_by(subscription.id()));

    consumer.acknowledge_message(1, false).await.unwrap();

    assert!(entry.is_discarded());
    assert_eq!(q.depth(), 0);
    assert_eq!(consumer.unacknowledged_count(), 0);
    assert_eq!(subscription.credit().available(), (Some(1), Some(1000)));
    assert!(!broker.store.contains_entry(q.id(), m.id()));
    assert!(!broker.store.contains_message(m.id()));
}

#[tokio::test]
async fn test_unknown_delivery_tag() {
    let broker = setup();
    let (channel, _) = broker.open_channel(1).unwrap();

    assert!(matches!(
        channel.acknowledge_message(42, false).await,
        Err(Error::UnknownDeliveryTag { tag: 42 })
    ));
    assert!(channel.acknowledge_message(42, true).await.is_ok());
}

#[tokio::test]
async fn test_close_requeues_unacknowledged() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (first, mut first_deliveries) = broker.open_channel(1).unwrap();
    first
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();

    let (publisher, _) = broker.open_channel(3).unwrap();
    for _ in 0..2 {
        publisher
            .publish(message(&broker, 10).await, &[q.clone()])
            .await
            .unwrap();
    }

    let received = drain(&mut first_deliveries);
    assert_eq!(
        received.iter().map(|d| d.delivery_tag).collect::<Vec<_>>(),
        vec![1, 2]
    );

    broker.close_channel(first.id()).await.unwrap();

    for entry in q.entries() {
        assert!(entry.is_available());
        assert!(entry.is_redelivered());
    }

    let (second, mut second_deliveries) = broker.open_channel(2).unwrap();
    second
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();

    let redelivered = drain(&mut second_deliveries);
    assert_eq!(redelivered.len(), 2);
    assert!(redelivered.iter().all(|d| d.redelivered));
    assert!(redelivered.iter().all(|d| d.delivery_count == 2));

    assert!(matches!(
        first.publish(message(&broker, 1).await, &[q.clone()]).await,
        Err(Error::ChannelClosed)
    ));
}

#[tokio::test]
async fn test_dead_letter_after_max_deliveries() {
    let broker = setup();
    let dead = queue(&broker, "dead");
    let exchange: Arc<dyn Exchange> = Arc::new(FixedRoute::new("dlx", [&dead]));
    let q = broker
        .create_queue(
            QueueSettings::builder()
                .name("q")
                .max_delivery_count(3)
                .alternate_exchange(exchange)
                .build(),
        )
        .unwrap();

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    channel
        .publish(message(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();

    for expected in 1..=3 {
        let received = drain(&mut deliveries);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].delivery_count, expected);
        channel.requeue_tag(received[0].delivery_tag).unwrap();
    }

    assert!(drain(&mut deliveries).is_empty());
    assert_eq!(q.depth(), 0);
    assert_eq!(dead.depth(), 1);
    assert_eq!(q.statistics().dead_lettered, 1);
}

#[tokio::test]
async fn test_dead_letter_without_alternate_discards() {
    let broker = setup();
    let q = broker
        .create_queue(
            QueueSettings::builder()
                .name("q")
                .max_delivery_count(2)
                .build(),
        )
        .unwrap();

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    let m = message(&broker, 10).await;
    channel.publish(m.clone(), &[q.clone()]).await.unwrap();

    for _ in 0..2 {
        let received = drain(&mut deliveries);
        assert_eq!(received.len(), 1);
        channel.requeue_tag(received[0].delivery_tag).unwrap();
    }

    assert!(drain(&mut deliveries).is_empty());
    assert_eq!(q.depth(), 0);
    assert_eq!(m.reference_count(), 0);
}

#[tokio::test]
async fn test_resend_goes_back_to_same_subscription() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    channel
        .publish(message(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();

    let first = drain(&mut deliveries);
    assert_eq!(first[0].delivery_tag, 1);
    assert_eq!(first[0].delivery_count, 1);

    channel.resend();

    let again = drain(&mut deliveries);
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].delivery_tag, 2);
    assert!(again[0].redelivered);
    assert_eq!(again[0].delivery_count, 1);
    assert_eq!(channel.unacknowledged_tags(), vec![2]);
}

#[tokio::test]
async fn test_failed_commit_rolls_back() {
    let broker = setup();
    let q = durable_queue(&broker, "q");

    let (publisher, _) = broker.open_channel(1).unwrap();
    publisher.set_local_transactional().unwrap();

    publisher
        .publish(persistent(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    broker.store.fail_commits(true);
    assert!(matches!(publisher.commit().await, Err(Error::Store { .. })));
    assert_eq!(q.depth(), 0);
    assert!(broker.environment().ensure_open().is_ok());

    broker.store.fail_commits(false);
    publisher
        .publish(persistent(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    publisher.commit().await.unwrap();
    assert_eq!(q.depth(), 1);
}

#[tokio::test]
async fn test_failed_commit_resends_acknowledged() {
    let broker = setup();
    let q = durable_queue(&broker, "q");

    let (publisher, _) = broker.open_channel(1).unwrap();
    publisher
        .publish(persistent(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();

    let (consumer, mut deliveries) = broker.open_channel(2).unwrap();
    consumer.set_local_transactional().unwrap();
    consumer
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    assert_eq!(drain(&mut deliveries)[0].delivery_tag, 1);

    consumer.acknowledge_message(1, false).await.unwrap();
    assert_eq!(consumer.unacknowledged_count(), 0);

    broker.store.fail_commits(true);
    assert!(consumer.commit().await.is_err());

    let resent = drain(&mut deliveries);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].delivery_tag, 2);
    assert!(resent[0].redelivered);
    assert_eq!(q.depth(), 1);
}

#[tokio::test]
async fn test_rollback_resends_acknowledged() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel.set_local_transactional().unwrap();
    channel
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();

    let (publisher, _) = broker.open_channel(2).unwrap();
    publisher
        .publish(message(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    assert_eq!(drain(&mut deliveries).len(), 1);

    channel.acknowledge_message(1, false).await.unwrap();
    channel.rollback().await.unwrap();

    let resent = drain(&mut deliveries);
    assert_eq!(resent.len(), 1);
    assert!(resent[0].redelivered);
    assert_eq!(channel.unacknowledged_tags(), vec![2]);

    channel.acknowledge_message(2, false).await.unwrap();
    channel.commit().await.unwrap();
    assert_eq!(q.depth(), 0);
}

#[tokio::test]
async fn test_commit_on_auto_commit_channel() {
    let broker = setup();
    let (channel, _) = broker.open_channel(1).unwrap();

    assert!(matches!(channel.commit().await, Err(Error::NotTransactional)));
    assert!(matches!(channel.rollback().await, Err(Error::NotTransactional)));
}

#[tokio::test]
async fn test_async_commits_complete_in_order() {
    let broker = setup();
    let q = durable_queue(&broker, "q");
    let (channel, _) = broker.open_channel(1).unwrap();

    let messages = [
        persistent(&broker, 1).await,
        persistent(&broker, 1).await,
        persistent(&broker, 1).await,
    ];

    broker.store.hold_commits(true);
    channel.publish(messages[0].clone(), &[q.clone()]).await.unwrap();
    channel.publish(messages[1].clone(), &[q.clone()]).await.unwrap();
    assert_eq!(channel.pending_commits(), 2);

    assert!(broker.store.complete_held_commit(1));
    channel.publish(messages[2].clone(), &[q.clone()]).await.unwrap();
    assert_eq!(q.depth(), 0);

    broker.store.complete_all_held_commits();
    channel.sync().await.unwrap();

    let order: Vec<_> = q.entries().iter().map(|e| e.message().id()).collect();
    assert_eq!(order, messages.iter().map(|m| m.id()).collect::<Vec<_>>());
    assert_eq!(channel.pending_commits(), 0);
}

#[tokio::test]
async fn test_acknowledgement_completes_when_store_write_resolves() {
    let broker = setup();
    let q = durable_queue(&broker, "q");

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel
        .publish(persistent(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    channel
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    assert_eq!(drain(&mut deliveries).len(), 1);
    let entry = q.entries()[0].clone();

    broker.store.hold_commits(true);
    channel.acknowledge_message(1, false).await.unwrap();
    assert_eq!(channel.pending_commits(), 1);
    assert!(entry.is_acquired());

    broker.store.complete_all_held_commits();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(channel.pending_commits(), 0);
    assert!(entry.is_discarded());
    assert_eq!(q.depth(), 0);
}

#[tokio::test]
async fn test_discarded_entry_is_not_delivered_while_dequeue_pending() {
    let broker = setup();
    let q = durable_queue(&broker, "q");

    let (publisher, _) = broker.open_channel(1).unwrap();
    publisher
        .publish(persistent(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    let entry = q.entries()[0].clone();

    broker.store.hold_commits(true);
    assert!(entry.discard());
    assert!(!entry.discard());

    let (consumer, mut deliveries) = broker.open_channel(2).unwrap();
    consumer
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    assert!(drain(&mut deliveries).is_empty());

    broker.store.complete_all_held_commits();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(entry.is_discarded());
    assert_eq!(q.depth(), 0);
    assert_eq!(consumer.unacknowledged_count(), 0);
    assert!(drain(&mut deliveries).is_empty());
}

#[tokio::test]
async fn test_failed_acknowledgement_redelivers_in_credit_mode() {
    let broker = setup();
    let q = durable_queue(&broker, "q");

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel
        .subscribe(
            &q,
            Some("c".to_owned()),
            SubscriptionOptions::builder()
                .flow_mode(FlowMode::Credit)
                .message_credit(Allowance::Limited(2))
                .build(),
        )
        .unwrap();
    channel
        .publish(persistent(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    assert_eq!(drain(&mut deliveries)[0].delivery_tag, 1);

    broker.store.fail_commits(true);
    channel.acknowledge_message(1, false).await.unwrap();

    let redelivered = drain(&mut deliveries);
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].delivery_tag, 2);
    assert!(redelivered[0].redelivered);
    assert_eq!(redelivered[0].delivery_count, 2);
    assert_eq!(channel.unacknowledged_tags(), vec![2]);
    assert_eq!(q.depth(), 1);

    let error = channel.sync().await.unwrap_err();
    assert!(matches!(error, Error::Store { .. }));
    assert!(error.is_recoverable());
    assert!(broker.environment().ensure_open().is_ok());

    broker.store.fail_commits(false);
    channel.acknowledge_message(2, false).await.unwrap();
    assert_eq!(q.depth(), 0);
}

#[tokio::test]
async fn test_close_with_failed_write_shuts_environment() {
    let broker = setup_with(Config {
        eager_commit_completion: Some(false),
        ..Config::default()
    });
    let q = durable_queue(&broker, "q");
    let (channel, _) = broker.open_channel(1).unwrap();

    broker.store.hold_commits(true);
    channel
        .publish(persistent(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    assert_eq!(channel.pending_commits(), 1);

    broker.store.close();
    assert!(!broker.environment().is_closed());

    channel.close().await;

    assert!(broker.environment().is_closed());
    assert_eq!(channel.pending_commits(), 0);
    assert_eq!(q.depth(), 0);
}

#[tokio::test]
async fn test_fatal_error_during_purge_shuts_environment() {
    let broker = setup();
    let q = durable_queue(&broker, "q");
    let (channel, _) = broker.open_channel(1).unwrap();
    channel
        .publish(persistent(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();

    broker.store.hold_commits(true);
    assert_eq!(q.purge(), 1);
    broker.store.close();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(broker.environment().is_closed());
    assert_eq!(q.depth(), 1);
    assert!(q.entries()[0].is_available());
}

#[tokio::test]
async fn test_recovery() {
    let broker = setup();
    let q = durable_queue(&broker, "q");
    let gone = durable_queue(&broker, "gone");
    let (channel, _) = broker.open_channel(1).unwrap();

    let kept = persistent(&broker, 10).await;
    let orphaned = persistent(&broker, 10).await;
    channel.publish(kept.clone(), &[q.clone()]).await.unwrap();
    channel.publish(orphaned.clone(), &[gone.clone()]).await.unwrap();

    let restarted = VirtualHost::connect_with()
        .store(Arc::new(broker.store.clone()))
        .call();
    let recovered_q = restarted
        .create_queue(QueueSettings::builder().name("q").durable(true).build())
        .unwrap();

    let report = restarted.recover().await.unwrap();
    assert_eq!(report.messages, 2);
    assert_eq!(report.entries, 1);
    assert_eq!(report.orphaned_entries, 1);
    assert_eq!(report.removed_messages, 1);

    assert_eq!(recovered_q.depth(), 1);
    let entry = &recovered_q.entries()[0];
    assert!(entry.is_redelivered());
    assert_eq!(entry.message().id(), kept.id());

    assert!(!broker.store.contains_entry(&QueueId::from("gone"), orphaned.id()));
    assert!(!broker.store.contains_message(orphaned.id()));
    assert!(broker.store.contains_message(kept.id()));
}

#[tokio::test]
async fn test_reject_requeue_skips_rejecting_consumer() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (first, mut first_deliveries) = broker.open_channel(1).unwrap();
    first
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    first
        .publish(message(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    assert_eq!(drain(&mut first_deliveries).len(), 1);

    let (second, mut second_deliveries) = broker.open_channel(2).unwrap();
    second
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    assert!(drain(&mut second_deliveries).is_empty());

    first.reject(1, true).unwrap();
    assert!(drain(&mut first_deliveries).is_empty());

    let moved = drain(&mut second_deliveries);
    assert_eq!(moved.len(), 1);
    assert!(moved[0].redelivered);

    second.reject(moved[0].delivery_tag, false).unwrap();
    assert_eq!(q.depth(), 0);
}

#[tokio::test]
async fn test_browser_leaves_entries_available() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (browser, mut browsed) = broker.open_channel(1).unwrap();
    browser
        .subscribe(
            &q,
            None,
            SubscriptionOptions::builder()
                .acquire_mode(AcquireMode::NotAcquired)
                .build(),
        )
        .unwrap();

    for _ in 0..2 {
        browser
            .publish(message(&broker, 10).await, &[q.clone()])
            .await
            .unwrap();
    }

    let seen = drain(&mut browsed);
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|d| d.settled && d.delivery_count == 0));
    assert_eq!(q.available_count(), 2);
    assert_eq!(browser.unacknowledged_count(), 0);

    let (consumer, mut consumed) = broker.open_channel(2).unwrap();
    consumer
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    assert_eq!(drain(&mut consumed).len(), 2);
    assert!(drain(&mut browsed).is_empty());
}

#[tokio::test]
async fn test_purge() {
    let broker = setup();
    let q = queue(&broker, "q");
    let (channel, _) = broker.open_channel(1).unwrap();

    for _ in 0..3 {
        channel
            .publish(message(&broker, 10).await, &[q.clone()])
            .await
            .unwrap();
    }

    assert_eq!(broker.purge_queue("q").unwrap(), 3);
    assert_eq!(q.depth(), 0);
    assert_eq!(q.statistics().dequeued, 3);
}

#[tokio::test]
async fn test_exclusive_consumer_conflict() {
    let broker = setup();
    let q = queue(&broker, "q");
    let (first, _) = broker.open_channel(1).unwrap();
    let (second, _) = broker.open_channel(2).unwrap();

    first
        .subscribe_to_queue()
        .queue(&q)
        .consumer_tag("owner")
        .acks(true)
        .exclusive(true)
        .call()
        .unwrap();

    assert!(matches!(
        second
            .subscribe_to_queue()
            .queue(&q)
            .acks(true)
            .call(),
        Err(Error::ExclusiveConsumerConflict { .. })
    ));
    assert!(second.consumer_tags().is_empty());

    first.unsubscribe("owner").unwrap();
    second
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
}

#[tokio::test]
async fn test_duplicate_consumer_tag() {
    let broker = setup();
    let q = queue(&broker, "q");
    let (channel, _) = broker.open_channel(1).unwrap();

    channel
        .subscribe_to_queue()
        .queue(&q)
        .consumer_tag("c")
        .acks(true)
        .call()
        .unwrap();
    assert!(matches!(
        channel
            .subscribe_to_queue()
            .queue(&q)
            .consumer_tag("c")
            .acks(true)
            .call(),
        Err(Error::ConsumerTagInUse { .. })
    ));
    assert!(matches!(
        channel.unsubscribe("missing"),
        Err(Error::UnknownConsumer { .. })
    ));
}

#[tokio::test]
async fn test_credit_mode_waits_for_more_credit() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel
        .subscribe(
            &q,
            Some("c".to_owned()),
            SubscriptionOptions::builder()
                .flow_mode(FlowMode::Credit)
                .message_credit(Allowance::Limited(1))
                .build(),
        )
        .unwrap();

    for _ in 0..3 {
        channel
            .publish(message(&broker, 10).await, &[q.clone()])
            .await
            .unwrap();
    }
    assert_eq!(drain(&mut deliveries).len(), 1);

    channel.acknowledge_message(1, false).await.unwrap();
    assert!(drain(&mut deliveries).is_empty());

    channel.add_credit("c", CreditUnit::Message, 2).unwrap();
    let received = drain(&mut deliveries);
    assert_eq!(
        received.iter().map(|d| d.delivery_tag).collect::<Vec<_>>(),
        vec![2, 3]
    );
}

#[tokio::test]
async fn test_prefetch_window_refills_on_ack() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel.set_credit(0, 2);
    channel
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();

    for _ in 0..5 {
        channel
            .publish(message(&broker, 10).await, &[q.clone()])
            .await
            .unwrap();
    }
    assert_eq!(drain(&mut deliveries).len(), 2);

    channel.acknowledge_message(1, false).await.unwrap();
    assert_eq!(drain(&mut deliveries)[0].delivery_tag, 3);

    channel.acknowledge_message(3, true).await.unwrap();
    let received = drain(&mut deliveries);
    assert_eq!(
        received.iter().map(|d| d.delivery_tag).collect::<Vec<_>>(),
        vec![4, 5]
    );
    assert_eq!(q.depth(), 2);
}

#[tokio::test]
async fn test_oversized_message_waits_for_byte_credit() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel.set_credit(50, 0);
    channel
        .subscribe_to_queue()
        .queue(&q)
        .consumer_tag("c")
        .acks(true)
        .call()
        .unwrap();

    channel
        .publish(message(&broker, 100).await, &[q.clone()])
        .await
        .unwrap();
    assert!(drain(&mut deliveries).is_empty());

    channel.set_credit(0, 0);
    assert_eq!(drain(&mut deliveries).len(), 1);
}

#[tokio::test]
async fn test_stop_withdraws_credit() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel
        .subscribe_to_queue()
        .queue(&q)
        .consumer_tag("c")
        .acks(true)
        .call()
        .unwrap();
    channel.stop("c").unwrap();

    channel
        .publish(message(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    assert!(drain(&mut deliveries).is_empty());

    channel.add_credit("c", CreditUnit::Message, 1).unwrap();
    assert!(drain(&mut deliveries).is_empty());

    channel
        .add_credit("c", CreditUnit::Byte, UNLIMITED_CREDIT)
        .unwrap();
    assert_eq!(drain(&mut deliveries).len(), 1);
}

#[tokio::test]
async fn test_no_ack_consumer_dequeues_on_send() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel
        .subscribe_to_queue()
        .queue(&q)
        .acks(false)
        .call()
        .unwrap();
    channel
        .publish(message(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();

    let received = drain(&mut deliveries);
    assert_eq!(received.len(), 1);
    assert!(received[0].settled);
    assert_eq!(q.depth(), 0);
    assert_eq!(channel.unacknowledged_count(), 0);
}

#[tokio::test]
async fn test_suspended_channel_gets_nothing() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (channel, mut deliveries) = broker.open_channel(1).unwrap();
    channel
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    channel.set_suspended(true);

    channel
        .publish(message(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    assert!(drain(&mut deliveries).is_empty());

    channel.set_suspended(false);
    assert_eq!(drain(&mut deliveries).len(), 1);
}

#[tokio::test]
async fn test_filtered_consumer_skips_backlog_in_order() {
    let broker = setup();
    let q = queue(&broker, "q");
    let (publisher, _) = broker.open_channel(1).unwrap();

    for _ in 0..20 {
        let other = broker
            .create_message()
            .content("x")
            .routing_key("audit")
            .call()
            .await
            .unwrap();
        publisher.publish(other, &[q.clone()]).await.unwrap();
    }

    let (filtered, mut filtered_deliveries) = broker.open_channel(2).unwrap();
    filtered
        .subscribe(
            &q,
            None,
            SubscriptionOptions::builder()
                .filter(FilterSpec::RoutingKeyPrefix("orders.".to_owned()))
                .build(),
        )
        .unwrap();
    assert!(drain(&mut filtered_deliveries).is_empty());

    let order = broker
        .create_message()
        .content("order")
        .routing_key("orders.eu")
        .call()
        .await
        .unwrap();
    publisher.publish(order.clone(), &[q.clone()]).await.unwrap();

    let received = drain(&mut filtered_deliveries);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message.id(), order.id());
    assert_eq!(q.available_count(), 20);

    let (plain, mut plain_deliveries) = broker.open_channel(3).unwrap();
    plain
        .subscribe_to_queue()
        .queue(&q)
        .acks(true)
        .call()
        .unwrap();
    let rest = drain(&mut plain_deliveries);
    assert_eq!(rest.len(), 20);
    assert!(rest
        .windows(2)
        .all(|pair| pair[0].message.id() < pair[1].message.id()));
}

#[tokio::test]
async fn test_no_local_and_filter() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (local, mut local_deliveries) = broker.open_channel(1).unwrap();
    local
        .subscribe(
            &q,
            None,
            SubscriptionOptions::builder().no_local(true).build(),
        )
        .unwrap();

    let own = broker
        .create_message()
        .content("mine")
        .connection_id(1)
        .call()
        .await
        .unwrap();
    local.publish(own, &[q.clone()]).await.unwrap();
    assert!(drain(&mut local_deliveries).is_empty());

    let (remote, mut remote_deliveries) = broker.open_channel(2).unwrap();
    remote
        .subscribe(
            &q,
            None,
            SubscriptionOptions::builder()
                .filter(FilterSpec::RoutingKeyPrefix("orders.".to_owned()))
                .build(),
        )
        .unwrap();
    assert!(drain(&mut remote_deliveries).is_empty());

    let order = broker
        .create_message()
        .content("order")
        .routing_key("orders.eu")
        .connection_id(1)
        .call()
        .await
        .unwrap();
    remote.publish(order, &[q.clone()]).await.unwrap();

    let received = drain(&mut remote_deliveries);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message.metadata().routing_key, "orders.eu");
}

#[tokio::test]
async fn test_transaction_timeout() {
    let broker = setup_with(Config {
        transaction_idle_close_secs: Some(60),
        ..Default::default()
    });
    let q = queue(&broker, "q");

    let (channel, _) = broker.open_channel(1).unwrap();
    channel.set_local_transactional().unwrap();
    assert!(channel
        .check_transaction_timeout(Instant::now() + Duration::from_secs(600))
        .is_ok());

    channel
        .publish(message(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();
    assert!(channel.check_transaction_timeout(Instant::now()).is_ok());
    assert!(matches!(
        channel.check_transaction_timeout(Instant::now() + Duration::from_secs(120)),
        Err(Error::TransactionTimeout { .. })
    ));
}

#[tokio::test]
async fn test_delete_queue_closes_consumers() {
    let broker = setup();
    let q = queue(&broker, "q");

    let (channel, _) = broker.open_channel(1).unwrap();
    channel
        .subscribe_to_queue()
        .queue(&q)
        .consumer_tag("c")
        .acks(true)
        .call()
        .unwrap();
    channel
        .publish(message(&broker, 10).await, &[q.clone()])
        .await
        .unwrap();

    broker.delete_queue("q").unwrap();

    assert!(channel.subscription("c").unwrap().is_closed());
    assert_eq!(q.consumer_count(), 0);

    channel.requeue();
    assert_eq!(q.depth(), 0);
}

#[tokio::test]
async fn test_closed_store_shuts_environment() {
    let broker = setup();
    let q = queue(&broker, "q");
    let (channel, _) = broker.open_channel(1).unwrap();

    broker.environment().close();

    assert!(matches!(
        channel.publish(message_unchecked(), &[q.clone()]).await,
        Err(Error::EnvironmentClosed)
    ));
    assert!(matches!(
        broker.open_channel(2),
        Err(Error::EnvironmentClosed)
    ));
}

fn message_unchecked() -> Arc<Message> {
    Arc::new(
        Message::builder()
            .id(courier::message::MessageId(999))
            .content("late")
            .build(),
    )
}
