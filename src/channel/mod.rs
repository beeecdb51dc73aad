//! A consumer/producer session.
//!
//! The channel owns the delivery-tag ledger of everything it has sent and
//! not yet seen settled, the channel's current server transaction, and the
//! commit ledger used by auto-commit work. Deliveries leave the channel on an
//! unbounded stream in tag order.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Instant,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    config::{Config, TransactionTimeouts},
    error::{Error, Result},
    message::Message,
    queue::{Queue, QueueEntry, QueueId},
    service::Environment,
    store::StoreError,
    subscription::{
        AcceptMode, Allowance, CreditUnit, FilterSpec, FlowMode, SendGuard, Subscription,
        SubscriptionOptions, SubscriptionTarget,
    },
    txn::{
        action, enqueue_action, AutoCommitTransaction, FutureRecorder, LocalTransaction,
        ServerTransaction,
    },
};

pub mod ledger;
pub mod unacked;

pub use ledger::{CommitLedger, FailureHook};
pub use unacked::{UnackedEntry, UnacknowledgedMap};

/// A message handed to the consumer side of a channel.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub queue: QueueId,
    pub message: Arc<Message>,
    pub payload: Bytes,
    pub redelivered: bool,
    pub delivery_count: u32,
    /// Settled deliveries need no acknowledgement.
    pub settled: bool,
    /// More deliveries follow immediately; the protocol layer may coalesce.
    pub batched: bool,
}

pub type DeliveryStream = UnboundedReceiverStream<Delivery>;

enum ChannelTransaction {
    AutoCommit,
    Local(LocalTransaction),
}

pub struct Channel {
    id: u64,
    connection_id: u64,
    environment: Arc<Environment>,
    weak_self: Weak<Channel>,

    unacked: UnacknowledgedMap,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    next_consumer_tag: AtomicU64,

    transaction: Mutex<ChannelTransaction>,
    ledger: Arc<CommitLedger>,
    /// Entries whose acknowledgement was rolled back, waiting to be resent.
    resend_list: Arc<Mutex<Vec<UnackedEntry>>>,
    timeouts: TransactionTimeouts,

    prefetch: Mutex<(u64, u64)>,
    suspended: AtomicBool,
    closing: AtomicBool,
    outbound: mpsc::UnboundedSender<Delivery>,
}

impl Channel {
    pub(crate) fn new(
        id: u64,
        connection_id: u64,
        environment: Arc<Environment>,
        config: &Config,
    ) -> (Arc<Self>, DeliveryStream) {
        let (outbound, inbound) = mpsc::unbounded_channel();

        let failed = Arc::clone(&environment);
        let on_failure: FailureHook = Box::new(move |e: &StoreError| failed.fail(e));

        let channel = Arc::new_cyclic(|weak_self| Self {
            id,
            connection_id,
            environment,
            weak_self: weak_self.clone(),
            unacked: UnacknowledgedMap::new(),
            subscriptions: Mutex::new(HashMap::new()),
            next_consumer_tag: AtomicU64::new(1),
            transaction: Mutex::new(ChannelTransaction::AutoCommit),
            ledger: CommitLedger::new(
                config.commit_backlog_threshold(),
                config.eager_commit_completion(),
                Some(on_failure),
            ),
            resend_list: Arc::new(Mutex::new(Vec::new())),
            timeouts: config.transaction_timeouts(),
            prefetch: Mutex::new((0, 0)),
            suspended: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            outbound,
        });

        (channel, UnboundedReceiverStream::new(inbound))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_transactional(&self) -> bool {
        matches!(*self.transaction.lock(), ChannelTransaction::Local(_))
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn unacknowledged_tags(&self) -> Vec<u64> {
        self.unacked.tags()
    }

    pub fn pending_commits(&self) -> usize {
        self.ledger.len()
    }

    /// Waits for every outstanding asynchronous commit of this channel.
    pub async fn sync(&self) -> Result<()> {
        self.ledger.sync().await.map_err(|e| {
            self.environment.fail(&e);
            Error::from(e)
        })
    }

    pub fn subscription(&self, consumer_tag: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.lock().get(consumer_tag).cloned()
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.environment.ensure_open()
    }

    fn all_subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.lock().values().cloned().collect()
    }

    /// Runs `f` against the current transaction. Auto-commit work runs
    /// outside the channel's transaction lock.
    fn with_transaction<R>(&self, f: impl FnOnce(&mut dyn ServerTransaction) -> R) -> R {
        let mut guard = self.transaction.lock();
        if let ChannelTransaction::Local(txn) = &mut *guard {
            return f(txn as &mut dyn ServerTransaction);
        }
        drop(guard);

        let mut txn = self.auto_commit();
        f(&mut txn as &mut dyn ServerTransaction)
    }

    async fn sync_if_backlogged(&self) {
        if self.ledger.needs_sync() {
            self.settle_commits().await;
        }
    }

    /// Waits for outstanding commits before the transaction changes hands.
    /// Failures were already rolled back; a fatal one closes the environment.
    async fn settle_commits(&self) {
        if let Err(e) = self.ledger.sync().await {
            tracing::error!(channel = self.id, error = %e, "asynchronous commit failed");
            self.environment.fail(&e);
        }
    }

    pub fn subscribe(
        &self,
        queue: &Arc<Queue>,
        consumer_tag: Option<String>,
        options: SubscriptionOptions,
    ) -> Result<String> {
        self.ensure_open()?;

        let tag = consumer_tag.unwrap_or_else(|| {
            format!(
                "ctag-{}-{}",
                self.id,
                self.next_consumer_tag.fetch_add(1, Ordering::Relaxed)
            )
        });

        let subscription = {
            let mut subscriptions = self.subscriptions.lock();
            if subscriptions.contains_key(&tag) {
                return Err(Error::ConsumerTagInUse { tag });
            }

            let target: Weak<dyn SubscriptionTarget> = self.weak_self.clone();
            let subscription = Subscription::new(tag.clone(), queue, target, options);
            subscriptions.insert(tag.clone(), Arc::clone(&subscription));
            subscription
        };

        if let Err(e) = queue.register(Arc::clone(&subscription)) {
            self.subscriptions.lock().remove(&tag);
            subscription.close();
            return Err(e);
        }

        tracing::debug!(
            channel = self.id,
            consumer = %tag,
            queue = %queue.id(),
            subscription = %subscription.id(),
            "subscribed"
        );
        Ok(tag)
    }

    /// Cancels a consumer. Deliveries it made stay unacknowledged on the
    /// channel until they are settled or requeued.
    pub fn unsubscribe(&self, consumer_tag: &str) -> Result<()> {
        let subscription = self
            .subscriptions
            .lock()
            .remove(consumer_tag)
            .ok_or_else(|| Error::unknown_consumer(consumer_tag))?;

        let _guard = subscription.send_lock();
        subscription.close();

        tracing::debug!(channel = self.id, consumer = %consumer_tag, "unsubscribed");
        Ok(())
    }

    /// Enqueues `message` onto every destination through the current
    /// transaction.
    pub async fn publish(&self, message: Arc<Message>, destinations: &[Arc<Queue>]) -> Result<()> {
        self.ensure_open()?;

        if destinations.is_empty() {
            tracing::debug!(channel = self.id, message = %message.id(), "unroutable message");
            return Ok(());
        }

        self.with_transaction(|txn| {
            let transactional = txn.is_transactional();
            txn.enqueue(
                destinations,
                &message,
                enqueue_action(destinations, &message, transactional),
            );
        });

        self.sync_if_backlogged().await;
        Ok(())
    }

    /// Settles deliveries the consumer keeps. With `multiple`, every tag up
    /// to and including `delivery_tag` is settled (0 meaning all).
    pub async fn acknowledge_message(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.ensure_open()?;

        let acked: Vec<UnackedEntry> = if multiple {
            self.unacked
                .remove_up_to(delivery_tag)
                .into_iter()
                .map(|(_, unacked)| unacked)
                .collect()
        } else {
            let unacked = self
                .unacked
                .remove(delivery_tag)
                .ok_or(Error::UnknownDeliveryTag { tag: delivery_tag })?;
            vec![unacked]
        };

        if acked.is_empty() {
            return Ok(());
        }

        for unacked in &acked {
            unacked.subscription.settle(&unacked.entry, true);
        }

        let entries: Vec<Arc<QueueEntry>> = acked.iter().map(|u| Arc::clone(&u.entry)).collect();
        let resend_list = Arc::clone(&self.resend_list);

        self.with_transaction(move |txn| {
            let committed = entries.clone();
            let work = if txn.is_transactional() {
                action(
                    move || {
                        for entry in committed {
                            entry.delete();
                        }
                    },
                    move || resend_list.lock().extend(acked),
                )
            } else {
                action(
                    move || {
                        for entry in committed {
                            entry.delete();
                        }
                    },
                    move || {
                        for unacked in acked {
                            unacked.entry.set_redelivered();
                            unacked.entry.release();
                        }
                    },
                )
            };
            txn.dequeue(&entries, work);
        });

        self.sync_if_backlogged().await;
        Ok(())
    }

    /// Returns every unacknowledged delivery to its queue, marked redelivered.
    pub fn requeue(&self) {
        for (_, unacked) in self.unacked.drain() {
            requeue_entry(unacked);
        }
    }

    pub fn requeue_tag(&self, delivery_tag: u64) -> Result<()> {
        let unacked = self
            .unacked
            .remove(delivery_tag)
            .ok_or(Error::UnknownDeliveryTag { tag: delivery_tag })?;
        requeue_entry(unacked);
        Ok(())
    }

    /// Sends every unacknowledged delivery again to the subscription that
    /// holds it, under new tags. Entries whose subscription is gone are
    /// requeued instead.
    pub fn resend(&self) {
        let outstanding = self.unacked.drain();
        tracing::debug!(channel = self.id, count = outstanding.len(), "resending");

        for (_, unacked) in outstanding {
            unacked.subscription.settle(&unacked.entry, false);
            redeliver(unacked);
        }
    }

    /// Refuses a delivery. Requeued entries are not offered to the same
    /// subscription again; the others are dead-lettered or discarded.
    pub fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let unacked = self
            .unacked
            .remove(delivery_tag)
            .ok_or(Error::UnknownDeliveryTag { tag: delivery_tag })?;

        unacked.subscription.settle(&unacked.entry, false);

        if requeue {
            unacked.entry.reject(unacked.subscription.id());
            unacked.entry.set_redelivered();
            unacked.entry.release();
        } else {
            unacked.entry.route_to_alternate();
        }

        Ok(())
    }

    /// Replaces the prefetch window of every consumer on this channel. 0
    /// means unlimited.
    pub fn set_credit(&self, prefetch_size: u64, prefetch_count: u64) {
        *self.prefetch.lock() = (prefetch_size, prefetch_count);

        for subscription in self.all_subscriptions() {
            subscription.set_credit_limit(prefetch_size, prefetch_count);
        }
    }

    pub fn add_credit(&self, consumer_tag: &str, unit: CreditUnit, value: u64) -> Result<()> {
        self.subscription(consumer_tag)
            .ok_or_else(|| Error::unknown_consumer(consumer_tag))?
            .add_credit(unit, value);
        Ok(())
    }

    /// Withdraws a consumer's credit until more is granted.
    pub fn stop(&self, consumer_tag: &str) -> Result<()> {
        self.subscription(consumer_tag)
            .ok_or_else(|| Error::unknown_consumer(consumer_tag))?
            .stop();
        Ok(())
    }

    /// Switches the channel to local transactions. Idempotent.
    pub fn set_local_transactional(&self) -> Result<()> {
        self.ensure_open()?;

        let mut txn = self.transaction.lock();
        if let ChannelTransaction::AutoCommit = *txn {
            *txn = ChannelTransaction::Local(LocalTransaction::new(self.environment.store()));
            tracing::debug!(channel = self.id, "local transactions enabled");
        }
        Ok(())
    }

    fn take_transaction(&self) -> Result<LocalTransaction> {
        let mut txn = self.transaction.lock();
        match &mut *txn {
            ChannelTransaction::AutoCommit => Err(Error::NotTransactional),
            ChannelTransaction::Local(current) => Ok(std::mem::replace(
                current,
                LocalTransaction::new(self.environment.store()),
            )),
        }
    }

    pub async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        let mut txn = self.take_transaction()?;

        self.settle_commits().await;

        match txn.commit().await {
            Ok(()) => {
                tracing::debug!(channel = self.id, "committed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(channel = self.id, error = %e, "commit failed, rolling back");
                let _ = txn.rollback();
                self.resend_pending();
                if let Error::Store { source } = &e {
                    self.environment.fail(source);
                }
                Err(e)
            }
        }
    }

    pub async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        let mut txn = self.take_transaction()?;

        self.settle_commits().await;

        {
            let subscriptions = self.all_subscriptions();
            let guards: Vec<SendGuard<'_>> =
                subscriptions.iter().map(|s| s.send_lock()).collect();
            txn.rollback()?;
            drop(guards);
        }

        self.resend_pending();
        tracing::debug!(channel = self.id, "rolled back");
        Ok(())
    }

    fn resend_pending(&self) {
        let pending = std::mem::take(&mut *self.resend_list.lock());
        for unacked in pending {
            if !unacked.entry.is_discarded() {
                redeliver(unacked);
            }
        }
    }

    /// Flow control from the peer. Suspending waits for in-flight
    /// deliveries; resuming restarts delivery on every subscribed queue.
    pub fn set_suspended(&self, suspended: bool) {
        if self.suspended.swap(suspended, Ordering::AcqRel) == suspended {
            return;
        }

        let subscriptions = self.all_subscriptions();
        if suspended {
            for subscription in &subscriptions {
                drop(subscription.send_lock());
            }
            tracing::debug!(channel = self.id, "suspended");
        } else {
            tracing::debug!(channel = self.id, "resumed");
            for subscription in &subscriptions {
                if let Some(queue) = subscription.queue() {
                    queue.deliver();
                }
            }
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Warns about, or fails, a local transaction that has been open or
    /// idle for too long.
    pub fn check_transaction_timeout(&self, now: Instant) -> Result<()> {
        let txn = self.transaction.lock();
        let ChannelTransaction::Local(txn) = &*txn else {
            return Ok(());
        };

        let checks = [
            ("open", txn.open_duration(now), self.timeouts.open_warn, self.timeouts.open_close),
            ("idle", txn.idle_duration(now), self.timeouts.idle_warn, self.timeouts.idle_close),
        ];

        for (kind, elapsed, warn, close) in checks {
            let Some(elapsed) = elapsed else {
                continue;
            };

            if close.is_some_and(|limit| elapsed >= limit) {
                return Err(Error::TransactionTimeout {
                    reason: format!("{kind} for {}s", elapsed.as_secs()),
                });
            }

            if warn.is_some_and(|limit| elapsed >= limit) {
                tracing::warn!(
                    channel = self.id,
                    elapsed_secs = elapsed.as_secs(),
                    "transaction {kind} for too long"
                );
            }
        }

        Ok(())
    }

    /// Closes every consumer, abandons the open transaction and returns all
    /// unacknowledged deliveries to their queues as redelivered.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let subscriptions: Vec<Arc<Subscription>> =
            self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for subscription in &subscriptions {
            let _guard = subscription.send_lock();
            subscription.close();
        }

        self.settle_commits().await;

        let txn = std::mem::replace(&mut *self.transaction.lock(), ChannelTransaction::AutoCommit);
        if let ChannelTransaction::Local(mut txn) = txn {
            let _ = txn.rollback();
        }

        let pending = std::mem::take(&mut *self.resend_list.lock());
        let outstanding = self.unacked.drain().into_iter().map(|(_, u)| u);
        let mut requeued = 0;
        for unacked in pending.into_iter().chain(outstanding) {
            if unacked.entry.is_discarded() {
                continue;
            }
            unacked.entry.set_redelivered();
            unacked.entry.release();
            requeued += 1;
        }

        tracing::info!(channel = self.id, requeued, "channel closed");
    }
}

fn requeue_entry(unacked: UnackedEntry) {
    unacked.entry.set_redelivered();
    unacked.subscription.settle(&unacked.entry, false);
    unacked.entry.release();
}

/// Offers an entry back to its original subscription, falling back to the
/// queue when that subscription cannot take it.
fn redeliver(unacked: UnackedEntry) {
    let UnackedEntry {
        entry,
        subscription,
    } = unacked;

    entry.set_redelivered();
    entry.decrement_delivery_count();

    let resent = entry
        .queue()
        .is_some_and(|queue| queue.resend(&entry, subscription.id()));

    if !resent {
        entry.increment_delivery_count();
        entry.release();
    }
}

#[bon::bon]
impl Channel {
    /// Subscribes with the channel's prefetch window. `acks` selects explicit
    /// acknowledgement; without it deliveries are settled on send.
    #[builder]
    pub fn subscribe_to_queue(
        &self,
        queue: &Arc<Queue>,
        #[builder(into)] consumer_tag: Option<String>,
        acks: bool,
        filter: Option<FilterSpec>,
        #[builder(default)] no_local: bool,
        #[builder(default)] exclusive: bool,
    ) -> Result<String> {
        let (prefetch_size, prefetch_count) = *self.prefetch.lock();

        let options = SubscriptionOptions::builder()
            .accept_mode(if acks {
                AcceptMode::Explicit
            } else {
                AcceptMode::None
            })
            .flow_mode(FlowMode::Window)
            .message_credit(Allowance::from_prefetch(prefetch_count))
            .byte_credit(Allowance::from_prefetch(prefetch_size))
            .maybe_filter(filter)
            .no_local(no_local)
            .exclusive(exclusive)
            .build();

        self.subscribe(queue, consumer_tag, options)
    }
}

impl SubscriptionTarget for Channel {
    fn deliver(
        &self,
        subscription: &Arc<Subscription>,
        entry: &Arc<QueueEntry>,
        payload: Bytes,
        settled: bool,
        batched: bool,
    ) -> u64 {
        let unacked = UnackedEntry {
            entry: Arc::clone(entry),
            subscription: Arc::clone(subscription),
        };

        self.unacked.record(unacked, settled, |delivery_tag| {
            let delivery = Delivery {
                delivery_tag,
                consumer_tag: subscription.consumer_tag().to_owned(),
                queue: entry.queue_id().clone(),
                message: Arc::clone(entry.message()),
                payload,
                redelivered: entry.is_redelivered(),
                delivery_count: entry.delivery_count(),
                settled,
                batched,
            };
            if self.outbound.send(delivery).is_err() {
                tracing::trace!(channel = self.id, delivery_tag, "delivery stream dropped");
            }
        })
    }

    fn auto_commit(&self) -> AutoCommitTransaction {
        let recorder: Arc<dyn FutureRecorder> = self.ledger.clone();
        AutoCommitTransaction::new(self.environment.store(), recorder)
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire) || self.closing.load(Ordering::Acquire)
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("unacked", &self.unacked.len())
            .field("transactional", &self.is_transactional())
            .field("closed", &self.is_closed())
            .finish()
    }
}
