//! A consumer's view of one queue.
//!
//! One subscription type covers every protocol flavour; the differences are
//! captured by [`AcceptMode`], [`AcquireMode`], an optional [`FilterSpec`] and
//! a [`WireTranslator`] that turns an entry into the bytes handed to the
//! protocol layer.
//!
//! Delivery happens under the subscription's send lock. Callers that change
//! flow-control-visible state (suspend, close) take the same lock through
//! [`Subscription::send_lock`] so that no delivery is in flight while they do.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use strum::{Display, EnumString, FromRepr, IntoStaticStr};

use crate::{
    queue::{Queue, QueueEntry, QueueId},
    txn::{action, AutoCommitTransaction, ServerTransaction},
};

pub mod credit;
pub mod filter;

pub use credit::{
    Allowance, CreditManager, CreditStateChanged, CreditUnit, FlowMode, ListenerId,
    UNLIMITED_CREDIT,
};
pub use filter::FilterSpec;

// Owner values 0 and 1 are reserved by queue entries.
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, IntoStaticStr, FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum SubscriptionState {
    Active,
    Suspended,
    Stopped,
    Closed,
}

/// Whether delivery takes ownership of the entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AcquireMode {
    PreAcquired,
    /// Browsing: entries are shown to the consumer but stay on the queue.
    NotAcquired,
}

/// Whether the consumer must settle deliveries explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AcceptMode {
    Explicit,
    None,
}

/// Turns an entry into the payload handed to the protocol layer.
pub type WireTranslator = Arc<dyn Fn(&QueueEntry) -> Bytes + Send + Sync>;

/// The consumer session a subscription delivers into.
pub trait SubscriptionTarget: Send + Sync {
    /// Hands a delivery to the consumer and returns its delivery tag.
    /// Unsettled deliveries are tracked until acknowledged or requeued.
    fn deliver(
        &self,
        subscription: &Arc<Subscription>,
        entry: &Arc<QueueEntry>,
        payload: Bytes,
        settled: bool,
        batched: bool,
    ) -> u64;

    /// Transaction used to dequeue entries that need no acknowledgement.
    fn auto_commit(&self) -> AutoCommitTransaction;

    /// Flow control: nothing is delivered while the target is suspended.
    fn is_suspended(&self) -> bool;

    fn connection_id(&self) -> u64;
}

#[derive(bon::Builder)]
pub struct SubscriptionOptions {
    #[builder(default = AcceptMode::Explicit)]
    pub accept_mode: AcceptMode,
    #[builder(default = AcquireMode::PreAcquired)]
    pub acquire_mode: AcquireMode,
    #[builder(default = FlowMode::Window)]
    pub flow_mode: FlowMode,
    #[builder(default = Allowance::Unlimited)]
    pub message_credit: Allowance,
    #[builder(default = Allowance::Unlimited)]
    pub byte_credit: Allowance,
    pub filter: Option<FilterSpec>,
    #[builder(default)]
    pub no_local: bool,
    #[builder(default)]
    pub exclusive: bool,
    pub translator: Option<WireTranslator>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    /// The entry was acquired and sent.
    Delivered,
    /// The entry was shown to a browser and stays available.
    Browsed,
    Skipped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatistics {
    pub delivered_messages: u64,
    pub delivered_bytes: u64,
    pub unacknowledged: u64,
}

pub struct Subscription {
    id: SubscriptionId,
    consumer_tag: String,
    queue: Weak<Queue>,
    queue_id: QueueId,
    target: Weak<dyn SubscriptionTarget>,
    state: AtomicU8,

    accept_mode: AcceptMode,
    acquire_mode: AcquireMode,
    filter: Option<FilterSpec>,
    no_local: bool,
    exclusive: bool,
    translator: WireTranslator,

    credit: CreditManager,
    credit_listener: Mutex<Option<ListenerId>>,

    send_lock: Mutex<()>,
    delivery_missed: AtomicBool,
    last_browsed: AtomicU64,

    delivered_messages: AtomicU64,
    delivered_bytes: AtomicU64,
    unacknowledged: AtomicU64,
}

fn default_translator() -> WireTranslator {
    Arc::new(|entry: &QueueEntry| entry.message().content().clone())
}

impl Subscription {
    pub fn new(
        consumer_tag: impl Into<String>,
        queue: &Arc<Queue>,
        target: Weak<dyn SubscriptionTarget>,
        options: SubscriptionOptions,
    ) -> Arc<Self> {
        let credit = CreditManager::new(
            options.flow_mode,
            options.message_credit,
            options.byte_credit,
        );
        let initial = if credit.has_credit() {
            SubscriptionState::Active
        } else {
            SubscriptionState::Suspended
        };

        Arc::new_cyclic(|weak: &Weak<Subscription>| {
            let listener = {
                let weak = weak.clone();
                credit.add_listener(move |event| {
                    if let Some(subscription) = weak.upgrade() {
                        subscription.credit_state_changed(event);
                    }
                })
            };

            Self {
                id: SubscriptionId::next(),
                consumer_tag: consumer_tag.into(),
                queue: Arc::downgrade(queue),
                queue_id: queue.id().clone(),
                target,
                state: AtomicU8::new(initial as u8),
                accept_mode: options.accept_mode,
                acquire_mode: options.acquire_mode,
                filter: options.filter,
                no_local: options.no_local,
                exclusive: options.exclusive,
                translator: options.translator.unwrap_or_else(default_translator),
                credit,
                credit_listener: Mutex::new(Some(listener)),
                send_lock: Mutex::new(()),
                delivery_missed: AtomicBool::new(false),
                last_browsed: AtomicU64::new(0),
                delivered_messages: AtomicU64::new(0),
                delivered_bytes: AtomicU64::new(0),
                unacknowledged: AtomicU64::new(0),
            }
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.queue.upgrade()
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    pub fn accept_mode(&self) -> AcceptMode {
        self.accept_mode
    }

    pub fn acquire_mode(&self) -> AcquireMode {
        self.acquire_mode
    }

    pub fn is_browser(&self) -> bool {
        self.acquire_mode == AcquireMode::NotAcquired
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn credit(&self) -> &CreditManager {
        &self.credit
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_repr(self.state.load(Ordering::Acquire))
            .unwrap_or(SubscriptionState::Closed)
    }

    fn transition(&self, from: SubscriptionState, to: SubscriptionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    /// Whether the subscription currently participates in delivery.
    pub fn is_active(&self) -> bool {
        if self.state() != SubscriptionState::Active {
            return false;
        }
        match self.target.upgrade() {
            Some(target) => !target.is_suspended(),
            None => false,
        }
    }

    pub fn statistics(&self) -> SubscriptionStatistics {
        SubscriptionStatistics {
            delivered_messages: self.delivered_messages.load(Ordering::Relaxed),
            delivered_bytes: self.delivered_bytes.load(Ordering::Relaxed),
            unacknowledged: self.unacknowledged.load(Ordering::Relaxed),
        }
    }

    /// Blocks until no delivery is in flight on this subscription.
    pub fn send_lock(&self) -> SendGuard<'_> {
        SendGuard {
            subscription: self,
            guard: Some(self.send_lock.lock()),
        }
    }

    fn try_send_lock(&self) -> Option<SendGuard<'_>> {
        self.send_lock.try_lock().map(|guard| SendGuard {
            subscription: self,
            guard: Some(guard),
        })
    }

    /// Reserves credit for `entry`. Returns true, reserving nothing, when
    /// the subscription cannot take it; the entry must not be acquired then.
    pub fn would_suspend(&self, entry: &QueueEntry) -> bool {
        !self.credit.use_credit_for_message(entry.size())
    }

    pub fn has_interest(&self, entry: &QueueEntry) -> bool {
        if entry.is_rejected_by(self.id) {
            return false;
        }

        let message = entry.message();

        if self.no_local {
            if let (Some(origin), Some(target)) =
                (message.metadata().connection_id, self.target.upgrade())
            {
                if origin == target.connection_id() {
                    return false;
                }
            }
        }

        self.filter
            .as_ref()
            .map_or(true, |filter| filter.matches(message))
    }

    /// Offers `entry` to this subscription from the queue's delivery loop.
    pub(crate) fn try_deliver(self: &Arc<Self>, entry: &Arc<QueueEntry>) -> DeliveryOutcome {
        let Some(guard) = self.try_send_lock() else {
            self.delivery_missed.store(true, Ordering::Release);
            return DeliveryOutcome::Skipped;
        };

        if !self.is_active() || !self.has_interest(entry) {
            return DeliveryOutcome::Skipped;
        }

        if self.is_browser() && entry.id().0 <= self.last_browsed.load(Ordering::Acquire) {
            return DeliveryOutcome::Skipped;
        }

        if self.would_suspend(entry) {
            return DeliveryOutcome::Skipped;
        }

        let outcome = if self.is_browser() {
            self.last_browsed.store(entry.id().0, Ordering::Release);
            DeliveryOutcome::Browsed
        } else if entry.acquire(self.id) {
            DeliveryOutcome::Delivered
        } else {
            self.credit.restore_credit(1, entry.size());
            return DeliveryOutcome::Skipped;
        };

        self.send(entry, false);
        drop(guard);

        outcome
    }

    /// Delivers an entry for which credit has been reserved and which this
    /// subscription has acquired (or is browsing). The caller holds the
    /// send lock.
    pub fn send(self: &Arc<Self>, entry: &Arc<QueueEntry>, batch: bool) {
        let payload = (self.translator)(entry);

        let acquired = !self.is_browser();
        let settled = !acquired || self.accept_mode == AcceptMode::None;

        if acquired {
            entry.increment_delivery_count();
        }
        self.delivered_messages.fetch_add(1, Ordering::Relaxed);
        self.delivered_bytes
            .fetch_add(entry.size(), Ordering::Relaxed);

        let Some(target) = self.target.upgrade() else {
            tracing::debug!(subscription = %self.id, "target gone, abandoning delivery");
            if acquired {
                entry.decrement_delivery_count();
                entry.release();
            }
            self.credit.restore_credit(1, entry.size());
            return;
        };

        if !settled {
            self.unacknowledged.fetch_add(1, Ordering::Relaxed);
        }

        let tag = target.deliver(self, entry, payload, settled, batch);

        tracing::trace!(
            subscription = %self.id,
            queue = %self.queue_id,
            entry = %entry.id(),
            tag,
            settled,
            "sent"
        );

        if !settled {
            return;
        }

        if acquired {
            let mut txn = target.auto_commit();
            let committed = Arc::clone(entry);
            let abandoned = Arc::clone(entry);
            txn.dequeue(
                &[Arc::clone(entry)],
                action(
                    move || {
                        committed.delete();
                    },
                    move || {
                        abandoned.release();
                    },
                ),
            );
        }

        self.release_credit(entry, true);
    }

    /// Sends an entry this subscription already holds again. Returns false
    /// if the subscription cannot take it, in which case nothing changed.
    pub fn resend(self: &Arc<Self>, entry: &Arc<QueueEntry>) -> bool {
        let _guard = self.send_lock();

        if self.is_closed() || !entry.is_acquired_by(self.id) {
            return false;
        }

        if self.would_suspend(entry) {
            return false;
        }

        self.send(entry, false);
        true
    }

    /// Settles an unacknowledged delivery. `kept` is true when the consumer
    /// keeps the message (acknowledgement) and false when it comes back.
    pub fn settle(&self, entry: &QueueEntry, kept: bool) {
        let _ = self
            .unacknowledged
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.release_credit(entry, kept);
    }

    fn release_credit(&self, entry: &QueueEntry, kept: bool) {
        if !kept || self.credit.mode() == FlowMode::Window {
            self.credit.restore_credit(1, entry.size());
        }
    }

    pub fn add_credit(&self, unit: CreditUnit, value: u64) {
        self.credit.add_credit(unit, value);
    }

    pub fn set_credit_limit(&self, prefetch_size: u64, prefetch_count: u64) {
        self.credit.set_credit_limit(prefetch_size, prefetch_count);
    }

    /// Withdraws all credit. Delivery resumes once credit is added again.
    pub fn stop(&self) {
        let _guard = self.send_lock();
        loop {
            let state = self.state();
            if matches!(state, SubscriptionState::Stopped | SubscriptionState::Closed) {
                break;
            }
            if self.transition(state, SubscriptionState::Stopped) {
                break;
            }
        }
        self.credit.clear_credit();
    }

    fn credit_state_changed(&self, event: CreditStateChanged) {
        if event.has_credit {
            let resumed = self.transition(SubscriptionState::Suspended, SubscriptionState::Active)
                || self.transition(SubscriptionState::Stopped, SubscriptionState::Active);
            if resumed {
                tracing::debug!(subscription = %self.id, "credit available, resuming");
                if let Some(queue) = self.queue.upgrade() {
                    queue.deliver();
                }
            }
        } else if self.transition(SubscriptionState::Active, SubscriptionState::Suspended) {
            tracing::debug!(subscription = %self.id, "out of credit, suspending");
        }
    }

    /// Terminal. Deregisters from the queue and from credit notifications.
    /// Entries this subscription still holds stay with the consumer session,
    /// which requeues them.
    pub fn close(&self) -> bool {
        let previous = self
            .state
            .swap(SubscriptionState::Closed as u8, Ordering::AcqRel);
        if previous == SubscriptionState::Closed as u8 {
            return false;
        }

        if let Some(listener) = self.credit_listener.lock().take() {
            self.credit.remove_listener(listener);
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.unregister(self.id);
        }

        tracing::debug!(subscription = %self.id, queue = %self.queue_id, "closed");
        true
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("consumer_tag", &self.consumer_tag)
            .field("queue", &self.queue_id)
            .field("state", &self.state())
            .field("accept_mode", &self.accept_mode)
            .field("acquire_mode", &self.acquire_mode)
            .finish()
    }
}

/// Held while delivering. Dropping it re-runs queue delivery if the queue
/// skipped this subscription because the lock was taken.
pub struct SendGuard<'a> {
    subscription: &'a Subscription,
    guard: Option<MutexGuard<'a, ()>>,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        if self
            .subscription
            .delivery_missed
            .swap(false, Ordering::AcqRel)
        {
            if let Some(queue) = self.subscription.queue.upgrade() {
                queue.deliver();
            }
        }
    }
}
