use std::{
    collections::BTreeMap,
    fmt,
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use serde::{Serialize, Serializer};

use crate::{
    error::{Error, Result},
    exchange::Exchange,
    message::Message,
    service::Environment,
    subscription::{DeliveryOutcome, Subscription, SubscriptionId},
    txn::{action, needs_store, AutoCommitTransaction, DetachedRecorder, FutureRecorder, ServerTransaction},
};

pub mod entry;

pub use entry::{AcquisitionState, EntryId, QueueEntry};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(Arc<str>);

impl QueueId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueueId {
    fn from(name: &str) -> Self {
        Self(Arc::from(name))
    }
}

impl From<String> for QueueId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueId({})", self.0)
    }
}

impl Serialize for QueueId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Runs against a freshly created entry before it is offered to consumers.
pub type EnqueueAction = Box<dyn FnOnce(&Arc<QueueEntry>) + Send>;

#[derive(Clone, bon::Builder)]
pub struct QueueSettings {
    #[builder(into)]
    pub name: String,
    #[builder(default)]
    pub durable: bool,
    /// Deliveries after which a released entry is dead-lettered. 0 disables.
    #[builder(default)]
    pub max_delivery_count: u32,
    pub alternate_exchange: Option<Arc<dyn Exchange>>,
    /// Queued bytes above which the queue reports itself overfull. 0 disables.
    #[builder(default)]
    pub flow_control_size: u64,
    #[builder(default)]
    pub flow_resume_size: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueStatistics {
    pub queue: QueueId,
    pub durable: bool,
    pub message_count: u64,
    pub available_count: u64,
    pub acquired_count: u64,
    pub queued_bytes: u64,
    pub avg_size_bytes: f64,
    pub consumer_count: u64,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dead_lettered: u64,
    pub transactional_enqueues: u64,
    pub overfull: bool,
}

pub struct Queue {
    id: QueueId,
    durable: bool,
    max_delivery_count: u32,
    alternate_exchange: Option<Arc<dyn Exchange>>,
    flow_control_size: u64,
    flow_resume_size: u64,

    environment: Arc<Environment>,
    weak_self: Weak<Queue>,

    entries: Mutex<BTreeMap<EntryId, Arc<QueueEntry>>>,
    next_entry: AtomicU64,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,

    delivery_lock: Mutex<()>,
    delivery_pending: AtomicBool,
    round_robin: AtomicUsize,

    queued_bytes: AtomicU64,
    overfull: AtomicBool,
    deleted: AtomicBool,

    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dead_lettered: AtomicU64,
    transactional_enqueues: AtomicU64,
}

impl Queue {
    pub fn new(settings: QueueSettings, environment: Arc<Environment>) -> Arc<Self> {
        let flow_resume_size = settings.flow_resume_size.min(settings.flow_control_size);

        Arc::new_cyclic(|weak_self| Self {
            id: QueueId::from(settings.name),
            durable: settings.durable,
            max_delivery_count: settings.max_delivery_count,
            alternate_exchange: settings.alternate_exchange,
            flow_control_size: settings.flow_control_size,
            flow_resume_size,
            environment,
            weak_self: weak_self.clone(),
            entries: Mutex::new(BTreeMap::new()),
            next_entry: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
            delivery_lock: Mutex::new(()),
            delivery_pending: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
            queued_bytes: AtomicU64::new(0),
            overfull: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            transactional_enqueues: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &QueueId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.as_str()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn max_delivery_count(&self) -> u32 {
        self.max_delivery_count
    }

    pub fn alternate_exchange(&self) -> Option<&Arc<dyn Exchange>> {
        self.alternate_exchange.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn is_overfull(&self) -> bool {
        self.overfull.load(Ordering::Acquire)
    }

    /// Entries on the queue that have not been discarded.
    pub fn depth(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn available_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_available())
            .count()
    }

    pub fn entries(&self) -> Vec<Arc<QueueEntry>> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Makes `message` visible on this queue and offers it to consumers.
    pub fn enqueue(
        &self,
        message: Arc<Message>,
        transactional: bool,
        action: Option<EnqueueAction>,
    ) -> Arc<QueueEntry> {
        message.add_reference();

        let id = EntryId(self.next_entry.fetch_add(1, Ordering::Relaxed));
        let size = message.size();
        let entry = Arc::new(QueueEntry::new(
            id,
            self.weak_self.clone(),
            self.id.clone(),
            message,
        ));

        if let Some(action) = action {
            action(&entry);
        }

        if self.is_deleted() {
            tracing::warn!(queue = %self.id, "enqueue onto deleted queue, discarding");
            entry.delete();
            return entry;
        }

        self.entries.lock().insert(id, Arc::clone(&entry));
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        if transactional {
            self.transactional_enqueues.fetch_add(1, Ordering::Relaxed);
        }
        self.queued_bytes.fetch_add(size, Ordering::AcqRel);
        self.check_overfull();

        tracing::trace!(queue = %self.id, entry = %id, message = %entry.message().id(), "enqueued");

        self.deliver();
        entry
    }

    /// Re-creates an entry found in the store during recovery. The consumer
    /// may have seen it before the restart, so it is marked redelivered.
    pub fn recover_entry(&self, message: Arc<Message>) -> Arc<QueueEntry> {
        self.enqueue(
            message,
            false,
            Some(Box::new(|entry: &Arc<QueueEntry>| entry.set_redelivered())),
        )
    }

    /// Runs delivery until no further work has been signalled. Only one
    /// thread delivers at a time; others leave a pending flag behind.
    pub fn deliver(&self) {
        self.delivery_pending.store(true, Ordering::Release);

        loop {
            let Some(guard) = self.delivery_lock.try_lock() else {
                return;
            };

            while self.delivery_pending.swap(false, Ordering::AcqRel) {
                self.delivery_pass();
            }

            drop(guard);

            if !self.delivery_pending.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Offers available entries in queue order, walking the entry map with a
    /// cursor instead of copying it. Stops as soon as no subscription can
    /// take anything.
    fn delivery_pass(&self) {
        let subscriptions: Vec<Arc<Subscription>> = self.subscriptions.lock().clone();
        let count = subscriptions.len();
        let mut cursor = None;

        while subscriptions.iter().any(|s| s.is_active()) {
            let Some(entry) = self.next_available(cursor) else {
                return;
            };
            cursor = Some(entry.id());

            let start = self.round_robin.load(Ordering::Relaxed) % count;
            for offset in 0..count {
                let index = (start + offset) % count;
                if subscriptions[index].try_deliver(&entry) == DeliveryOutcome::Delivered {
                    self.round_robin.store((index + 1) % count, Ordering::Relaxed);
                    break;
                }
            }
        }
    }

    fn next_available(&self, after: Option<EntryId>) -> Option<Arc<QueueEntry>> {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        self.entries
            .lock()
            .range((lower, Bound::Unbounded))
            .map(|(_, entry)| entry)
            .find(|entry| entry.is_available())
            .cloned()
    }

    pub(crate) fn entry_released(&self, entry: &Arc<QueueEntry>) {
        if self.is_deleted() {
            if entry.acquire_by_queue() {
                self.dequeue_entries(vec![Arc::clone(entry)]);
            }
            return;
        }
        self.deliver();
    }

    pub(crate) fn entry_deleted(&self, entry: &QueueEntry) {
        if self.entries.lock().remove(&entry.id()).is_none() {
            return;
        }

        self.dequeued.fetch_add(1, Ordering::Relaxed);
        let size = entry.size();
        let _ = self
            .queued_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(size))
            });
        self.check_underfull();
    }

    fn recorder(&self) -> DetachedRecorder {
        DetachedRecorder::new(Arc::clone(&self.environment))
    }

    /// Dequeues entries from the store, deleting them once that is durable.
    pub(crate) fn dequeue_entries(&self, entries: Vec<Arc<QueueEntry>>) {
        if entries.is_empty() {
            return;
        }

        let recorder: Arc<dyn FutureRecorder> = Arc::new(self.recorder());
        let mut txn = AutoCommitTransaction::new(self.environment.store(), recorder);

        let committed = entries.clone();
        let abandoned = entries.clone();
        txn.dequeue(
            &entries,
            action(
                move || {
                    for entry in committed {
                        entry.delete();
                    }
                },
                move || {
                    for entry in abandoned {
                        entry.restore();
                    }
                },
            ),
        );
    }

    /// Moves an entry to the queues its alternate exchange routes it to.
    /// Without an alternate exchange, or with no matching destination other
    /// than this queue, the entry is discarded.
    pub fn route_to_alternate(&self, entry: &Arc<QueueEntry>) {
        if entry.is_discarded() || (entry.is_available() && !entry.acquire_by_queue()) {
            return;
        }

        let message = Arc::clone(entry.message());
        let destinations: Vec<Arc<Queue>> = self
            .alternate_exchange
            .as_ref()
            .map(|exchange| exchange.route(&message))
            .unwrap_or_default()
            .into_iter()
            .filter(|queue| queue.id != self.id)
            .collect();

        if destinations.is_empty() {
            tracing::warn!(
                queue = %self.id,
                message = %message.id(),
                delivery_count = entry.delivery_count(),
                "no alternate destination, discarding"
            );
            self.dequeue_entries(vec![Arc::clone(entry)]);
            return;
        }

        let mut txn = self.environment.store().new_transaction();
        let mut durable = false;
        for queue in destinations.iter().filter(|q| needs_store(q, &message)) {
            txn.enqueue_message(queue.id(), message.id());
            durable = true;
        }
        if needs_store(self, &message) {
            txn.dequeue_message(&self.id, message.id());
            durable = true;
        }

        tracing::info!(
            queue = %self.id,
            message = %message.id(),
            destinations = destinations.len(),
            "dead-lettering"
        );
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);

        let moved = Arc::clone(entry);
        let abandoned = Arc::clone(entry);
        let work = action(
            move || {
                for queue in &destinations {
                    queue.enqueue(Arc::clone(&message), false, None);
                }
                moved.delete();
            },
            move || {
                abandoned.restore();
            },
        );

        if durable {
            self.recorder().record(txn.commit(true), work);
        } else {
            txn.abort();
            work.post_commit();
        }
    }

    /// Discards every entry not held by a consumer. Returns how many.
    pub fn purge(&self) -> usize {
        let acquired: Vec<Arc<QueueEntry>> = self
            .entries()
            .into_iter()
            .filter(|entry| entry.acquire_by_queue())
            .collect();

        let purged = acquired.len();
        self.dequeue_entries(acquired);

        tracing::info!(queue = %self.id, purged, "purged");
        purged
    }

    /// Hands an entry back to the subscription that holds it. Returns false
    /// if that subscription is no longer consuming from this queue.
    pub fn resend(&self, entry: &Arc<QueueEntry>, subscription: SubscriptionId) -> bool {
        let found = self
            .subscriptions
            .lock()
            .iter()
            .find(|s| s.id() == subscription)
            .cloned();

        match found {
            Some(subscription) if !subscription.is_closed() => subscription.resend(entry),
            _ => false,
        }
    }

    pub fn register(&self, subscription: Arc<Subscription>) -> Result<()> {
        if self.is_deleted() {
            return Err(Error::queue_not_found(self.name()));
        }

        {
            let mut subscriptions = self.subscriptions.lock();
            let conflict = subscriptions.iter().any(|s| s.is_exclusive())
                || (subscription.is_exclusive() && !subscriptions.is_empty());
            if conflict {
                return Err(Error::ExclusiveConsumerConflict {
                    queue: self.name().to_owned(),
                });
            }
            subscriptions.push(subscription);
        }

        self.deliver();
        Ok(())
    }

    pub fn unregister(&self, subscription: SubscriptionId) {
        self.subscriptions.lock().retain(|s| s.id() != subscription);
    }

    /// Closes every subscription and discards every entry. Entries still held
    /// by consumers are discarded when they are released.
    pub fn delete(&self) -> usize {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            let _guard = subscription.send_lock();
            subscription.close();
        }

        let discarded = self.purge();
        tracing::info!(queue = %self.id, discarded, "deleted");
        discarded
    }

    pub fn statistics(&self) -> QueueStatistics {
        let (message_count, available_count) = {
            let entries = self.entries.lock();
            let available = entries.values().filter(|e| e.is_available()).count();
            (entries.len() as u64, available as u64)
        };
        let queued_bytes = self.queued_bytes.load(Ordering::Acquire);

        QueueStatistics {
            queue: self.id.clone(),
            durable: self.durable,
            message_count,
            available_count,
            acquired_count: message_count - available_count,
            queued_bytes,
            avg_size_bytes: if message_count == 0 {
                0.0
            } else {
                queued_bytes as f64 / message_count as f64
            },
            consumer_count: self.consumer_count() as u64,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            transactional_enqueues: self.transactional_enqueues.load(Ordering::Relaxed),
            overfull: self.is_overfull(),
        }
    }

    fn check_overfull(&self) {
        if self.flow_control_size == 0 {
            return;
        }
        let queued = self.queued_bytes.load(Ordering::Acquire);
        if queued > self.flow_control_size && !self.overfull.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                queue = %self.id,
                queued_bytes = queued,
                limit = self.flow_control_size,
                "queue overfull"
            );
        }
    }

    fn check_underfull(&self) {
        if self.flow_control_size == 0 || !self.is_overfull() {
            return;
        }
        let queued = self.queued_bytes.load(Ordering::Acquire);
        if queued <= self.flow_resume_size && self.overfull.swap(false, Ordering::AcqRel) {
            tracing::info!(
                queue = %self.id,
                queued_bytes = queued,
                resume = self.flow_resume_size,
                "queue underfull"
            );
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("durable", &self.durable)
            .field("depth", &self.depth())
            .finish()
    }
}
