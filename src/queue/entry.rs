//! A message instance as it exists on one queue.
//!
//! Ownership lives in a single atomic word so that acquisition is one
//! compare-and-swap: `0` is available, `u64::MAX` is discarded and any other
//! value is the id of the owner (subscription ids, or [`QUEUE_OWNER`] when the
//! queue itself holds the entry for purge or dead-lettering).

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use strum::{Display, IntoStaticStr};

use super::{Queue, QueueId};
use crate::{message::Message, subscription::SubscriptionId};

const AVAILABLE: u64 = 0;
const DISCARDED: u64 = u64::MAX;
pub(crate) const QUEUE_OWNER: u64 = 1;

/// Position of an entry on its queue. Increases with enqueue order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquisitionState {
    Available,
    Acquired,
    Discarded,
}

pub struct QueueEntry {
    id: EntryId,
    queue: Weak<Queue>,
    queue_id: QueueId,
    message: Arc<Message>,
    owner: AtomicU64,
    redelivered: AtomicBool,
    delivery_count: AtomicU32,
    rejected_by: Mutex<Vec<SubscriptionId>>,
}

impl QueueEntry {
    pub(crate) fn new(
        id: EntryId,
        queue: Weak<Queue>,
        queue_id: QueueId,
        message: Arc<Message>,
    ) -> Self {
        Self {
            id,
            queue,
            queue_id,
            message,
            owner: AtomicU64::new(AVAILABLE),
            redelivered: AtomicBool::new(false),
            delivery_count: AtomicU32::new(0),
            rejected_by: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.queue.upgrade()
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    pub fn size(&self) -> u64 {
        self.message.size()
    }

    pub fn state(&self) -> AcquisitionState {
        match self.owner.load(Ordering::Acquire) {
            AVAILABLE => AcquisitionState::Available,
            DISCARDED => AcquisitionState::Discarded,
            _ => AcquisitionState::Acquired,
        }
    }

    pub fn is_available(&self) -> bool {
        self.owner.load(Ordering::Acquire) == AVAILABLE
    }

    pub fn is_acquired(&self) -> bool {
        self.state() == AcquisitionState::Acquired
    }

    pub fn is_discarded(&self) -> bool {
        self.owner.load(Ordering::Acquire) == DISCARDED
    }

    /// The subscription holding this entry, if any.
    pub fn owner(&self) -> Option<SubscriptionId> {
        match self.owner.load(Ordering::Acquire) {
            AVAILABLE | DISCARDED | QUEUE_OWNER => None,
            id => Some(SubscriptionId(id)),
        }
    }

    pub fn is_acquired_by(&self, subscription: SubscriptionId) -> bool {
        self.owner.load(Ordering::Acquire) == subscription.0
    }

    /// AVAILABLE -> ACQUIRED by `subscription`. Returns false when another
    /// actor got there first or the entry is discarded.
    pub fn acquire(&self, subscription: SubscriptionId) -> bool {
        self.acquire_as(subscription.0)
    }

    /// Acquires the entry on behalf of the queue itself.
    pub(crate) fn acquire_by_queue(&self) -> bool {
        self.acquire_as(QUEUE_OWNER)
    }

    fn acquire_as(&self, owner: u64) -> bool {
        self.owner
            .compare_exchange(AVAILABLE, owner, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// ACQUIRED -> AVAILABLE. Redelivery bookkeeping is left untouched. If the
    /// entry has reached the queue's delivery limit it is dead-lettered
    /// instead of being offered again.
    pub fn release(self: &Arc<Self>) -> bool {
        let current = self.owner.load(Ordering::Acquire);
        if current == AVAILABLE || current == DISCARDED {
            return false;
        }

        let queue = self.queue.upgrade();

        if let Some(queue) = &queue {
            let limit = queue.max_delivery_count();
            if limit > 0 && self.delivery_count() >= limit {
                tracing::debug!(
                    queue = %self.queue_id,
                    entry = %self.id,
                    delivery_count = self.delivery_count(),
                    "delivery limit reached"
                );
                queue.route_to_alternate(self);
                return true;
            }
        }

        if self
            .owner
            .compare_exchange(current, AVAILABLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if let Some(queue) = queue {
            queue.entry_released(self);
        }

        true
    }

    /// Puts an entry back after its dequeue failed in the store, skipping
    /// the delivery limit.
    pub(crate) fn restore(self: &Arc<Self>) -> bool {
        let current = self.owner.load(Ordering::Acquire);
        if current == AVAILABLE || current == DISCARDED {
            return false;
        }
        if self
            .owner
            .compare_exchange(current, AVAILABLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if let Some(queue) = self.queue.upgrade() {
            queue.entry_released(self);
        }
        true
    }

    /// Removes the entry permanently and dequeues its message from the store.
    /// Valid from AVAILABLE (purge) or ACQUIRED (acknowledgement). An available
    /// entry is taken by the queue first so no consumer can acquire it while
    /// the dequeue is pending; returns false if a consumer got there first.
    pub fn discard(self: &Arc<Self>) -> bool {
        match self.owner.load(Ordering::Acquire) {
            DISCARDED | QUEUE_OWNER => return false,
            AVAILABLE if !self.acquire_by_queue() => return false,
            _ => {}
        }

        match self.queue.upgrade() {
            Some(queue) => {
                queue.dequeue_entries(vec![Arc::clone(self)]);
                true
            }
            None => self.delete(),
        }
    }

    /// Dead-letters the entry through the queue's alternate exchange, or
    /// discards it when there is none.
    pub fn route_to_alternate(self: &Arc<Self>) {
        match self.queue.upgrade() {
            Some(queue) => queue.route_to_alternate(self),
            None => {
                self.delete();
            }
        }
    }

    /// Final transition once the store no longer references the entry.
    pub(crate) fn delete(&self) -> bool {
        let previous = self.owner.swap(DISCARDED, Ordering::AcqRel);
        if previous == DISCARDED {
            return false;
        }

        if let Some(queue) = self.queue.upgrade() {
            queue.entry_deleted(self);
        }
        self.message.remove_reference();

        true
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered.load(Ordering::Acquire)
    }

    pub fn set_redelivered(&self) {
        self.redelivered.store(true, Ordering::Release);
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count.load(Ordering::Acquire)
    }

    /// Returns the new count.
    pub fn increment_delivery_count(&self) -> u32 {
        self.delivery_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Undoes the increment of a delivery that never reached the client.
    pub fn decrement_delivery_count(&self) -> u32 {
        let previous = self
            .delivery_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn reject(&self, subscription: SubscriptionId) {
        let mut rejected = self.rejected_by.lock();
        if !rejected.contains(&subscription) {
            rejected.push(subscription);
        }
    }

    pub fn is_rejected_by(&self, subscription: SubscriptionId) -> bool {
        self.rejected_by.lock().contains(&subscription)
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("queue", &self.queue_id)
            .field("id", &self.id)
            .field("message", &self.message.id())
            .field("state", &self.state())
            .field("redelivered", &self.is_redelivered())
            .field("delivery_count", &self.delivery_count())
            .finish()
    }
}
