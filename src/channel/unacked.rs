use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use crate::{queue::QueueEntry, subscription::Subscription};

/// An entry delivered on a channel and not yet settled.
#[derive(Clone)]
pub struct UnackedEntry {
    pub entry: Arc<QueueEntry>,
    pub subscription: Arc<Subscription>,
}

impl std::fmt::Debug for UnackedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnackedEntry")
            .field("entry", &self.entry)
            .field("subscription", &self.subscription.id())
            .finish()
    }
}

struct Ledger {
    next_tag: u64,
    entries: BTreeMap<u64, UnackedEntry>,
}

/// Delivery tags of one channel and the entries they still hold.
pub struct UnacknowledgedMap {
    inner: Mutex<Ledger>,
}

impl Default for UnacknowledgedMap {
    fn default() -> Self {
        Self::new()
    }
}

impl UnacknowledgedMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Ledger {
                next_tag: 1,
                entries: BTreeMap::new(),
            }),
        }
    }

    /// Assigns the next delivery tag and tracks `unacked` under it unless
    /// the delivery is already settled. `emit` runs under the same lock so
    /// deliveries leave the channel in tag order.
    pub fn record<F>(&self, unacked: UnackedEntry, settled: bool, emit: F) -> u64
    where
        F: FnOnce(u64),
    {
        let mut inner = self.inner.lock();
        let tag = inner.next_tag;
        inner.next_tag += 1;

        if !settled {
            inner.entries.insert(tag, unacked);
        }
        emit(tag);

        tag
    }

    pub fn remove(&self, tag: u64) -> Option<UnackedEntry> {
        self.inner.lock().entries.remove(&tag)
    }

    /// Removes every entry with a tag up to and including `tag`. Tag 0 means
    /// everything outstanding.
    pub fn remove_up_to(&self, tag: u64) -> Vec<(u64, UnackedEntry)> {
        let mut inner = self.inner.lock();
        if tag == 0 {
            return std::mem::take(&mut inner.entries).into_iter().collect();
        }

        let rest = inner.entries.split_off(&tag.saturating_add(1));
        let taken = std::mem::replace(&mut inner.entries, rest);
        taken.into_iter().collect()
    }

    pub fn drain(&self) -> Vec<(u64, UnackedEntry)> {
        self.remove_up_to(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn tags(&self) -> Vec<u64> {
        self.inner.lock().entries.keys().copied().collect()
    }
}
