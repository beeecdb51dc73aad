//! In-memory implementation of the message store.
//!
//! Backed by concurrent hash maps. Used for tests and for brokers that do not
//! need durability across restarts. Commits can be made to fail or to stay
//! pending until released, which lets callers exercise the asynchronous
//! completion paths.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};

use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{
    MessageStore, RecoveredMessage, RecoveryHandler, StoreError, StoreFuture, StoreTransaction,
    StoredMessage,
};
use crate::{
    message::{MessageId, MessageMetadata},
    queue::QueueId,
};

struct StoredRecord {
    metadata: MessageMetadata,
    content: Mutex<Vec<u8>>,
}

enum Operation {
    Enqueue(QueueId, MessageId),
    Dequeue(QueueId, MessageId),
}

struct HeldCommit {
    operations: Vec<Operation>,
    completion: oneshot::Sender<Result<(), StoreError>>,
}

struct Inner {
    messages: papaya::HashMap<MessageId, Arc<StoredRecord>>,
    entries: papaya::HashMap<(QueueId, MessageId), ()>,
    next_id: AtomicU64,
    open: AtomicBool,
    fail_commits: AtomicBool,
    hold_commits: AtomicBool,
    held: Mutex<Vec<HeldCommit>>,
}

impl Inner {
    fn apply(&self, operations: Vec<Operation>) {
        let entries = self.entries.pin();
        for op in operations {
            match op {
                Operation::Enqueue(queue, message) => {
                    entries.insert((queue, message), ());
                }
                Operation::Dequeue(queue, message) => {
                    entries.remove(&(queue, message));
                }
            }
        }
    }
}

#[derive(Clone)]
/// Thread-safe in-memory message store.
pub struct MemoryMessageStore {
    inner: Arc<Inner>,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                messages: papaya::HashMap::new(),
                entries: papaya::HashMap::new(),
                next_id: AtomicU64::new(1),
                open: AtomicBool::new(true),
                fail_commits: AtomicBool::new(false),
                hold_commits: AtomicBool::new(false),
                held: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Makes every subsequent commit fail with [`StoreError::CommitFailed`].
    pub fn fail_commits(&self, fail: bool) {
        self.inner.fail_commits.store(fail, Ordering::Release);
    }

    /// Keeps subsequent commits pending until [`Self::complete_held_commit`]
    /// or [`Self::complete_all_held_commits`] is called.
    pub fn hold_commits(&self, hold: bool) {
        self.inner.hold_commits.store(hold, Ordering::Release);
    }

    pub fn held_commit_count(&self) -> usize {
        self.inner.held.lock().len()
    }

    /// Completes the held commit at `index` (in submission order). Returns
    /// false if there is no such commit.
    pub fn complete_held_commit(&self, index: usize) -> bool {
        let held = {
            let mut held = self.inner.held.lock();
            if index >= held.len() {
                return false;
            }
            held.remove(index)
        };

        self.inner.apply(held.operations);
        let _ = held.completion.send(Ok(()));
        true
    }

    pub fn complete_all_held_commits(&self) {
        while self.complete_held_commit(0) {}
    }

    pub fn contains_entry(&self, queue: &QueueId, message: MessageId) -> bool {
        self.inner
            .entries
            .pin()
            .contains_key(&(queue.clone(), message))
    }

    pub fn entry_count(&self) -> usize {
        self.inner.entries.pin().len()
    }

    pub fn contains_message(&self, message: MessageId) -> bool {
        self.inner.messages.pin().contains_key(&message)
    }

    pub fn message_count(&self) -> usize {
        self.inner.messages.pin().len()
    }
}

impl MessageStore for MemoryMessageStore {
    fn next_message_id(&self) -> MessageId {
        MessageId(self.inner.next_id.fetch_add(1, Ordering::AcqRel))
    }

    fn add_message(
        &self,
        id: MessageId,
        metadata: &MessageMetadata,
    ) -> Result<Arc<dyn StoredMessage>, StoreError> {
        if !self.is_open() {
            return Err(StoreError::Closed);
        }

        self.inner.messages.pin().insert(
            id,
            Arc::new(StoredRecord {
                metadata: metadata.clone(),
                content: Mutex::new(Vec::new()),
            }),
        );

        Ok(Arc::new(MemoryStoredMessage {
            id,
            store: Arc::downgrade(&self.inner),
        }))
    }

    fn new_transaction(&self) -> Box<dyn StoreTransaction> {
        Box::new(MemoryStoreTransaction {
            store: Arc::clone(&self.inner),
            operations: Vec::new(),
        })
    }

    fn recover(&self, handler: &mut dyn RecoveryHandler) -> Result<(), StoreError> {
        if !self.is_open() {
            return Err(StoreError::Closed);
        }

        let messages: Vec<(MessageId, Arc<StoredRecord>)> = self
            .inner
            .messages
            .pin()
            .iter()
            .map(|(id, record)| (*id, Arc::clone(record)))
            .collect();

        for (id, record) in messages {
            let content = Bytes::from(record.content.lock().clone());
            handler.stored_message(RecoveredMessage {
                id,
                metadata: record.metadata.clone(),
                content,
                stored: Arc::new(MemoryStoredMessage {
                    id,
                    store: Arc::downgrade(&self.inner),
                }),
            });
        }

        let entries: Vec<(QueueId, MessageId)> =
            self.inner.entries.pin().iter().map(|(k, _)| k.clone()).collect();

        for (queue, message) in entries {
            handler.queue_entry(queue, message);
        }

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            tracing::info!("closing in-memory message store");
            for held in self.inner.held.lock().drain(..) {
                let _ = held.completion.send(Err(StoreError::Closed));
            }
        }
    }
}

struct MemoryStoredMessage {
    id: MessageId,
    store: Weak<Inner>,
}

impl StoredMessage for MemoryStoredMessage {
    fn message_id(&self) -> MessageId {
        self.id
    }

    fn add_content(&self, offset: usize, bytes: &[u8]) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let messages = store.messages.pin();
        if let Some(record) = messages.get(&self.id) {
            let mut content = record.content.lock();
            if content.len() < offset + bytes.len() {
                content.resize(offset + bytes.len(), 0);
            }
            content[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    fn flush_to_store(&self) -> StoreFuture {
        let result = match self.store.upgrade() {
            Some(store) if store.open.load(Ordering::Acquire) => Ok(()),
            _ => Err(StoreError::Closed),
        };
        futures_util::future::ready(result).boxed()
    }

    fn remove(&self) {
        if let Some(store) = self.store.upgrade() {
            store.messages.pin().remove(&self.id);
        }
    }
}

struct MemoryStoreTransaction {
    store: Arc<Inner>,
    operations: Vec<Operation>,
}

impl StoreTransaction for MemoryStoreTransaction {
    fn enqueue_message(&mut self, queue: &QueueId, message: MessageId) {
        self.operations
            .push(Operation::Enqueue(queue.clone(), message));
    }

    fn dequeue_message(&mut self, queue: &QueueId, message: MessageId) {
        self.operations
            .push(Operation::Dequeue(queue.clone(), message));
    }

    fn commit(self: Box<Self>, _durable: bool) -> StoreFuture {
        let store = self.store;

        if !store.open.load(Ordering::Acquire) {
            return futures_util::future::ready(Err(StoreError::Closed)).boxed();
        }

        if store.fail_commits.load(Ordering::Acquire) {
            return futures_util::future::ready(Err(StoreError::CommitFailed {
                message: "injected commit failure".to_owned(),
            }))
            .boxed();
        }

        if store.hold_commits.load(Ordering::Acquire) {
            let (tx, rx) = oneshot::channel();
            store.held.lock().push(HeldCommit {
                operations: self.operations,
                completion: tx,
            });
            return async move { rx.await.unwrap_or(Err(StoreError::Closed)) }.boxed();
        }

        store.apply(self.operations);
        futures_util::future::ready(Ok(())).boxed()
    }

    fn abort(self: Box<Self>) {}
}
