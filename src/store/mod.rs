//! Contract between the delivery core and the durable message store.
//!
//! The core never assumes a particular persistence engine. It opens store
//! transactions to record enqueues and dequeues of persistent messages on
//! durable queues, and replays the store once at startup through
//! [`MessageStore::recover`].

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use snafu::Snafu;

use crate::{
    message::{MessageId, MessageMetadata},
    queue::QueueId,
};

pub mod memory;

pub use memory::MemoryMessageStore;

/// Resolves once a durable write has completed (or failed).
pub type StoreFuture = BoxFuture<'static, Result<(), StoreError>>;

#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("Message store is closed"))]
    Closed,

    #[snafu(display("Commit failed: {message}"))]
    CommitFailed { message: String },

    #[snafu(display("Unknown message {id}"))]
    UnknownMessage { id: MessageId },
}

impl StoreError {
    /// A fatal error means the store can no longer be used at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Handle to a message's durable copy.
pub trait StoredMessage: Send + Sync {
    fn message_id(&self) -> MessageId;

    fn add_content(&self, offset: usize, bytes: &[u8]);

    fn flush_to_store(&self) -> StoreFuture;

    fn remove(&self);
}

/// A unit of store work. Only the server transaction that opened a handle
/// writes against it.
pub trait StoreTransaction: Send {
    fn enqueue_message(&mut self, queue: &QueueId, message: MessageId);

    fn dequeue_message(&mut self, queue: &QueueId, message: MessageId);

    fn commit(self: Box<Self>, durable: bool) -> StoreFuture;

    fn abort(self: Box<Self>);
}

/// A message replayed from the store during recovery.
pub struct RecoveredMessage {
    pub id: MessageId,
    pub metadata: MessageMetadata,
    pub content: Bytes,
    pub stored: Arc<dyn StoredMessage>,
}

/// Callbacks driven by [`MessageStore::recover`]. Every stored message is
/// visited before any queue entry.
pub trait RecoveryHandler {
    fn stored_message(&mut self, message: RecoveredMessage);

    fn queue_entry(&mut self, queue: QueueId, message: MessageId);
}

pub trait MessageStore: Send + Sync + 'static {
    fn next_message_id(&self) -> MessageId;

    fn add_message(
        &self,
        id: MessageId,
        metadata: &MessageMetadata,
    ) -> Result<Arc<dyn StoredMessage>, StoreError>;

    fn new_transaction(&self) -> Box<dyn StoreTransaction>;

    fn recover(&self, handler: &mut dyn RecoveryHandler) -> Result<(), StoreError>;

    fn is_open(&self) -> bool;

    fn close(&self);
}
