//! Message types shared by queues, subscriptions and the store.
//!
//! A [`Message`] is immutable once created. Each queue that holds it keeps an
//! entry referencing the same `Arc<Message>`; the message counts those
//! references and removes its stored copy when the last one is dropped.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::StoredMessage;

/// Store-assigned identifier of a message, unique per store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routing-independent metadata carried with every message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub routing_key: String,
    pub headers: HashMap<String, String>,
    /// Persistent messages are written to the store when enqueued on a durable queue.
    pub persistent: bool,
    /// Connection the message was published on, used for no-local filtering.
    pub connection_id: Option<u64>,
    pub arrival: DateTime<Utc>,
}

pub struct Message {
    id: MessageId,
    metadata: MessageMetadata,
    content: Bytes,
    stored: Option<Arc<dyn StoredMessage>>,
    references: AtomicUsize,
}

#[bon::bon]
impl Message {
    #[builder]
    pub fn new(
        id: MessageId,
        #[builder(into)] content: Bytes,
        #[builder(default, into)] routing_key: String,
        #[builder(default)] headers: HashMap<String, String>,
        #[builder(default)] persistent: bool,
        connection_id: Option<u64>,
        arrival: Option<DateTime<Utc>>,
        stored: Option<Arc<dyn StoredMessage>>,
    ) -> Self {
        Self {
            id,
            metadata: MessageMetadata {
                routing_key,
                headers,
                persistent,
                connection_id,
                arrival: arrival.unwrap_or_else(Utc::now),
            },
            content,
            stored,
            references: AtomicUsize::new(0),
        }
    }
}

impl Message {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn is_persistent(&self) -> bool {
        self.metadata.persistent
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(String::as_str)
    }

    pub fn stored(&self) -> Option<&Arc<dyn StoredMessage>> {
        self.stored.as_ref()
    }

    pub fn reference_count(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    pub(crate) fn add_reference(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one queue reference. The stored copy is removed with the last one.
    pub(crate) fn remove_reference(&self) {
        let previous = self
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);

        if previous == 1 {
            if let Some(stored) = &self.stored {
                tracing::debug!(message = %self.id, "removing unreferenced message from store");
                stored.remove();
            }
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("persistent", &self.metadata.persistent)
            .field("references", &self.reference_count())
            .finish()
    }
}
