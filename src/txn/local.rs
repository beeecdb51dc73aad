use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use strum::Display;

use super::{needs_store, Action, ServerTransaction};
use crate::{
    error::{Error, Result},
    message::Message,
    queue::{Queue, QueueEntry},
    store::{MessageStore, StoreTransaction},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum TransactionState {
    Open,
    /// The durable write failed. Only `rollback` is permitted.
    Failed,
    Committed,
    RolledBack,
}

/// An explicit transaction: nothing is observable until [`Self::commit`].
pub struct LocalTransaction {
    store: Arc<dyn MessageStore>,
    store_txn: Option<Box<dyn StoreTransaction>>,
    actions: Vec<Box<dyn Action>>,
    state: TransactionState,
    started_at: Option<Instant>,
    last_activity: Option<Instant>,
}

impl LocalTransaction {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            store_txn: None,
            actions: Vec::new(),
            state: TransactionState::Open,
            started_at: None,
            last_activity: None,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Time since the first operation was registered.
    pub fn open_duration(&self, now: Instant) -> Option<Duration> {
        self.started_at.map(|t| now.saturating_duration_since(t))
    }

    /// Time since the most recent operation was registered.
    pub fn idle_duration(&self, now: Instant) -> Option<Duration> {
        self.last_activity.map(|t| now.saturating_duration_since(t))
    }

    fn touch(&mut self) {
        let now = Instant::now();
        self.started_at.get_or_insert(now);
        self.last_activity = Some(now);
    }

    fn store_txn(&mut self) -> &mut Box<dyn StoreTransaction> {
        let store = &self.store;
        self.store_txn.get_or_insert_with(|| store.new_transaction())
    }

    /// Writes the registered operations durably, then runs every post-commit
    /// action in registration order.
    ///
    /// If the durable write fails no action runs, the transaction moves to
    /// [`TransactionState::Failed`] and the caller must roll it back.
    pub async fn commit(&mut self) -> Result<()> {
        if self.state != TransactionState::Open {
            return Err(Error::TransactionCompleted);
        }

        if let Some(txn) = self.store_txn.take() {
            if let Err(e) = txn.commit(true).await {
                tracing::error!(error = %e, "transaction commit failed");
                self.state = TransactionState::Failed;
                return Err(e.into());
            }
        }

        self.state = TransactionState::Committed;
        for action in self.actions.drain(..) {
            action.post_commit();
        }

        Ok(())
    }

    /// Abandons the transaction and runs every rollback action in
    /// registration order.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Open | TransactionState::Failed => {}
            TransactionState::Committed | TransactionState::RolledBack => {
                return Err(Error::TransactionCompleted)
            }
        }

        if let Some(txn) = self.store_txn.take() {
            txn.abort();
        }

        self.state = TransactionState::RolledBack;
        for action in self.actions.drain(..) {
            action.on_rollback();
        }

        Ok(())
    }
}

impl ServerTransaction for LocalTransaction {
    fn enqueue(&mut self, queues: &[Arc<Queue>], message: &Arc<Message>, action: Box<dyn Action>) {
        self.touch();

        for queue in queues.iter().filter(|queue| needs_store(queue, message)) {
            self.store_txn().enqueue_message(queue.id(), message.id());
        }

        self.actions.push(action);
    }

    fn dequeue(&mut self, entries: &[Arc<QueueEntry>], action: Box<dyn Action>) {
        self.touch();

        for entry in entries {
            let durable = entry
                .queue()
                .is_some_and(|queue| needs_store(&queue, entry.message()));
            if durable {
                self.store_txn()
                    .dequeue_message(entry.queue_id(), entry.message().id());
            }
        }

        self.actions.push(action);
    }

    fn add_post_transaction_action(&mut self, action: Box<dyn Action>) {
        self.touch();
        self.actions.push(action);
    }

    fn is_transactional(&self) -> bool {
        true
    }
}

impl Drop for LocalTransaction {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            tracing::warn!(
                actions = self.actions.len(),
                "dropping unfinished transaction, rolling back"
            );
            if let Some(txn) = self.store_txn.take() {
                txn.abort();
            }
            for action in self.actions.drain(..) {
                action.on_rollback();
            }
        }
    }
}
