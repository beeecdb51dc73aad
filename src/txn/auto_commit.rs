use std::sync::Arc;

use futures_util::FutureExt;

use super::{needs_store, Action, FutureRecorder, ServerTransaction};
use crate::{
    message::Message,
    queue::{Queue, QueueEntry},
    service::Environment,
    store::{MessageStore, StoreError, StoreFuture},
};

/// Commits every operation as soon as it is registered.
///
/// Operations that touch the store hand their durable write to a
/// [`FutureRecorder`]; everything else runs its post-commit action before
/// the call returns.
pub struct AutoCommitTransaction {
    store: Arc<dyn MessageStore>,
    recorder: Arc<dyn FutureRecorder>,
}

impl AutoCommitTransaction {
    pub fn new(store: Arc<dyn MessageStore>, recorder: Arc<dyn FutureRecorder>) -> Self {
        Self { store, recorder }
    }
}

impl ServerTransaction for AutoCommitTransaction {
    fn enqueue(&mut self, queues: &[Arc<Queue>], message: &Arc<Message>, action: Box<dyn Action>) {
        let durable: Vec<&Arc<Queue>> = queues
            .iter()
            .filter(|queue| needs_store(queue, message))
            .collect();

        if durable.is_empty() {
            action.post_commit();
            return;
        }

        let mut txn = self.store.new_transaction();
        for queue in durable {
            txn.enqueue_message(queue.id(), message.id());
        }
        self.recorder.record(txn.commit(true), action);
    }

    fn dequeue(&mut self, entries: &[Arc<QueueEntry>], action: Box<dyn Action>) {
        let durable: Vec<&Arc<QueueEntry>> = entries
            .iter()
            .filter(|entry| {
                entry
                    .queue()
                    .is_some_and(|queue| needs_store(&queue, entry.message()))
            })
            .collect();

        if durable.is_empty() {
            action.post_commit();
            return;
        }

        let mut txn = self.store.new_transaction();
        for entry in durable {
            txn.dequeue_message(entry.queue_id(), entry.message().id());
        }
        self.recorder.record(txn.commit(true), action);
    }

    fn add_post_transaction_action(&mut self, action: Box<dyn Action>) {
        action.post_commit();
    }

    fn is_transactional(&self) -> bool {
        false
    }
}

/// Recorder for work that has no owning channel, such as queue purges and
/// dead-lettering. Ready futures complete inline; pending ones are driven on
/// the current tokio runtime. A fatal failure closes the environment.
#[derive(Clone)]
pub struct DetachedRecorder {
    environment: Arc<Environment>,
}

impl DetachedRecorder {
    pub fn new(environment: Arc<Environment>) -> Self {
        Self { environment }
    }

    fn complete(&self, result: Result<(), StoreError>, action: Box<dyn Action>) {
        match result {
            Ok(()) => action.post_commit(),
            Err(e) => {
                tracing::error!(error = %e, "durable write failed, rolling back");
                action.on_rollback();
                self.environment.fail(&e);
            }
        }
    }
}

impl FutureRecorder for DetachedRecorder {
    fn record(&self, mut future: StoreFuture, action: Box<dyn Action>) {
        if let Some(result) = (&mut future).now_or_never() {
            self.complete(result, action);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let recorder = self.clone();
                handle.spawn(async move {
                    recorder.complete(future.await, action);
                });
            }
            Err(_) => {
                tracing::error!("pending durable write outside of a runtime, rolling back");
                action.on_rollback();
            }
        }
    }
}
