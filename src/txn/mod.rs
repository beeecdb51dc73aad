//! Server-side transactions grouping enqueues and dequeues.
//!
//! Every enqueue or dequeue is paired with an [`Action`]: `post_commit` runs
//! once the durable write has completed, `on_rollback` runs instead if the
//! work is abandoned. Exactly one of the two runs for every action.

use std::sync::Arc;

use crate::{
    message::Message,
    queue::{Queue, QueueEntry},
    store::StoreFuture,
};

pub mod auto_commit;
pub mod local;

pub use auto_commit::{AutoCommitTransaction, DetachedRecorder};
pub use local::LocalTransaction;

/// Deferred work registered against a transaction.
pub trait Action: Send {
    fn post_commit(self: Box<Self>);

    fn on_rollback(self: Box<Self>);
}

struct FnAction<P, R> {
    post_commit: P,
    on_rollback: R,
}

impl<P, R> Action for FnAction<P, R>
where
    P: FnOnce() + Send,
    R: FnOnce() + Send,
{
    fn post_commit(self: Box<Self>) {
        (self.post_commit)()
    }

    fn on_rollback(self: Box<Self>) {
        (self.on_rollback)()
    }
}

/// Builds an [`Action`] from a pair of closures.
pub fn action<P, R>(post_commit: P, on_rollback: R) -> Box<dyn Action>
where
    P: FnOnce() + Send + 'static,
    R: FnOnce() + Send + 'static,
{
    Box::new(FnAction {
        post_commit,
        on_rollback,
    })
}

/// Runs several actions as one, preserving registration order.
pub(crate) struct ActionList(pub(crate) Vec<Box<dyn Action>>);

impl Action for ActionList {
    fn post_commit(self: Box<Self>) {
        for action in self.0 {
            action.post_commit();
        }
    }

    fn on_rollback(self: Box<Self>) {
        for action in self.0 {
            action.on_rollback();
        }
    }
}

/// Receives `(durable write, action)` pairs whose completion is deferred.
pub trait FutureRecorder: Send + Sync {
    fn record(&self, future: StoreFuture, action: Box<dyn Action>);
}

pub trait ServerTransaction: Send {
    /// Registers the enqueue of `message` onto every queue in `queues`.
    fn enqueue(&mut self, queues: &[Arc<Queue>], message: &Arc<Message>, action: Box<dyn Action>);

    /// Registers the dequeue of `entries` from their queues.
    fn dequeue(&mut self, entries: &[Arc<QueueEntry>], action: Box<dyn Action>);

    /// Registers an action with no store work of its own.
    fn add_post_transaction_action(&mut self, action: Box<dyn Action>);

    fn is_transactional(&self) -> bool;
}

/// Standard enqueue action: makes `message` visible on each queue once the
/// enqueue is durable.
pub fn enqueue_action(
    queues: &[Arc<Queue>],
    message: &Arc<Message>,
    transactional: bool,
) -> Box<dyn Action> {
    let queues = queues.to_vec();
    let message = Arc::clone(message);
    action(
        move || {
            for queue in &queues {
                queue.enqueue(Arc::clone(&message), transactional, None);
            }
        },
        || {},
    )
}

/// Whether the message must be written to the store for this queue.
pub(crate) fn needs_store(queue: &Queue, message: &Message) -> bool {
    queue.is_durable() && message.is_persistent()
}
