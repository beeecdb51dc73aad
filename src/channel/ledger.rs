//! Outstanding asynchronous commits of one channel.
//!
//! Auto-commit work that needs the store records its durable write here
//! together with its action. Actions always run in submission order, even
//! when the store completes writes out of order: a later write that is done
//! waits for every earlier one. In eager mode a background task completes
//! writes as they resolve.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    task::Poll,
};

use futures_util::{future, FutureExt};
use parking_lot::Mutex;

use crate::{
    store::{StoreError, StoreFuture},
    txn::{Action, FutureRecorder},
};

/// Called with every failed write after its rollback has run.
pub type FailureHook = Box<dyn Fn(&StoreError) + Send + Sync>;

struct PendingCommit {
    future: StoreFuture,
    action: Box<dyn Action>,
}

pub struct CommitLedger {
    pending: Mutex<VecDeque<PendingCommit>>,
    /// Held by whoever is completing entries, so actions never interleave.
    completion: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
    /// Set while a driver task owns completion of pending writes.
    driving: AtomicBool,
    error: Mutex<Option<StoreError>>,
    threshold: usize,
    eager: bool,
    on_failure: Option<FailureHook>,
    weak_self: Weak<CommitLedger>,
}

impl CommitLedger {
    pub fn new(threshold: usize, eager: bool, on_failure: Option<FailureHook>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            pending: Mutex::new(VecDeque::new()),
            completion: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
            driving: AtomicBool::new(false),
            error: Mutex::new(None),
            threshold,
            eager,
            on_failure,
            weak_self: weak_self.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Whether the backlog is large enough that the channel should wait.
    pub fn needs_sync(&self) -> bool {
        self.len() > self.threshold
    }

    /// Runs the actions of every leading write that has already completed.
    pub fn complete_ready(&self) {
        let Ok(_token) = self.completion.try_lock() else {
            self.rerun.store(true, Ordering::Release);
            return;
        };

        loop {
            let ready = self.take_ready();
            if ready.is_empty() && !self.rerun.swap(false, Ordering::AcqRel) {
                break;
            }
            for (result, action) in ready {
                self.finish(result, action);
            }
        }
    }

    fn take_ready(&self) -> Vec<(Result<(), StoreError>, Box<dyn Action>)> {
        let mut pending = self.pending.lock();
        let mut ready = Vec::new();

        while let Some(front) = pending.front_mut() {
            let Some(result) = (&mut front.future).now_or_never() else {
                break;
            };
            if let Some(commit) = pending.pop_front() {
                ready.push((result, commit.action));
            }
        }

        ready
    }

    /// Spawns a task that completes pending writes as they resolve. Without a
    /// runtime the writes complete at the next [`Self::sync`].
    fn drive(&self) {
        if self.driving.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = tokio::runtime::Handle::try_current();
        match (self.weak_self.upgrade(), handle) {
            (Some(ledger), Ok(handle)) => {
                handle.spawn(ledger.drive_pending());
            }
            _ => self.driving.store(false, Ordering::SeqCst),
        }
    }

    async fn drive_pending(self: Arc<Self>) {
        loop {
            {
                let _token = self.completion.lock().await;
                while let Some(result) = self.front_resolved().await {
                    let commit = self.pending.lock().pop_front();
                    if let Some(commit) = commit {
                        self.finish(result, commit.action);
                    }
                }
            }

            self.driving.store(false, Ordering::SeqCst);
            // A write recorded after the last check found the driver still running.
            if self.pending.lock().is_empty() || self.driving.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Resolves once the oldest write completes. `None` when nothing is pending.
    async fn front_resolved(&self) -> Option<Result<(), StoreError>> {
        future::poll_fn(|cx| {
            let mut pending = self.pending.lock();
            match pending.front_mut() {
                Some(front) => front.future.poll_unpin(cx).map(Some),
                None => Poll::Ready(None),
            }
        })
        .await
    }

    /// Waits for every outstanding write and runs its action. Returns the
    /// first failure seen since the previous sync.
    pub async fn sync(&self) -> Result<(), StoreError> {
        let _token = self.completion.lock().await;

        loop {
            let next = self.pending.lock().pop_front();
            let Some(PendingCommit { future, action }) = next else {
                break;
            };
            let result = future.await;
            self.finish(result, action);
        }
        self.rerun.store(false, Ordering::Release);

        match self.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn finish(&self, result: Result<(), StoreError>, action: Box<dyn Action>) {
        match result {
            Ok(()) => action.post_commit(),
            Err(e) => {
                tracing::error!(error = %e, "asynchronous commit failed, rolling back");
                action.on_rollback();
                if let Some(hook) = &self.on_failure {
                    hook(&e);
                }
                self.error.lock().get_or_insert(e);
            }
        }
    }
}

impl FutureRecorder for CommitLedger {
    fn record(&self, future: StoreFuture, action: Box<dyn Action>) {
        let backlog = {
            let mut pending = self.pending.lock();
            pending.push_back(PendingCommit { future, action });
            pending.len()
        };

        if self.eager || backlog > self.threshold {
            self.complete_ready();
        }
        if self.eager && !self.is_empty() {
            self.drive();
        }
    }
}

impl std::fmt::Debug for CommitLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLedger")
            .field("pending", &self.len())
            .field("threshold", &self.threshold)
            .field("eager", &self.eager)
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}
