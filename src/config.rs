use std::time::Duration;

use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Outstanding async commits a channel tolerates before it waits for them.
    pub commit_backlog_threshold: Option<usize>,
    /// Run post-commit actions as soon as their durable write resolves.
    pub eager_commit_completion: Option<bool>,
    /// Default for queues that do not set their own limit. 0 means unlimited.
    pub max_delivery_count: Option<u32>,

    pub transaction_open_warn_secs: Option<u64>,
    pub transaction_open_close_secs: Option<u64>,
    pub transaction_idle_warn_secs: Option<u64>,
    pub transaction_idle_close_secs: Option<u64>,

    pub housekeeping_interval_secs: Option<u64>,

    pub queue_flow_control_size_bytes: Option<u64>,
    pub queue_flow_resume_size_bytes: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("COURIER_").from_env::<Self>()?)
    }

    pub fn commit_backlog_threshold(&self) -> usize {
        self.commit_backlog_threshold.unwrap_or(128)
    }

    pub fn eager_commit_completion(&self) -> bool {
        self.eager_commit_completion.unwrap_or(true)
    }

    pub fn max_delivery_count(&self) -> u32 {
        self.max_delivery_count.unwrap_or(0)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs.unwrap_or(10).max(1))
    }

    pub fn transaction_timeouts(&self) -> TransactionTimeouts {
        let secs = |v: Option<u64>| v.filter(|s| *s > 0).map(Duration::from_secs);

        TransactionTimeouts {
            open_warn: secs(self.transaction_open_warn_secs),
            open_close: secs(self.transaction_open_close_secs),
            idle_warn: secs(self.transaction_idle_warn_secs),
            idle_close: secs(self.transaction_idle_close_secs),
        }
    }

    /// `(flow_control_size, flow_resume_size)` in bytes, 0 disables.
    pub fn queue_flow_limits(&self) -> (u64, u64) {
        let size = self.queue_flow_control_size_bytes.unwrap_or(0);
        let resume = self.queue_flow_resume_size_bytes.unwrap_or(size);
        (size, resume.min(size))
    }
}

/// Thresholds applied to local transactions. `None` disables a check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransactionTimeouts {
    pub open_warn: Option<Duration>,
    pub open_close: Option<Duration>,
    pub idle_warn: Option<Duration>,
    pub idle_close: Option<Duration>,
}
