use std::sync::{Arc, Weak};

use crate::{message::Message, queue::Queue};

/// Routes a message to the queues that should receive it. Used as the
/// alternate exchange of a queue for dead-lettering.
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    fn route(&self, message: &Message) -> Vec<Arc<Queue>>;
}

/// Routes every message to a fixed set of queues. Deleted queues are
/// skipped.
pub struct FixedRoute {
    name: String,
    queues: Vec<Weak<Queue>>,
}

impl FixedRoute {
    pub fn new<'a>(
        name: impl Into<String>,
        queues: impl IntoIterator<Item = &'a Arc<Queue>>,
    ) -> Self {
        Self {
            name: name.into(),
            queues: queues.into_iter().map(Arc::downgrade).collect(),
        }
    }
}

impl Exchange for FixedRoute {
    fn name(&self) -> &str {
        &self.name
    }

    fn route(&self, _message: &Message) -> Vec<Arc<Queue>> {
        self.queues
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|queue| !queue.is_deleted())
            .collect()
    }
}
