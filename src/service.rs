use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Instant,
};

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    channel::{Channel, DeliveryStream},
    config::Config,
    error::{Error, Result},
    message::{Message, MessageId, MessageMetadata},
    queue::{Queue, QueueId, QueueSettings, QueueStatistics},
    store::{MemoryMessageStore, MessageStore, RecoveredMessage, RecoveryHandler, StoreError},
};

/// State shared by every channel of a virtual host.
pub struct Environment {
    store: Arc<dyn MessageStore>,
    closed: AtomicBool,
}

impl Environment {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        Arc::clone(&self.store)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() || !self.store.is_open() {
            return Err(Error::EnvironmentClosed);
        }
        Ok(())
    }

    /// Shuts the environment down if `error` leaves the store unusable.
    pub fn fail(&self, error: &StoreError) {
        if error.is_fatal() && !self.closed.swap(true, Ordering::AcqRel) {
            tracing::error!(error = %error, "fatal message store error, shutting down");
            self.store.close();
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.store.close();
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub messages: usize,
    pub entries: usize,
    /// Entries for queues that no longer exist, dequeued from the store.
    pub orphaned_entries: usize,
    /// Stored messages no recovered entry refers to, removed from the store.
    pub removed_messages: usize,
}

#[derive(Default)]
struct RecoveryCollector {
    messages: HashMap<MessageId, RecoveredMessage>,
    entries: Vec<(QueueId, MessageId)>,
}

impl RecoveryHandler for RecoveryCollector {
    fn stored_message(&mut self, message: RecoveredMessage) {
        self.messages.insert(message.id, message);
    }

    fn queue_entry(&mut self, queue: QueueId, message: MessageId) {
        self.entries.push((queue, message));
    }
}

pub struct VirtualHost {
    environment: Arc<Environment>,
    config: Config,
    queues: papaya::HashMap<String, Arc<Queue>>,
    channels: papaya::HashMap<u64, Arc<Channel>>,
    next_channel: AtomicU64,
}

#[bon::bon]
impl VirtualHost {
    pub fn connect() -> Arc<Self> {
        Self::connect_with().call()
    }

    #[builder]
    pub fn connect_with(
        #[builder(default)] config: Config,
        store: Option<Arc<dyn MessageStore>>,
    ) -> Arc<Self> {
        let store = store.unwrap_or_else(|| Arc::new(MemoryMessageStore::new()));

        Arc::new(Self {
            environment: Arc::new(Environment::new(store)),
            config,
            queues: papaya::HashMap::new(),
            channels: papaya::HashMap::new(),
            next_channel: AtomicU64::new(1),
        })
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        self.environment.store()
    }

    /// Declares a queue. Unset limits fall back to the host configuration.
    pub fn create_queue(&self, mut settings: QueueSettings) -> Result<Arc<Queue>> {
        self.environment.ensure_open()?;

        if settings.max_delivery_count == 0 {
            settings.max_delivery_count = self.config.max_delivery_count();
        }
        if settings.flow_control_size == 0 {
            let (size, resume) = self.config.queue_flow_limits();
            settings.flow_control_size = size;
            settings.flow_resume_size = resume;
        }

        let name = settings.name.clone();
        let queue = Queue::new(settings, Arc::clone(&self.environment));

        if self.queues.pin().try_insert(name.clone(), Arc::clone(&queue)).is_err() {
            return Err(Error::QueueExists { queue: name });
        }

        tracing::info!(queue = %name, durable = queue.is_durable(), "created queue");
        Ok(queue)
    }

    pub fn get_queue(&self, name: impl AsRef<str>) -> Result<Arc<Queue>> {
        let name = name.as_ref();
        self.queues
            .pin()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::queue_not_found(name))
    }

    /// Removes a queue, closing its consumers. Returns the number of
    /// entries discarded.
    pub fn delete_queue(&self, name: impl AsRef<str>) -> Result<usize> {
        let name = name.as_ref();
        let queue = self
            .queues
            .pin()
            .remove(name)
            .cloned()
            .ok_or_else(|| Error::queue_not_found(name))?;

        Ok(queue.delete())
    }

    pub fn purge_queue(&self, name: impl AsRef<str>) -> Result<usize> {
        Ok(self.get_queue(name)?.purge())
    }

    pub fn list_queues(&self) -> Vec<QueueStatistics> {
        let mut stats: Vec<QueueStatistics> = self
            .queues
            .pin()
            .values()
            .map(|queue| queue.statistics())
            .collect();
        stats.sort_by(|a, b| a.queue.cmp(&b.queue));
        stats
    }

    /// Creates a message, writing persistent ones to the store first.
    #[builder]
    pub async fn create_message(
        &self,
        #[builder(into)] content: Bytes,
        #[builder(default, into)] routing_key: String,
        #[builder(default)] headers: HashMap<String, String>,
        #[builder(default)] persistent: bool,
        connection_id: Option<u64>,
    ) -> Result<Arc<Message>> {
        self.environment.ensure_open()?;

        let store = self.environment.store();
        let id = store.next_message_id();
        let arrival = Utc::now();

        let stored = if persistent {
            let metadata = MessageMetadata {
                routing_key: routing_key.clone(),
                headers: headers.clone(),
                persistent,
                connection_id,
                arrival,
            };
            let stored = store.add_message(id, &metadata)?;
            stored.add_content(0, &content);
            if let Err(e) = stored.flush_to_store().await {
                self.environment.fail(&e);
                return Err(e.into());
            }
            Some(stored)
        } else {
            None
        };

        Ok(Arc::new(
            Message::builder()
                .id(id)
                .content(content)
                .routing_key(routing_key)
                .headers(headers)
                .persistent(persistent)
                .maybe_connection_id(connection_id)
                .arrival(arrival)
                .maybe_stored(stored)
                .build(),
        ))
    }

    pub fn open_channel(&self, connection_id: u64) -> Result<(Arc<Channel>, DeliveryStream)> {
        self.environment.ensure_open()?;

        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let (channel, deliveries) =
            Channel::new(id, connection_id, Arc::clone(&self.environment), &self.config);
        self.channels.pin().insert(id, Arc::clone(&channel));

        tracing::debug!(channel = id, connection = connection_id, "opened channel");
        Ok((channel, deliveries))
    }

    pub fn channel(&self, id: u64) -> Option<Arc<Channel>> {
        self.channels.pin().get(&id).cloned()
    }

    pub async fn close_channel(&self, id: u64) -> Result<()> {
        let channel = self
            .channels
            .pin()
            .remove(&id)
            .cloned()
            .ok_or(Error::ChannelClosed)?;

        channel.close().await;
        Ok(())
    }

    /// Replays the store: recreates entries of declared queues, dequeues
    /// entries of queues that no longer exist and removes stored messages
    /// nothing refers to.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let store = self.environment.store();

        let mut collector = RecoveryCollector::default();
        store.recover(&mut collector)?;

        let mut report = RecoveryReport {
            messages: collector.messages.len(),
            ..Default::default()
        };

        let mut messages: HashMap<MessageId, Arc<Message>> = collector
            .messages
            .into_values()
            .map(|recovered| {
                let metadata = recovered.metadata;
                let message = Message::builder()
                    .id(recovered.id)
                    .content(recovered.content)
                    .routing_key(metadata.routing_key)
                    .headers(metadata.headers)
                    .persistent(metadata.persistent)
                    .maybe_connection_id(metadata.connection_id)
                    .arrival(metadata.arrival)
                    .stored(recovered.stored)
                    .build();
                (recovered.id, Arc::new(message))
            })
            .collect();

        let mut orphans = store.new_transaction();
        let mut referenced = HashSet::new();

        for (queue_id, message_id) in collector.entries {
            let Some(message) = messages.get(&message_id) else {
                tracing::warn!(queue = %queue_id, message = %message_id, "entry for unknown message");
                orphans.dequeue_message(&queue_id, message_id);
                report.orphaned_entries += 1;
                continue;
            };

            match self.get_queue(queue_id.as_str()) {
                Ok(queue) => {
                    queue.recover_entry(Arc::clone(message));
                    referenced.insert(message_id);
                    report.entries += 1;
                }
                Err(_) => {
                    tracing::warn!(queue = %queue_id, message = %message_id, "entry for undeclared queue");
                    orphans.dequeue_message(&queue_id, message_id);
                    report.orphaned_entries += 1;
                }
            }
        }

        if let Err(e) = orphans.commit(true).await {
            self.environment.fail(&e);
            return Err(e.into());
        }

        messages.retain(|id, _| !referenced.contains(id));
        for message in messages.values() {
            if let Some(stored) = message.stored() {
                stored.remove();
                report.removed_messages += 1;
            }
        }

        tracing::info!(
            messages = report.messages,
            entries = report.entries,
            orphaned = report.orphaned_entries,
            removed = report.removed_messages,
            "recovered message store"
        );
        Ok(report)
    }

    /// Closes channels whose local transaction exceeded its limits. Returns
    /// how many were closed.
    pub async fn check_transaction_timeouts(&self) -> usize {
        let now = Instant::now();

        let expired: Vec<u64> = self
            .channels
            .pin()
            .values()
            .filter_map(|channel| match channel.check_transaction_timeout(now) {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(channel = channel.id(), error = %e, "closing channel");
                    Some(channel.id())
                }
            })
            .collect();

        for id in &expired {
            let _ = self.close_channel(*id).await;
        }
        expired.len()
    }

    /// Periodically enforces transaction timeouts until the host is closed
    /// or dropped.
    pub fn spawn_housekeeping(self: &Arc<Self>) -> JoinHandle<()> {
        let host: Weak<Self> = Arc::downgrade(self);
        let period = self.config.housekeeping_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                interval.tick().await;

                let Some(host) = host.upgrade() else {
                    break;
                };
                if host.environment.is_closed() {
                    break;
                }
                host.check_transaction_timeouts().await;
            }

            tracing::debug!("housekeeping stopped");
        })
    }

    pub async fn close(&self) {
        let channels: Vec<u64> = self.channels.pin().keys().copied().collect();
        for id in channels {
            let _ = self.close_channel(id).await;
        }

        self.environment.close();
        tracing::info!("virtual host closed");
    }
}
