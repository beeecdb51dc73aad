use snafu::Snafu;

use crate::store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unknown delivery tag {tag}"))]
    UnknownDeliveryTag { tag: u64 },

    #[snafu(display("Channel is not transactional"))]
    NotTransactional,

    #[snafu(display("Transaction has already been committed or rolled back"))]
    TransactionCompleted,

    #[snafu(display("Transaction timed out: {reason}"))]
    TransactionTimeout { reason: String },

    #[snafu(display("Error returned from message store"))]
    Store {
        #[snafu(source)]
        source: StoreError,
    },

    #[snafu(display("Channel is closed"))]
    ChannelClosed,

    #[snafu(display("Queue {queue} not found"))]
    QueueNotFound { queue: String },

    #[snafu(display("Queue {queue} already exists"))]
    QueueExists { queue: String },

    #[snafu(display("Consumer tag {tag} already in use on this channel"))]
    ConsumerTagInUse { tag: String },

    #[snafu(display("Unknown consumer tag {tag}"))]
    UnknownConsumer { tag: String },

    #[snafu(display("Queue {queue} has an exclusive consumer conflict"))]
    ExclusiveConsumerConflict { queue: String },

    #[snafu(display("Virtual host has been closed"))]
    EnvironmentClosed,

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<StoreError> for Error {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl Error {
    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    pub fn unknown_consumer(tag: impl Into<String>) -> Self {
        Self::UnknownConsumer { tag: tag.into() }
    }

    /// Whether the failure leaves the channel usable. Protocol-usage errors
    /// are reported back to the peer without tearing the channel down.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::UnknownDeliveryTag { .. }
            | Self::NotTransactional
            | Self::TransactionCompleted
            | Self::ConsumerTagInUse { .. }
            | Self::UnknownConsumer { .. }
            | Self::ExclusiveConsumerConflict { .. }
            | Self::QueueNotFound { .. }
            | Self::QueueExists { .. } => true,

            Self::Store { source } => !source.is_fatal(),

            Self::TransactionTimeout { .. }
            | Self::ChannelClosed
            | Self::EnvironmentClosed
            | Self::InternalServerError { .. }
            | Self::Whatever { .. } => false,
        }
    }
}
