// Per-node changefeed registry.
//
// A node holds one `Registry`. It keeps at most one feed per table: the first
// subscriber of a table builds the feed by registering a private inbox with every
// publisher serving the table, later subscribers of the same table share it.
//
// Locking:
// - The table -> feed map sits behind an async RwLock. Feed creation holds it
//   exclusively across the registration round trips, so a second subscriber of the
//   same table waits and then reuses the new feed instead of registering again.
//   Subscribers of unrelated tables queue behind that creation too; that contention
//   is accepted in exchange for never building duplicate feeds.
// - Each feed keeps its subscriber table behind a parking_lot mutex that is never held
//   across an await.
//
// Ordering:
// - Each feed tracks the next expected stamp per publisher. Older stamps are dropped,
//   skipped stamps are reported to subscribers as `FeedError::MissedMessages`.
// - No order is implied between changes from different publishers.
//
// Shard changes:
// - When one publisher stops or disappears while others remain, the feed asks the
//   topology again and registers with any publisher it does not know yet. Subscribers
//   get `FeedError::SourceLost` either way: changes that went to the old publisher
//   after it stopped, or to the new one before registration, are not replayed.
use ripple_common::ids::{PublisherId, TableId};
use ripple_publisher::PublisherError;
use ripple_transport::TransportError;
use ripple_wire::ChangeEvent;

mod config;
mod feed;
mod registry;
mod stream;
mod topology;

pub use config::RegistryConfig;
pub use registry::Registry;
pub use stream::FeedStream;
pub use topology::{StaticTopology, Topology, TopologyError};

pub type Result<T> = std::result::Result<T, RegistryError>;

/// One item of a feed stream.
pub type FeedItem = std::result::Result<ChangeEvent, FeedError>;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("no publishers serve table {0}")]
    NoPublishers(TableId),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("registration with publisher {publisher} failed")]
    Registration {
        publisher: PublisherId,
        #[source]
        source: PublisherError,
    },
    #[error("registry is shut down")]
    ShutDown,
    #[error("subscribe interrupted by shutdown")]
    Interrupted,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced inside a feed stream. `MissedMessages` and `SourceLost` let the
/// stream go on; every other variant is its last item.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("missed messages from publisher {publisher}: expected stamp {expected}, got {received}")]
    MissedMessages {
        publisher: PublisherId,
        expected: u64,
        received: u64,
    },
    #[error("publisher {publisher} left the feed")]
    SourceLost { publisher: PublisherId },
    #[error("feed aborted: every publisher stopped")]
    Aborted,
    #[error("subscriber queue overflowed")]
    QueueOverflow,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("registry shut down")]
    ShutDown,
}

impl FeedError {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            FeedError::MissedMessages { .. } | FeedError::SourceLost { .. }
        )
    }
}
