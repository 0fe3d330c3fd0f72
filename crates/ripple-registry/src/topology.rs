// Which publishers serve a table.
use ahash::RandomState;
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use ripple_common::ids::TableId;
use ripple_publisher::PublisherHandle;

#[derive(thiserror::Error, Debug)]
pub enum TopologyError {
    #[error("table {0} is unknown")]
    UnknownTable(TableId),
    #[error("topology unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a table to the publishers currently serving its shards.
///
/// A feed resolves once at creation. When the shard set changes later, the old
/// publishers stop and subscribers have to subscribe again.
#[async_trait]
pub trait Topology: Send + Sync {
    async fn publishers(&self, table: TableId) -> Result<Vec<PublisherHandle>, TopologyError>;
}

/// In-memory topology.
///
/// ```
/// use ripple_common::{MailboxAddress, ids::{NodeId, PublisherId, TableId}};
/// use ripple_publisher::PublisherHandle;
/// use ripple_registry::{StaticTopology, Topology};
///
/// let topology = StaticTopology::new();
/// let table = TableId::new();
/// let handle = PublisherHandle::new(PublisherId::new(), MailboxAddress::new(NodeId::new(), 1));
/// topology.add_publisher(table, handle);
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// let found = rt.block_on(topology.publishers(table)).expect("lookup");
/// assert_eq!(found, vec![handle]);
/// ```
#[derive(Debug, Default)]
pub struct StaticTopology {
    tables: RwLock<HashMap<TableId, Vec<PublisherHandle>, RandomState>>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_publishers(&self, table: TableId, publishers: Vec<PublisherHandle>) {
        self.tables.write().insert(table, publishers);
    }

    pub fn add_publisher(&self, table: TableId, publisher: PublisherHandle) {
        self.tables.write().entry(table).or_default().push(publisher);
    }

    pub fn remove_table(&self, table: TableId) -> bool {
        self.tables.write().remove(&table).is_some()
    }
}

#[async_trait]
impl Topology for StaticTopology {
    async fn publishers(&self, table: TableId) -> Result<Vec<PublisherHandle>, TopologyError> {
        self.tables
            .read()
            .get(&table)
            .cloned()
            .ok_or(TopologyError::UnknownTable(table))
    }
}
