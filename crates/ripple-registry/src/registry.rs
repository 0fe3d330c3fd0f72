use ahash::RandomState;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use hashbrown::{HashMap, HashSet};
use ripple_common::ids::{NodeId, TableId};
use ripple_publisher::PublisherHandle;
use ripple_transport::Transport;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RegistryConfig;
use crate::feed::{self, Feed, SourceState, Sources};
use crate::stream::FeedStream;
use crate::topology::Topology;
use crate::{FeedError, RegistryError, Result};

/// Per-node subscription registry.
///
/// ```
/// use ripple_common::ids::{NodeId, TableId};
/// use ripple_publisher::{Publisher, PublisherConfig};
/// use ripple_registry::{Registry, RegistryConfig, StaticTopology};
/// use ripple_transport::{Transport, TransportConfig};
/// use ripple_wire::{ChangeEvent, FeedMessage};
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let transport = Transport::new(TransportConfig::default());
///     let node = NodeId::new();
///     let table = TableId::new();
///     let publisher =
///         Publisher::start(transport.clone(), node, PublisherConfig::default()).expect("start");
///     let topology = Arc::new(StaticTopology::new());
///     topology.add_publisher(table, publisher.handle());
///
///     let registry = Registry::new(transport, node, topology, RegistryConfig::default());
///     let mut stream = registry.subscribe(table).await.expect("subscribe");
///     let change = ChangeEvent::insert(serde_json::json!({"id": 1}));
///     publisher
///         .broadcast(FeedMessage::Change(change.clone()))
///         .await
///         .expect("broadcast");
///     assert_eq!(stream.next().await, Some(Ok(change)));
///
///     stream.detach().await;
///     assert_eq!(registry.feed_count().await, 0);
///     registry.shutdown().await;
///     publisher.shutdown().await;
/// });
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    node: NodeId,
    transport: Arc<Transport>,
    topology: Arc<dyn Topology>,
    config: RegistryConfig,
    feeds: RwLock<HashMap<TableId, Arc<Feed>, RandomState>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for RegistryInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryInner")
            .field("node", &self.node)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl Registry {
    pub fn new(
        transport: Arc<Transport>,
        node: NodeId,
        topology: Arc<dyn Topology>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                node,
                transport,
                topology,
                config,
                feeds: RwLock::new(HashMap::with_hasher(RandomState::new())),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    /// Attaches a new local subscriber to `table`, building the table's feed first when
    /// this node has none. Creation is all-or-nothing: if it fails or the caller goes
    /// away, no feed is left behind and every publisher drops the registration.
    pub async fn subscribe(&self, table: TableId) -> Result<FeedStream> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(RegistryError::ShutDown);
        }
        {
            let feeds = inner.feeds.read().await;
            if let Some(feed) = feeds.get(&table)
                && !feed.is_terminated()
            {
                return Ok(self.attach(feed));
            }
        }

        let mut feeds = tokio::select! {
            _ = inner.shutdown.cancelled() => return Err(RegistryError::Interrupted),
            feeds = inner.feeds.write() => feeds,
        };
        if let Some(feed) = feeds.get(&table) {
            if !feed.is_terminated() {
                // Built by whoever held the lock before us.
                return Ok(self.attach(feed));
            }
            // Ended but its inbox task has not cleaned up yet.
            feeds.remove(&table);
        }
        let feed = tokio::select! {
            _ = inner.shutdown.cancelled() => return Err(RegistryError::Interrupted),
            feed = inner.create_feed(table) => feed?,
        };
        let stream = self.attach(&feed);
        feeds.insert(table, feed);
        metrics::gauge!("ripple_feeds_active").set(feeds.len() as f64);
        Ok(stream)
    }

    /// Detaches `stream`; see [`FeedStream::detach`].
    pub async fn detach(&self, stream: FeedStream) {
        stream.detach().await;
    }

    pub async fn feed_count(&self) -> usize {
        self.inner.feeds.read().await.len()
    }

    pub async fn has_feed(&self, table: TableId) -> bool {
        self.inner.feeds.read().await.contains_key(&table)
    }

    /// Local subscribers currently attached to `table`'s feed.
    pub async fn subscriber_count(&self, table: TableId) -> usize {
        let feeds = self.inner.feeds.read().await;
        feeds.get(&table).map_or(0, |feed| feed.subscriber_count())
    }

    /// Interrupts pending subscribes, ends every feed with `FeedError::ShutDown`,
    /// unregisters them from their publishers and waits for every registry task.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let feeds: Vec<Arc<Feed>> = {
            let mut feeds = inner.feeds.write().await;
            let drained = feeds.drain().map(|(_, feed)| feed).collect();
            metrics::gauge!("ripple_feeds_active").set(0.0);
            drained
        };
        for feed in &feeds {
            feed.end(FeedError::ShutDown);
        }
        join_all(feeds.iter().map(|feed| feed.unregister(&inner.transport))).await;
        for feed in &feeds {
            feed.close();
        }
        inner.tasks.close();
        inner.tasks.wait().await;
        tracing::info!(node = %inner.node, feeds = feeds.len(), "registry shut down");
    }

    fn attach(&self, feed: &Arc<Feed>) -> FeedStream {
        let attachment = feed.attach();
        FeedStream::new(Arc::clone(feed), Arc::downgrade(&self.inner), attachment)
    }
}

impl RegistryInner {
    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    // Runs with the feed map locked exclusively.
    async fn create_feed(self: &Arc<Self>, table: TableId) -> Result<Arc<Feed>> {
        let mut handles = self.topology.publishers(table).await?;
        let mut seen = HashSet::with_hasher(RandomState::new());
        handles.retain(|handle| seen.insert(handle.id()));
        if handles.is_empty() {
            return Err(RegistryError::NoPublishers(table));
        }

        let inbox = self.transport.open_mailbox(self.node)?;
        let address = inbox.address();
        let transport = &self.transport;
        let mut pending: FuturesUnordered<_> = handles
            .iter()
            .map(|handle| async move { (*handle, handle.add_client(transport, address).await) })
            .collect();
        let mut sources = Sources::with_hasher(RandomState::new());
        let mut failure = None;
        while let Some((handle, result)) = pending.next().await {
            match result {
                Ok(stamp) => {
                    sources.insert(handle.id(), SourceState::new(handle, stamp));
                }
                Err(err) => {
                    tracing::warn!(
                        table = %table,
                        publisher = %handle.id(),
                        error = %err,
                        "feed registration failed"
                    );
                    failure.get_or_insert((handle.id(), err));
                }
            }
        }
        drop(pending);

        if let Some((publisher, source)) = failure {
            let registered: Vec<PublisherHandle> = handles
                .iter()
                .filter(|handle| sources.contains_key(&handle.id()))
                .copied()
                .collect();
            for handle in registered {
                let _ = handle.request_removal(&self.transport, address).await;
            }
            return Err(RegistryError::Registration { publisher, source });
        }

        let feed = Arc::new(Feed::new(
            table,
            address,
            handles,
            self.config.subscriber_queue_capacity,
            self.shutdown.child_token(),
        ));
        self.tasks.spawn(feed::run_inbox(
            Arc::clone(&feed),
            inbox,
            sources,
            Arc::clone(&self.transport),
            Arc::clone(&self.topology),
            Arc::downgrade(self),
        ));
        tracing::info!(
            table = %table,
            inbox = %feed.inbox(),
            publishers = feed.sources().len(),
            "feed created"
        );
        Ok(feed)
    }

    /// Removes one subscriber and, when it was the last one, retires the feed: erase it
    /// from the map, unregister from every publisher, stop its inbox task.
    pub(crate) async fn detach_subscriber(&self, feed: &Arc<Feed>, subscriber: u64) {
        if !feed.release(subscriber) {
            return;
        }
        if !self.retire_idle(feed).await {
            return;
        }
        let table = feed.table();
        feed.unregister(&self.transport).await;
        feed.close();
        tracing::info!(table = %table, "feed retired");
    }

    /// Erases a feed left without subscribers from the map. Returns false when the map
    /// holds another feed for the table or a subscriber attached in the meantime.
    pub(crate) async fn retire_idle(&self, feed: &Arc<Feed>) -> bool {
        let mut feeds = self.feeds.write().await;
        let table = feed.table();
        let current = feeds
            .get(&table)
            .is_some_and(|existing| Arc::ptr_eq(existing, feed));
        // A subscriber may have attached while we waited for the lock.
        if current && feed.retire() {
            feeds.remove(&table);
            metrics::gauge!("ripple_feeds_active").set(feeds.len() as f64);
            true
        } else {
            false
        }
    }

    /// Drops the map entry of a feed that ended on its own.
    pub(crate) async fn forget(&self, feed: &Arc<Feed>) {
        let mut feeds = self.feeds.write().await;
        let table = feed.table();
        if feeds
            .get(&table)
            .is_some_and(|existing| Arc::ptr_eq(existing, feed))
        {
            feeds.remove(&table);
            metrics::gauge!("ripple_feeds_active").set(feeds.len() as f64);
        }
    }
}
