//! In-process cluster used by the node binary.
//!
//! One storage node hosts a publisher per shard of a single table; a query node runs the
//! subscription registry and a handful of consumers. A writer task produces a rolling
//! stream of insert, update and delete changes so the feed path is always busy.
use anyhow::{Context, Result};
use ripple_common::ids::{NodeId, TableId};
use ripple_publisher::{Publisher, PublisherConfig};
use ripple_registry::{FeedStream, Registry, RegistryConfig, StaticTopology};
use ripple_transport::{Transport, TransportConfig};
use ripple_wire::{ChangeEvent, FeedMessage};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::NodeConfig;

// Distinct rows the writer cycles through.
const KEYSPACE: u64 = 16;
// Updates a row receives before it is deleted.
const MAX_VERSION: u64 = 3;

pub struct Demo {
    table: TableId,
    transport: Arc<Transport>,
    publishers: Vec<Arc<Publisher>>,
    registry: Registry,
    consumed: Arc<AtomicU64>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Demo {
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        let limits = config.limits();
        limits.validate().context("validate feed limits")?;
        let transport = Transport::new(TransportConfig::from(&limits));
        let storage_node = NodeId::new();
        let query_node = NodeId::new();
        let table = TableId::new();

        let mut publishers = Vec::with_capacity(config.shards as usize);
        for shard in 0..config.shards {
            let publisher = Publisher::start(
                Arc::clone(&transport),
                storage_node,
                PublisherConfig { table, shard },
            )
            .with_context(|| format!("start publisher for shard {shard}"))?;
            publishers.push(publisher);
        }
        let topology = Arc::new(StaticTopology::new());
        topology.set_publishers(table, publishers.iter().map(|p| p.handle()).collect());

        let registry = Registry::new(
            Arc::clone(&transport),
            query_node,
            topology,
            RegistryConfig::from(&limits),
        );

        let demo = Self {
            table,
            transport,
            publishers,
            registry,
            consumed: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        for consumer in 0..config.consumers {
            let stream = demo
                .registry
                .subscribe(table)
                .await
                .with_context(|| format!("subscribe consumer {consumer}"))?;
            demo.tasks.spawn(consume(
                consumer,
                stream,
                Arc::clone(&demo.consumed),
                demo.cancel.clone(),
            ));
        }
        demo.tasks.spawn(write(
            demo.publishers.clone(),
            Duration::from_millis(config.write_interval_ms),
            demo.cancel.clone(),
        ));
        tracing::info!(
            table = %table,
            shards = config.shards,
            consumers = config.consumers,
            "demo cluster started"
        );
        Ok(demo)
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Changes delivered to consumers so far.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Stops the writer and consumers, then tears down the registry and publishers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.registry.shutdown().await;
        for publisher in &self.publishers {
            publisher.shutdown().await;
        }
        tracing::info!(
            table = %self.table,
            consumed = self.consumed(),
            "demo cluster stopped"
        );
    }
}

async fn consume(
    consumer: usize,
    mut stream: FeedStream,
    consumed: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(change)) => {
                consumed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ripple_demo_changes_consumed_total").increment(1);
                tracing::debug!(consumer, kind = ?change.kind(), "change received");
            }
            Some(Err(err)) if !err.is_terminal() => {
                tracing::warn!(consumer, error = %err, "feed reported a notice");
            }
            Some(Err(err)) => {
                tracing::warn!(consumer, error = %err, "feed ended");
                break;
            }
            None => break,
        }
    }
    stream.detach().await;
}

async fn write(publishers: Vec<Arc<Publisher>>, interval: Duration, cancel: CancellationToken) {
    if publishers.is_empty() {
        return;
    }
    let mut versions: BTreeMap<u64, u64> = BTreeMap::new();
    let mut ticker = tokio::time::interval(interval);
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let key = sequence % KEYSPACE;
        sequence += 1;
        let change = next_change(&mut versions, key);
        let shard = (key % publishers.len() as u64) as usize;
        match publishers[shard]
            .broadcast(FeedMessage::Change(change))
            .await
        {
            Ok(delivered) => {
                tracing::trace!(key, shard, delivered, "change written");
            }
            Err(err) => {
                tracing::warn!(key, shard, error = %err, "change broadcast failed");
            }
        }
    }
}

fn next_change(versions: &mut BTreeMap<u64, u64>, key: u64) -> ChangeEvent {
    match versions.get(&key).copied() {
        None => {
            versions.insert(key, 0);
            ChangeEvent::insert(json!({"id": key, "version": 0}))
        }
        Some(version) if version < MAX_VERSION => {
            versions.insert(key, version + 1);
            ChangeEvent::update(
                json!({"id": key, "version": version}),
                json!({"id": key, "version": version + 1}),
            )
        }
        Some(version) => {
            versions.remove(&key);
            ChangeEvent::delete(json!({"id": key, "version": version}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_wire::ChangeKind;

    #[test]
    fn rows_cycle_through_insert_updates_and_delete() {
        let mut versions = BTreeMap::new();
        let kinds: Vec<ChangeKind> = (0..6)
            .map(|_| next_change(&mut versions, 7).kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::Insert,
                ChangeKind::Update,
                ChangeKind::Update,
                ChangeKind::Update,
                ChangeKind::Delete,
                ChangeKind::Insert,
            ]
        );
    }

    #[test]
    fn update_carries_both_versions() {
        let mut versions = BTreeMap::new();
        next_change(&mut versions, 1);
        let update = next_change(&mut versions, 1);
        assert_eq!(update.old_value(), Some(&json!({"id": 1, "version": 0})));
        assert_eq!(update.new_value(), Some(&json!({"id": 1, "version": 1})));
    }
}
