// Per-shard change publisher.
// A publisher owns the destinations registered for one shard and fans every change out
// to them as stamped frames. Each destination sees its own gapless stamp sequence.
use ahash::RandomState;
use hashbrown::HashMap;
use ripple_common::MailboxAddress;
use ripple_common::ids::{NodeId, PublisherId, TableId};
use ripple_transport::{Liveness, Transport, TransportError};
use ripple_wire::{FeedMessage, WireError, binary};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

mod control;
mod handle;

pub use handle::PublisherHandle;

pub type Result<T> = std::result::Result<T, PublisherError>;

#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("destination {0} is already registered")]
    AlreadyRegistered(MailboxAddress),
    #[error("publisher {0} is stopped")]
    Stopped(PublisherId),
    #[error("destination {0} is unreachable")]
    DestinationUnreachable(MailboxAddress),
    #[error("publisher {0} is unavailable")]
    Unavailable(PublisherId),
    #[error("publisher rejected request: {0}")]
    Rejected(String),
    #[error("unexpected control reply for request {0}")]
    UnexpectedReply(u64),
    #[error("operation interrupted by shutdown")]
    Interrupted,
    #[error("message of {len} bytes exceeds frame limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Identity of the shard a publisher serves. Only used for logs and metrics labels.
#[derive(Debug, Clone, Default)]
pub struct PublisherConfig {
    pub table: TableId,
    pub shard: u32,
}

#[derive(Debug)]
struct ClientInfo {
    // Distinguishes this registration from an earlier one for the same address.
    registration: u64,
    next_stamp: AtomicU64,
    stop: watch::Sender<bool>,
}

/// Publisher for one shard.
///
/// ```
/// use ripple_common::ids::NodeId;
/// use ripple_publisher::{Publisher, PublisherConfig};
/// use ripple_transport::{Transport, TransportConfig};
/// use ripple_wire::{ChangeEvent, FeedMessage};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let transport = Transport::new(TransportConfig::default());
///     let node = NodeId::new();
///     let publisher =
///         Publisher::start(transport.clone(), node, PublisherConfig::default()).expect("start");
///     let inbox = transport.open_mailbox(node).expect("inbox");
///     let stamp = publisher.add_client(inbox.address()).await.expect("add");
///     assert_eq!(stamp, 0);
///     let change = ChangeEvent::insert(serde_json::json!({"id": 1}));
///     let delivered = publisher
///         .broadcast(FeedMessage::Change(change))
///         .await
///         .expect("broadcast");
///     assert_eq!(delivered, 1);
///     publisher.shutdown().await;
/// });
/// ```
#[derive(Debug)]
pub struct Publisher {
    id: PublisherId,
    config: PublisherConfig,
    transport: Arc<Transport>,
    control: MailboxAddress,
    // Registration and removal take this exclusively, broadcast and lookups share it.
    clients: RwLock<HashMap<MailboxAddress, ClientInfo, RandomState>>,
    // Held for a whole broadcast so stamps follow call order.
    send_order: Mutex<()>,
    // Advanced by every broadcast; new destinations start counting from here.
    generation: AtomicU64,
    next_registration: AtomicU64,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Publisher {
    /// Opens the control mailbox on `node` and starts serving control requests.
    pub fn start(
        transport: Arc<Transport>,
        node: NodeId,
        config: PublisherConfig,
    ) -> Result<Arc<Self>> {
        let mailbox = transport.open_mailbox(node)?;
        let publisher = Arc::new(Self {
            id: PublisherId::new(),
            config,
            transport,
            control: mailbox.address(),
            clients: RwLock::new(HashMap::with_hasher(RandomState::new())),
            send_order: Mutex::new(()),
            generation: AtomicU64::new(0),
            next_registration: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        publisher.tasks.spawn(control::serve(
            Arc::downgrade(&publisher),
            mailbox,
            publisher.shutdown.clone(),
        ));
        tracing::info!(
            publisher = %publisher.id,
            table = %publisher.config.table,
            shard = publisher.config.shard,
            control = %publisher.control,
            "publisher started"
        );
        Ok(publisher)
    }

    pub fn id(&self) -> PublisherId {
        self.id
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Address registries use to reach this publisher.
    pub fn handle(&self) -> PublisherHandle {
        PublisherHandle::new(self.id, self.control)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Registers `destination` and returns the first stamp it will receive.
    pub async fn add_client(self: &Arc<Self>, destination: MailboxAddress) -> Result<u64> {
        let mut clients = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(PublisherError::Interrupted),
            clients = self.clients.write() => clients,
        };
        if self.is_stopped() {
            return Err(PublisherError::Stopped(self.id));
        }
        if clients.contains_key(&destination) {
            return Err(PublisherError::AlreadyRegistered(destination));
        }
        let liveness = self.transport.liveness(&destination);
        if liveness.is_lost() {
            return Err(PublisherError::DestinationUnreachable(destination));
        }
        // Broadcasts advance the generation under the shared lock, so it is stable here.
        let stamp = self.generation.load(Ordering::Acquire);
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let (stop, stop_rx) = watch::channel(false);
        clients.insert(
            destination,
            ClientInfo {
                registration,
                next_stamp: AtomicU64::new(stamp),
                stop,
            },
        );
        self.record_destinations(clients.len());
        drop(clients);

        self.watch_destination(destination, registration, stop_rx, liveness);
        tracing::debug!(
            publisher = %self.id,
            destination = %destination,
            stamp,
            "destination registered"
        );
        Ok(stamp)
    }

    /// Unregisters `destination`. Returns whether it was registered.
    pub async fn remove_client(&self, destination: MailboxAddress) -> bool {
        let removed = {
            let mut clients = self.clients.write().await;
            let removed = clients.remove(&destination);
            self.record_destinations(clients.len());
            removed
        };
        let Some(info) = removed else {
            return false;
        };
        info.stop.send_replace(true);
        tracing::debug!(publisher = %self.id, destination = %destination, "destination removed");
        true
    }

    /// Sends `message` to every registered destination, stamped per destination, and
    /// returns how many sends succeeded. Never waits on a destination: one whose send
    /// fails or whose mailbox is full is removed, and a full one is sent `Stop` once it
    /// has room again.
    pub async fn broadcast(&self, message: FeedMessage) -> Result<usize> {
        // Encode once; only the stamp differs between destinations.
        let template = binary::encode_stamped(self.id, 0, &message)?;
        let max = self.transport.config().max_frame_bytes;
        if template.len() > max {
            return Err(PublisherError::MessageTooLarge {
                len: template.len(),
                max,
            });
        }

        let _order = self.send_order.lock().await;
        if self.is_stopped() {
            return Err(PublisherError::Stopped(self.id));
        }
        let mut delivered = 0usize;
        let mut failed = Vec::new();
        {
            let clients = self.clients.read().await;
            self.generation.fetch_add(1, Ordering::AcqRel);
            for (destination, info) in clients.iter() {
                let stamp = info.next_stamp.fetch_add(1, Ordering::AcqRel);
                let frame = binary::restamp(&template, stamp)?;
                match self.transport.try_send(destination, frame) {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        tracing::debug!(
                            publisher = %self.id,
                            destination = %destination,
                            stamp,
                            error = %err,
                            "send failed"
                        );
                        failed.push((*destination, info.registration, stamp, err));
                    }
                }
            }
        }
        for (destination, registration, stamp, err) in failed {
            match err {
                TransportError::MailboxFull(_) => {
                    if self
                        .evict(destination, registration, "mailbox full")
                        .await
                    {
                        // The lost frame leaves a gap the receiver will see before Stop.
                        self.deliver_stop(destination, stamp + 1);
                    }
                }
                _ => {
                    self.evict(destination, registration, "send failed").await;
                }
            }
        }
        metrics::counter!("ripple_broadcast_total").increment(1);
        Ok(delivered)
    }

    /// Sends `Stop` to every destination and refuses later registrations. Returns how
    /// many destinations were stopped.
    pub async fn stop_all(&self) -> usize {
        let _order = self.send_order.lock().await;
        let drained: Vec<(MailboxAddress, ClientInfo)> = {
            let mut clients = self.clients.write().await;
            self.stopped.store(true, Ordering::Release);
            let drained = clients.drain().collect();
            self.record_destinations(0);
            drained
        };
        for (destination, info) in &drained {
            self.deliver_stop(*destination, info.next_stamp.load(Ordering::Acquire));
            info.stop.send_replace(true);
        }
        if !drained.is_empty() {
            tracing::info!(
                publisher = %self.id,
                destinations = drained.len(),
                "stopped all destinations"
            );
        }
        drained.len()
    }

    /// Next stamp that would be issued to `destination`, if it is registered.
    pub async fn get_stamp(&self, destination: &MailboxAddress) -> Option<u64> {
        let clients = self.clients.read().await;
        clients
            .get(destination)
            .map(|info| info.next_stamp.load(Ordering::Acquire))
    }

    pub async fn destination_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Stops every destination, ends the control loop and waits for every task this
    /// publisher spawned.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!(publisher = %self.id, "publisher shut down");
    }

    // Removes the destination when its mailbox goes away before it unregisters.
    fn watch_destination(
        self: &Arc<Self>,
        destination: MailboxAddress,
        registration: u64,
        mut stop: watch::Receiver<bool>,
        mut liveness: Liveness,
    ) {
        let publisher: Weak<Publisher> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                // Explicit removal or stop_all already erased the entry.
                _ = stop.changed() => return,
                _ = shutdown.cancelled() => return,
                _ = liveness.lost() => {}
            }
            if let Some(publisher) = publisher.upgrade() {
                publisher
                    .evict(destination, registration, "destination lost")
                    .await;
            }
        });
    }

    // Returns whether this call removed the registration.
    async fn evict(
        &self,
        destination: MailboxAddress,
        registration: u64,
        reason: &'static str,
    ) -> bool {
        let evicted = {
            let mut clients = self.clients.write().await;
            if !clients
                .get(&destination)
                .is_some_and(|info| info.registration == registration)
            {
                return false;
            }
            let evicted = clients.remove(&destination);
            self.record_destinations(clients.len());
            evicted
        };
        let Some(info) = evicted else {
            return false;
        };
        info.stop.send_replace(true);
        metrics::counter!("ripple_destination_dropped_total", "reason" => reason).increment(1);
        tracing::debug!(
            publisher = %self.id,
            destination = %destination,
            reason,
            "destination dropped"
        );
        true
    }

    // Sends `Stop` at `stamp` without blocking the caller. A full mailbox gets it from
    // a background task once there is room, unless the mailbox or publisher goes first.
    fn deliver_stop(&self, destination: MailboxAddress, stamp: u64) {
        let frame = match binary::encode_stamped(self.id, stamp, &FeedMessage::Stop) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(publisher = %self.id, error = %err, "failed to encode stop");
                return;
            }
        };
        match self.transport.try_send(&destination, frame.clone()) {
            Ok(()) => {}
            Err(TransportError::MailboxFull(_)) => {
                let transport = Arc::clone(&self.transport);
                let mut liveness = transport.liveness(&destination);
                let shutdown = self.shutdown.clone();
                self.tasks.spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = liveness.lost() => {}
                        result = transport.send(&destination, frame) => {
                            if let Err(err) = result {
                                tracing::debug!(
                                    destination = %destination,
                                    error = %err,
                                    "deferred stop not delivered"
                                );
                            }
                        }
                    }
                });
            }
            Err(err) => {
                tracing::debug!(
                    publisher = %self.id,
                    destination = %destination,
                    error = %err,
                    "stop not delivered"
                );
            }
        }
    }

    fn record_destinations(&self, count: usize) {
        metrics::gauge!("ripple_publisher_destinations", "publisher" => self.id.to_string())
            .set(count as f64);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
