// In-process mailbox transport: addressable inboxes, one-way at-most-once sends and
// per-mailbox liveness signals.
use ahash::RandomState;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use ripple_common::{FeedLimits, MailboxAddress, ids::NodeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("mailbox {0} is unreachable")]
    Unreachable(MailboxAddress),
    #[error("node {0} is disconnected")]
    NodeDisconnected(NodeId),
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("mailbox {0} is full")]
    MailboxFull(MailboxAddress),
}

/// Transport-level configuration defaults.
///
/// ```
/// use ripple_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_frame_bytes > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
    pub mailbox_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&FeedLimits::default())
    }
}

impl From<&FeedLimits> for TransportConfig {
    fn from(limits: &FeedLimits) -> Self {
        Self {
            max_frame_bytes: limits.max_frame_bytes,
            mailbox_capacity: limits.mailbox_capacity.max(1),
        }
    }
}

#[derive(Debug)]
struct MailboxEntry {
    sender: mpsc::Sender<Bytes>,
    lost: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct TransportState {
    mailboxes: HashMap<MailboxAddress, MailboxEntry, RandomState>,
    disconnected: HashSet<NodeId, RandomState>,
}

/// Shared message fabric connecting every node of an in-process cluster.
///
/// ```
/// use bytes::Bytes;
/// use ripple_common::ids::NodeId;
/// use ripple_transport::{Transport, TransportConfig};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let transport = Transport::new(TransportConfig::default());
///     let mut inbox = transport.open_mailbox(NodeId::new()).expect("mailbox");
///     transport
///         .send(&inbox.address(), Bytes::from_static(b"hello"))
///         .await
///         .expect("send");
///     assert_eq!(inbox.recv().await, Some(Bytes::from_static(b"hello")));
/// });
/// ```
#[derive(Debug)]
pub struct Transport {
    config: TransportConfig,
    // Mailbox table; held only for lookups and bookkeeping, never across a send.
    state: Mutex<TransportState>,
    next_mailbox: AtomicU64,
    weak_self: Weak<Transport>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            state: Mutex::new(TransportState::default()),
            next_mailbox: AtomicU64::new(1),
            weak_self: weak_self.clone(),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn open_mailbox(&self, node: NodeId) -> Result<Mailbox> {
        let mut state = self.state.lock();
        if state.disconnected.contains(&node) {
            return Err(TransportError::NodeDisconnected(node));
        }
        let address = MailboxAddress::new(node, self.next_mailbox.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.config.mailbox_capacity);
        let (lost, _) = watch::channel(false);
        state.mailboxes.insert(address, MailboxEntry { sender, lost });
        Ok(Mailbox {
            address,
            receiver,
            transport: self.weak_self.clone(),
        })
    }

    /// Sends one frame to `to`. Delivery is in sender order while the mailbox lives; a
    /// closed or disconnected mailbox fails the send and the frame is lost.
    pub async fn send(&self, to: &MailboxAddress, frame: Bytes) -> Result<()> {
        let sender = self.sender_for(to, frame.len())?;
        sender.send(frame).await.map_err(|_| {
            metrics::counter!("ripple_transport_send_failed_total").increment(1);
            TransportError::Unreachable(*to)
        })
    }

    /// Like `send`, but fails with `MailboxFull` instead of waiting for room.
    pub fn try_send(&self, to: &MailboxAddress, frame: Bytes) -> Result<()> {
        let sender = self.sender_for(to, frame.len())?;
        sender.try_send(frame).map_err(|err| {
            metrics::counter!("ripple_transport_send_failed_total").increment(1);
            match err {
                mpsc::error::TrySendError::Full(_) => TransportError::MailboxFull(*to),
                mpsc::error::TrySendError::Closed(_) => TransportError::Unreachable(*to),
            }
        })
    }

    fn sender_for(&self, to: &MailboxAddress, len: usize) -> Result<mpsc::Sender<Bytes>> {
        if len > self.config.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.config.max_frame_bytes,
            });
        }
        let sender = {
            let state = self.state.lock();
            if state.disconnected.contains(&to.node()) {
                None
            } else {
                state.mailboxes.get(to).map(|entry| entry.sender.clone())
            }
        };
        sender.ok_or_else(|| {
            metrics::counter!("ripple_transport_send_failed_total").increment(1);
            TransportError::Unreachable(*to)
        })
    }

    /// Signal that fires once `address` can no longer receive. Unknown addresses are
    /// reported as already lost.
    pub fn liveness(&self, address: &MailboxAddress) -> Liveness {
        let state = self.state.lock();
        match state.mailboxes.get(address) {
            Some(entry) if !state.disconnected.contains(&address.node()) => {
                Liveness::new(entry.lost.subscribe())
            }
            _ => Liveness::lost_already(),
        }
    }

    pub fn is_reachable(&self, address: &MailboxAddress) -> bool {
        let state = self.state.lock();
        !state.disconnected.contains(&address.node()) && state.mailboxes.contains_key(address)
    }

    /// Drops connectivity to `node`: every mailbox on it closes, every liveness signal
    /// for it fires, and later sends to it fail until `reconnect_node`.
    pub fn disconnect_node(&self, node: NodeId) {
        let closed = {
            let mut state = self.state.lock();
            state.disconnected.insert(node);
            let doomed: Vec<MailboxAddress> = state
                .mailboxes
                .keys()
                .filter(|address| address.node() == node)
                .copied()
                .collect();
            doomed
                .into_iter()
                .filter_map(|address| state.mailboxes.remove(&address))
                .collect::<Vec<_>>()
        };
        tracing::info!(node = %node, mailboxes = closed.len(), "node disconnected");
        for entry in closed {
            entry.lost.send_replace(true);
        }
    }

    pub fn reconnect_node(&self, node: NodeId) {
        self.state.lock().disconnected.remove(&node);
    }

    pub fn mailbox_count(&self) -> usize {
        self.state.lock().mailboxes.len()
    }

    fn close_mailbox(&self, address: &MailboxAddress) {
        let entry = self.state.lock().mailboxes.remove(address);
        if let Some(entry) = entry {
            entry.lost.send_replace(true);
        }
    }
}

/// Receiving end of an addressable inbox. Dropping it closes the address.
#[derive(Debug)]
pub struct Mailbox {
    address: MailboxAddress,
    receiver: mpsc::Receiver<Bytes>,
    transport: Weak<Transport>,
}

impl Mailbox {
    pub fn address(&self) -> MailboxAddress {
        self.address
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Bytes, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.close_mailbox(&self.address);
        }
    }
}

/// Connectivity signal for one mailbox.
#[derive(Debug, Clone)]
pub struct Liveness {
    receiver: watch::Receiver<bool>,
}

impl Liveness {
    fn new(receiver: watch::Receiver<bool>) -> Self {
        Self { receiver }
    }

    fn lost_already() -> Self {
        let (_, receiver) = watch::channel(true);
        Self { receiver }
    }

    pub fn is_lost(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Resolves once the mailbox is gone.
    pub async fn lost(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                // Sender dropped without a final value: the entry is gone either way.
                return;
            }
        }
    }
}
