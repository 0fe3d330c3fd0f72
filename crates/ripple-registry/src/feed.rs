// One table's feed: the inbox every publisher of the table sends to, the per-publisher
// stamp bookkeeping, and the local subscriber fan-out.
use ahash::RandomState;
use futures::future::{BoxFuture, join_all};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use ripple_common::MailboxAddress;
use ripple_common::ids::{PublisherId, TableId};
use ripple_publisher::PublisherHandle;
use ripple_transport::{Mailbox, Transport};
use ripple_wire::{ChangeEvent, FeedMessage, StampedMessage, binary};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::registry::RegistryInner;
use crate::topology::Topology;
use crate::{FeedError, FeedItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    // At least one subscriber, or a subscriber about to attach.
    Active,
    // Last subscriber left; removal from the registry map is pending.
    Draining,
    // Erased from the registry map.
    Removed,
    // Every publisher stopped, the inbox failed, or the registry shut down.
    Terminated,
}

#[derive(Debug)]
struct Subscriber {
    sender: mpsc::Sender<FeedItem>,
    terminal: Arc<OnceLock<FeedError>>,
}

#[derive(Debug)]
struct FeedState {
    lifecycle: Lifecycle,
    subscribers: HashMap<u64, Subscriber, RandomState>,
    next_subscriber: u64,
    ended: Option<FeedError>,
}

/// Receiving half handed to a new local subscriber.
#[derive(Debug)]
pub(crate) struct Attachment {
    pub(crate) id: u64,
    pub(crate) receiver: mpsc::Receiver<FeedItem>,
    pub(crate) terminal: Arc<OnceLock<FeedError>>,
}

#[derive(Debug)]
pub(crate) struct Feed {
    table: TableId,
    inbox: MailboxAddress,
    // Grows when a replacement publisher joins a live feed.
    sources: Mutex<Vec<PublisherHandle>>,
    queue_capacity: usize,
    state: Mutex<FeedState>,
    closed: CancellationToken,
}

impl Feed {
    pub(crate) fn new(
        table: TableId,
        inbox: MailboxAddress,
        sources: Vec<PublisherHandle>,
        queue_capacity: usize,
        closed: CancellationToken,
    ) -> Self {
        Self {
            table,
            inbox,
            sources: Mutex::new(sources),
            queue_capacity: queue_capacity.max(1),
            state: Mutex::new(FeedState {
                lifecycle: Lifecycle::Active,
                subscribers: HashMap::with_hasher(RandomState::new()),
                next_subscriber: 1,
                ended: None,
            }),
            closed,
        }
    }

    pub(crate) fn table(&self) -> TableId {
        self.table
    }

    pub(crate) fn inbox(&self) -> MailboxAddress {
        self.inbox
    }

    pub(crate) fn sources(&self) -> Vec<PublisherHandle> {
        self.sources.lock().clone()
    }

    fn add_source(&self, handle: PublisherHandle) {
        self.sources.lock().push(handle);
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.lifecycle() == Lifecycle::Terminated
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    // Left without subscribers and not yet taken out of the registry.
    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.lifecycle == Lifecycle::Draining && state.subscribers.is_empty()
    }

    /// Adds a local subscriber. Attaching to a feed that already ended hands back a
    /// stream that yields the end reason and nothing else.
    pub(crate) fn attach(&self) -> Attachment {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let terminal = Arc::new(OnceLock::new());
        let mut state = self.state.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        match state.lifecycle {
            Lifecycle::Active | Lifecycle::Draining => {
                state.lifecycle = Lifecycle::Active;
                state.subscribers.insert(
                    id,
                    Subscriber {
                        sender,
                        terminal: Arc::clone(&terminal),
                    },
                );
            }
            Lifecycle::Removed | Lifecycle::Terminated => {
                let reason = state.ended.clone().unwrap_or(FeedError::Aborted);
                let _ = terminal.set(reason);
            }
        }
        Attachment {
            id,
            receiver,
            terminal,
        }
    }

    /// Drops one subscriber. Returns true when the feed is left without subscribers and
    /// should be retired.
    pub(crate) fn release(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        state.subscribers.remove(&id);
        if state.subscribers.is_empty() && state.lifecycle == Lifecycle::Active {
            state.lifecycle = Lifecycle::Draining;
        }
        state.lifecycle == Lifecycle::Draining && state.subscribers.is_empty()
    }

    /// Moves a draining feed with no subscribers to `Removed`. Called with the registry
    /// map locked exclusively.
    pub(crate) fn retire(&self) -> bool {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Draining && state.subscribers.is_empty() {
            state.lifecycle = Lifecycle::Removed;
            return true;
        }
        false
    }

    /// Ends the stream of every subscriber with `reason`. Each subscriber sees it once,
    /// after whatever it already has queued.
    pub(crate) fn end(&self, reason: FeedError) -> usize {
        let mut state = self.state.lock();
        if matches!(state.lifecycle, Lifecycle::Removed | Lifecycle::Terminated) {
            return 0;
        }
        state.lifecycle = Lifecycle::Terminated;
        state.ended = Some(reason.clone());
        let notified = state.subscribers.len();
        for (_, subscriber) in state.subscribers.drain() {
            let _ = subscriber.terminal.set(reason.clone());
        }
        notified
    }

    /// Stops the inbox task.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Unregisters the inbox from every publisher and waits for each to confirm or to be
    /// gone.
    pub(crate) async fn unregister(&self, transport: &Transport) {
        let inbox = self.inbox;
        let sources = self.sources();
        let results = join_all(sources.iter().map(|handle| async move {
            (handle.id(), handle.remove_client(transport, inbox).await)
        }))
        .await;
        for (publisher, result) in results {
            if let Err(err) = result {
                tracing::debug!(
                    table = %self.table,
                    publisher = %publisher,
                    error = %err,
                    "unregister skipped"
                );
            }
        }
    }

    // `notice` is a non-terminal error delivered just ahead of `change`.
    fn publish(&self, notice: Option<FeedError>, change: Option<ChangeEvent>) {
        let count = usize::from(notice.is_some()) + usize::from(change.is_some());
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        if state.subscribers.is_empty() {
            return;
        }
        let mut overflowed = Vec::new();
        let mut closed = Vec::new();
        for (id, subscriber) in state.subscribers.iter() {
            // Reserve both slots up front so a gap marker never lands without its change.
            match subscriber.sender.try_reserve_many(count) {
                Ok(mut permits) => {
                    if let Some(notice) = &notice
                        && let Some(permit) = permits.next()
                    {
                        permit.send(Err(notice.clone()));
                    }
                    if let Some(change) = &change
                        && let Some(permit) = permits.next()
                    {
                        permit.send(Ok(change.clone()));
                    }
                }
                Err(TrySendError::Full(())) => overflowed.push(*id),
                Err(TrySendError::Closed(())) => closed.push(*id),
            }
        }
        for id in overflowed {
            if let Some(subscriber) = state.subscribers.remove(&id) {
                let _ = subscriber.terminal.set(FeedError::QueueOverflow);
                metrics::counter!("ripple_subscriber_overflow_total").increment(1);
                tracing::warn!(table = %self.table, subscriber = id, "subscriber queue overflowed");
            }
        }
        for id in closed {
            state.subscribers.remove(&id);
        }
        if state.subscribers.is_empty() && state.lifecycle == Lifecycle::Active {
            state.lifecycle = Lifecycle::Draining;
        }
    }
}

/// Stamp bookkeeping for one publisher of a feed.
#[derive(Debug)]
pub(crate) struct SourceState {
    handle: PublisherHandle,
    expected: u64,
    stopped: bool,
}

impl SourceState {
    pub(crate) fn new(handle: PublisherHandle, first_stamp: u64) -> Self {
        Self {
            handle,
            expected: first_stamp,
            stopped: false,
        }
    }
}

pub(crate) type Sources = HashMap<PublisherId, SourceState, RandomState>;

enum Step {
    Continue,
    // A publisher stopped while others are still live.
    SourceStopped(PublisherId),
    Ended(FeedError),
}

/// Reads the feed inbox until the feed is closed, retired or ends on its own.
pub(crate) async fn run_inbox(
    feed: Arc<Feed>,
    mut inbox: Mailbox,
    mut sources: Sources,
    transport: Arc<Transport>,
    topology: Arc<dyn Topology>,
    registry: Weak<RegistryInner>,
) {
    let mut lost: FuturesUnordered<BoxFuture<'static, PublisherId>> = sources
        .values()
        .map(|source| watch_source(&source.handle, &transport))
        .collect();

    let reason = loop {
        let step = tokio::select! {
            // Frames already queued are handled before a publisher's disappearance.
            biased;
            _ = feed.closed.cancelled() => return,
            frame = inbox.recv() => match frame {
                Some(frame) => match binary::decode_stamped_bytes(frame) {
                    Ok(message) => apply(&feed, &mut sources, message),
                    Err(err) => {
                        metrics::counter!("ripple_protocol_errors_total", "side" => "feed")
                            .increment(1);
                        tracing::warn!(table = %feed.table, error = %err, "malformed feed frame");
                        Step::Ended(FeedError::Protocol(err.to_string()))
                    }
                },
                // The inbox itself went away with its node.
                None => Step::Ended(FeedError::Aborted),
            },
            Some(publisher) = lost.next(), if !lost.is_empty() => {
                stop_source(&feed, &mut sources, publisher, "publisher unreachable")
            }
        };
        match step {
            Step::Continue => {}
            Step::SourceStopped(publisher) => {
                let added = tokio::select! {
                    _ = feed.closed.cancelled() => return,
                    added = join_new_sources(&feed, &mut sources, &transport, topology.as_ref()) => added,
                };
                for handle in added {
                    lost.push(watch_source(&handle, &transport));
                }
                feed.publish(Some(FeedError::SourceLost { publisher }), None);
            }
            Step::Ended(reason) => break reason,
        }
        if feed.is_idle()
            && let Some(registry) = registry.upgrade()
            && registry.retire_idle(&feed).await
        {
            // Every subscriber was cut off; nobody is left to detach the feed.
            feed.unregister(&transport).await;
            feed.close();
            tracing::info!(table = %feed.table, "feed retired without subscribers");
            return;
        }
    };

    let notified = feed.end(reason.clone());
    tracing::info!(table = %feed.table, reason = %reason, subscribers = notified, "feed ended");
    for source in sources.values().filter(|source| !source.stopped) {
        let _ = source.handle.request_removal(&transport, feed.inbox).await;
    }
    drop(inbox);
    if let Some(registry) = registry.upgrade() {
        registry.forget(&feed).await;
    }
}

fn watch_source(handle: &PublisherHandle, transport: &Transport) -> BoxFuture<'static, PublisherId> {
    let publisher = handle.id();
    let mut liveness = handle.liveness(transport);
    async move {
        liveness.lost().await;
        publisher
    }
    .boxed()
}

// Registers the feed with publishers the topology now lists for the table but the feed
// has never seen, and returns the ones that accepted.
async fn join_new_sources(
    feed: &Feed,
    sources: &mut Sources,
    transport: &Transport,
    topology: &dyn Topology,
) -> Vec<PublisherHandle> {
    let handles = match topology.publishers(feed.table).await {
        Ok(handles) => handles,
        Err(err) => {
            tracing::warn!(table = %feed.table, error = %err, "publisher lookup failed");
            return Vec::new();
        }
    };
    let mut seen = HashSet::with_hasher(RandomState::new());
    let fresh: Vec<PublisherHandle> = handles
        .into_iter()
        .filter(|handle| !sources.contains_key(&handle.id()) && seen.insert(handle.id()))
        .collect();
    let inbox = feed.inbox;
    let results = join_all(fresh.iter().map(|handle| async move {
        (*handle, handle.add_client(transport, inbox).await)
    }))
    .await;

    let mut added = Vec::new();
    for (handle, result) in results {
        match result {
            Ok(stamp) => {
                sources.insert(handle.id(), SourceState::new(handle, stamp));
                feed.add_source(handle);
                added.push(handle);
                tracing::info!(table = %feed.table, publisher = %handle.id(), "publisher joined feed");
            }
            Err(err) => {
                tracing::warn!(
                    table = %feed.table,
                    publisher = %handle.id(),
                    error = %err,
                    "publisher join failed"
                );
            }
        }
    }
    added
}

fn apply(feed: &Feed, sources: &mut Sources, message: StampedMessage) -> Step {
    let Some(source) = sources.get_mut(&message.source_id) else {
        tracing::warn!(
            table = %feed.table,
            publisher = %message.source_id,
            "message from unregistered publisher"
        );
        return Step::Continue;
    };
    if source.stopped || message.stamp < source.expected {
        metrics::counter!("ripple_feed_stale_dropped_total").increment(1);
        tracing::debug!(
            table = %feed.table,
            publisher = %message.source_id,
            stamp = message.stamp,
            expected = source.expected,
            "stale message dropped"
        );
        return Step::Continue;
    }
    let gap = (message.stamp > source.expected).then(|| FeedError::MissedMessages {
        publisher: message.source_id,
        expected: source.expected,
        received: message.stamp,
    });
    if gap.is_some() {
        metrics::counter!("ripple_feed_gaps_total").increment(1);
    }
    source.expected = message.stamp.saturating_add(1);
    match message.payload {
        FeedMessage::Change(change) => {
            feed.publish(gap, Some(change));
            Step::Continue
        }
        FeedMessage::Stop => {
            feed.publish(gap, None);
            stop_source(feed, sources, message.source_id, "publisher stopped")
        }
    }
}

fn stop_source(
    feed: &Feed,
    sources: &mut Sources,
    publisher: PublisherId,
    why: &'static str,
) -> Step {
    let newly_stopped = match sources.get_mut(&publisher) {
        Some(source) if !source.stopped => {
            source.stopped = true;
            tracing::debug!(table = %feed.table, publisher = %publisher, why, "source stopped");
            true
        }
        _ => false,
    };
    if sources.values().all(|source| source.stopped) {
        Step::Ended(FeedError::Aborted)
    } else if newly_stopped {
        Step::SourceStopped(publisher)
    } else {
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_common::ids::NodeId;
    use serde_json::json;

    fn feed(capacity: usize) -> Feed {
        Feed::new(
            TableId::new(),
            MailboxAddress::new(NodeId::new(), 1),
            Vec::new(),
            capacity,
            CancellationToken::new(),
        )
    }

    fn sources_for(publisher: PublisherId, first_stamp: u64) -> Sources {
        let mut sources = Sources::with_hasher(RandomState::new());
        let handle = PublisherHandle::new(publisher, MailboxAddress::new(NodeId::new(), 2));
        sources.insert(publisher, SourceState::new(handle, first_stamp));
        sources
    }

    fn change(stamp: u64, publisher: PublisherId, id: u64) -> StampedMessage {
        StampedMessage {
            source_id: publisher,
            stamp,
            payload: FeedMessage::Change(ChangeEvent::insert(json!({ "id": id }))),
        }
    }

    #[test]
    fn stale_stamps_are_dropped_and_gaps_reported() {
        let feed = feed(8);
        let publisher = PublisherId::new();
        let mut sources = sources_for(publisher, 5);
        let mut sub = feed.attach();

        assert!(matches!(apply(&feed, &mut sources, change(4, publisher, 1)), Step::Continue));
        assert!(matches!(apply(&feed, &mut sources, change(5, publisher, 2)), Step::Continue));
        assert!(matches!(apply(&feed, &mut sources, change(8, publisher, 3)), Step::Continue));

        let first = sub.receiver.try_recv().expect("first");
        assert_eq!(first.expect("change").new_value(), Some(&json!({"id": 2})));
        let gap = sub.receiver.try_recv().expect("gap");
        assert_eq!(
            gap.expect_err("gap"),
            FeedError::MissedMessages {
                publisher,
                expected: 6,
                received: 8
            }
        );
        let third = sub.receiver.try_recv().expect("third");
        assert_eq!(third.expect("change").new_value(), Some(&json!({"id": 3})));
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn stop_from_last_source_ends_the_feed() {
        let feed = feed(8);
        let publisher = PublisherId::new();
        let mut sources = sources_for(publisher, 0);
        let stop = StampedMessage {
            source_id: publisher,
            stamp: 0,
            payload: FeedMessage::Stop,
        };
        assert!(matches!(
            apply(&feed, &mut sources, stop),
            Step::Ended(FeedError::Aborted)
        ));
        // Anything after a stop is stale.
        assert!(matches!(apply(&feed, &mut sources, change(1, publisher, 1)), Step::Continue));
    }

    #[test]
    fn stop_from_one_of_two_sources_keeps_the_feed() {
        let feed = feed(8);
        let stopping = PublisherId::new();
        let other = PublisherId::new();
        let mut sources = sources_for(stopping, 0);
        let handle = PublisherHandle::new(other, MailboxAddress::new(NodeId::new(), 3));
        sources.insert(other, SourceState::new(handle, 0));
        let stop = StampedMessage {
            source_id: stopping,
            stamp: 0,
            payload: FeedMessage::Stop,
        };
        assert!(matches!(
            apply(&feed, &mut sources, stop.clone()),
            Step::SourceStopped(publisher) if publisher == stopping
        ));
        // A second stop for the same publisher is not reported again.
        assert!(matches!(
            stop_source(&feed, &mut sources, stopping, "publisher unreachable"),
            Step::Continue
        ));
        assert!(matches!(apply(&feed, &mut sources, change(0, other, 1)), Step::Continue));
    }

    #[test]
    fn overflow_leaves_the_feed_idle() {
        let feed = feed(1);
        let publisher = PublisherId::new();
        let mut sources = sources_for(publisher, 0);
        let _only = feed.attach();
        assert!(!feed.is_idle());

        apply(&feed, &mut sources, change(0, publisher, 1));
        apply(&feed, &mut sources, change(1, publisher, 2));
        assert_eq!(feed.lifecycle(), Lifecycle::Draining);
        assert!(feed.is_idle());
        assert!(feed.retire());
        assert!(!feed.is_idle());
    }

    #[test]
    fn overflow_cuts_off_only_the_slow_subscriber() {
        let feed = feed(1);
        let publisher = PublisherId::new();
        let mut sources = sources_for(publisher, 0);
        let mut slow = feed.attach();
        let mut fast = feed.attach();

        apply(&feed, &mut sources, change(0, publisher, 1));
        assert!(fast.receiver.try_recv().expect("fast first").is_ok());
        apply(&feed, &mut sources, change(1, publisher, 2));

        assert_eq!(feed.subscriber_count(), 1);
        assert_eq!(slow.terminal.get(), Some(&FeedError::QueueOverflow));
        assert!(slow.receiver.try_recv().expect("buffered").is_ok());
        assert!(fast.receiver.try_recv().expect("fast second").is_ok());
    }

    #[test]
    fn end_notifies_each_subscriber_once() {
        let feed = feed(4);
        let first = feed.attach();
        let second = feed.attach();
        assert_eq!(feed.end(FeedError::Aborted), 2);
        assert_eq!(feed.end(FeedError::ShutDown), 0);
        assert_eq!(first.terminal.get(), Some(&FeedError::Aborted));
        assert_eq!(second.terminal.get(), Some(&FeedError::Aborted));
        assert!(feed.is_terminated());

        let late = feed.attach();
        assert_eq!(late.terminal.get(), Some(&FeedError::Aborted));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn release_and_reattach_cycle_lifecycle() {
        let feed = feed(4);
        let sub = feed.attach();
        assert!(feed.release(sub.id));
        assert_eq!(feed.lifecycle(), Lifecycle::Draining);

        let again = feed.attach();
        assert_eq!(feed.lifecycle(), Lifecycle::Active);
        assert!(!feed.retire());

        assert!(feed.release(again.id));
        assert!(feed.retire());
        assert_eq!(feed.lifecycle(), Lifecycle::Removed);
        assert!(!feed.release(again.id));
    }
}
