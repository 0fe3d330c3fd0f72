use futures::Stream;
use ripple_common::ids::TableId;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll, ready};
use tokio::sync::mpsc;

use crate::feed::{Attachment, Feed};
use crate::registry::RegistryInner;
use crate::{FeedError, FeedItem};

/// A local subscriber's view of a table feed.
///
/// Yields changes in arrival order. `Err(FeedError::MissedMessages { .. })` marks a gap
/// and `Err(FeedError::SourceLost { .. })` a publisher that left; the stream continues
/// after both. Any other error is the last item before `None`. Dropping
/// the stream detaches it in the background; `detach` does the same and waits for it.
#[derive(Debug)]
pub struct FeedStream {
    table: TableId,
    id: u64,
    receiver: mpsc::Receiver<FeedItem>,
    terminal: Arc<OnceLock<FeedError>>,
    finished: bool,
    link: Option<Link>,
}

#[derive(Debug)]
struct Link {
    feed: Arc<Feed>,
    registry: Weak<RegistryInner>,
}

impl FeedStream {
    pub(crate) fn new(
        feed: Arc<Feed>,
        registry: Weak<RegistryInner>,
        attachment: Attachment,
    ) -> Self {
        Self {
            table: feed.table(),
            id: attachment.id,
            receiver: attachment.receiver,
            terminal: attachment.terminal,
            finished: false,
            link: Some(Link { feed, registry }),
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    /// Next change, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<FeedItem> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Leaves the feed. When this was the feed's last subscriber, returns after the feed
    /// has unregistered from its publishers.
    pub async fn detach(mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        match link.registry.upgrade() {
            Some(registry) => registry.detach_subscriber(&link.feed, self.id).await,
            None => {
                link.feed.release(self.id);
            }
        }
    }
}

impl Stream for FeedStream {
    type Item = FeedItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FeedItem>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match ready!(self.receiver.poll_recv(cx)) {
            Some(item) => Poll::Ready(Some(item)),
            None => {
                self.finished = true;
                Poll::Ready(self.terminal.get().cloned().map(Err))
            }
        }
    }
}

impl Drop for FeedStream {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let id = self.id;
        let Some(registry) = link.registry.upgrade() else {
            link.feed.release(id);
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let tasks = registry.tasks().clone();
                tasks.spawn_on(
                    async move { registry.detach_subscriber(&link.feed, id).await },
                    &runtime,
                );
            }
            Err(_) => {
                // No runtime left to unregister on; at least stop receiving.
                link.feed.release(id);
                tracing::debug!(table = %self.table, "feed stream dropped outside a runtime");
            }
        }
    }
}
