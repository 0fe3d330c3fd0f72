use ripple_common::MailboxAddress;
use ripple_common::ids::PublisherId;
use ripple_transport::{Liveness, Transport, TransportError};
use ripple_wire::ControlMessage;
use serde::{Deserialize, Serialize};

use crate::{PublisherError, Result};

/// Remote reference to a publisher: its identity and control mailbox.
///
/// Request methods open a private reply mailbox on the destination's node, send one
/// control request and wait for the reply or for the publisher to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublisherHandle {
    id: PublisherId,
    control: MailboxAddress,
}

impl PublisherHandle {
    pub fn new(id: PublisherId, control: MailboxAddress) -> Self {
        Self { id, control }
    }

    pub fn id(&self) -> PublisherId {
        self.id
    }

    pub fn control(&self) -> MailboxAddress {
        self.control
    }

    /// Fires when the publisher's control mailbox closes.
    pub fn liveness(&self, transport: &Transport) -> Liveness {
        transport.liveness(&self.control)
    }

    /// Registers `destination`; resolves to the first stamp it will be sent.
    pub async fn add_client(
        &self,
        transport: &Transport,
        destination: MailboxAddress,
    ) -> Result<u64> {
        let reply = self
            .request(transport, destination, |request_id, reply_to| {
                ControlMessage::AddClient {
                    request_id,
                    destination,
                    reply_to,
                }
            })
            .await?;
        match reply {
            ControlMessage::ClientAdded { stamp, .. } => Ok(stamp),
            ControlMessage::Rejected { reason, .. } => Err(PublisherError::Rejected(reason)),
            other => Err(PublisherError::UnexpectedReply(other.request_id())),
        }
    }

    /// Unregisters `destination` and waits for confirmation.
    pub async fn remove_client(
        &self,
        transport: &Transport,
        destination: MailboxAddress,
    ) -> Result<bool> {
        let reply = self
            .request(transport, destination, |request_id, reply_to| {
                ControlMessage::RemoveClient {
                    request_id,
                    destination,
                    reply_to: Some(reply_to),
                }
            })
            .await?;
        match reply {
            ControlMessage::ClientRemoved { removed, .. } => Ok(removed),
            ControlMessage::Rejected { reason, .. } => Err(PublisherError::Rejected(reason)),
            other => Err(PublisherError::UnexpectedReply(other.request_id())),
        }
    }

    /// Asks for removal without waiting for the publisher to act on it.
    pub async fn request_removal(
        &self,
        transport: &Transport,
        destination: MailboxAddress,
    ) -> Result<()> {
        let request = ControlMessage::RemoveClient {
            request_id: 0,
            destination,
            reply_to: None,
        };
        self.send(transport, &request).await
    }

    pub async fn get_stamp(
        &self,
        transport: &Transport,
        destination: MailboxAddress,
    ) -> Result<Option<u64>> {
        let reply = self
            .request(transport, destination, |request_id, reply_to| {
                ControlMessage::GetStamp {
                    request_id,
                    destination,
                    reply_to,
                }
            })
            .await?;
        match reply {
            ControlMessage::Stamp { stamp, .. } => Ok(stamp),
            ControlMessage::Rejected { reason, .. } => Err(PublisherError::Rejected(reason)),
            other => Err(PublisherError::UnexpectedReply(other.request_id())),
        }
    }

    async fn request(
        &self,
        transport: &Transport,
        destination: MailboxAddress,
        build: impl FnOnce(u64, MailboxAddress) -> ControlMessage,
    ) -> Result<ControlMessage> {
        let mut reply_box = transport.open_mailbox(destination.node())?;
        // Reply mailboxes are single-use, so their number doubles as the request id.
        let request_id = reply_box.address().mailbox();
        let mut liveness = self.liveness(transport);
        self.send(transport, &build(request_id, reply_box.address()))
            .await?;

        loop {
            tokio::select! {
                // A reply already queued wins over the publisher disappearing after it.
                biased;
                frame = reply_box.recv() => {
                    let Some(frame) = frame else {
                        return Err(PublisherError::Unavailable(self.id));
                    };
                    let reply = ControlMessage::decode_bytes(frame)?;
                    if reply.request_id() == request_id {
                        return Ok(reply);
                    }
                    tracing::debug!(
                        publisher = %self.id,
                        request_id = reply.request_id(),
                        "ignoring stray control reply"
                    );
                }
                _ = liveness.lost() => return Err(PublisherError::Unavailable(self.id)),
            }
        }
    }

    async fn send(&self, transport: &Transport, message: &ControlMessage) -> Result<()> {
        let frame = message.encode_bytes()?;
        transport
            .send(&self.control, frame)
            .await
            .map_err(|err| match err {
                TransportError::Unreachable(_) | TransportError::NodeDisconnected(_) => {
                    PublisherError::Unavailable(self.id)
                }
                other => PublisherError::Transport(other),
            })
    }
}
