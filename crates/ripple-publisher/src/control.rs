// Control loop: answers registration requests arriving on the publisher's control mailbox.
use ripple_common::MailboxAddress;
use ripple_transport::Mailbox;
use ripple_wire::ControlMessage;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

use crate::{Publisher, Result};

pub(crate) async fn serve(
    publisher: Weak<Publisher>,
    mut mailbox: Mailbox,
    shutdown: CancellationToken,
) {
    let control = mailbox.address();
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = mailbox.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let request = match ControlMessage::decode_bytes(frame) {
            Ok(request) => request,
            Err(err) => {
                // No reply address to blame; drop the frame and keep serving.
                metrics::counter!("ripple_protocol_errors_total", "side" => "publisher")
                    .increment(1);
                tracing::warn!(control = %control, error = %err, "malformed control frame");
                continue;
            }
        };
        let Some(publisher) = publisher.upgrade() else {
            break;
        };
        handle_request(&publisher, request).await;
    }
    tracing::debug!(control = %control, "control loop stopped");
}

async fn handle_request(publisher: &Arc<Publisher>, request: ControlMessage) {
    match request {
        ControlMessage::AddClient {
            request_id,
            destination,
            reply_to,
        } => {
            let (reply, added) = match publisher.add_client(destination).await {
                Ok(stamp) => (ControlMessage::ClientAdded { request_id, stamp }, true),
                Err(err) => (
                    ControlMessage::Rejected {
                        request_id,
                        reason: err.to_string(),
                    },
                    false,
                ),
            };
            if let Err(err) = send_reply(publisher, reply_to, &reply).await
                && added
            {
                // Nobody is left to learn about the registration.
                publisher.remove_client(destination).await;
                tracing::debug!(
                    publisher = %publisher.id(),
                    destination = %destination,
                    error = %err,
                    "registration rolled back"
                );
            }
        }
        ControlMessage::RemoveClient {
            request_id,
            destination,
            reply_to,
        } => {
            let removed = publisher.remove_client(destination).await;
            if let Some(reply_to) = reply_to {
                let reply = ControlMessage::ClientRemoved {
                    request_id,
                    removed,
                };
                let _ = send_reply(publisher, reply_to, &reply).await;
            }
        }
        ControlMessage::GetStamp {
            request_id,
            destination,
            reply_to,
        } => {
            let stamp = publisher.get_stamp(&destination).await;
            let reply = ControlMessage::Stamp { request_id, stamp };
            let _ = send_reply(publisher, reply_to, &reply).await;
        }
        reply => {
            metrics::counter!("ripple_protocol_errors_total", "side" => "publisher").increment(1);
            tracing::warn!(
                publisher = %publisher.id(),
                request_id = reply.request_id(),
                "reply sent to control mailbox"
            );
        }
    }
}

async fn send_reply(
    publisher: &Publisher,
    reply_to: MailboxAddress,
    reply: &ControlMessage,
) -> Result<()> {
    let frame = reply.encode_bytes()?;
    publisher.transport.send(&reply_to, frame).await?;
    Ok(())
}
