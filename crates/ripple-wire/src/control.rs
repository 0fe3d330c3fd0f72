// JSON control protocol spoken between a registry and a publisher's control mailbox.
use bytes::Bytes;
use ripple_common::MailboxAddress;
use serde::{Deserialize, Serialize};

use crate::{Frame, Result, WireError};

/// Control requests and their replies.
///
/// Every request names the mailbox the reply should go to and carries a request id that
/// the reply echoes.
///
/// ```
/// use ripple_common::{MailboxAddress, ids::NodeId};
/// use ripple_wire::ControlMessage;
///
/// let node = NodeId::new();
/// let message = ControlMessage::GetStamp {
///     request_id: 1,
///     destination: MailboxAddress::new(node, 3),
///     reply_to: MailboxAddress::new(node, 4),
/// };
/// let frame = message.encode().expect("encode");
/// assert_eq!(ControlMessage::decode(&frame).expect("decode"), message);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    // Register `destination` for stamped change delivery.
    AddClient {
        request_id: u64,
        destination: MailboxAddress,
        reply_to: MailboxAddress,
    },
    // Unregister `destination`; the reply says whether it was present.
    RemoveClient {
        request_id: u64,
        destination: MailboxAddress,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<MailboxAddress>,
    },
    // Ask for the next stamp that would be issued to `destination`.
    GetStamp {
        request_id: u64,
        destination: MailboxAddress,
        reply_to: MailboxAddress,
    },
    // Registration succeeded; `stamp` is the first stamp the destination will see.
    ClientAdded {
        request_id: u64,
        stamp: u64,
    },
    ClientRemoved {
        request_id: u64,
        removed: bool,
    },
    Stamp {
        request_id: u64,
        stamp: Option<u64>,
    },
    // Request refused (duplicate registration, publisher stopping, ...).
    Rejected {
        request_id: u64,
        reason: String,
    },
}

impl ControlMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            ControlMessage::AddClient { request_id, .. }
            | ControlMessage::RemoveClient { request_id, .. }
            | ControlMessage::GetStamp { request_id, .. }
            | ControlMessage::ClientAdded { request_id, .. }
            | ControlMessage::ClientRemoved { request_id, .. }
            | ControlMessage::Stamp { request_id, .. }
            | ControlMessage::Rejected { request_id, .. } => *request_id,
        }
    }

    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(WireError::Serialize)?;
        Frame::new(0, Bytes::from(payload))
    }

    pub fn encode_bytes(&self) -> Result<Bytes> {
        Ok(self.encode()?.encode())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        if frame.is_stamped() {
            return Err(WireError::UnexpectedFlags(frame.header.flags));
        }
        serde_json::from_slice(&frame.payload).map_err(WireError::Deserialize)
    }

    pub fn decode_bytes(input: Bytes) -> Result<Self> {
        let frame = Frame::decode(input)?;
        Self::decode(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_common::ids::NodeId;

    #[test]
    fn json_shape_is_tagged() {
        let node = NodeId::new();
        let message = ControlMessage::RemoveClient {
            request_id: 9,
            destination: MailboxAddress::new(node, 1),
            reply_to: None,
        };
        let frame = message.encode().expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&frame.payload).expect("json");
        assert_eq!(value["type"], "remove_client");
        assert_eq!(value["request_id"], 9);
        assert!(value.get("reply_to").is_none());
    }

    #[test]
    fn rejected_reply_keeps_request_id() {
        let message = ControlMessage::Rejected {
            request_id: 5,
            reason: "already registered".to_string(),
        };
        let decoded =
            ControlMessage::decode_bytes(message.encode_bytes().expect("encode")).expect("decode");
        assert_eq!(decoded.request_id(), 5);
        assert_eq!(decoded, message);
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let frame = Frame::new(0, Bytes::from_static(b"not json")).expect("frame");
        let err = ControlMessage::decode(&frame).expect_err("garbage");
        assert!(matches!(err, WireError::Deserialize(_)));
    }
}
