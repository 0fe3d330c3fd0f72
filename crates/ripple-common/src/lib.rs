// Shared identifiers and limits used across the changefeed crates.
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed IDs so a table id can never be passed where a publisher id is expected.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(
                Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                // Generate a new random ID for this namespace.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }

                /// Fixed-size form used on the wire.
                pub fn to_bytes(&self) -> [u8; 16] {
                    *self.0.as_bytes()
                }

                pub fn from_bytes(bytes: [u8; 16]) -> Self {
                    Self(Uuid::from_bytes(bytes))
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    // Preserve the original input for clearer error messages.
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(NodeId);
    id_type!(TableId);
    id_type!(PublisherId);
}

/// Address of a mailbox reachable through the transport.
///
/// Used both as the key a publisher files a subscribed destination under and as the
/// opaque handle a registry uses to reach a publisher's control loop.
///
/// ```
/// use ripple_common::{MailboxAddress, ids::NodeId};
///
/// let node = NodeId::new();
/// let addr = MailboxAddress::new(node, 7);
/// assert_eq!(addr.node(), node);
/// assert_eq!(addr.to_string(), format!("{node}/7"));
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MailboxAddress {
    node: ids::NodeId,
    mailbox: u64,
}

impl MailboxAddress {
    pub fn new(node: ids::NodeId, mailbox: u64) -> Self {
        Self { node, mailbox }
    }

    pub fn node(&self) -> ids::NodeId {
        self.node
    }

    pub fn mailbox(&self) -> u64 {
        self.mailbox
    }
}

impl std::fmt::Display for MailboxAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node, self.mailbox)
    }
}

/// Queue and frame limits shared by publishers, feeds and the transport.
///
/// ```
/// use ripple_common::FeedLimits;
///
/// let limits = FeedLimits::default();
/// assert!(limits.subscriber_queue_capacity > 0);
/// assert!(limits.max_frame_bytes >= 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedLimits {
    // Bounded queue in front of every local subscriber.
    pub subscriber_queue_capacity: usize,
    // Depth of each mailbox opened on the transport.
    pub mailbox_capacity: usize,
    // Largest frame the transport accepts.
    pub max_frame_bytes: usize,
}

impl Default for FeedLimits {
    fn default() -> Self {
        // Defaults are conservative for local/dev usage.
        Self {
            subscriber_queue_capacity: 1024,
            mailbox_capacity: 4096,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Smallest frame limit that still fits a stamped `Stop` with its header.
pub const MIN_FRAME_BYTES: usize = 64;

impl FeedLimits {
    pub fn validate(&self) -> Result<()> {
        if self.subscriber_queue_capacity == 0 {
            return Err(Error::Config(
                "subscriber_queue_capacity must be positive".into(),
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::Config("mailbox_capacity must be positive".into()));
        }
        if self.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(Error::Config(format!(
                "max_frame_bytes must be at least {MIN_FRAME_BYTES}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, FeedLimits, ids::PublisherId, ids::TableId};
    use std::str::FromStr;

    #[test]
    fn table_id_round_trip() {
        // IDs should print and parse without loss.
        let table = TableId::new();
        let parsed = TableId::from_str(&table.to_string()).expect("parse");
        assert_eq!(table, parsed);
    }

    #[test]
    fn table_id_rejects_invalid_input() {
        let err = TableId::from_str("not-a-uuid").expect_err("invalid");
        assert!(matches!(err, Error::InvalidId(s) if s == "not-a-uuid"));
    }

    #[test]
    fn publisher_id_wire_bytes_are_stable() {
        let id = PublisherId::new();
        assert_eq!(PublisherId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn ids_serialize_as_plain_uuid_strings() {
        let id = PublisherId::new();
        let json = serde_json::to_string(&id).expect("json");
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let limits = FeedLimits {
            subscriber_queue_capacity: 0,
            ..FeedLimits::default()
        };
        let err = limits.validate().expect_err("zero capacity");
        assert!(matches!(err, Error::Config(msg) if msg.contains("subscriber_queue_capacity")));
        assert!(FeedLimits::default().validate().is_ok());

        let tiny = FeedLimits {
            max_frame_bytes: 16,
            ..FeedLimits::default()
        };
        assert!(tiny.validate().is_err());
    }
}
