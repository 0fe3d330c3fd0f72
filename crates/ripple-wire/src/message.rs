use ripple_common::ids::PublisherId;

use crate::{Result, WireError};

/// A row value as produced by the storage layer.
pub type Row = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single row-level change. At least one side is always present.
///
/// ```
/// use ripple_wire::{ChangeEvent, ChangeKind};
/// use serde_json::json;
///
/// let insert = ChangeEvent::new(None, Some(json!({"id": 1}))).expect("insert");
/// assert_eq!(insert.kind(), ChangeKind::Insert);
/// assert!(ChangeEvent::new(None, None).is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    old_value: Option<Row>,
    new_value: Option<Row>,
}

impl ChangeEvent {
    pub fn new(old_value: Option<Row>, new_value: Option<Row>) -> Result<Self> {
        if old_value.is_none() && new_value.is_none() {
            return Err(WireError::EmptyChange);
        }
        Ok(Self {
            old_value,
            new_value,
        })
    }

    pub fn insert(row: Row) -> Self {
        Self {
            old_value: None,
            new_value: Some(row),
        }
    }

    pub fn update(old: Row, new: Row) -> Self {
        Self {
            old_value: Some(old),
            new_value: Some(new),
        }
    }

    pub fn delete(row: Row) -> Self {
        Self {
            old_value: Some(row),
            new_value: None,
        }
    }

    pub fn old_value(&self) -> Option<&Row> {
        self.old_value.as_ref()
    }

    pub fn new_value(&self) -> Option<&Row> {
        self.new_value.as_ref()
    }

    pub fn kind(&self) -> ChangeKind {
        match (&self.old_value, &self.new_value) {
            (Some(_), Some(_)) => ChangeKind::Update,
            (None, Some(_)) => ChangeKind::Insert,
            // Construction rejects (None, None).
            _ => ChangeKind::Delete,
        }
    }

    pub fn into_parts(self) -> (Option<Row>, Option<Row>) {
        (self.old_value, self.new_value)
    }
}

/// What a publisher sends down a feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// The publisher will send nothing further to this destination.
    Stop,
    Change(ChangeEvent),
}

impl FeedMessage {
    pub fn is_stop(&self) -> bool {
        matches!(self, FeedMessage::Stop)
    }
}

impl From<ChangeEvent> for FeedMessage {
    fn from(change: ChangeEvent) -> Self {
        FeedMessage::Change(change)
    }
}

/// A feed message tagged with its origin and its per-destination sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedMessage {
    pub source_id: PublisherId,
    pub stamp: u64,
    pub payload: FeedMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_follows_which_sides_are_present() {
        assert_eq!(ChangeEvent::insert(json!(1)).kind(), ChangeKind::Insert);
        assert_eq!(
            ChangeEvent::update(json!(1), json!(2)).kind(),
            ChangeKind::Update
        );
        assert_eq!(ChangeEvent::delete(json!(1)).kind(), ChangeKind::Delete);
    }

    #[test]
    fn empty_change_is_rejected() {
        let err = ChangeEvent::new(None, None).expect_err("empty");
        assert!(matches!(err, WireError::EmptyChange));
    }

    #[test]
    fn into_parts_returns_both_sides() {
        let change = ChangeEvent::update(json!({"a": 1}), json!({"a": 2}));
        let (old, new) = change.into_parts();
        assert_eq!(old, Some(json!({"a": 1})));
        assert_eq!(new, Some(json!({"a": 2})));
    }
}
