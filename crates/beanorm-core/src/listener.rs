//! Post-commit change notification.

use crate::id::{EntityId, EntityKey};
use std::fmt;

/// Kind of write recorded in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        })
    }
}

/// One successful write, appended to the transaction that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub entity: &'static str,
    pub op: ChangeOp,
    pub id: EntityId,
}

impl ChangeEvent {
    pub fn new(entity: &'static str, op: ChangeOp, id: EntityId) -> Self {
        Self { entity, op, id }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            entity: self.entity,
            id: self.id.clone(),
        }
    }
}

/// Receives committed writes, e.g. to forward them to other processes.
///
/// Called once per event after the store commit and local cache
/// invalidation. Never called for rolled-back transactions.
pub trait ChangeListener: Send + Sync {
    fn notify(&self, entity: &'static str, op: ChangeOp, id: &EntityId);
}
