use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Cancellable, OperationListener, OperationType};
use crate::error::ErrorReason;
use crate::lock;

type Entry = (OperationType, Arc<dyn Cancellable>);

/// In-flight operations by id. Entries are inserted on start and evicted
/// when the operation reports it has finished.
#[derive(Default)]
pub struct OperationRegistry {
    ops: Mutex<HashMap<String, Entry>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, op_id: impl Into<String>, op: Arc<dyn Cancellable>) {
        let op_id = op_id.into();
        tracing::debug!(op_id, op_type = ?op.op_type(), "Operation registered");
        lock(&self.ops).insert(op_id, (op.op_type(), op));
    }

    /// Insert unless an operation of the same type is already in flight.
    pub fn insert_exclusive(&self, op_id: impl Into<String>, op: Arc<dyn Cancellable>) -> bool {
        let op_type = op.op_type();
        let mut ops = lock(&self.ops);
        if ops.values().any(|(t, _)| *t == op_type) {
            return false;
        }
        ops.insert(op_id.into(), (op_type, op));
        true
    }

    pub fn len(&self) -> usize {
        lock(&self.ops).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.ops).is_empty()
    }

    pub fn contains(&self, op_id: &str) -> bool {
        lock(&self.ops).contains_key(op_id)
    }

    pub fn count(&self, op_type: OperationType) -> usize {
        lock(&self.ops).values().filter(|(t, _)| *t == op_type).count()
    }

    pub fn drain(&self) -> Vec<Arc<dyn Cancellable>> {
        lock(&self.ops).drain().map(|(_, (_, op))| op).collect()
    }

    /// Cancel everything in flight. Returns how many were cancelled.
    pub async fn cancel_all(&self, reason: ErrorReason) -> usize {
        let ops = self.drain();
        let count = ops.len();
        for op in ops {
            op.cancel(reason).await;
        }
        if count > 0 {
            tracing::info!(count, %reason, "Cancelled in-flight operations");
        }
        count
    }
}

impl OperationListener for OperationRegistry {
    fn on_finish(&self, op_type: OperationType, op_id: &str) {
        if lock(&self.ops).remove(op_id).is_some() {
            tracing::debug!(op_id, ?op_type, "Operation evicted");
        }
    }
}
