//! Pool status snapshots for reporting.

use serde::{Deserialize, Serialize};

/// Ready resources versus capacity for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub size: usize,
    pub capacity: usize,
}

impl PoolStatus {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }
}

/// Status of both levels of a circuit pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Transport client handles (outer pool).
    pub clients: PoolStatus,
    /// Circuits ready to be leased (inner pool).
    pub circuits: PoolStatus,
}
