//! Per-index slot state.

use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use serde::Serialize;

use super::PoolError;

/// In-flight creation shared by every caller waiting on the same index.
pub(crate) type Creation<R> = Shared<BoxFuture<'static, Result<Arc<R>, PoolError>>>;

/// Lifecycle phase of a slot, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPhase {
    Empty,
    Creating,
    Ready,
    /// Retired after a permanent factory failure.
    Deleted,
}

pub(crate) enum SlotState<R> {
    Empty,
    Creating {
        generation: u64,
        creation: Creation<R>,
    },
    Ready(Arc<R>),
    Deleted {
        cause: String,
    },
}

impl<R> SlotState<R> {
    pub fn phase(&self) -> SlotPhase {
        match self {
            SlotState::Empty => SlotPhase::Empty,
            SlotState::Creating { .. } => SlotPhase::Creating,
            SlotState::Ready(_) => SlotPhase::Ready,
            SlotState::Deleted { .. } => SlotPhase::Deleted,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SlotState::Ready(_))
    }

    /// True while this slot is still running the creation identified by `generation`.
    pub fn is_creating(&self, generation: u64) -> bool {
        matches!(self, SlotState::Creating { generation: g, .. } if *g == generation)
    }

    /// Take the ready resource out, leaving the slot empty.
    pub fn take_ready(&mut self) -> Option<Arc<R>> {
        if !self.is_ready() {
            return None;
        }
        match std::mem::replace(self, SlotState::Empty) {
            SlotState::Ready(resource) => Some(resource),
            _ => None,
        }
    }
}
