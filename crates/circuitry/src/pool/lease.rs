//! Exclusive, pool-removed ownership of one resource.

use std::ops::Deref;
use std::sync::Arc;

use super::bounded::{PoolInner, ResourceFactory};

/// A resource taken out of a pool by [`Pool::take`](super::Pool::take).
///
/// Leases are single use: the resource never returns to the pool. On
/// `discard`, `evict` or drop the factory's `destroy` runs exactly once.
#[must_use = "a dropped lease destroys its resource immediately"]
pub struct Lease<F: ResourceFactory> {
    index: usize,
    resource: Option<Arc<F::Resource>>,
    pool: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Lease<F> {
    pub(crate) fn new(index: usize, resource: Arc<F::Resource>, pool: Arc<PoolInner<F>>) -> Self {
        Self {
            index,
            resource: Some(resource),
            pool,
        }
    }

    /// Slot the resource was taken from. The slot itself may already hold a
    /// replacement.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Destroy after normal use.
    pub fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            tracing::debug!(pool = %self.pool.name(), slot = self.index, "Discarding used resource");
            self.pool.destroy(self.index, &resource);
        }
    }

    /// Destroy after a failure; the resource is presumed unusable.
    pub fn evict(mut self, reason: &dyn std::fmt::Display) {
        if let Some(resource) = self.resource.take() {
            tracing::warn!(pool = %self.pool.name(), slot = self.index, reason = %reason, "Evicting failed resource");
            self.pool.destroy(self.index, &resource);
        }
    }
}

impl<F: ResourceFactory> Deref for Lease<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        // Only `discard`/`evict` empty the option, and both consume the lease.
        match &self.resource {
            Some(resource) => resource.as_ref(),
            None => unreachable!("lease used after release"),
        }
    }
}

impl<F: ResourceFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            tracing::debug!(pool = %self.pool.name(), slot = self.index, "Lease dropped - destroying resource");
            self.pool.destroy(self.index, &resource);
        }
    }
}

impl<F: ResourceFactory> std::fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool.name())
            .field("index", &self.index)
            .finish()
    }
}
