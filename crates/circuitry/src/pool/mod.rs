//! Bounded pool of lazily-created, indexed resources.
//!
//! Every index in `[0, capacity)` owns one slot. A slot moves through:
//! - `Empty` → `Creating` when a factory call starts (at most one per index)
//! - `Creating` → `Ready` on success, `Empty` on a transient failure,
//!   `Deleted` on a permanent failure (the index is retired for good)
//! - `Ready` → `Empty` on `delete` or when handed out by `take`
//!
//! Resources handed out by [`Pool::take`] never come back: the [`Lease`]
//! destroys its resource when it goes away.

mod bounded;
mod events;
mod lease;
mod slot;

pub use bounded::{FactoryError, FnFactory, Pool, PoolError, ResourceFactory, factory_fn};
pub use events::{PoolEvent, Subscription};
pub use lease::Lease;
pub use slot::SlotPhase;
