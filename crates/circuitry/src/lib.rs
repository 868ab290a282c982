//! circuitry: bounded pools of single-use transport circuits and a resilient
//! fetch engine on top of them.

mod circuits;
mod engine;
mod keyed;
mod socks;
mod status;
mod version;

pub mod config;
pub mod fetch;
pub mod pool;
pub mod transport;

pub use tokio_util::sync::CancellationToken;

pub use circuits::{CircuitFactory, CircuitPool, ClientFactory, ClientPool, circuit_pool};
pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use fetch::{FetchConfig, FetchError, Fetcher};
pub use keyed::{CACHE_KEY_PREFIX, FetchOutcome, cache_key, url_from_key};
pub use pool::{
    FactoryError, Lease, Pool, PoolError, PoolEvent, ResourceFactory, SlotPhase, Subscription,
    factory_fn,
};
pub use socks::{HttpCircuit, SocksClient, SocksTransport};
pub use status::{EngineStatus, PoolStatus};
pub use transport::{Circuit, Response, Transport, TransportClient, TransportError};
pub use version::{CIRCUITRY_VERSION, user_agent};
