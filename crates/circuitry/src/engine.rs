//! Engine façade: both pool levels plus the fetch loop, built from [`EngineConfig`].

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::circuits::{CircuitFactory, CircuitPool, ClientPool, circuit_pool};
use crate::config::{ConfigError, EngineConfig};
use crate::fetch::{FetchError, Fetcher};
use crate::keyed::FetchOutcome;
use crate::socks::SocksTransport;
use crate::status::{EngineStatus, PoolStatus};
use crate::transport::Transport;

pub struct Engine<T: Transport> {
    config: EngineConfig,
    fetcher: Fetcher<CircuitFactory<T>>,
}

impl<T: Transport> Engine<T> {
    /// Build the pools over `transport`. With `prefill` set, circuit creation
    /// starts right away, so this must run inside a tokio runtime.
    pub fn new(transport: T, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let circuits = circuit_pool(transport, config.outer_capacity, config.inner_capacity);
        if config.prefill {
            circuits.prefill();
        }
        let fetcher = Fetcher::new(circuits, config.fetch.clone()).with_replenish(config.replenish);

        tracing::info!(
            clients = config.outer_capacity,
            circuits = config.inner_capacity,
            max_attempts = config.fetch.max_attempts,
            prefill = config.prefill,
            "Fetch engine ready"
        );
        Ok(Self { config, fetcher })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn circuits(&self) -> &CircuitPool<T> {
        self.fetcher.pool()
    }

    pub fn clients(&self) -> &ClientPool<T> {
        self.fetcher.pool().factory().clients()
    }

    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String, FetchError> {
        self.fetcher.fetch(url, cancel).await
    }

    pub async fn fetch_keyed(&self, key: &str, cancel: &CancellationToken) -> FetchOutcome {
        self.fetcher.fetch_keyed(key, cancel).await
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            clients: self.clients().status(),
            circuits: self.circuits().status(),
        }
    }

    /// Changes in the number of ready circuits.
    pub fn watch_status(&self) -> watch::Receiver<PoolStatus> {
        self.circuits().watch_status()
    }

    /// Close circuits first, then the clients they were extended from.
    pub fn close(&self) {
        self.circuits().close();
        self.clients().close();
        tracing::info!("Fetch engine closed");
    }
}

impl Engine<SocksTransport> {
    pub fn from_config(config: EngineConfig) -> Result<Self, ConfigError> {
        let transport = SocksTransport::from_proxy(config.proxy.as_deref())?;
        Self::new(transport, config)
    }
}
