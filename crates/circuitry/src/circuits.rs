//! Two-level pool composition: transport clients (outer) and circuits (inner).
//!
//! Flow for inner slot `i`:
//! 1. Borrow outer slot `i % clients.capacity()`, connecting it if needed
//! 2. Extend a fresh path from that client
//! 3. The circuit becomes slot `i`'s ready resource
//!
//! Clients are shared by every circuit mapped onto them and survive circuit
//! eviction; circuits are single use.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::pool::{FactoryError, Pool, PoolError, ResourceFactory};
use crate::transport::{Circuit, Transport, TransportClient};

pub type ClientPool<T> = Pool<ClientFactory<T>>;
pub type CircuitPool<T> = Pool<CircuitFactory<T>>;

/// Outer factory: one transport client connection per slot.
pub struct ClientFactory<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> ClientFactory<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: Transport> ResourceFactory for ClientFactory<T> {
    type Resource = T::Client;

    async fn create(
        &self,
        index: usize,
        cancel: CancellationToken,
    ) -> Result<T::Client, FactoryError> {
        Ok(self.transport.connect(index, cancel).await?)
    }
}

/// Inner factory: extends a circuit from the client at `index % outer capacity`.
pub struct CircuitFactory<T: Transport> {
    clients: ClientPool<T>,
}

impl<T: Transport> CircuitFactory<T> {
    pub fn new(clients: ClientPool<T>) -> Self {
        Self { clients }
    }

    pub fn clients(&self) -> &ClientPool<T> {
        &self.clients
    }

    fn client_index(&self, index: usize) -> usize {
        index % self.clients.capacity()
    }
}

/// Wrap an outer pool failure as the inner factory's failure.
fn client_pool_error(e: PoolError) -> FactoryError {
    match e {
        PoolError::Cancelled => FactoryError::Cancelled,
        // The mapped client can never come back, so neither can this circuit slot.
        PoolError::Retired { .. } | PoolError::Depleted | PoolError::Closed => {
            FactoryError::Permanent(format!("client pool: {e}"))
        }
        other => FactoryError::Transient(format!("client pool: {other}")),
    }
}

#[async_trait]
impl<T: Transport> ResourceFactory for CircuitFactory<T> {
    type Resource = <T::Client as TransportClient>::Circuit;

    async fn create(
        &self,
        index: usize,
        cancel: CancellationToken,
    ) -> Result<Self::Resource, FactoryError> {
        let client_index = self.client_index(index);
        let client = self
            .clients
            .get(client_index, &cancel)
            .await
            .map_err(client_pool_error)?;

        tracing::debug!(slot = index, client = client_index, "Extending path");
        Ok(client.extend_path(cancel).await?)
    }

    fn destroy(&self, circuit: &Self::Resource) -> Result<(), FactoryError> {
        Ok(circuit.destroy()?)
    }
}

/// Build the client pool and the circuit pool layered on it.
pub fn circuit_pool<T: Transport>(
    transport: T,
    client_capacity: usize,
    circuit_capacity: usize,
) -> CircuitPool<T> {
    let clients = Pool::new(
        "clients",
        client_capacity,
        ClientFactory::new(Arc::new(transport)),
    );
    Pool::new("circuits", circuit_capacity, CircuitFactory::new(clients))
}
