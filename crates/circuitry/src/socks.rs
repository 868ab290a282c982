//! SOCKS-backed transport built on reqwest.
//!
//! - Client (outer): a SOCKS endpoint that answered a TCP reachability probe
//! - Circuit (inner): a `reqwest::Client` whose proxy credentials are a fresh
//!   random pair, so an isolating proxy builds a new path for it
//! - Without a proxy, clients are trivially available and circuits connect
//!   directly

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::transport::{Circuit, Response, Transport, TransportClient, TransportError};
use crate::version::user_agent;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProxyEndpoint {
    scheme: String,
    host: String,
    port: u16,
}

impl ProxyEndpoint {
    fn parse(proxy_url: &str) -> Result<Self, ConfigError> {
        let malformed = || ConfigError::Malformed {
            name: "proxy",
            expected: "socks5://host:port or socks5h://host:port",
            value: proxy_url.to_string(),
        };

        let url = reqwest::Url::parse(proxy_url).map_err(|_| malformed())?;
        if !matches!(url.scheme(), "socks5" | "socks5h") {
            return Err(malformed());
        }
        let host = url.host_str().ok_or_else(malformed)?;
        let port = url.port().ok_or_else(malformed)?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// Proxy URL carrying a one-off isolation credential.
    fn isolated_url(&self, user: &Uuid, password: &Uuid) -> String {
        format!(
            "{}://{}:{}@{}:{}",
            self.scheme,
            user.simple(),
            password.simple(),
            self.host,
            self.port
        )
    }

    fn address(&self) -> String {
        // IPv6 hosts come back bracketed, which `to_socket_addrs` accepts.
        format!("{}:{}", self.host, self.port)
    }
}

pub struct SocksTransport {
    proxy: Option<ProxyEndpoint>,
    connect_timeout: Duration,
}

impl SocksTransport {
    /// Connect without a proxy.
    pub fn direct() -> Self {
        Self {
            proxy: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn new(proxy_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            proxy: Some(ProxyEndpoint::parse(proxy_url)?),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn from_proxy(proxy_url: Option<&str>) -> Result<Self, ConfigError> {
        match proxy_url {
            Some(url) => Self::new(url),
            None => Ok(Self::direct()),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn is_direct(&self) -> bool {
        self.proxy.is_none()
    }

    async fn probe(&self, endpoint: &ProxyEndpoint, cancel: &CancellationToken) -> Result<(), TransportError> {
        let address = endpoint.address();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address)) => {
                match result {
                    Ok(Ok(_stream)) => Ok(()),
                    Ok(Err(e)) => Err(TransportError::Connect(format!("{address}: {e}"))),
                    Err(_) => Err(TransportError::Connect(format!(
                        "{address}: no answer within {:?}",
                        self.connect_timeout
                    ))),
                }
            }
        }
    }
}

#[async_trait]
impl Transport for SocksTransport {
    type Client = SocksClient;

    async fn connect(&self, index: usize, cancel: CancellationToken) -> Result<SocksClient, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if let Some(endpoint) = &self.proxy {
            self.probe(endpoint, &cancel).await?;
            tracing::debug!(slot = index, proxy = %endpoint.address(), "Proxy reachable");
        }
        Ok(SocksClient {
            index,
            proxy: self.proxy.clone(),
        })
    }
}

pub struct SocksClient {
    index: usize,
    proxy: Option<ProxyEndpoint>,
}

impl SocksClient {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[async_trait]
impl TransportClient for SocksClient {
    type Circuit = HttpCircuit;

    async fn extend_path(&self, cancel: CancellationToken) -> Result<HttpCircuit, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let id = Uuid::new_v4();
        let builder = reqwest::Client::builder().user_agent(user_agent());
        let builder = match &self.proxy {
            Some(endpoint) => {
                let proxy = reqwest::Proxy::all(endpoint.isolated_url(&id, &Uuid::new_v4()))
                    .map_err(|e| TransportError::Config(e.to_string()))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };
        let client = builder
            .build()
            .map_err(|e| TransportError::Extend(e.to_string()))?;

        Ok(HttpCircuit {
            id,
            client,
            destroyed: AtomicBool::new(false),
        })
    }
}

/// One isolated HTTP path.
pub struct HttpCircuit {
    id: Uuid,
    client: reqwest::Client,
    destroyed: AtomicBool,
}

impl HttpCircuit {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

fn request_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Request(e.to_string())
    }
}

#[async_trait]
impl Circuit for HttpCircuit {
    async fn request(&self, url: &str, timeout: Duration) -> Result<Response, TransportError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| request_error(e, timeout))?;

        Ok(Response::new(status, body))
    }

    fn destroy(&self) -> Result<(), TransportError> {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            tracing::debug!(circuit = %self.id, "Circuit destroyed");
        }
        Ok(())
    }
}
