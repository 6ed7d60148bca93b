//! The query engine: endpoint-pinned HTTP clients and the attempt loop.

pub(crate) mod error;
pub(crate) mod executor;
pub(crate) mod reader;
pub(crate) mod retry;
pub(crate) mod streamer;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use self::error::{Cause, EngineError};

/// Prepared TLS trust material, assembled once per cluster.
#[derive(Debug, Clone, Default)]
pub(crate) struct TlsMaterial {
    /// Extra root certificates to trust.
    pub roots: Vec<reqwest::Certificate>,
    /// Whether the system trust store remains in effect.
    pub use_system_roots: bool,
    /// Trust any certificate regardless of validity.
    pub accept_invalid_certs: bool,
}

pub(crate) struct ClientConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub tls: TlsMaterial,
}

/// Options for a single engine query call.
pub(crate) struct QueryOptions {
    /// The JSON payload to be sent to the query server.
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Returns the username and password for authentication; consulted on
    /// every attempt.
    pub credentials: Box<dyn Fn() -> (String, String) + Send + Sync>,
    /// Wall-clock instant past which no further attempts may be scheduled.
    pub deadline: Option<Instant>,
    /// Hard cap on retry attempts; `None` is deadline-bounded only.
    pub max_retries: Option<u32>,
}

/// HTTP client for the query endpoint of one cluster.
///
/// Each resolved IP gets its own pooled `reqwest::Client`, pinned to that
/// address via a resolver override so that `Host`, SNI and certificate
/// verification all stay on the configured hostname while the dial goes
/// to the chosen endpoint. Rotating away from a failing endpoint is then
/// simply not picking it again within the call.
pub(crate) struct Client {
    scheme: String,
    host: String,
    port: u16,
    connect_timeout: Duration,
    tls: TlsMaterial,
    endpoints: Mutex<HashMap<IpAddr, reqwest::Client>>,
}

impl Client {
    pub(crate) fn new(config: ClientConfig) -> Client {
        Client {
            scheme: config.scheme,
            host: config.host,
            port: config.port,
            connect_timeout: config.connect_timeout,
            tls: config.tls,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Drops the pooled connections. In-flight requests keep their client
    /// alive until they finish.
    pub(crate) fn close(&self) {
        self.endpoints.lock().expect("endpoint map poisoned").clear();
    }

    fn request_uri(&self) -> String {
        format!("{}://{}:{}/api/v1/request", self.scheme, self.host, self.port)
    }

    fn client_for(&self, addr: IpAddr) -> Result<reqwest::Client, EngineError> {
        let mut endpoints = self.endpoints.lock().expect("endpoint map poisoned");
        if let Some(client) = endpoints.get(&addr) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(self.connect_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_millis(1000))
            .resolve(&self.host, SocketAddr::new(addr, self.port));

        if !self.tls.use_system_roots {
            builder = builder.tls_built_in_root_certs(false);
        }

        for root in &self.tls.roots {
            builder = builder.add_root_certificate(root.clone());
        }

        if self.tls.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(|e| {
            EngineError::new(
                Cause::wrapped("failed to build http client", e),
                "",
                self.host.clone(),
                0,
            )
        })?;

        endpoints.insert(addr, client.clone());

        Ok(client)
    }
}
