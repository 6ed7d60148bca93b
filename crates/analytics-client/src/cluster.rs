//! Cluster construction and the caller-facing handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::credential::Credential;
use crate::duration::parse_duration;
use crate::error::{Error, Result};
use crate::http;
use crate::options::{ClusterOptions, SecurityOptions, TrustSource};
use crate::query::execute_query;
use crate::query_options::QueryOptions;
use crate::result::QueryResult;
use crate::unmarshaler::{JsonUnmarshaler, Unmarshaler};

/// CA certificate(s) bundled with the client, used by the
/// [`TrustSource::Capella`] and [`TrustSource::CapellaAndSystem`] trust
/// modes.
const BUNDLED_ROOT_CA: &[u8] = include_bytes!("../certs/capella_roots.pem");

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(600);

pub(crate) struct ClusterInner {
    pub(crate) client: http::Client,
    pub(crate) credential: Credential,
    pub(crate) server_query_timeout: Duration,
    pub(crate) unmarshaler: Arc<dyn Unmarshaler>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) closed: AtomicBool,
}

/// The main entry point of the client: a handle to one analytics cluster.
///
/// Cheap to clone; all clones share the underlying connection pools.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").finish_non_exhaustive()
    }
}

impl Cluster {
    /// Connects to the cluster at `endpoint`.
    ///
    /// Only `http` and `https` schemes are accepted; a missing port
    /// defaults to 80 or 443 respectively. A handful of options can also
    /// be supplied through the query string:
    ///
    /// - `timeout.connect_timeout`: connect timeout as a duration string.
    /// - `timeout.query_timeout`: default server-side query timeout.
    /// - `security.trust_only_pem_file`: path to a PEM trust file.
    /// - `security.disable_server_certificate_verification`: boolean.
    ///
    /// Unknown query parameters are ignored; malformed values fail with an
    /// invalid-argument error naming the offending key.
    pub fn new(endpoint: &str, credential: Credential, opts: ClusterOptions) -> Result<Cluster> {
        let conn_spec = url::Url::parse(endpoint)
            .map_err(|e| Error::invalid_argument("endpoint", e.to_string()))?;

        let scheme = conn_spec.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(Error::invalid_argument(
                "scheme",
                "only http and https schemes are supported",
            ));
        }

        let host = conn_spec
            .host_str()
            .ok_or_else(|| Error::invalid_argument("endpoint", "missing host"))?
            .to_string();

        let port = match conn_spec.port() {
            Some(port) => port,
            None if scheme == "https" => 443,
            None => 80,
        };

        let mut connect_timeout = opts.timeout_options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let mut query_timeout = opts.timeout_options.query_timeout.unwrap_or(DEFAULT_QUERY_TIMEOUT);
        let mut security = opts.security_options.clone();

        for (key, value) in conn_spec.query_pairs() {
            match key.as_ref() {
                "timeout.connect_timeout" => {
                    connect_timeout = parse_duration(&value)
                        .map_err(|e| Error::invalid_argument("timeout.connect_timeout", e.to_string()))?;
                }
                "timeout.query_timeout" => {
                    query_timeout = parse_duration(&value)
                        .map_err(|e| Error::invalid_argument("timeout.query_timeout", e.to_string()))?;
                }
                "security.trust_only_pem_file" => {
                    security.trust_source = Some(TrustSource::PemFile(value.as_ref().into()));
                }
                "security.disable_server_certificate_verification" => {
                    let disabled = parse_bool(&value).ok_or_else(|| {
                        Error::invalid_argument(
                            "security.disable_server_certificate_verification",
                            format!("{value:?} is not a boolean"),
                        )
                    })?;
                    security.disable_server_certificate_verification = Some(disabled);
                }
                _ => {}
            }
        }

        if connect_timeout.is_zero() {
            return Err(Error::invalid_argument("connect_timeout", "must be greater than 0"));
        }

        if query_timeout.is_zero() {
            return Err(Error::invalid_argument("query_timeout", "must be greater than 0"));
        }

        let tls = build_tls_material(&security)?;
        if tls.accept_invalid_certs {
            tracing::warn!("server certificate verification is disabled, this is insecure");
        }

        let client = http::Client::new(http::ClientConfig {
            scheme,
            host,
            port,
            connect_timeout,
            tls,
        });

        let unmarshaler = opts
            .unmarshaler
            .clone()
            .unwrap_or_else(|| Arc::new(JsonUnmarshaler::new()));

        Ok(Cluster {
            inner: Arc::new(ClusterInner {
                client,
                credential,
                server_query_timeout: query_timeout,
                unmarshaler,
                max_retries: opts.max_retries,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Returns a handle to the named database.
    pub fn database(&self, name: impl Into<String>) -> Database {
        Database {
            inner: Arc::clone(&self.inner),
            name: name.into(),
        }
    }

    /// Executes the query statement on the server.
    ///
    /// When the options carry no timeout, the cluster-level query timeout
    /// applies.
    pub async fn execute_query(&self, statement: &str, opts: QueryOptions) -> Result<QueryResult> {
        execute_query(&self.inner, statement, opts, None).await
    }

    /// Shuts down the cluster handle and releases idle pooled connections.
    /// In-flight queries run to completion; new queries fail.
    pub fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.client.close();

        Ok(())
    }
}

/// A handle to a database within a cluster.
#[derive(Clone)]
pub struct Database {
    inner: Arc<ClusterInner>,
    name: String,
}

impl Database {
    /// The database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a handle to the named scope.
    pub fn scope(&self, name: impl Into<String>) -> Scope {
        Scope {
            inner: Arc::clone(&self.inner),
            database: self.name.clone(),
            name: name.into(),
        }
    }
}

/// A handle to a scope within a database; queries executed through it are
/// bound to the scope's query context.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ClusterInner>,
    database: String,
    name: String,
}

impl Scope {
    /// The scope name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning database name.
    pub fn database_name(&self) -> &str {
        &self.database
    }

    /// Executes the query statement on the server, tying the query context
    /// to this scope.
    pub async fn execute_query(&self, statement: &str, opts: QueryOptions) -> Result<QueryResult> {
        execute_query(&self.inner, statement, opts, Some((&self.database, &self.name))).await
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn build_tls_material(security: &SecurityOptions) -> Result<http::TlsMaterial> {
    let trust_source = security.trust_source.clone().unwrap_or_default();

    let mut material = match trust_source {
        TrustSource::Capella => http::TlsMaterial {
            roots: bundled_roots()?,
            use_system_roots: false,
            accept_invalid_certs: false,
        },
        TrustSource::System => http::TlsMaterial {
            roots: Vec::new(),
            use_system_roots: true,
            accept_invalid_certs: false,
        },
        TrustSource::PemFile(path) => {
            let data = std::fs::read(&path).map_err(|e| {
                Error::invalid_argument(
                    "security.trust_only_pem_file",
                    format!("failed to read pem file {}: {e}", path.display()),
                )
            })?;

            http::TlsMaterial {
                roots: parse_pem_roots(&data, "security.trust_only_pem_file")?,
                use_system_roots: false,
                accept_invalid_certs: false,
            }
        }
        TrustSource::PemString(pem) => http::TlsMaterial {
            roots: parse_pem_roots(pem.as_bytes(), "security.trust_only_pem_string")?,
            use_system_roots: false,
            accept_invalid_certs: false,
        },
        TrustSource::Certificates(certificates) => http::TlsMaterial {
            roots: certificates,
            use_system_roots: false,
            accept_invalid_certs: false,
        },
        TrustSource::CapellaAndSystem => http::TlsMaterial {
            roots: bundled_roots()?,
            use_system_roots: true,
            accept_invalid_certs: false,
        },
    };

    if security.disable_server_certificate_verification == Some(true) {
        material.roots.clear();
        material.use_system_roots = false;
        material.accept_invalid_certs = true;
    }

    Ok(material)
}

fn bundled_roots() -> Result<Vec<reqwest::Certificate>> {
    parse_pem_roots(BUNDLED_ROOT_CA, "bundled certificates")
}

fn parse_pem_roots(pem: &[u8], what: &str) -> Result<Vec<reqwest::Certificate>> {
    reqwest::Certificate::from_pem_bundle(pem)
        .map_err(|e| Error::invalid_argument(what, format!("failed to parse certificates: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn credential() -> Credential {
        Credential::basic("username", "password")
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = Cluster::new("couchbase://localhost", credential(), ClusterOptions::new()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_rejects_missing_scheme() {
        let err = Cluster::new("//localhost", credential(), ClusterOptions::new()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_accepts_http_and_https() {
        for endpoint in ["http://localhost", "https://localhost:18095"] {
            assert!(Cluster::new(endpoint, credential(), ClusterOptions::new()).is_ok());
        }
    }

    #[test]
    fn test_default_ports_follow_scheme() {
        let cluster = Cluster::new("http://localhost", credential(), ClusterOptions::new()).unwrap();
        assert_eq!(cluster.inner.client.port(), 80);

        let cluster = Cluster::new("https://localhost", credential(), ClusterOptions::new()).unwrap();
        assert_eq!(cluster.inner.client.port(), 443);

        let cluster = Cluster::new("http://localhost:8095", credential(), ClusterOptions::new()).unwrap();
        assert_eq!(cluster.inner.client.port(), 8095);
    }

    #[test]
    fn test_query_string_timeouts() {
        let cluster = Cluster::new(
            "http://localhost?timeout.query_timeout=30s",
            credential(),
            ClusterOptions::new(),
        )
        .unwrap();

        assert_eq!(cluster.inner.server_query_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_malformed_query_string_duration_names_key() {
        let err = Cluster::new(
            "http://localhost?timeout.query_timeout=banana",
            credential(),
            ClusterOptions::new(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("timeout.query_timeout"));
    }

    #[test]
    fn test_malformed_query_string_bool_names_key() {
        let err = Cluster::new(
            "http://localhost?security.disable_server_certificate_verification=yep",
            credential(),
            ClusterOptions::new(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("disable_server_certificate_verification"));
    }

    #[test]
    fn test_unknown_query_parameters_are_ignored() {
        assert!(Cluster::new(
            "http://localhost?an_invalid_option=true",
            credential(),
            ClusterOptions::new(),
        )
        .is_ok());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let err = Cluster::new(
            "http://localhost?timeout.query_timeout=0",
            credential(),
            ClusterOptions::new(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_bundled_roots_parse() {
        assert!(!bundled_roots().unwrap().is_empty());
    }

    #[test]
    fn test_disable_verification_clears_trust() {
        let security = SecurityOptions::new().disable_server_certificate_verification(true);
        let material = build_tls_material(&security).unwrap();

        assert!(material.accept_invalid_certs);
        assert!(material.roots.is_empty());
        assert!(!material.use_system_roots);
    }

    #[test]
    fn test_missing_pem_file_is_invalid_argument() {
        let security =
            SecurityOptions::new().trust_source(TrustSource::PemFile("/definitely/not/here.pem".into()));
        let err = build_tls_material(&security).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_scope_handles_carry_names() {
        let cluster = Cluster::new("http://localhost", credential(), ClusterOptions::new()).unwrap();
        let scope = cluster.database("travel").scope("inventory");

        assert_eq!(scope.database_name(), "travel");
        assert_eq!(scope.name(), "inventory");
    }
}
