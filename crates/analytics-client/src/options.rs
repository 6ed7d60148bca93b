//! Cluster-level configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::unmarshaler::Unmarshaler;

/// Where the root certificates used to verify the server come from.
///
/// A closed set on purpose: every variant is handled exhaustively when the
/// TLS configuration is assembled, so adding one is a compile-time change.
#[derive(Debug, Clone)]
pub enum TrustSource {
    /// Trust only the CA certificate(s) bundled with the client.
    Capella,
    /// Trust only the system certificate store.
    System,
    /// Trust only the PEM-encoded certificate(s) in the file at this path.
    PemFile(PathBuf),
    /// Trust only the PEM-encoded certificate(s) in this string.
    PemString(String),
    /// Trust only these certificates.
    Certificates(Vec<reqwest::Certificate>),
    /// Trust the bundled CA certificate(s) merged with the system store.
    /// This is the default.
    CapellaAndSystem,
}

impl Default for TrustSource {
    fn default() -> Self {
        TrustSource::CapellaAndSystem
    }
}

/// Options controlling TLS trust and verification.
#[derive(Debug, Clone, Default)]
pub struct SecurityOptions {
    pub(crate) trust_source: Option<TrustSource>,
    pub(crate) disable_server_certificate_verification: Option<bool>,
}

impl SecurityOptions {
    /// Creates a new instance with defaults.
    pub fn new() -> SecurityOptions {
        SecurityOptions::default()
    }

    /// Sets where root certificates come from.
    pub fn trust_source(mut self, trust_source: TrustSource) -> SecurityOptions {
        self.trust_source = Some(trust_source);

        self
    }

    /// When true, the client trusts ANY certificate regardless of validity.
    pub fn disable_server_certificate_verification(mut self, disabled: bool) -> SecurityOptions {
        self.disable_server_certificate_verification = Some(disabled);

        self
    }
}

/// Operation timeout defaults.
#[derive(Debug, Clone, Default)]
pub struct TimeoutOptions {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) query_timeout: Option<Duration>,
}

impl TimeoutOptions {
    /// Creates a new instance with defaults.
    pub fn new() -> TimeoutOptions {
        TimeoutOptions::default()
    }

    /// The timeout for establishing an individual authenticated
    /// connection. Default 10 seconds.
    pub fn connect_timeout(mut self, timeout: Duration) -> TimeoutOptions {
        self.connect_timeout = Some(timeout);

        self
    }

    /// The default amount of time a query may spend executing before the
    /// server times it out. Only used when the query itself does not carry
    /// a timeout. Default 10 minutes.
    pub fn query_timeout(mut self, timeout: Duration) -> TimeoutOptions {
        self.query_timeout = Some(timeout);

        self
    }
}

/// Options for configuring a [`Cluster`](crate::Cluster).
#[derive(Clone, Default)]
pub struct ClusterOptions {
    pub(crate) timeout_options: TimeoutOptions,
    pub(crate) security_options: SecurityOptions,
    pub(crate) unmarshaler: Option<Arc<dyn Unmarshaler>>,
    pub(crate) max_retries: Option<u32>,
}

impl ClusterOptions {
    /// Creates a new instance with defaults.
    pub fn new() -> ClusterOptions {
        ClusterOptions::default()
    }

    /// Sets the operation timeout defaults.
    pub fn timeout_options(mut self, timeout_options: TimeoutOptions) -> ClusterOptions {
        self.timeout_options = timeout_options;

        self
    }

    /// Sets the TLS trust and verification options.
    pub fn security_options(mut self, security_options: SecurityOptions) -> ClusterOptions {
        self.security_options = security_options;

        self
    }

    /// Sets the default unmarshaler used to decode query rows.
    pub fn unmarshaler(mut self, unmarshaler: impl Unmarshaler + 'static) -> ClusterOptions {
        self.unmarshaler = Some(Arc::new(unmarshaler));

        self
    }

    /// Caps the number of retries a query will attempt. Zero disables
    /// retries; unset leaves retries bounded only by the deadlines.
    pub fn max_retries(mut self, max_retries: u32) -> ClusterOptions {
        self.max_retries = Some(max_retries);

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_trust_source_is_capella_and_system() {
        assert!(matches!(TrustSource::default(), TrustSource::CapellaAndSystem));
    }

    #[test]
    fn test_builders_chain() {
        let opts = ClusterOptions::new()
            .timeout_options(
                TimeoutOptions::new()
                    .connect_timeout(Duration::from_secs(5))
                    .query_timeout(Duration::from_secs(60)),
            )
            .security_options(SecurityOptions::new().disable_server_certificate_verification(true))
            .max_retries(4);

        assert_eq!(opts.timeout_options.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts.timeout_options.query_timeout, Some(Duration::from_secs(60)));
        assert_eq!(opts.security_options.disable_server_certificate_verification, Some(true));
        assert_eq!(opts.max_retries, Some(4));
    }
}
