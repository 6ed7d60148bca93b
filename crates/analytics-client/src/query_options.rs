//! Per-query options.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::unmarshaler::Unmarshaler;

/// The level of data consistency required for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanConsistency {
    /// No consistency is required.
    NotBounded,
    /// Request-level consistency is required.
    RequestPlus,
}

impl ScanConsistency {
    pub(crate) fn wire_name(self) -> &'static str {
        match self {
            ScanConsistency::NotBounded => "not_bounded",
            ScanConsistency::RequestPlus => "request_plus",
        }
    }
}

/// The set of options available to a query.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub(crate) client_context_id: Option<String>,
    pub(crate) positional_parameters: Option<Vec<serde_json::Value>>,
    pub(crate) named_parameters: Option<HashMap<String, serde_json::Value>>,
    pub(crate) read_only: Option<bool>,
    pub(crate) scan_consistency: Option<ScanConsistency>,
    pub(crate) raw: Option<serde_json::Map<String, serde_json::Value>>,
    pub(crate) unmarshaler: Option<Arc<dyn Unmarshaler>>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) timeout: Option<Duration>,
}

impl QueryOptions {
    /// Creates a new instance with defaults.
    pub fn new() -> QueryOptions {
        QueryOptions::default()
    }

    /// Overrides the autogenerated identifier correlating all attempts of
    /// this query on the server.
    pub fn client_context_id(mut self, id: impl Into<String>) -> QueryOptions {
        self.client_context_id = Some(id.into());

        self
    }

    /// Sets positional placeholder parameters.
    pub fn positional_parameters(mut self, params: impl IntoIterator<Item = serde_json::Value>) -> QueryOptions {
        self.positional_parameters = Some(params.into_iter().collect());

        self
    }

    /// Sets named placeholder parameters. Keys are `$`-prefixed on the
    /// wire if they are not already.
    pub fn named_parameters(
        mut self,
        params: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> QueryOptions {
        self.named_parameters = Some(params.into_iter().collect());

        self
    }

    /// Marks the query read-only.
    pub fn read_only(mut self, read_only: bool) -> QueryOptions {
        self.read_only = Some(read_only);

        self
    }

    /// Sets the data consistency level.
    pub fn scan_consistency(mut self, scan_consistency: ScanConsistency) -> QueryOptions {
        self.scan_consistency = Some(scan_consistency);

        self
    }

    /// Extra entries merged into the request body. Merged after the typed
    /// options, so these can override them.
    pub fn raw(mut self, raw: impl IntoIterator<Item = (String, serde_json::Value)>) -> QueryOptions {
        self.raw = Some(raw.into_iter().collect());

        self
    }

    /// Overrides the unmarshaler used to decode this query's rows.
    pub fn unmarshaler(mut self, unmarshaler: impl Unmarshaler + 'static) -> QueryOptions {
        self.unmarshaler = Some(Arc::new(unmarshaler));

        self
    }

    /// Caps the number of retries for this query. Zero disables retries.
    pub fn max_retries(mut self, max_retries: u32) -> QueryOptions {
        self.max_retries = Some(max_retries);

        self
    }

    /// The caller's budget for the whole call, including retries. When
    /// unset, only the cluster-level query timeout bounds the call.
    pub fn timeout(mut self, timeout: Duration) -> QueryOptions {
        self.timeout = Some(timeout);

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_consistency_wire_names() {
        assert_eq!(ScanConsistency::NotBounded.wire_name(), "not_bounded");
        assert_eq!(ScanConsistency::RequestPlus.wire_name(), "request_plus");
    }

    #[test]
    fn test_builders_chain() {
        let opts = QueryOptions::new()
            .client_context_id("my-id")
            .positional_parameters([serde_json::json!(1)])
            .read_only(true)
            .scan_consistency(ScanConsistency::RequestPlus)
            .max_retries(2)
            .timeout(Duration::from_secs(30));

        assert_eq!(opts.client_context_id.as_deref(), Some("my-id"));
        assert_eq!(opts.read_only, Some(true));
        assert_eq!(opts.scan_consistency, Some(ScanConsistency::RequestPlus));
        assert_eq!(opts.max_retries, Some(2));
        assert_eq!(opts.timeout, Some(Duration::from_secs(30)));
    }
}
