//! Streaming query results.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::duration::parse_duration;
use crate::error::{Error, Result};
use crate::http::reader::QueryRowReader;
use crate::query::translate_engine_error;
use crate::unmarshaler::Unmarshaler;

/// The streamed result of a query.
///
/// A single-consumer cursor: pull rows with [`next_row`](Self::next_row)
/// until it returns `None`, then check [`err`](Self::err) and read
/// [`metadata`](Self::metadata). Exactly one of the two is terminal for a
/// given response. Dropping the result releases the connection; calling
/// [`close`](Self::close) does so eagerly.
pub struct QueryResult {
    reader: QueryRowReader,
    unmarshaler: Arc<dyn Unmarshaler>,
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult").finish_non_exhaustive()
    }
}

impl QueryResult {
    pub(crate) fn new(reader: QueryRowReader, unmarshaler: Arc<dyn Unmarshaler>) -> QueryResult {
        QueryResult { reader, unmarshaler }
    }

    /// Returns the next row, or `None` once the stream is exhausted
    /// (successfully or not; consult [`err`](Self::err) to distinguish).
    pub async fn next_row(&mut self) -> Option<Row> {
        let bytes = self.reader.next_row().await?;

        Some(Row {
            bytes,
            unmarshaler: Arc::clone(&self.unmarshaler),
        })
    }

    /// Any error that occurred while streaming, or that the server
    /// reported in the response trailer.
    pub fn err(&self) -> Result<()> {
        match self.reader.err() {
            Some(err) => Err(translate_engine_error(err)),
            None => Ok(()),
        }
    }

    /// The query metadata. Only available after [`next_row`](Self::next_row)
    /// has returned `None`.
    pub fn metadata(&self) -> Result<QueryMetadata> {
        let bytes = self.reader.metadata().map_err(translate_engine_error)?;

        parse_metadata(&bytes)
    }

    /// Releases the underlying connection immediately. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.reader.close();

        Ok(())
    }
}

/// One result row, as raw bytes plus the unmarshaler configured for the
/// query.
pub struct Row {
    bytes: Bytes,
    unmarshaler: Arc<dyn Unmarshaler>,
}

impl Row {
    /// The raw JSON bytes of the row.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decodes the row into `T` using the configured unmarshaler.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.unmarshaler.unmarshal(&self.bytes)?;

        serde_json::from_value(value).map_err(|e| Error::Unmarshal {
            reason: e.to_string(),
        })
    }
}

/// Warning attached to a query response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryWarning {
    /// Server-assigned warning code.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
}

/// Execution metrics reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMetrics {
    /// Total round-trip time of the request.
    pub elapsed_time: Duration,
    /// Time spent executing the query.
    pub execution_time: Duration,
    /// Number of rows in the result.
    pub result_count: u64,
    /// Size of the result in bytes.
    pub result_size: u64,
    /// Number of objects processed while executing.
    pub processed_objects: u64,
}

/// Metadata attached to a query response.
#[derive(Debug, Clone, Default)]
pub struct QueryMetadata {
    /// Server-assigned identifier of the request.
    pub request_id: String,
    /// The identifier correlating all attempts of the call.
    pub client_context_id: String,
    /// Shape of the rows, as reported by the server.
    pub signature: Option<serde_json::Value>,
    /// Warnings raised during execution.
    pub warnings: Vec<QueryWarning>,
    /// Execution metrics.
    pub metrics: QueryMetrics,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireMetadata {
    #[serde(rename = "requestID")]
    request_id: String,
    #[serde(rename = "clientContextID")]
    client_context_id: String,
    signature: Option<serde_json::Value>,
    warnings: Vec<WireWarning>,
    metrics: WireMetrics,
}

#[derive(Deserialize)]
struct WireWarning {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireMetrics {
    #[serde(rename = "elapsedTime")]
    elapsed_time: String,
    #[serde(rename = "executionTime")]
    execution_time: String,
    #[serde(rename = "resultCount")]
    result_count: u64,
    #[serde(rename = "resultSize")]
    result_size: u64,
    #[serde(rename = "processedObjects")]
    processed_objects: u64,
}

fn parse_metadata(bytes: &[u8]) -> Result<QueryMetadata> {
    let wire: WireMetadata = serde_json::from_slice(bytes).map_err(|e| Error::Unmarshal {
        reason: format!("failed to unmarshal metadata: {e}"),
    })?;

    Ok(QueryMetadata {
        request_id: wire.request_id,
        client_context_id: wire.client_context_id,
        signature: wire.signature,
        warnings: wire
            .warnings
            .into_iter()
            .map(|w| QueryWarning {
                code: w.code,
                message: w.msg,
            })
            .collect(),
        metrics: QueryMetrics {
            elapsed_time: parse_duration(&wire.metrics.elapsed_time).unwrap_or(Duration::ZERO),
            execution_time: parse_duration(&wire.metrics.execution_time).unwrap_or(Duration::ZERO),
            result_count: wire.metrics.result_count,
            result_size: wire.metrics.result_size,
            processed_objects: wire.metrics.processed_objects,
        },
    })
}

/// Collects every row of `result` into a `Vec<T>` and returns it together
/// with the query metadata.
pub async fn buffer_query_result<T: DeserializeOwned>(
    mut result: QueryResult,
) -> Result<(Vec<T>, QueryMetadata)> {
    let mut rows = Vec::new();

    while let Some(row) = result.next_row().await {
        rows.push(row.content_as()?);
    }

    result.err()?;
    let metadata = result.metadata()?;
    result.close()?;

    Ok((rows, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unmarshaler::JsonUnmarshaler;

    #[test]
    fn test_parse_metadata_full_envelope() {
        let bytes = br#"{
            "requestID": "req-1",
            "clientContextID": "ctx-1",
            "signature": {"*": "*"},
            "warnings": [{"code": 100, "msg": "careful"}],
            "metrics": {
                "elapsedTime": "12.34ms",
                "executionTime": "10ms",
                "resultCount": 100,
                "resultSize": 2048,
                "processedObjects": 0
            }
        }"#;

        let meta = parse_metadata(bytes).unwrap();
        assert_eq!(meta.request_id, "req-1");
        assert_eq!(meta.client_context_id, "ctx-1");
        assert_eq!(meta.warnings.len(), 1);
        assert_eq!(meta.warnings[0].code, 100);
        assert_eq!(meta.metrics.result_count, 100);
        assert_eq!(meta.metrics.result_size, 2048);
        assert_eq!(meta.metrics.execution_time, Duration::from_millis(10));
        assert_eq!(meta.metrics.elapsed_time, Duration::from_micros(12340));
    }

    #[test]
    fn test_parse_metadata_tolerates_missing_members() {
        let meta = parse_metadata(br#"{"requestID": "req-2"}"#).unwrap();

        assert_eq!(meta.request_id, "req-2");
        assert!(meta.warnings.is_empty());
        assert_eq!(meta.metrics, QueryMetrics::default());
    }

    #[test]
    fn test_parse_metadata_rejects_garbage() {
        assert!(parse_metadata(b"not json").is_err());
    }

    #[test]
    fn test_row_content_as() {
        let row = Row {
            bytes: Bytes::from_static(br#"{"greeting": "hello"}"#),
            unmarshaler: Arc::new(JsonUnmarshaler::new()),
        };

        #[derive(Deserialize)]
        struct Greeting {
            greeting: String,
        }

        let decoded: Greeting = row.content_as().unwrap();
        assert_eq!(decoded.greeting, "hello");
    }

    #[test]
    fn test_row_content_as_propagates_unmarshaler_error() {
        struct FailingUnmarshaler;

        impl Unmarshaler for FailingUnmarshaler {
            fn unmarshal(&self, _data: &[u8]) -> Result<serde_json::Value> {
                Err(Error::Unmarshal {
                    reason: "something went wrong".to_string(),
                })
            }
        }

        let row = Row {
            bytes: Bytes::from_static(b"1"),
            unmarshaler: Arc::new(FailingUnmarshaler),
        };

        let err = row.content_as::<i32>().unwrap_err();
        assert!(err.to_string().contains("something went wrong"));
    }
}
