//! Analytics query client
//!
//! A streaming Rust client for Columnar analytics query services over
//! HTTP(S).
//!
//! # Features
//!
//! - **Streaming results**: rows are pulled off the wire one at a time;
//!   memory use is bounded by the largest single row
//! - **Automatic retries**: exponential backoff with jitter, endpoint
//!   rotation on connection failures, and deadline-aware budgeting
//! - **TLS trust control**: bundled, system, file, string or explicit
//!   certificate trust, assembled once per cluster
//! - **Pluggable row decoding**: bring your own [`Unmarshaler`] per
//!   cluster or per query
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use analytics_client::{Cluster, ClusterOptions, Credential, QueryOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = Cluster::new(
//!         "https://analytics.example.com",
//!         Credential::basic("username", "password"),
//!         ClusterOptions::new(),
//!     )?;
//!
//!     let mut result = cluster
//!         .execute_query(
//!             "FROM RANGE(0, 99) AS i SELECT RAW i",
//!             QueryOptions::new().timeout(Duration::from_secs(30)),
//!         )
//!         .await?;
//!
//!     while let Some(row) = result.next_row().await {
//!         let value: i64 = row.content_as()?;
//!         println!("{value}");
//!     }
//!
//!     result.err()?;
//!     let meta = result.metadata()?;
//!     println!("{} rows", meta.metrics.result_count);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All operations return `Result<T, Error>`. [`Error::kind`] classifies
//! the root cause:
//!
//! - `InvalidArgument`: rejected before any I/O (bad scheme, malformed
//!   option value, zero timeout)
//! - `InvalidCredential`: the server rejected the credentials (401 or
//!   error code 20000); never retried
//! - `Timeout`: the server-side budget ran out
//! - `DeadlineExceeded`: the caller's budget ran out
//! - `Query`: the server reported errors executing the statement; the
//!   attributed code and message are on [`QueryError`]
//!
//! Failures the server marks retriable are retried automatically with
//! exponential backoff until a deadline or the configured retry cap says
//! otherwise.

mod cluster;
mod credential;
mod duration;
mod error;
mod http;
pub mod leakcheck;
mod options;
mod query;
mod query_options;
mod result;
mod unmarshaler;

pub use cluster::{Cluster, Database, Scope};
pub use credential::{Credential, UserPassPair};
pub use error::{AnalyticsError, Error, ErrorDesc, ErrorKind, QueryError, Result};
pub use options::{ClusterOptions, SecurityOptions, TimeoutOptions, TrustSource};
pub use query_options::{QueryOptions, ScanConsistency};
pub use result::{buffer_query_result, QueryMetadata, QueryMetrics, QueryResult, QueryWarning, Row};
pub use unmarshaler::{JsonUnmarshaler, Unmarshaler};
