//! Error types surfaced to callers.

use std::fmt;

/// The root cause class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A client-server interaction with the analytics service failed and no
    /// more specific class applies.
    Analytics,
    /// The provided credentials were rejected.
    InvalidCredential,
    /// The server-side timeout elapsed before the operation completed.
    Timeout,
    /// The server reported an error while executing the query.
    Query,
    /// An argument was invalid; detected before any I/O.
    InvalidArgument,
    /// The handle was used after it was closed.
    Closed,
    /// A row could not be decoded.
    Unmarshal,
    /// The service, or part of the path to it, is unavailable.
    ServiceUnavailable,
    /// The caller's deadline elapsed, or the next attempt could not be
    /// scheduled inside it.
    DeadlineExceeded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Analytics => "analytics error",
            ErrorKind::InvalidCredential => "invalid credential",
            ErrorKind::Timeout => "timeout error",
            ErrorKind::Query => "query error",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Closed => "closed",
            ErrorKind::Unmarshal => "unmarshalling error",
            ErrorKind::ServiceUnavailable => "service unavailable",
            ErrorKind::DeadlineExceeded => "deadline exceeded",
        };

        f.write_str(s)
    }
}

/// A single error reported by the server for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDesc {
    /// Server-assigned error code.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
    /// Whether the server considers this entry safe to retry.
    pub retriable: bool,
}

/// Errors that can occur when using the analytics client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An argument was invalid. Raised at the call boundary, before any I/O.
    #[error("invalid argument: {argument} - {reason}")]
    InvalidArgument {
        /// Name of the offending argument or option key.
        argument: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The cluster handle was used after `close`.
    #[error("cluster has been closed")]
    Closed,

    /// A row could not be decoded into the requested type.
    #[error("failed to unmarshal - {reason}")]
    Unmarshal {
        /// Decoder-provided reason.
        reason: String,
    },

    /// An interaction with the analytics service failed.
    #[error(transparent)]
    Analytics(#[from] AnalyticsError),

    /// The server reported errors in the response body of a query.
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl Error {
    /// The root cause class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::Closed => ErrorKind::Closed,
            Error::Unmarshal { .. } => ErrorKind::Unmarshal,
            Error::Analytics(e) => e.kind(),
            Error::Query(e) => e.kind(),
        }
    }

    pub(crate) fn invalid_argument(argument: impl Into<String>, reason: impl Into<String>) -> Error {
        Error::InvalidArgument {
            argument: argument.into(),
            reason: reason.into(),
        }
    }

    /// The `AnalyticsError` in this error's chain, if any.
    pub fn as_analytics_error(&self) -> Option<&AnalyticsError> {
        match self {
            Error::Analytics(e) => Some(e),
            Error::Query(e) => Some(e.analytics_error()),
            _ => None,
        }
    }

    /// The `QueryError` in this error's chain, if any.
    pub fn as_query_error(&self) -> Option<&QueryError> {
        match self {
            Error::Query(e) => Some(e),
            _ => None,
        }
    }
}

/// An error encountered while interacting with the analytics service.
///
/// Carries the failing statement, the endpoint it was sent to, the HTTP
/// status code (0 when the failure happened before a response arrived) and
/// any error descriptors the server reported.
#[derive(Debug)]
pub struct AnalyticsError {
    kind: ErrorKind,
    message: String,
    statement: String,
    endpoint: String,
    http_status_code: u16,
    errors: Vec<ErrorDesc>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AnalyticsError {
    pub(crate) fn new(kind: ErrorKind, statement: impl Into<String>, endpoint: impl Into<String>, status_code: u16) -> AnalyticsError {
        AnalyticsError {
            kind,
            message: String::new(),
            statement: statement.into(),
            endpoint: endpoint.into(),
            http_status_code: status_code,
            errors: Vec::new(),
            source: None,
        }
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> AnalyticsError {
        self.message = message.into();

        self
    }

    pub(crate) fn with_errors(mut self, errors: Vec<ErrorDesc>) -> AnalyticsError {
        self.errors = errors;

        self
    }

    pub(crate) fn with_source(mut self, source: Box<dyn std::error::Error + Send + Sync>) -> AnalyticsError {
        self.source = Some(source);

        self
    }

    /// The root cause class.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Additional detail about the failure, if any.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The statement that was being executed.
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// The endpoint the request was sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The HTTP status code of the response, or 0 if none was received.
    pub fn http_status_code(&self) -> u16 {
        self.http_status_code
    }

    /// The error descriptors reported by the server, in response order.
    pub fn errors(&self) -> &[ErrorDesc] {
        &self.errors
    }
}

impl fmt::Display for AnalyticsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }

        write!(f, " | statement={:?} endpoint={:?}", self.statement, self.endpoint)?;

        if self.http_status_code != 0 {
            write!(f, " status_code={}", self.http_status_code)?;
        }

        if !self.errors.is_empty() {
            write!(f, " errors=[")?;
            for (i, desc) in self.errors.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{{code={} msg={:?}}}", desc.code, desc.message)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

impl std::error::Error for AnalyticsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source.as_deref() {
            Some(source) => Some(source),
            None => None,
        }
    }
}

/// An error reported in the `errors` field of a query response body.
///
/// Wraps an [`AnalyticsError`] and exposes the code and message of the
/// entry the failure was attributed to (the first non-retriable entry, or
/// the first entry when all were retriable).
#[derive(Debug)]
pub struct QueryError {
    cause: AnalyticsError,
    code: u32,
    message: String,
}

impl QueryError {
    pub(crate) fn new(cause: AnalyticsError, code: u32, message: impl Into<String>) -> QueryError {
        QueryError {
            cause,
            code,
            message: message.into(),
        }
    }

    /// The server error code this failure was attributed to.
    pub fn code(&self) -> u32 {
        self.code
    }

    /// The server error message this failure was attributed to.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The root cause class.
    pub fn kind(&self) -> ErrorKind {
        self.cause.kind()
    }

    /// The underlying analytics error with full request detail.
    pub fn analytics_error(&self) -> &AnalyticsError {
        &self.cause
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.cause.fmt(f)
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
