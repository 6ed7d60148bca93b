//! Engine-level errors and response classification.

use serde::Deserialize;

use super::streamer::StreamError;

/// One entry of the `errors` array in a response body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct ErrorDesc {
    pub code: u32,
    #[serde(rename = "msg", default)]
    pub message: String,
    #[serde(rename = "retriable", default)]
    pub retriable: bool,
}

#[derive(Deserialize)]
struct WireErrorResponse {
    #[serde(default)]
    errors: Option<Box<serde_json::value::RawValue>>,
}

/// The root cause of an engine failure.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Cause {
    #[error("analytics error")]
    Analytics,

    #[error("an invalid set of credentials was provided")]
    InvalidCredential,

    #[error("operation has timed out")]
    Timeout,

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("operation not sent to server, as timeout would be exceeded")]
    DeadlineWouldBeExceeded,

    #[error("deadline exceeded")]
    DeadlineExceeded(#[source] Option<reqwest::Error>),

    #[error("failed to lookup host: {0}")]
    Dns(#[source] std::io::Error),

    #[error("failed to send request: {0}")]
    Send(#[source] reqwest::Error),

    #[error("{0}")]
    Stream(#[from] StreamError),

    #[error("{message}: {source}")]
    Wrapped {
        message: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{0}")]
    Message(String),
}

impl Cause {
    pub(crate) fn wrapped(message: &'static str, source: impl std::error::Error + Send + Sync + 'static) -> Cause {
        Cause::Wrapped {
            message,
            source: Box::new(source),
        }
    }
}

/// An engine failure, carrying request context for diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("{cause} | statement={statement:?} endpoint={endpoint:?} status_code={status_code}")]
pub(crate) struct EngineError {
    pub cause: Cause,
    pub statement: String,
    pub endpoint: String,
    pub status_code: u16,
    pub errors: Vec<ErrorDesc>,
    pub last_code: u32,
    pub last_message: String,
    pub error_text: String,
}

impl EngineError {
    pub(crate) fn new(cause: Cause, statement: impl Into<String>, endpoint: impl Into<String>, status_code: u16) -> EngineError {
        EngineError {
            cause,
            statement: statement.into(),
            endpoint: endpoint.into(),
            status_code,
            errors: Vec::new(),
            last_code: 0,
            last_message: String::new(),
            error_text: String::new(),
        }
    }

    pub(crate) fn with_errors(mut self, errors: Vec<ErrorDesc>) -> EngineError {
        self.errors = errors;

        self
    }

    pub(crate) fn with_error_text(mut self, text: impl Into<String>) -> EngineError {
        self.error_text = text.into();

        self
    }

    pub(crate) fn with_last_detail(mut self, code: u32, message: impl Into<String>) -> EngineError {
        self.last_code = code;
        self.last_message = message.into();

        self
    }
}

/// Classifies a response body.
///
/// Returns `None` when the body does not describe a failure; the caller
/// decides what a non-2xx status with a clean body means. Classification
/// order: a 401 status short-circuits to the credential error regardless
/// of the body; an unparseable body yields a generic analytics error
/// carrying the raw text; an empty error list maps a 503 status to
/// service-unavailable and anything else to `None`; a non-empty list is
/// surfaced in response order.
pub(crate) fn parse_error_response(
    body: &[u8],
    statement: &str,
    endpoint: &str,
    status_code: u16,
    last_code: u32,
    last_message: &str,
) -> Option<EngineError> {
    if status_code == 401 {
        return Some(EngineError::new(Cause::InvalidCredential, statement, endpoint, status_code));
    }

    let raw: WireErrorResponse = match serde_json::from_slice(body) {
        Ok(raw) => raw,
        Err(e) => {
            return Some(
                EngineError::new(Cause::wrapped("failed to parse response errors", e), statement, endpoint, status_code)
                    .with_last_detail(last_code, last_message)
                    .with_error_text(String::from_utf8_lossy(body)),
            );
        }
    };

    let raw_errors = match raw.errors {
        Some(raw_errors) if raw_errors.get() != "null" => raw_errors,
        _ => {
            if status_code == 503 {
                return Some(EngineError::new(Cause::ServiceUnavailable, statement, endpoint, status_code));
            }

            return None;
        }
    };

    let descs: Vec<ErrorDesc> = match serde_json::from_str(raw_errors.get()) {
        Ok(descs) => descs,
        Err(e) => {
            return Some(
                EngineError::new(Cause::wrapped("failed to parse response errors", e), statement, endpoint, status_code)
                    .with_last_detail(last_code, last_message)
                    .with_error_text(String::from_utf8_lossy(body)),
            );
        }
    };

    if descs.is_empty() {
        if status_code == 503 {
            return Some(EngineError::new(Cause::ServiceUnavailable, statement, endpoint, status_code));
        }

        return None;
    }

    Some(
        EngineError::new(Cause::Analytics, statement, endpoint, status_code)
            .with_last_detail(last_code, last_message)
            .with_error_text(String::from_utf8_lossy(body))
            .with_errors(descs),
    )
}

/// Decides whether a classified server error may be retried.
///
/// Returns the descriptor the failure should be attributed to (the first
/// non-retriable entry, or the first entry when all are retriable) and the
/// verdict. An empty descriptor list is not retriable.
pub(crate) fn error_retriability(err: &EngineError) -> (Option<&ErrorDesc>, bool) {
    if matches!(err.cause, Cause::ServiceUnavailable) {
        return (None, true);
    }

    if err.errors.is_empty() {
        return (None, false);
    }

    let first_non_retriable = err.errors.iter().find(|desc| !desc.retriable);
    match first_non_retriable {
        Some(desc) => (Some(desc), false),
        None => (Some(&err.errors[0]), true),
    }
}
