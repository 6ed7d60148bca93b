//! Query dispatch: payload construction and error translation.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::cluster::ClusterInner;
use crate::duration::format_duration;
use crate::error::{AnalyticsError, Error, ErrorDesc, ErrorKind, QueryError, Result};
use crate::http;
use crate::http::error::{Cause, EngineError};
use crate::query_options::QueryOptions;
use crate::result::QueryResult;

/// Extra server-side budget granted on top of the caller's timeout, so
/// the caller's deadline fires first and the server cleans up shortly
/// after.
const SERVER_TIMEOUT_PAD: Duration = Duration::from_secs(5);

pub(crate) async fn execute_query(
    inner: &ClusterInner,
    statement: &str,
    opts: QueryOptions,
    namespace: Option<(&str, &str)>,
) -> Result<QueryResult> {
    if inner.closed.load(Ordering::SeqCst) {
        return Err(Error::Closed);
    }

    let (payload, deadline) = build_payload(statement, &opts, namespace, inner.server_query_timeout);

    let unmarshaler = opts.unmarshaler.clone().unwrap_or_else(|| inner.unmarshaler.clone());
    let max_retries = opts.max_retries.or(inner.max_retries);

    let credential = inner.credential.clone();
    let engine_opts = http::QueryOptions {
        payload,
        credentials: Box::new(move || {
            let pair = credential.credentials();

            (pair.username, pair.password)
        }),
        deadline,
        max_retries,
    };

    let reader = inner
        .client
        .query(engine_opts)
        .await
        .map_err(translate_engine_error)?;

    Ok(QueryResult::new(reader, unmarshaler))
}

/// Assembles the request payload and derives the caller deadline.
///
/// Typed options go in first, then `raw` entries (which may override
/// them), then the reserved members: `timeout` (rewritten between
/// retries), `statement`, `query_context` and `client_context_id` (stable
/// across retries). Reserved members always win over `raw`.
pub(crate) fn build_payload(
    statement: &str,
    opts: &QueryOptions,
    namespace: Option<(&str, &str)>,
    default_server_timeout: Duration,
) -> (serde_json::Map<String, serde_json::Value>, Option<Instant>) {
    let mut payload = serde_json::Map::new();

    if let Some(params) = &opts.positional_parameters {
        payload.insert("args".to_string(), serde_json::Value::Array(params.clone()));
    }

    if let Some(params) = &opts.named_parameters {
        for (key, value) in params {
            let key = if key.starts_with('$') {
                key.clone()
            } else {
                format!("${key}")
            };

            payload.insert(key, value.clone());
        }
    }

    if let Some(scan_consistency) = opts.scan_consistency {
        payload.insert(
            "scan_consistency".to_string(),
            serde_json::Value::String(scan_consistency.wire_name().to_string()),
        );
    }

    if let Some(read_only) = opts.read_only {
        payload.insert("readonly".to_string(), serde_json::Value::Bool(read_only));
    }

    if let Some(raw) = &opts.raw {
        for (key, value) in raw {
            payload.insert(key.clone(), value.clone());
        }
    }

    let (server_timeout, deadline) = match opts.timeout {
        Some(timeout) => (timeout + SERVER_TIMEOUT_PAD, Some(Instant::now() + timeout)),
        None => (default_server_timeout, None),
    };

    payload.insert(
        "timeout".to_string(),
        serde_json::Value::String(format_duration(server_timeout)),
    );

    payload.insert(
        "statement".to_string(),
        serde_json::Value::String(statement.to_string()),
    );

    if let Some((database, scope)) = namespace {
        payload.insert(
            "query_context".to_string(),
            serde_json::Value::String(format!("default:`{database}`.`{scope}`")),
        );
    }

    let client_context_id = opts
        .client_context_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    payload.insert(
        "client_context_id".to_string(),
        serde_json::Value::String(client_context_id),
    );

    (payload, deadline)
}

/// Maps an engine failure onto the public taxonomy.
pub(crate) fn translate_engine_error(err: EngineError) -> Error {
    if err.errors.is_empty() {
        let kind = match &err.cause {
            Cause::InvalidCredential => ErrorKind::InvalidCredential,
            Cause::ServiceUnavailable => ErrorKind::ServiceUnavailable,
            Cause::Timeout => ErrorKind::Timeout,
            Cause::DeadlineWouldBeExceeded | Cause::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            _ => ErrorKind::Analytics,
        };

        let analytics = AnalyticsError::new(kind, err.statement, err.endpoint, err.status_code)
            .with_message(err.cause.to_string())
            .with_source(Box::new(err.cause));

        return Error::Analytics(analytics);
    }

    let descs: Vec<ErrorDesc> = err
        .errors
        .iter()
        .map(|desc| ErrorDesc {
            code: desc.code,
            message: desc.message.clone(),
            retriable: desc.retriable,
        })
        .collect();

    // Attribute the failure to the first non-retriable entry, or the
    // first entry when all were retriable.
    let attributed = err
        .errors
        .iter()
        .find(|desc| !desc.retriable)
        .unwrap_or(&err.errors[0]);
    let (code, message) = (attributed.code, attributed.message.clone());

    let kind = match code {
        20000 => ErrorKind::InvalidCredential,
        21002 => ErrorKind::Timeout,
        23000 => ErrorKind::ServiceUnavailable,
        _ => match &err.cause {
            Cause::Timeout => ErrorKind::Timeout,
            Cause::DeadlineWouldBeExceeded | Cause::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            _ => ErrorKind::Query,
        },
    };

    let analytics = AnalyticsError::new(kind, err.statement, err.endpoint, err.status_code)
        .with_errors(descs)
        .with_source(Box::new(err.cause));

    Error::Query(QueryError::new(analytics, code, message))
}
