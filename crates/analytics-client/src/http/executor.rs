//! The attempt loop: resolve, pick, dispatch, classify, retry.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use rand::Rng;

use super::error::{error_retriability, parse_error_response, Cause, EngineError};
use super::reader::QueryRowReader;
use super::retry::{exponential_backoff_with_jitter, RetryController, RetryRefusal};
use super::streamer::{BodyError, QueryStreamer};
use super::{Client, QueryOptions};
use crate::duration::parse_duration;

const ROWS_ATTRIB: &str = "results";

const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const BACKOFF_FACTOR: f64 = 2.0;

impl Client {
    /// Executes a query, retrying retriable failures until a deadline or
    /// the retry cap refuses another attempt. Returns a row reader with
    /// one row already peeked, or the classified error.
    pub(crate) async fn query(&self, opts: QueryOptions) -> Result<QueryRowReader, EngineError> {
        let statement = opts
            .payload
            .get("statement")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut payload = opts.payload;

        let mut body = serde_json::to_vec(&payload).map_err(|e| {
            self.fatal(Cause::wrapped("failed to marshal query payload", e), &statement, 0)
        })?;

        let server_deadline = match payload.get("timeout").and_then(|v| v.as_str()) {
            Some(timeout) => {
                let timeout = parse_duration(timeout).map_err(|e| {
                    self.fatal(Cause::wrapped("failed to parse server timeout", e), &statement, 0)
                })?;

                Some(Instant::now() + timeout)
            }
            None => None,
        };

        let mut last_code: u32 = 0;
        let mut last_message = String::new();
        let mut last_root: Option<Cause> = None;

        let unique_id = uuid::Uuid::new_v4().to_string();

        let mut controller = RetryController::new(
            opts.deadline,
            server_deadline,
            opts.max_retries,
            exponential_backoff_with_jitter(BACKOFF_MIN, BACKOFF_MAX, BACKOFF_FACTOR),
        );

        let mut addrs = self.resolve(opts.deadline, &statement).await?;

        loop {
            if addrs.is_empty() {
                return Err(self
                    .fatal(last_root.take().unwrap_or(Cause::Analytics), &statement, 0)
                    .with_last_detail(last_code, last_message));
            }

            let idx = rand::thread_rng().gen_range(0..addrs.len());
            let addr = addrs[idx];

            let client = self.client_for(addr)?;

            let (username, password) = (opts.credentials)();

            let mut request = client
                .post(self.request_uri())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .basic_auth(username, Some(password))
                .body(body.clone());

            if let Some(deadline) = opts.deadline {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Err(self.fatal(Cause::DeadlineExceeded(None), &statement, 0));
                };

                request = request.timeout(remaining);
            }

            tracing::trace!(id = %unique_id, endpoint = %addr, "sending query request");

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::trace!(id = %unique_id, error = %e, "query request errored");

                    if !e.is_connect() {
                        // The connection was established; a failure past
                        // that point is not safe to replay blindly.
                        if e.is_timeout() {
                            return Err(self.fatal(Cause::DeadlineExceeded(Some(e)), &statement, 0));
                        }

                        return Err(self.fatal(Cause::Send(e), &statement, 0));
                    }

                    let send_err = self.fatal(Cause::Send(e), &statement, 0);

                    match controller.before_retry(&mut payload).await {
                        Ok(new_body) => {
                            if let Some(new_body) = new_body {
                                body = new_body;
                            }

                            addrs.remove(idx);
                            last_root = Some(send_err.cause);

                            continue;
                        }
                        Err(refusal) => {
                            return Err(refusal_error(
                                refusal,
                                send_err.with_last_detail(last_code, last_message),
                            ));
                        }
                    }
                }
            };

            let status_code = response.status().as_u16();

            tracing::trace!(id = %unique_id, status = status_code, "received query response");

            if !(200..300).contains(&status_code) {
                let resp_body = response.bytes().await.map_err(|e| {
                    self.fatal(
                        Cause::wrapped("failed to read response body", e),
                        &statement,
                        status_code,
                    )
                })?;

                let Some(classified) = parse_error_response(
                    &resp_body,
                    &statement,
                    self.host(),
                    status_code,
                    last_code,
                    &last_message,
                ) else {
                    return Err(self
                        .fatal(
                            Cause::Message("query returned non-200 status code but no errors in body".to_string()),
                            &statement,
                            status_code,
                        )
                        .with_error_text(String::from_utf8_lossy(&resp_body))
                        .with_last_detail(last_code, last_message));
                };

                match handle_classified(classified, &mut controller, &mut payload, &mut body).await {
                    RetryOutcome::Retried { detail } => {
                        if let Some((code, message)) = detail {
                            last_code = code;
                            last_message = message;
                        }

                        continue;
                    }
                    RetryOutcome::Fatal(err) => return Err(err),
                }
            }

            let body_stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| Box::new(e) as BodyError))
                .boxed();

            let mut streamer = match QueryStreamer::new(body_stream, ROWS_ATTRIB).await {
                Ok(streamer) => streamer,
                Err(e) => {
                    return Err(self
                        .fatal(Cause::Stream(e), &statement, status_code)
                        .with_last_detail(last_code, last_message));
                }
            };

            let peeked = streamer.next_row().await;
            if peeked.is_none() {
                if let Some(e) = streamer.err() {
                    return Err(self.fatal(Cause::Stream(e), &statement, status_code));
                }

                let meta = match streamer.metadata() {
                    Ok(meta) => meta,
                    Err(e) => return Err(self.fatal(Cause::Stream(e), &statement, status_code)),
                };

                if let Some(classified) = parse_error_response(
                    &meta,
                    &statement,
                    self.host(),
                    status_code,
                    last_code,
                    &last_message,
                ) {
                    match handle_classified(classified, &mut controller, &mut payload, &mut body).await {
                        RetryOutcome::Retried { detail } => {
                            if let Some((code, message)) = detail {
                                last_code = code;
                                last_message = message;
                            }

                            continue;
                        }
                        RetryOutcome::Fatal(err) => return Err(err),
                    }
                }
            }

            return Ok(QueryRowReader::new(
                streamer,
                statement,
                self.host().to_string(),
                status_code,
                peeked,
            ));
        }
    }

    fn fatal(&self, cause: Cause, statement: &str, status_code: u16) -> EngineError {
        EngineError::new(cause, statement, self.host().to_string(), status_code)
    }

    async fn resolve(&self, deadline: Option<Instant>, statement: &str) -> Result<Vec<IpAddr>, EngineError> {
        let lookup = tokio::net::lookup_host((self.host(), self.port()));

        let resolved = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline.into(), lookup).await {
                Ok(resolved) => resolved,
                Err(_) => return Err(self.fatal(Cause::DeadlineExceeded(None), statement, 0)),
            },
            None => lookup.await,
        };

        let resolved = resolved.map_err(|e| self.fatal(Cause::Dns(e), statement, 0))?;

        let mut addrs: Vec<IpAddr> = Vec::new();
        for addr in resolved {
            if !addrs.contains(&addr.ip()) {
                addrs.push(addr.ip());
            }
        }

        Ok(addrs)
    }
}

enum RetryOutcome {
    Retried { detail: Option<(u32, String)> },
    Fatal(EngineError),
}

/// Applies the retry decision for a server-classified error: fatal when
/// any descriptor is non-retriable or the controller refuses another
/// attempt, otherwise backs off and reports the descriptor the failure
/// was attributed to for the running diagnostic.
async fn handle_classified(
    mut classified: EngineError,
    controller: &mut RetryController,
    payload: &mut serde_json::Map<String, serde_json::Value>,
    body: &mut Vec<u8>,
) -> RetryOutcome {
    let (first, retriable) = error_retriability(&classified);
    if !retriable {
        return RetryOutcome::Fatal(classified);
    }

    let detail = first.map(|desc| (desc.code, desc.message.clone()));

    match controller.before_retry(payload).await {
        Ok(new_body) => {
            if let Some(new_body) = new_body {
                *body = new_body;
            }

            RetryOutcome::Retried { detail }
        }
        Err(refusal) => {
            if let Some((code, message)) = detail {
                classified = classified.with_last_detail(code, message);
            }

            RetryOutcome::Fatal(refusal_error(refusal, classified))
        }
    }
}

/// Builds the error surfaced when the controller refuses another attempt:
/// exhausting the retry cap returns the triggering error unchanged, while
/// the deadline refusals keep its request context but replace the cause.
fn refusal_error(refusal: RetryRefusal, current: EngineError) -> EngineError {
    let mut err = current;

    match refusal {
        RetryRefusal::RetriesExhausted => {}
        RetryRefusal::DeadlineWouldBeExceeded => err.cause = Cause::DeadlineWouldBeExceeded,
        RetryRefusal::ServerTimedOut => err.cause = Cause::Timeout,
        RetryRefusal::Marshal(e) => {
            err.cause = Cause::wrapped("failed to marshal payload after updating timeout", e);
        }
    }

    err
}
