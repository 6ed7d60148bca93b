//! Row cursor handed back by the executor.

use bytes::Bytes;

use super::error::{parse_error_response, Cause, EngineError};
use super::streamer::{QueryStreamer, StreamError};

/// Single-consumer cursor over the streamed rows of a query response.
///
/// The executor peeks one row before returning the reader so that an
/// error-only response can be classified (and possibly retried) without
/// the caller ever seeing a reader; the peeked row is replayed on the
/// first [`QueryRowReader::next_row`] call.
pub(crate) struct QueryRowReader {
    streamer: QueryStreamer,
    statement: String,
    endpoint: String,
    status_code: u16,
    peeked: Option<Bytes>,
}

impl QueryRowReader {
    pub(crate) fn new(
        streamer: QueryStreamer,
        statement: String,
        endpoint: String,
        status_code: u16,
        peeked: Option<Bytes>,
    ) -> QueryRowReader {
        QueryRowReader {
            streamer,
            statement,
            endpoint,
            status_code,
            peeked,
        }
    }

    /// Reads the next row's bytes from the stream.
    pub(crate) async fn next_row(&mut self) -> Option<Bytes> {
        if let Some(peeked) = self.peeked.take() {
            return Some(peeked);
        }

        self.streamer.next_row().await
    }

    /// Any error that occurred during streaming, or that the server
    /// reported in the response trailer.
    pub(crate) fn err(&self) -> Option<EngineError> {
        if let Some(err) = self.streamer.err() {
            return Some(EngineError::new(
                Cause::Stream(err),
                self.statement.clone(),
                self.endpoint.clone(),
                self.status_code,
            ));
        }

        let meta = match self.streamer.metadata() {
            Ok(meta) => meta,
            // The trailer has not arrived yet; nothing has failed.
            Err(StreamError::MetaDataUnavailable) => return None,
            Err(err) => {
                return Some(EngineError::new(
                    Cause::Stream(err),
                    self.statement.clone(),
                    self.endpoint.clone(),
                    self.status_code,
                ));
            }
        };

        parse_error_response(&meta, &self.statement, &self.endpoint, self.status_code, 0, "")
    }

    /// The non-row bytes streamed in the response.
    pub(crate) fn metadata(&self) -> Result<Bytes, EngineError> {
        self.streamer.metadata().map_err(|err| {
            EngineError::new(
                Cause::Stream(err),
                self.statement.clone(),
                self.endpoint.clone(),
                self.status_code,
            )
        })
    }

    /// Shuts down the underlying connection. Idempotent.
    pub(crate) fn close(&mut self) {
        self.peeked = None;
        self.streamer.close();
    }
}
