//! Incremental parsing of the query response envelope.
//!
//! The response is a single JSON object in which one member (`results`)
//! is an array that can dwarf everything else. The streamer tokenizes the
//! body as chunks arrive: members ahead of `results` are buffered, rows
//! are handed out one at a time as raw bytes, and members after the array
//! are buffered too. Once the object closes, the buffered members are
//! exposed as a single metadata JSON object. Memory use is bounded by the
//! largest single row plus the (small) non-row members.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::leakcheck;

pub(crate) type BodyError = Box<dyn std::error::Error + Send + Sync>;
pub(crate) type BodyStream = BoxStream<'static, Result<Bytes, BodyError>>;

/// A failure while streaming the response body.
///
/// Sticky: once raised, the streamer stays in the failed state and every
/// accessor reports the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum StreamError {
    #[error("failed to read response body: {0}")]
    Read(String),

    #[error("unexpected end of response body")]
    UnexpectedEof,

    #[error("malformed response envelope: {0}")]
    Malformed(String),

    #[error("cannot read meta-data until the results stream has been fully read")]
    MetaDataUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Rows,
    Done,
    Failed,
}

pub(crate) struct QueryStreamer {
    source: Option<BodyStream>,
    buf: BytesMut,
    state: State,
    first_row: bool,
    attributes: serde_json::Map<String, serde_json::Value>,
    meta_bytes: Option<Bytes>,
    err: Option<StreamError>,
    tracker: leakcheck::BodyTracker,
}

impl std::fmt::Debug for QueryStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStreamer").finish_non_exhaustive()
    }
}

impl QueryStreamer {
    /// Consumes the envelope up to the opening of the `rows_attrib` array,
    /// buffering any members that precede it. If the object closes without
    /// the array the streamer starts out exhausted and all members become
    /// metadata.
    pub(crate) async fn new(source: BodyStream, rows_attrib: &str) -> Result<QueryStreamer, StreamError> {
        let mut streamer = QueryStreamer {
            source: Some(source),
            buf: BytesMut::new(),
            state: State::Rows,
            first_row: true,
            attributes: serde_json::Map::new(),
            meta_bytes: None,
            err: None,
            tracker: leakcheck::BodyTracker::register(),
        };

        streamer.read_prologue(rows_attrib).await?;

        Ok(streamer)
    }

    /// Returns the next row as raw JSON bytes, or `None` once the array is
    /// exhausted (or after a failure; see [`QueryStreamer::err`]).
    pub(crate) async fn next_row(&mut self) -> Option<Bytes> {
        if self.state != State::Rows {
            return None;
        }

        match self.read_row().await {
            Ok(row) => row,
            Err(e) => {
                self.fail(e);

                None
            }
        }
    }

    /// The sticky streaming error, if any.
    pub(crate) fn err(&self) -> Option<StreamError> {
        self.err.clone()
    }

    /// The non-row members of the envelope as one JSON object. Only
    /// available after `next_row` has returned `None`.
    pub(crate) fn metadata(&self) -> Result<Bytes, StreamError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }

        self.meta_bytes.clone().ok_or(StreamError::MetaDataUnavailable)
    }

    /// Releases the underlying connection. Idempotent.
    pub(crate) fn close(&mut self) {
        self.source = None;
        self.buf.clear();
        self.tracker.release();

        if self.state == State::Rows {
            self.state = State::Done;
        }
    }

    fn fail(&mut self, err: StreamError) {
        self.err = Some(err);
        self.state = State::Failed;
        self.source = None;
        self.tracker.release();
    }

    async fn read_prologue(&mut self, rows_attrib: &str) -> Result<(), StreamError> {
        self.expect_byte(b'{').await?;

        let mut first_member = true;

        loop {
            match self.peek_non_ws().await? {
                b'}' => {
                    self.buf.advance(1);
                    self.finish();

                    return Ok(());
                }
                b',' if !first_member => {
                    self.buf.advance(1);
                }
                _ if first_member => {}
                other => {
                    return Err(StreamError::Malformed(format!(
                        "expected ',' or '}}' between members, found {:?}",
                        other as char
                    )));
                }
            }
            first_member = false;

            let key = self.read_key().await?;
            self.expect_byte(b':').await?;

            if key == rows_attrib {
                self.expect_byte(b'[').await?;

                return Ok(());
            }

            let raw = self.read_raw_value().await?;
            let value = serde_json::from_slice(&raw)
                .map_err(|e| StreamError::Malformed(format!("invalid value for member {key:?}: {e}")))?;
            self.attributes.insert(key, value);
        }
    }

    async fn read_row(&mut self) -> Result<Option<Bytes>, StreamError> {
        match self.peek_non_ws().await? {
            b']' => {
                self.buf.advance(1);
                self.read_epilogue().await?;

                return Ok(None);
            }
            b',' if !self.first_row => {
                self.buf.advance(1);
                self.skip_ws().await?;
            }
            _ if self.first_row => {}
            other => {
                return Err(StreamError::Malformed(format!(
                    "expected ',' or ']' between rows, found {:?}",
                    other as char
                )));
            }
        }
        self.first_row = false;

        let row = self.read_raw_value().await?;

        Ok(Some(row))
    }

    async fn read_epilogue(&mut self) -> Result<(), StreamError> {
        loop {
            match self.peek_non_ws().await? {
                b'}' => {
                    self.buf.advance(1);
                    self.finish();

                    return Ok(());
                }
                b',' => {
                    self.buf.advance(1);
                }
                other => {
                    return Err(StreamError::Malformed(format!(
                        "expected ',' or '}}' after results, found {:?}",
                        other as char
                    )));
                }
            }

            let key = self.read_key().await?;
            self.expect_byte(b':').await?;

            let raw = self.read_raw_value().await?;
            let value = serde_json::from_slice(&raw)
                .map_err(|e| StreamError::Malformed(format!("invalid value for member {key:?}: {e}")))?;
            self.attributes.insert(key, value);
        }
    }

    fn finish(&mut self) {
        let meta = serde_json::to_vec(&self.attributes).unwrap_or_default();
        self.meta_bytes = Some(Bytes::from(meta));
        self.state = State::Done;
        self.source = None;
        self.tracker.release();
    }

    // -- tokenizer -----------------------------------------------------------

    async fn fill(&mut self) -> Result<(), StreamError> {
        loop {
            let Some(source) = self.source.as_mut() else {
                return Err(StreamError::UnexpectedEof);
            };

            match source.next().await {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.buf.extend_from_slice(&chunk);

                    return Ok(());
                }
                Some(Err(e)) => return Err(StreamError::Read(e.to_string())),
                None => {
                    self.source = None;

                    return Err(StreamError::UnexpectedEof);
                }
            }
        }
    }

    async fn skip_ws(&mut self) -> Result<(), StreamError> {
        loop {
            while let Some(&b) = self.buf.first() {
                if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                    self.buf.advance(1);
                } else {
                    return Ok(());
                }
            }

            self.fill().await?;
        }
    }

    async fn peek_non_ws(&mut self) -> Result<u8, StreamError> {
        self.skip_ws().await?;

        Ok(self.buf[0])
    }

    async fn expect_byte(&mut self, want: u8) -> Result<(), StreamError> {
        let got = self.peek_non_ws().await?;
        if got != want {
            return Err(StreamError::Malformed(format!(
                "expected {:?}, found {:?}",
                want as char, got as char
            )));
        }
        self.buf.advance(1);

        Ok(())
    }

    async fn read_key(&mut self) -> Result<String, StreamError> {
        if self.peek_non_ws().await? != b'"' {
            return Err(StreamError::Malformed("expected a string member name".to_string()));
        }

        let raw = self.read_raw_value().await?;

        serde_json::from_slice(&raw).map_err(|e| StreamError::Malformed(format!("invalid member name: {e}")))
    }

    /// Scans one complete JSON value and returns its exact bytes. Assumes
    /// leading whitespace has been consumed.
    async fn read_raw_value(&mut self) -> Result<Bytes, StreamError> {
        self.skip_ws().await?;

        let mut idx = 0usize;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut is_scalar = false;
        let mut started = false;

        loop {
            if idx == self.buf.len() {
                self.fill().await?;
            }

            let b = self.buf[idx];

            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                    if depth == 0 {
                        idx += 1;

                        break;
                    }
                }
                idx += 1;

                continue;
            }

            if !started {
                started = true;
                match b {
                    b'"' => {
                        in_string = true;
                        idx += 1;

                        continue;
                    }
                    b'{' | b'[' => {
                        depth = 1;
                        idx += 1;

                        continue;
                    }
                    b',' | b'}' | b']' | b':' => {
                        return Err(StreamError::Malformed(format!(
                            "expected a value, found {:?}",
                            b as char
                        )));
                    }
                    _ => {
                        is_scalar = true;
                        idx += 1;

                        continue;
                    }
                }
            }

            if is_scalar {
                match b {
                    b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r' => break,
                    _ => idx += 1,
                }

                continue;
            }

            match b {
                b'"' => {
                    in_string = true;
                    idx += 1;
                }
                b'{' | b'[' => {
                    depth += 1;
                    idx += 1;
                }
                b'}' | b']' => {
                    depth -= 1;
                    idx += 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => idx += 1,
            }
        }

        Ok(self.buf.split_to(idx).freeze())
    }
}

impl Drop for QueryStreamer {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use futures_util::stream;

    pub(crate) fn body_stream(chunks: Vec<&'static [u8]>) -> BodyStream {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, BodyError>(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    pub(crate) fn single_chunk(body: &'static [u8]) -> BodyStream {
        body_stream(vec![body])
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::{body_stream, single_chunk};
    use super::*;

    async fn collect_rows(streamer: &mut QueryStreamer) -> Vec<String> {
        let mut rows = Vec::new();
        while let Some(row) = streamer.next_row().await {
            rows.push(String::from_utf8(row.to_vec()).unwrap());
        }

        rows
    }

    #[tokio::test]
    async fn test_streams_rows_in_order() {
        let body = br#"{"requestID": "abc", "results": [1, 2, 3], "status": "success"}"#;
        let mut streamer = QueryStreamer::new(single_chunk(body), "results").await.unwrap();

        assert_eq!(collect_rows(&mut streamer).await, vec!["1", "2", "3"]);
        assert!(streamer.err().is_none());

        let meta: serde_json::Value = serde_json::from_slice(&streamer.metadata().unwrap()).unwrap();
        assert_eq!(meta["requestID"], "abc");
        assert_eq!(meta["status"], "success");
    }

    #[tokio::test]
    async fn test_object_rows_and_members_on_both_sides() {
        let body = br#"{
            "requestID": "id-1",
            "signature": {"*": "*"},
            "results": [{"a": [1, 2]}, {"b": "}]"}],
            "metrics": {"resultCount": 2}
        }"#;
        let mut streamer = QueryStreamer::new(single_chunk(body), "results").await.unwrap();

        let rows = collect_rows(&mut streamer).await;
        assert_eq!(rows, vec![r#"{"a": [1, 2]}"#, r#"{"b": "}]"}"#]);

        let meta: serde_json::Value = serde_json::from_slice(&streamer.metadata().unwrap()).unwrap();
        assert_eq!(meta["requestID"], "id-1");
        assert_eq!(meta["signature"]["*"], "*");
        assert_eq!(meta["metrics"]["resultCount"], 2);
    }

    #[tokio::test]
    async fn test_rows_split_across_chunks() {
        let mut streamer = QueryStreamer::new(
            body_stream(vec![
                br#"{"requestID": "x", "resu"#,
                br#"lts": [{"n": 1"#,
                br#"}, {"n"#,
                br#"": 22}], "status": "suc"#,
                br#"cess"}"#,
            ]),
            "results",
        )
        .await
        .unwrap();

        let rows = collect_rows(&mut streamer).await;
        assert_eq!(rows, vec![r#"{"n": 1}"#, r#"{"n": 22}"#]);

        let meta: serde_json::Value = serde_json::from_slice(&streamer.metadata().unwrap()).unwrap();
        assert_eq!(meta["status"], "success");
    }

    #[tokio::test]
    async fn test_empty_results() {
        let body = br#"{"results": [], "status": "success"}"#;
        let mut streamer = QueryStreamer::new(single_chunk(body), "results").await.unwrap();

        assert!(streamer.next_row().await.is_none());
        assert!(streamer.err().is_none());

        let meta: serde_json::Value = serde_json::from_slice(&streamer.metadata().unwrap()).unwrap();
        assert_eq!(meta["status"], "success");
    }

    #[tokio::test]
    async fn test_envelope_without_results_is_all_metadata() {
        let body = br#"{"requestID": "y", "errors": [{"code": 24000, "msg": "syntax"}]}"#;
        let mut streamer = QueryStreamer::new(single_chunk(body), "results").await.unwrap();

        assert!(streamer.next_row().await.is_none());

        let meta: serde_json::Value = serde_json::from_slice(&streamer.metadata().unwrap()).unwrap();
        assert_eq!(meta["errors"][0]["code"], 24000);
    }

    #[tokio::test]
    async fn test_metadata_unavailable_until_exhausted() {
        let body = br#"{"results": [1, 2], "status": "success"}"#;
        let mut streamer = QueryStreamer::new(single_chunk(body), "results").await.unwrap();

        assert_eq!(streamer.metadata().unwrap_err(), StreamError::MetaDataUnavailable);

        streamer.next_row().await;
        assert_eq!(streamer.metadata().unwrap_err(), StreamError::MetaDataUnavailable);

        while streamer.next_row().await.is_some() {}
        assert!(streamer.metadata().is_ok());
    }

    #[tokio::test]
    async fn test_truncated_body_latches_error() {
        let body = br#"{"results": [1, 2"#;
        let mut streamer = QueryStreamer::new(single_chunk(body), "results").await.unwrap();

        assert!(streamer.next_row().await.is_some());
        assert!(streamer.next_row().await.is_none());

        assert_eq!(streamer.err().unwrap(), StreamError::UnexpectedEof);
        assert_eq!(streamer.metadata().unwrap_err(), StreamError::UnexpectedEof);

        // Sticky: further pulls keep reporting the same failure.
        assert!(streamer.next_row().await.is_none());
        assert_eq!(streamer.err().unwrap(), StreamError::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_rejected() {
        let err = QueryStreamer::new(single_chunk(b"[1, 2, 3]"), "results").await.unwrap_err();

        assert!(matches!(err, StreamError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_malformed_row_separator_latches_error() {
        let body = br#"{"results": [1 2]}"#;
        let mut streamer = QueryStreamer::new(single_chunk(body), "results").await.unwrap();

        assert!(streamer.next_row().await.is_some());
        assert!(streamer.next_row().await.is_none());
        assert!(matches!(streamer.err().unwrap(), StreamError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let body = br#"{"results": [1, 2, 3]}"#;
        let mut streamer = QueryStreamer::new(single_chunk(body), "results").await.unwrap();

        assert!(streamer.next_row().await.is_some());
        streamer.close();
        streamer.close();

        assert!(streamer.next_row().await.is_none());
        assert!(streamer.err().is_none());
    }

    #[tokio::test]
    async fn test_string_rows_with_escapes() {
        let body = br#"{"results": ["plain", "with \"quotes\"", "with \\ backslash"]}"#;
        let mut streamer = QueryStreamer::new(single_chunk(body), "results").await.unwrap();

        let rows = collect_rows(&mut streamer).await;
        assert_eq!(
            rows,
            vec![r#""plain""#, r#""with \"quotes\"""#, r#""with \\ backslash""#]
        );
    }
}
