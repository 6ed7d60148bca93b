//! Row decoding.
//!
//! Rows arrive as raw JSON bytes; an [`Unmarshaler`] turns them into a
//! `serde_json::Value` from which [`Row::content_as`](crate::Row::content_as)
//! produces the caller's type. The indirection exists so applications can
//! swap in lenient or validating decoders per cluster or per query.

use crate::error::Error;

/// Decodes raw row bytes into a JSON value.
pub trait Unmarshaler: Send + Sync {
    /// Decodes one row.
    fn unmarshal(&self, data: &[u8]) -> Result<serde_json::Value, Error>;
}

/// The default unmarshaler: strict JSON via `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonUnmarshaler;

impl JsonUnmarshaler {
    /// Creates a new `JsonUnmarshaler`.
    pub fn new() -> JsonUnmarshaler {
        JsonUnmarshaler
    }
}

impl Unmarshaler for JsonUnmarshaler {
    fn unmarshal(&self, data: &[u8]) -> Result<serde_json::Value, Error> {
        serde_json::from_slice(data).map_err(|e| Error::Unmarshal {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_json_unmarshaler_decodes() {
        let value = JsonUnmarshaler::new().unmarshal(br#"{"a": 1}"#).unwrap();

        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_json_unmarshaler_rejects_malformed() {
        let err = JsonUnmarshaler::new().unmarshal(b"{nope").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unmarshal);
    }
}
