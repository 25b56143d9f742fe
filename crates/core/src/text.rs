//! Canonical rendering of an `Event`'s `data` field to the UTF-8 text that
//! goes out over the wire.
//!
//! Three cases, in order: a string is sent verbatim; raw bytes are sent
//! verbatim provided they are valid UTF-8 (SSE is a text protocol); anything
//! else is rendered as canonical JSON. This is the single place both the
//! in-process and Redis-backed buses funnel payloads through before they
//! reach the wire, so "what does this event's data look like on the wire"
//! has one answer regardless of transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A value about to become an SSE `data:` field (or a queued job's payload).
///
/// Serializable so a Redis-backed bus can carry it across processes as-is
/// instead of pre-rendering to text and losing the distinction between "a
/// JSON object" and "a string that happens to look like JSON".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl Payload {
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        let json = serde_json::to_value(value).map_err(|e| Error::Other(e.into()))?;
        Ok(Payload::Json(json))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}

/// Render a payload to the text that should appear after `data:`.
///
/// Bytes that aren't valid UTF-8 are rejected rather than lossily
/// re-encoded: SSE has no way to carry binary data, so silently mangling it
/// would just move the bug downstream.
pub fn render(payload: &Payload) -> Result<String> {
    match payload {
        Payload::Text(s) => Ok(s.clone()),
        Payload::Bytes(b) => String::from_utf8(b.clone())
            .map_err(|e| Error::Other(anyhow::anyhow!("payload is not valid utf-8: {e}"))),
        Payload::Json(v) => {
            serde_json::to_string(v).map_err(|e| Error::Other(e.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_is_rendered_verbatim() {
        let payload = Payload::from("hello");
        assert_eq!(render(&payload).unwrap(), "hello");
    }

    #[test]
    fn utf8_bytes_are_rendered_verbatim() {
        let payload = Payload::from(b"hello".to_vec());
        assert_eq!(render(&payload).unwrap(), "hello");
    }

    #[test]
    fn non_utf8_bytes_are_rejected() {
        let payload = Payload::from(vec![0xff, 0xfe]);
        assert!(render(&payload).is_err());
    }

    #[test]
    fn json_is_rendered_canonically() {
        let payload = Payload::from(json!({"a": 1}));
        assert_eq!(render(&payload).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn from_json_serializes_struct() {
        #[derive(Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }
        let payload = Payload::from_json(&Point { x: 1, y: 2 }).unwrap();
        assert_eq!(render(&payload).unwrap(), r#"{"x":1,"y":2}"#);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any UTF-8 string, round-tripped through the bytes variant,
            // renders identically to rendering it as text directly.
            #[test]
            fn bytes_and_text_variants_render_the_same_utf8_string(s in "\\PC*") {
                let as_text = render(&Payload::from(s.clone())).unwrap();
                let as_bytes = render(&Payload::from(s.clone().into_bytes())).unwrap();
                prop_assert_eq!(as_text, s);
                prop_assert_eq!(as_bytes, s);
            }
        }
    }
}
