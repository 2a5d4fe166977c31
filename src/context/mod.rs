//! Context codec
//!
//! Embeds an arbitrary structured payload into a compact, URL/JSON-safe
//! string so it survives the round trip through a third-party UI field.
//! Pipeline: serde serialize -> zlib compress -> URL-safe base64 (no
//! padding). A later, unrelated callback can then reconstruct full context
//! without a server-side session lookup.
//!
//! Decoding is fail-closed: truncated or corrupt input yields `None`,
//! never an error, because absence is the common case for callers.

use std::io::Write;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Reserved key inside a transported state field holding an encoded payload.
const PAYLOAD_KEY: &str = "payload";

/// Errors for context encoding.
///
/// Only caller misuse surfaces here (a payload the serializer rejects);
/// decode failures never do.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("payload is not serializable: {0}")]
    Unserializable(#[from] serde_json::Error),
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Encode a payload into a transport-safe opaque string.
pub fn encode<T: Serialize>(payload: &T) -> Result<String, ContextError> {
    let raw = serde_json::to_vec(payload)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;
    Ok(URL_SAFE_NO_PAD.encode(compressed))
}

/// Decode a string produced by [`encode`].
///
/// Returns `None` for anything that does not decode cleanly end to end.
pub fn decode<T: DeserializeOwned>(encoded: &str) -> Option<T> {
    let compressed = URL_SAFE_NO_PAD.decode(encoded.as_bytes()).ok()?;
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder.write_all(&compressed).ok()?;
    let raw = decoder.finish().ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Read a transported dialog-state field.
///
/// The state field is a JSON object carried through the platform; its
/// `payload` entry, when present, holds an encoded context which is
/// inflated in place. A field that is not valid JSON yields an empty map.
pub fn read_embedded_state(state: &str) -> Map<String, Value> {
    let mut data: Map<String, Value> = match serde_json::from_str(state) {
        Ok(Value::Object(map)) => map,
        _ => return Map::new(),
    };

    let decoded = data
        .get(PAYLOAD_KEY)
        .and_then(Value::as_str)
        .and_then(decode::<Value>);
    if let Some(payload) = decoded {
        data.insert(PAYLOAD_KEY.to_string(), payload);
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_nested_payload() {
        let payload = json!({
            "step": "confirm",
            "items": [1, 2, 3],
            "nested": {"flag": true, "note": null},
            "who": "user-42",
        });

        let encoded = encode(&payload).unwrap();
        let decoded: Value = decode(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_encoded_alphabet_is_transport_safe() {
        let payload = json!({"text": "тест с юникодом и \"кавычками\""});
        let encoded = encode(&payload).unwrap();

        for c in encoded.chars() {
            assert!(
                c.is_ascii_alphanumeric() || c == '-' || c == '_',
                "unsafe char {c:?} in encoded output"
            );
        }
    }

    #[test]
    fn test_decode_fails_closed_on_garbage() {
        assert_eq!(decode::<Value>(""), None);
        assert_eq!(decode::<Value>("not-base64!!"), None);
        // Valid base64, but not zlib data underneath.
        let bogus = URL_SAFE_NO_PAD.encode(b"plain bytes");
        assert_eq!(decode::<Value>(&bogus), None);
    }

    #[test]
    fn test_decode_fails_closed_on_truncation() {
        let payload = json!({"a": "long enough value to compress down"});
        let encoded = encode(&payload).unwrap();
        let truncated = &encoded[..encoded.len() / 2];
        assert_eq!(decode::<Value>(truncated), None);
    }

    #[test]
    fn test_read_embedded_state_inflates_payload() {
        let payload = json!({"resume_at": "signup:email"});
        let state = serde_json::to_string(&json!({
            "session_id": "abc",
            "payload": encode(&payload).unwrap(),
        }))
        .unwrap();

        let parsed = read_embedded_state(&state);
        assert_eq!(parsed.get("session_id"), Some(&json!("abc")));
        assert_eq!(parsed.get("payload"), Some(&payload));
    }

    #[test]
    fn test_read_embedded_state_rejects_non_json() {
        assert!(read_embedded_state("plain session id").is_empty());
        assert!(read_embedded_state("").is_empty());
    }

    #[test]
    fn test_read_embedded_state_keeps_undecodable_payload() {
        // A payload entry that does not decode stays as-is rather than
        // erroring; callers treat it as opaque.
        let parsed = read_embedded_state(r#"{"payload": "zzz"}"#);
        assert_eq!(parsed.get("payload"), Some(&Value::String("zzz".into())));
    }
}
