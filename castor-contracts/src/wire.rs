//! JSON wire codec shared by both websocket endpoints. The coordinator side
//! speaks axum's `ws::Message`, the daemon side tungstenite's; both reduce
//! to text/binary JSON, so the conversions here work on plain strings and
//! byte slices and each endpoint adapts its own message type.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported websocket payload")]
    UnsupportedPayload,
}

/// Serialize a frame for a text websocket message.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, WireError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a frame from a text websocket message.
pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T, WireError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a frame from a binary websocket message.
pub fn decode_frame_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serde adapter encoding `Vec<u8>` fields as base64 strings, keeping raw
/// sample payloads and init blobs JSON-safe.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DaemonFrame, UnregisterRequest};

    #[test]
    fn text_and_binary_decode_agree() {
        let frame = DaemonFrame::Unregister(UnregisterRequest {
            daemon_id: "d-1".into(),
            reason: "shutting down".into(),
        });
        let text = encode_frame(&frame).unwrap();
        let from_text: DaemonFrame = decode_frame(&text).unwrap();
        let from_bytes: DaemonFrame = decode_frame_bytes(text.as_bytes()).unwrap();
        assert_eq!(from_text, from_bytes);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = decode_frame::<DaemonFrame>("{\"frame\":\"nope\"}");
        assert!(matches!(err, Err(WireError::Json(_))));
    }
}
