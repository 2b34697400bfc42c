use bytes::Bytes;

use super::types::{EngineError, EngineResult};

/// Transport-neutral inbound payload.
///
/// Hosts may deliver either UTF-8 text frames or binary frames; binary frames
/// must decode to UTF-8 before JSON parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportPayload {
    Text(Bytes),
    Binary(Bytes),
}

impl TransportPayload {
    #[inline]
    pub fn text_static(s: &'static str) -> Self {
        Self::Text(Bytes::from_static(s.as_bytes()))
    }

    /// Raw payload bytes regardless of framing.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        match self {
            TransportPayload::Text(bytes) | TransportPayload::Binary(bytes) => bytes.as_ref(),
        }
    }

    /// Decode the payload to UTF-8.
    pub fn as_utf8(&self) -> EngineResult<&str> {
        std::str::from_utf8(self.bytes())
            .map_err(|err| EngineError::ParseFailed(format!("payload is not UTF-8: {err}")))
    }
}

/// Convert owned bytes into a payload, preferring text when valid UTF-8.
#[inline]
pub fn into_payload<B>(bytes: B) -> TransportPayload
where
    B: Into<Bytes>,
{
    let payload = bytes.into();
    if std::str::from_utf8(payload.as_ref()).is_ok() {
        TransportPayload::Text(payload)
    } else {
        TransportPayload::Binary(payload)
    }
}
