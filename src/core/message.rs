//! JSON-RPC wire encoding and inbound classification.
//!
//! Push-style JSON-RPC multiplexes three kinds of asynchronous messages over
//! one channel with different correlation keys: `id` for request/response and
//! `params.subscription` for ongoing notifications. Classification happens up
//! front, before any state lookup, so confirmations are never mistaken for
//! notifications or vice versa.

use bytes::Bytes;
use serde::Serialize;
use sonic_rs::{JsonValueTrait, Value};

use super::types::{EngineError, EngineResult, RequestId, RpcError, RpcSubscriptionId};

#[derive(Serialize)]
struct RpcCall<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a P,
}

/// Serialize an outgoing JSON-RPC call.
pub fn encode_request(
    request_id: RequestId,
    method: &str,
    params: &impl Serialize,
) -> EngineResult<Bytes> {
    let call = RpcCall {
        jsonrpc: "2.0",
        id: request_id.0,
        method,
        params,
    };
    sonic_rs::to_vec(&call)
        .map(Bytes::from)
        .map_err(|err| EngineError::ParseFailed(err.to_string()))
}

/// One inbound message, classified by shape.
#[derive(Clone, Debug)]
pub enum InboundMessage {
    /// Ongoing push for a confirmed subscription, keyed by the server id.
    Notification {
        method: String,
        rpc_subscription_id: RpcSubscriptionId,
        result: Value,
    },
    /// Acknowledgement of a subscribe request; carries the server-assigned id.
    Confirmation {
        request_id: RequestId,
        rpc_subscription_id: RpcSubscriptionId,
    },
    /// Request-scoped (with `request_id`) or connection-level (without) error.
    Failure {
        request_id: Option<RequestId>,
        error: RpcError,
    },
    /// Valid JSON that matches none of the known shapes.
    Unrecognized,
}

/// Classify a raw inbound payload.
///
/// Returns `Err` only for payloads that are not valid JSON; shape mismatches
/// map to [`InboundMessage::Unrecognized`].
pub fn classify(payload: &[u8]) -> EngineResult<InboundMessage> {
    let value: Value = sonic_rs::from_slice(payload)
        .map_err(|err| EngineError::ParseFailed(err.to_string()))?;

    // Notifications carry a method plus a server subscription id in params.
    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        if let Some(params) = value.get("params") {
            if let Some(subscription) = params.get("subscription").and_then(|s| s.as_u64()) {
                let result = params.get("result").cloned().unwrap_or_default();
                return Ok(InboundMessage::Notification {
                    method: method.to_string(),
                    rpc_subscription_id: RpcSubscriptionId(subscription),
                    result,
                });
            }
        }
        return Ok(InboundMessage::Unrecognized);
    }

    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        let request_id = value.get("id").and_then(|id| id.as_u64()).map(RequestId);
        return Ok(InboundMessage::Failure {
            request_id,
            error: RpcError { code, message },
        });
    }

    // Confirmations pair a request id with a numeric result and no method.
    if let (Some(id), Some(result)) = (
        value.get("id").and_then(|id| id.as_u64()),
        value.get("result").and_then(|r| r.as_u64()),
    ) {
        return Ok(InboundMessage::Confirmation {
            request_id: RequestId(id),
            rpc_subscription_id: RpcSubscriptionId(result),
        });
    }

    Ok(InboundMessage::Unrecognized)
}
