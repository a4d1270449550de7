//! Request and reply envelope types.

use bazaar_core::MethodError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An inbound JSON-RPC request.
///
/// `id` is the client's only correlation mechanism for out-of-order
/// replies; it is echoed verbatim into the reply and omitted when the
/// request carried none. `Some(Value::Null)` and `None` are distinct:
/// an explicit `"id": null` is echoed as null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol tag, nominally "2.0". Tolerated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    /// Method name (e.g. `cart_add`, `recover_session`).
    pub method: String,

    /// Parameters object; defaults to empty when absent.
    #[serde(default)]
    pub params: Value,

    /// Correlation id, copied verbatim into the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// An outbound reply: either `result` or `error`, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Result payload (success).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error payload (failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,

    /// Echoed request id, omitted when the request carried none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// The structured error object inside a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Stable numeric code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl From<MethodError> for ErrorObject {
    fn from(err: MethodError) -> Self {
        Self {
            code: err.code,
            message: err.message,
        }
    }
}

impl Response {
    /// Builds a success reply.
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Builds an error reply.
    pub fn error(id: Option<Value>, err: impl Into<ErrorObject>) -> Self {
        Self {
            result: None,
            error: Some(err.into()),
            id,
        }
    }

    /// Serializes the reply for the outbound queue.
    ///
    /// Serialization of these envelopes cannot fail for any value the
    /// gateway constructs; a failure is downgraded to an id-less
    /// internal error reply rather than a panic.
    pub fn into_json(self) -> String {
        match serde_json::to_string(&self) {
            Ok(json) => json,
            Err(_) => {
                r#"{"error":{"code":-32603,"message":"reply serialization failed"}}"#.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_minimal() {
        let req: Request = serde_json::from_str(r#"{"method":"user_islogin"}"#).unwrap();
        assert_eq!(req.method, "user_islogin");
        assert_eq!(req.params, Value::Null);
        assert!(req.id.is_none());
    }

    #[test]
    fn test_request_null_id_is_preserved() {
        let req: Request =
            serde_json::from_str(r#"{"method":"m","id":null}"#).unwrap();
        assert_eq!(req.id, Some(Value::Null));
    }

    #[test]
    fn test_result_reply_echoes_id() {
        let reply = Response::result(Some(json!(7)), json!({"ok": true}));
        let json = reply.into_json();
        assert!(json.contains("\"id\":7"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_error_reply_without_id_omits_field() {
        let reply = Response::error(None, MethodError::invalid_request());
        let json = reply.into_json();
        assert!(!json.contains("\"id\""));
        assert!(json.contains("-32600"));
    }

    #[test]
    fn test_error_object_from_method_error() {
        use bazaar_core::MethodError;
        let obj: ErrorObject = MethodError::method_not_found("goods_list").into();
        assert_eq!(obj.code, -32601);
        assert!(obj.message.contains("goods_list"));
    }

    #[test]
    fn test_string_id_roundtrip() {
        let reply = Response::result(Some(json!("req-abc")), json!(1));
        let parsed: Response = serde_json::from_str(&reply.into_json()).unwrap();
        assert_eq!(parsed.id, Some(json!("req-abc")));
    }
}
