//! The error type crossing the method-dispatch seam.

use thiserror::Error;

/// Stable numeric error codes carried in error replies.
///
/// The -32xxx range follows JSON-RPC 2.0; -320xx is the server-defined
/// range used for gateway-level failures.
pub mod codes {
    /// The payload was a well-formed object but not a valid request envelope.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The requested method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// The params did not match what the method expects.
    pub const INVALID_PARAMS: i64 = -32602;
    /// An unexpected failure inside the gateway or a handler.
    pub const INTERNAL: i64 = -32603;
    /// The method requires a session and none is attached yet.
    pub const SESSION_NEEDED: i64 = -32000;
    /// The method requires an authenticated principal.
    pub const LOGIN_NEEDED: i64 = -32001;
    /// The session store rejected or lost the operation.
    pub const STORE_UNAVAILABLE: i64 = -32002;
}

/// Error raised by a method handler (or the gateway on its behalf).
///
/// Carries a stable numeric code and a human-readable message; maps
/// directly onto the JSON-RPC error object in the reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct MethodError {
    /// Stable numeric code from [`codes`] or a domain-specific range.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// Result type for method handlers.
pub type MethodResult<T> = Result<T, MethodError>;

impl MethodError {
    /// Creates an error with an arbitrary code.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The envelope was an object but not a valid request.
    pub fn invalid_request() -> Self {
        Self::new(codes::INVALID_REQUEST, "Invalid Request")
    }

    /// The named method does not exist.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// The params were rejected by the handler.
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, reason)
    }

    /// An unexpected internal failure.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, reason)
    }

    /// A session must be recovered before calling this method.
    pub fn session_needed() -> Self {
        Self::new(codes::SESSION_NEEDED, "session needed")
    }

    /// An authenticated principal is required.
    pub fn login_needed() -> Self {
        Self::new(codes::LOGIN_NEEDED, "login needed")
    }

    /// The session store could not serve the request.
    pub fn store_unavailable() -> Self {
        Self::new(codes::STORE_UNAVAILABLE, "session store unavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = MethodError::method_not_found("cart_add");
        assert!(err.to_string().contains("cart_add"));
        assert!(err.to_string().contains("-32601"));
    }

    #[test]
    fn test_constructors_use_stable_codes() {
        assert_eq!(MethodError::invalid_request().code, codes::INVALID_REQUEST);
        assert_eq!(MethodError::session_needed().code, codes::SESSION_NEEDED);
        assert_eq!(MethodError::internal("boom").code, codes::INTERNAL);
    }
}
