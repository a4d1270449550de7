//! Classifying one raw inbound frame.
//!
//! The read loop distinguishes exactly three outcomes, with three very
//! different consequences: a malformed payload tears the connection
//! down with no reply, an invalid envelope earns an error reply, and a
//! call is dispatched.

use serde_json::Value;

use crate::message::Request;

/// Outcome of classifying one inbound text frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Not JSON, or JSON that is not an object. Fatal protocol
    /// violation: the connection is torn down silently.
    Malformed,

    /// A well-formed object that is not a valid request envelope
    /// (missing or non-string `method`). Earns an "Invalid Request"
    /// reply, correlated when an id could be extracted.
    Invalid {
        /// The id salvaged from the envelope, if any.
        id: Option<Value>,
    },

    /// A dispatchable request.
    Call(Request),
}

/// Classifies one raw text frame.
pub fn classify(text: &str) -> Frame {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Frame::Malformed,
    };

    let Value::Object(ref map) = value else {
        return Frame::Malformed;
    };

    match map.get("method") {
        Some(Value::String(method)) if !method.is_empty() => {}
        _ => {
            return Frame::Invalid {
                id: map.get("id").cloned(),
            }
        }
    }

    match serde_json::from_value::<Request>(value) {
        Ok(req) => Frame::Call(req),
        // Object with a method but an otherwise broken envelope
        Err(_) => Frame::Invalid { id: None },
    }
}
