//! Bazaar Protocol - JSON-RPC 2.0 wire envelope
//!
//! Whole-message JSON-RPC 2.0 over one upgraded bidirectional
//! connection: no chunking, no batching. `frame` classifies a raw text
//! frame into the three outcomes the read loop distinguishes; `message`
//! holds the request/reply envelope types.

pub mod frame;
pub mod message;

pub use frame::{classify, Frame};
pub use message::{ErrorObject, Request, Response};
