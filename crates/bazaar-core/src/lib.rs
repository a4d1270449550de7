//! Bazaar Core - Shared types for the marketplace gateway
//!
//! This crate provides the domain types shared between the gateway
//! daemon (bazaard) and the wire protocol (bazaar-protocol): session
//! identity, authenticated principals, the durable session record, and
//! the error type raised across the method-dispatch seam.

pub mod error;
pub mod session;

// Re-exports for convenience
pub use error::{codes, MethodError, MethodResult};
pub use session::{Principal, Session, SessionId, SessionRecord, UserId};
