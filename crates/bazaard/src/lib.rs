//! Bazaar Gateway Daemon - connection, session and RPC runtime
//!
//! This crate provides the core every marketplace interaction rides on:
//! - `pool` - fixed set of single-threaded cooperative run loops
//! - `transport` - plain / TLS / unix sockets behind one capability surface
//! - `listener` - accept loops, connection ids, graceful drain
//! - `connection` - per-connection state, idempotent teardown
//! - `engine` - WebSocket upgrade and the JSON-RPC read/write loops
//! - `store` - durable, TTL-expiring session persistence
//! - `registry` - live-connection index for targeted and broadcast push
//! - `dispatch` - the seam business logic plugs into
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        bazaard                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────┐   accept    ┌─────────────────────────────┐  │
//! │  │  Listener  │────────────▶│  Engine (per connection)    │  │
//! │  │ (tcp/tls/  │             │  read loop ─┬─ write loop   │  │
//! │  │   unix)    │             └─────────────┼───────────────┘  │
//! │  └────────────┘                           │ fan-out          │
//! │                                           ▼                  │
//! │  ┌──────────────────┐        ┌─────────────────────────────┐ │
//! │  │ SessionStore     │◀──────▶│  MethodHandler (external)   │ │
//! │  │ (persistence     │        └─────────────────────────────┘ │
//! │  │  loop, sqlite)   │        ┌─────────────────────────────┐ │
//! │  └──────────────────┘        │  ConnectionRegistry (push)  │ │
//! │                              └─────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod server;
pub mod store;
pub mod transport;
