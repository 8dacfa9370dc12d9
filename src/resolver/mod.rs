//! Stub DNS Resolver Engine
//!
//! This module implements the client side of DNS resolution as a
//! single-threaded, externally driven engine:
//! * Callers submit pre-serialized query bytes with a completion callback
//! * Queries are multiplexed over the configured upstream servers,
//!   UDP first with TCP promotion on truncation
//! * Replies are matched back by transaction id and validated against the
//!   original question section before dispatch
//! * Timeouts, refusals, and connection failures walk the query across
//!   servers until it succeeds or its attempt budget is spent
//!
//! # Module Structure
//!
//! * `channel` - the resolver context: options, servers, query indexes
//! * `buffer` - byte buffer for TCP reassembly and send queueing
//! * `wire` - minimal wire-format message view for matching and validation
//! * `io` - injected socket provider and its std-socket implementation
//! * `clock` - monotonic time and backoff arithmetic
//! * `qid` - transaction id generation

/// Byte buffer for TCP stream reassembly and send queueing
pub mod buffer;

/// The resolver channel: options, servers, indexes, and the public API
pub mod channel;

/// Monotonic time and deadline/backoff arithmetic
pub mod clock;

/// Injected socket provider and the std-socket implementation
pub mod io;

/// Transaction id generation
pub mod qid;

/// Minimal wire-format message view
pub mod wire;

/// Per-connection state
mod conn;

/// The send/receive/timeout/retry engine
mod process;

/// In-flight query records
mod query;

/// Per-server state
mod upstream;
