//! Quiver
//!
//! An asynchronous stub DNS resolver engine. Quiver tracks outbound
//! queries across one or more upstream name servers, speaking UDP and TCP,
//! and delivers each response to its per-query callback exactly once.
//!
//! # Features
//!
//! * Single-threaded, externally driven: the caller supplies socket
//!   readiness and the clock, the engine runs each step to completion
//! * Retry and failover across servers with per-pass exponential backoff
//! * TCP promotion on truncated UDP responses
//! * EDNS downgrade when a server answers FORMERR without an OPT record
//! * Anti-spoofing triple check: source address, transaction id, exact
//!   question-section match
//! * Pluggable socket I/O for deterministic testing
//!
//! # Architecture
//!
//! The crate is a single `resolver` module tree; the entry point is
//! `resolver::channel::Channel`.

/// The stub resolver engine
pub mod resolver;
