//! Integration tests for Undertow
//!
//! These tests drive the core service through the HTTP router with the
//! simulated swarm standing in for the network. They cover the HTTP status
//! contract, reader and buffer invariants, and persistence across restarts.

#[path = "harness.rs"]
mod harness;

#[path = "integration/http_api.rs"]
mod http_api;
#[path = "integration/persistence.rs"]
mod persistence;
#[path = "integration/streaming.rs"]
mod streaming;
