//! End-to-end tests for Undertow
//!
//! Complete client workflows against the HTTP surface: add a torrent, stream
//! ranges while it downloads, pause and seek, and survive reaping and
//! restarts. The simulated swarm stands in for remote peers.

#[path = "../harness.rs"]
mod harness;

mod lifecycle;
mod streaming_workflow;
