//! Undertow Web - HTTP surface
//!
//! Torrent control endpoints and range-capable file streaming over the core
//! service. Errors are answered as `{"kind", "detail"}` JSON with a status
//! derived from the error kind.

pub mod error;
pub mod handlers;
pub mod server;

// Re-export main types
pub use error::{ApiError, status_for};
pub use server::{AppState, bind, router, run_server};
