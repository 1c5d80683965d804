//! HTTP daemon tying the stagegate crates together.
//!
//! The library surface exists mainly so integration tests can build the
//! router against a mock resume transport; the binary in `main.rs` is a
//! thin wrapper around [`api::router`] and [`state::AppState`].

pub mod api;
pub mod logging;
pub mod state;

pub use api::router;
pub use state::AppState;
