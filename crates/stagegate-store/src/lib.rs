//! Evidence & Progress Store.
//!
//! Exclusive owner of durable run state: phase records, checkpoints,
//! append-only evidence, and the audit log. Coordination layers mutate
//! through transactional closures; a closure either commits atomically
//! (bumping the run's version counter) or leaves the run untouched.

pub mod state;
pub mod store;

pub use state::RunState;
pub use store::RunStore;
