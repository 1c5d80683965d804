//! Checkpoint State Machine.
//!
//! Coordinates worker callbacks, human approval decisions, gate
//! re-evaluation, and the outbound resume call. Stateless apart from the
//! readiness monitor: all durable state lives in the store, and every
//! mutation commits transactionally before any event is published.

pub mod machine;
pub mod publish;

pub use machine::{DecisionOutcome, DecisionRequest, Machine, NewEvidence};
pub use publish::{EventPublisher, NullPublisher};
