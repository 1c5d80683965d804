//! Post-commit event publication seam.

use stagegate_types::RunEvent;

/// Receives events after the mutation that produced them has committed.
/// Delivery is at-least-once and best-effort; subscribers reconcile via
/// the run snapshot.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &RunEvent);
}

/// Discards everything. Used by tests and offline tooling.
#[derive(Debug, Default)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: &RunEvent) {}
}
