//! Core types shared across the stagegate workspace.
//!
//! This crate owns the durable entity shapes (runs, phases, checkpoints,
//! evidence), the wire-facing enums, and the error taxonomy. It has no
//! behavior beyond consistency helpers; all coordination lives in
//! `stagegate-machine` and all persistence in `stagegate-store`.

pub mod error;
pub mod events;
pub mod types;

pub use error::{MachineError, StoreError};
pub use events::{EventAck, EventDisposition, RunEvent, WorkerEvent, WorkerEventType};
pub use types::{
    AuditEntry, Checkpoint, CheckpointDecision, CheckpointId, CheckpointKind, EvidenceItem,
    EvidenceKind, EvidenceStrength, PhaseId, PhaseRecord, PhaseStatus, RunId, RunSnapshot,
};
