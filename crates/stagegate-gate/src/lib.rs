//! Gate Evaluation Engine.
//!
//! Gate verdicts are derived, never stored: [`evaluate`] is a pure function
//! from criteria and the active evidence set to a [`GateResult`], recomputed
//! on every read. [`ReadinessMonitor`] layers threshold-crossing alerts with
//! a cooldown on top of the pure evaluation.

pub mod criteria;
pub mod evaluate;
pub mod monitor;

pub use criteria::{GateCriteria, ScoreWeights};
pub use evaluate::{evaluate, GateResult, GateVerdict};
pub use monitor::{ReadinessAlert, ReadinessMonitor};
