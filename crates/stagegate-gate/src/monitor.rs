//! Readiness threshold alerts with cooldown suppression.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use stagegate_types::{PhaseId, RunId};
use tracing::info;

/// Emitted once per upward threshold crossing, at most once per cooldown
/// window. Delivery is at-least-once; subscribers dedupe on
/// (run, phase, generated_at).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessAlert {
    pub run_id: RunId,
    pub phase: PhaseId,
    pub readiness: f64,
    pub threshold: f64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    last_readiness: f64,
    last_alert_at: Option<DateTime<Utc>>,
}

/// Tracks per-(run, phase) readiness and decides when a crossing warrants
/// an alert. Callers pass `now` explicitly so sweeps and tests control the
/// clock.
#[derive(Debug)]
pub struct ReadinessMonitor {
    cooldown: Duration,
    seen: HashMap<(RunId, PhaseId), Observation>,
}

impl ReadinessMonitor {
    /// 24 hours unless configured otherwise.
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            seen: HashMap::new(),
        }
    }

    /// Record a readiness observation.
    ///
    /// Returns an alert only on an upward crossing of `threshold` when no
    /// alert for this (run, phase) fired within the cooldown window.
    /// Re-observations above the threshold without a dip below it never
    /// re-alert, regardless of cooldown.
    pub fn observe(
        &mut self,
        run_id: RunId,
        phase: PhaseId,
        readiness: f64,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Option<ReadinessAlert> {
        let entry = self.seen.entry((run_id, phase)).or_insert(Observation {
            last_readiness: 0.0,
            last_alert_at: None,
        });

        let crossed = entry.last_readiness < threshold && readiness >= threshold;
        entry.last_readiness = readiness;

        if !crossed {
            return None;
        }
        if let Some(last) = entry.last_alert_at {
            if now - last < self.cooldown {
                return None;
            }
        }
        entry.last_alert_at = Some(now);
        info!(run_id = %run_id, phase = %phase, readiness, threshold, "readiness alert");
        Some(ReadinessAlert {
            run_id,
            phase,
            readiness,
            threshold,
            generated_at: now,
        })
    }
}
