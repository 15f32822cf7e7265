//! Statistics for reconciliation sweeps.
//!
//! A `SweepReport` is filled in by the reconciliation engine while it walks the active records of
//! one entity type, and summarizes how many were already in sync, healed, orphaned, or failed.

use serde::Serialize;
use std::time::Duration;

use crate::store::EntityType;
use crate::sync::reconciliation::ReconcileOutcome;

/// Outcome counts of one `reconcile_all` sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub entity_type: EntityType,
    /// Records handed to `reconcile_one`
    pub checked: usize,
    pub in_sync: usize,
    pub healed: usize,
    /// Individual watched fields overwritten across all healed records
    pub fields_healed: usize,
    pub orphaned: usize,
    pub missing_locally: usize,
    /// Records not yet on chain
    pub skipped_pending: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl SweepReport {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            checked: 0,
            in_sync: 0,
            healed: 0,
            fields_healed: 0,
            orphaned: 0,
            missing_locally: 0,
            skipped_pending: 0,
            failed: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Record the outcome of one record
    pub fn record(&mut self, outcome: &ReconcileOutcome) {
        self.checked += 1;
        match outcome {
            ReconcileOutcome::InSync => self.in_sync += 1,
            ReconcileOutcome::Healed(changes) => {
                self.healed += 1;
                self.fields_healed += changes.len();
            }
            ReconcileOutcome::Orphaned => self.orphaned += 1,
            ReconcileOutcome::MissingLocally => self.missing_locally += 1,
        }
    }

    pub fn record_failure(&mut self) {
        self.checked += 1;
        self.failed += 1;
    }

    pub fn record_skipped(&mut self) {
        self.skipped_pending += 1;
    }

    /// Whether every checked record matched the ledger
    pub fn is_clean(&self) -> bool {
        self.checked == self.in_sync
    }

    /// Get a human-readable summary of the sweep
    pub fn summary(&self) -> String {
        format!(
            "{} sweep: {} checked, {} in sync, {} healed ({} fields), {} orphaned{}{} in {:.2?}",
            self.entity_type,
            self.checked,
            self.in_sync,
            self.healed,
            self.fields_healed,
            self.orphaned,
            if self.failed == 0 {
                String::new()
            } else {
                format!(", {} failed", self.failed)
            },
            if self.skipped_pending == 0 {
                String::new()
            } else {
                format!(", {} pending skipped", self.skipped_pending)
            },
            self.elapsed
        )
    }
}
